//! Operator CLI over the campaign store. Every command prints JSON.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use mail_campaign::campaign::{self, CampaignUpdate, CreateCampaign};
use mail_campaign::config::{self, Config};
use mail_campaign::db::{self, Pool};
use mail_campaign::dispatch::{DispatchSettings, Dispatcher};
use mail_campaign::model::{CampaignStatus, SubscriptionStatus};
use mail_campaign::recorder::DeliveryRecorder;
use mail_campaign::report::Reporter;
use mail_campaign::{ingest, recipients, summary, transport};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bulk import recipients from a .csv file with name and email columns
    Import { file: PathBuf },
    AddRecipient {
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long)]
        email: String,
    },
    SetSubscription {
        #[arg(long)]
        email: String,
        #[arg(long, value_parser = parse_subscription)]
        status: SubscriptionStatus,
    },
    Recipients,
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        subject: String,
        /// Body template, e.g. "Hi {{ name }}"
        #[arg(long, conflicts_with = "body_file")]
        body: Option<String>,
        #[arg(long)]
        body_file: Option<PathBuf>,
        /// RFC 3339 timestamp; with --schedule the campaign is created scheduled
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        #[arg(long)]
        schedule: bool,
    },
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        body: Option<String>,
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        #[arg(long, value_parser = parse_campaign_status)]
        status: Option<CampaignStatus>,
    },
    Schedule {
        id: i64,
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    Cancel { id: i64 },
    /// Run a scheduled campaign now, regardless of its scheduled time
    Execute { id: i64 },
    Campaigns,
    Logs {
        #[arg(long)]
        campaign: Option<i64>,
    },
    Summary,
    /// Mail the delivery report of a campaign to the admin address
    Report { id: i64 },
}

fn parse_subscription(s: &str) -> Result<SubscriptionStatus, String> {
    SubscriptionStatus::parse(s).ok_or_else(|| format!("expected subscribed or unsubscribed, got {s}"))
}

fn parse_campaign_status(s: &str) -> Result<CampaignStatus, String> {
    CampaignStatus::parse(s).ok_or_else(|| format!("unknown campaign status {s}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn dispatcher(cfg: &Config, pool: &Pool) -> Result<Dispatcher> {
    let mailer = transport::from_config(&cfg.mail)?;
    Ok(Dispatcher::new(
        pool.clone(),
        mailer,
        Arc::new(DeliveryRecorder::new(pool.clone())),
        DispatchSettings::from_config(cfg),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Import { file } => {
            let res = ingest::import_file(&pool, &file)
                .await
                .with_context(|| format!("importing {}", file.display()))?;
            print_json(&res)?;
        }
        Command::AddRecipient { name, email } => {
            print_json(&recipients::add_recipient(&pool, &name, &email).await?)?;
        }
        Command::SetSubscription { email, status } => {
            print_json(&recipients::set_subscription(&pool, &email, status).await?)?;
        }
        Command::Recipients => print_json(&recipients::list_recipients(&pool).await?)?,
        Command::Create {
            name,
            subject,
            body,
            body_file,
            at,
            schedule,
        } => {
            let body = match (body, body_file) {
                (Some(body), _) => body,
                (None, Some(path)) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => return Err(anyhow!("one of --body or --body-file is required")),
            };
            let input = CreateCampaign {
                name,
                subject,
                body,
                scheduled_time: at,
                status: Some(if schedule {
                    CampaignStatus::Scheduled
                } else {
                    CampaignStatus::Draft
                }),
            };
            print_json(&campaign::create_campaign(&pool, input).await?)?;
        }
        Command::Update {
            id,
            name,
            subject,
            body,
            at,
            status,
        } => {
            let update = CampaignUpdate {
                name,
                subject,
                body,
                scheduled_time: at,
                status,
            };
            print_json(&campaign::update_campaign(&pool, id, update).await?)?;
        }
        Command::Schedule { id, at } => {
            print_json(&campaign::schedule_campaign(&pool, id, at).await?)?;
        }
        Command::Cancel { id } => print_json(&campaign::cancel_campaign(&pool, id).await?)?,
        Command::Execute { id } => {
            let outcome = dispatcher(&cfg, &pool)?.execute(id).await?;
            print_json(&outcome)?;
        }
        Command::Campaigns => print_json(&campaign::list_campaigns(&pool).await?)?,
        Command::Logs { campaign } => {
            print_json(&db::list_delivery_logs(&pool, campaign).await?)?;
        }
        Command::Summary => print_json(&summary::summary(&pool).await?)?,
        Command::Report { id } => {
            let reporter = Reporter::new(
                pool.clone(),
                transport::from_config(&cfg.mail)?,
                cfg.mail.from_address.clone(),
                cfg.mail.admin_address.clone(),
            )
            .with_send_timeout(cfg.send_timeout());
            reporter.send_report(id).await?;
            print_json(&serde_json::json!({ "campaign_id": id, "sent_to": cfg.mail.admin_address }))?;
        }
    }

    pool.close().await;
    Ok(())
}
