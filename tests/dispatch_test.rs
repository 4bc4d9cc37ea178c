mod common;

use common::{add, dispatcher, due_campaign, settings, setup_pool, RecordingTransport};
use mail_campaign::campaign::{self, CreateCampaign};
use mail_campaign::db;
use mail_campaign::dispatch::DispatchOutcome;
use mail_campaign::error::Error;
use mail_campaign::model::{CampaignStatus, DeliveryStatus, OutboxKind, SubscriptionStatus};
use mail_campaign::recipients;
use std::time::Duration;

#[tokio::test]
async fn partial_failure_still_completes_campaign() {
    let (_dir, pool) = setup_pool().await;
    add(&pool, "Alice", "alice@x.com").await;
    add(&pool, "", "anon@x.com").await;
    let campaign = due_campaign(&pool, "Spring", "Hi {{name}}").await;
    assert_eq!(campaign.total_recipients, 2);

    let transport = RecordingTransport::new();
    transport.fail_for("anon@x.com", "550 mailbox unavailable").await;
    let d = dispatcher(&pool, transport.clone(), settings());

    let DispatchOutcome::Completed(summary) = d.execute(campaign.id).await.unwrap() else {
        panic!("campaign should run");
    };
    assert_eq!(summary.counters.sent_count, 1);
    assert_eq!(summary.counters.failed_count, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].email, "anon@x.com");
    assert_eq!(summary.failures[0].reason, "550 mailbox unavailable");

    let sent = transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "alice@x.com");
    assert_eq!(sent[0].body, "Hi Alice");
    assert_eq!(sent[0].subject, "Spring subject");
    assert_eq!(sent[0].from, "no-reply@company.com");

    let mut logs = db::delivery_logs_for_campaign(&pool, campaign.id).await.unwrap();
    logs.sort_by(|a, b| a.recipient_email.cmp(&b.recipient_email));
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].recipient_email, "alice@x.com");
    assert_eq!(logs[0].status, DeliveryStatus::Sent);
    assert!(logs[0].sent_at.is_some());
    assert!(logs[0].failure_reason.is_none());
    assert_eq!(logs[1].recipient_email, "anon@x.com");
    assert_eq!(logs[1].status, DeliveryStatus::Failed);
    assert_eq!(logs[1].failure_reason.as_deref(), Some("550 mailbox unavailable"));
    assert!(logs[1].sent_at.is_none());

    let stored = db::get_campaign(&pool, campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Completed);
    assert_eq!(stored.sent_count, 1);
    assert_eq!(stored.failed_count, 1);
    assert_eq!(stored.sent_count + stored.failed_count, stored.total_recipients);
    assert!(stored.started_at.is_some());
    assert!(stored.completed_at.is_some());

    let task = db::next_due_outbox(&pool, chrono::Utc::now()).await.unwrap().unwrap();
    assert_eq!(task.kind, OutboxKind::CampaignReport);
    assert_eq!(task.ref_id, campaign.id);
}

#[tokio::test]
async fn blank_name_renders_fallback() {
    let (_dir, pool) = setup_pool().await;
    add(&pool, "  ", "anon@x.com").await;
    let campaign = due_campaign(&pool, "Fallback", "Hi {{ name }} <{{ email }}>").await;

    let transport = RecordingTransport::new();
    let d = dispatcher(&pool, transport.clone(), settings());
    d.execute(campaign.id).await.unwrap();

    let sent = transport.sent().await;
    assert_eq!(sent[0].body, "Hi Subscriber <anon@x.com>");
}

#[tokio::test]
async fn re_executing_is_a_no_op() {
    let (_dir, pool) = setup_pool().await;
    add(&pool, "Alice", "alice@x.com").await;
    let campaign = due_campaign(&pool, "Once", "Hello").await;

    let transport = RecordingTransport::new();
    let d = dispatcher(&pool, transport.clone(), settings());
    assert!(matches!(
        d.execute(campaign.id).await.unwrap(),
        DispatchOutcome::Completed(_)
    ));
    let again = d.execute(campaign.id).await.unwrap();
    assert!(matches!(
        again,
        DispatchOutcome::Skipped {
            status: CampaignStatus::Completed
        }
    ));
    assert_eq!(transport.sent().await.len(), 1);
    assert_eq!(
        db::delivery_logs_for_campaign(&pool, campaign.id).await.unwrap().len(),
        1
    );
    assert_eq!(db::count_outbox(&pool).await.unwrap(), 1);
}

#[tokio::test]
async fn concurrent_triggers_run_campaign_once() {
    let (_dir, pool) = setup_pool().await;
    for i in 0..5 {
        add(&pool, &format!("R{i}"), &format!("r{i}@x.com")).await;
    }
    let campaign = due_campaign(&pool, "Race", "Hello {{ name }}").await;

    let transport = RecordingTransport::new();
    let d = dispatcher(&pool, transport.clone(), settings());
    let (a, b) = tokio::join!(d.execute(campaign.id), d.execute(campaign.id));
    let outcomes = [a.unwrap(), b.unwrap()];
    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Completed(_)))
        .count();
    assert_eq!(completed, 1);

    assert_eq!(transport.sent().await.len(), 5);
    let stored = db::get_campaign(&pool, campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Completed);
    assert_eq!(stored.sent_count, 5);
    assert_eq!(stored.total_recipients, 5);
}

#[tokio::test]
async fn unsubscribed_before_dispatch_is_not_mailed() {
    let (_dir, pool) = setup_pool().await;
    add(&pool, "Alice", "alice@x.com").await;
    add(&pool, "Bob", "bob@x.com").await;
    let campaign = due_campaign(&pool, "Opt-out", "Hi").await;
    assert_eq!(campaign.total_recipients, 2);

    recipients::set_subscription(&pool, "bob@x.com", SubscriptionStatus::Unsubscribed)
        .await
        .unwrap();
    // Subscribed after creation: outside the snapshot.
    add(&pool, "Carol", "carol@x.com").await;

    let transport = RecordingTransport::new();
    let d = dispatcher(&pool, transport.clone(), settings());
    let DispatchOutcome::Completed(summary) = d.execute(campaign.id).await.unwrap() else {
        panic!("campaign should run");
    };
    assert_eq!(summary.counters.total_recipients, 1);
    assert_eq!(summary.counters.sent_count, 1);
    let sent: Vec<String> = transport.sent().await.into_iter().map(|m| m.to).collect();
    assert_eq!(sent, vec!["alice@x.com".to_string()]);
}

#[tokio::test]
async fn malformed_template_fails_each_recipient() {
    let (_dir, pool) = setup_pool().await;
    add(&pool, "Alice", "alice@x.com").await;
    add(&pool, "Bob", "bob@x.com").await;
    let campaign = due_campaign(&pool, "Broken", "Hi {{ name").await;

    let transport = RecordingTransport::new();
    let d = dispatcher(&pool, transport.clone(), settings());
    let DispatchOutcome::Completed(summary) = d.execute(campaign.id).await.unwrap() else {
        panic!("campaign should run");
    };
    assert_eq!(summary.counters.failed_count, 2);
    assert_eq!(summary.counters.sent_count, 0);
    assert!(summary
        .failures
        .iter()
        .all(|f| f.reason.starts_with("template error")));
    assert!(transport.sent().await.is_empty());

    let stored = db::get_campaign(&pool, campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn slow_transport_times_out_as_failure() {
    let (_dir, pool) = setup_pool().await;
    add(&pool, "Alice", "alice@x.com").await;
    let campaign = due_campaign(&pool, "Slow", "Hi").await;

    let mut settings = settings();
    settings.send_timeout = Duration::from_millis(50);
    let transport = RecordingTransport::with_delay(Duration::from_millis(500));
    let d = dispatcher(&pool, transport, settings);

    let DispatchOutcome::Completed(summary) = d.execute(campaign.id).await.unwrap() else {
        panic!("campaign should run");
    };
    assert_eq!(summary.counters.failed_count, 1);
    assert_eq!(summary.failures[0].reason, "send timed out after 0.05s");
}

#[tokio::test]
async fn draft_and_missing_campaigns() {
    let (_dir, pool) = setup_pool().await;
    add(&pool, "Alice", "alice@x.com").await;
    let draft = campaign::create_campaign(
        &pool,
        CreateCampaign {
            name: "Draft".into(),
            subject: "s".into(),
            body: "b".into(),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let transport = RecordingTransport::new();
    let d = dispatcher(&pool, transport.clone(), settings());
    assert!(matches!(
        d.execute(draft.id).await.unwrap(),
        DispatchOutcome::Skipped {
            status: CampaignStatus::Draft
        }
    ));
    assert!(matches!(
        d.execute(9999).await,
        Err(Error::NotFound { entity: "campaign", .. })
    ));
    assert!(transport.sent().await.is_empty());
}

#[tokio::test]
async fn sequential_pool_width_sends_everyone() {
    let (_dir, pool) = setup_pool().await;
    for i in 0..3 {
        add(&pool, &format!("R{i}"), &format!("r{i}@x.com")).await;
    }
    let campaign = due_campaign(&pool, "Serial", "Hi").await;

    let mut settings = settings();
    settings.concurrency = 1;
    let transport = RecordingTransport::new();
    let d = dispatcher(&pool, transport.clone(), settings);
    d.execute(campaign.id).await.unwrap();

    let sent: Vec<String> = transport.sent().await.into_iter().map(|m| m.to).collect();
    assert_eq!(sent, vec!["r0@x.com", "r1@x.com", "r2@x.com"]);
}

#[tokio::test]
async fn execute_runs_on_a_spawned_task() {
    let (_dir, pool) = setup_pool().await;
    add(&pool, "Alice", "alice@x.com").await;
    add(&pool, "Bob", "bob@x.com").await;
    let campaign = due_campaign(&pool, "Spawned", "Hi {{ name }}").await;
    let transport = RecordingTransport::new();
    let d = std::sync::Arc::new(dispatcher(&pool, transport.clone(), settings()));

    let id = campaign.id;
    let handle = tokio::spawn({
        let d = std::sync::Arc::clone(&d);
        async move { d.execute(id).await }
    });
    let DispatchOutcome::Completed(summary) = handle.await.unwrap().unwrap() else {
        panic!("campaign should run");
    };
    assert_eq!(summary.counters.sent_count, 2);
    assert_eq!(transport.sent().await.len(), 2);
}

#[tokio::test]
async fn unrecorded_outcome_leaves_campaign_in_progress() {
    let (_dir, pool) = setup_pool().await;
    add(&pool, "Alice", "alice@x.com").await;
    let bob = add(&pool, "Bob", "bob@x.com").await;
    let campaign = due_campaign(&pool, "Lossy", "Hi").await;
    sqlx::query(
        "CREATE TRIGGER refuse_bob BEFORE INSERT ON delivery_logs \
         WHEN NEW.recipient_email = 'bob@x.com' \
         BEGIN SELECT RAISE(ABORT, 'log write refused'); END;",
    )
    .execute(&pool)
    .await
    .unwrap();

    let transport = RecordingTransport::new();
    let d = dispatcher(&pool, transport.clone(), settings());
    let err = d.execute(campaign.id).await.unwrap_err();
    match &err {
        Error::Unrecorded { campaign_id, emails } => {
            assert_eq!(*campaign_id, campaign.id);
            assert_eq!(emails, &vec!["bob@x.com".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.sent().await.len(), 2);

    let stored = db::get_campaign(&pool, campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::InProgress);
    assert!(stored.completed_at.is_none());
    assert_eq!(stored.sent_count, 1);
    let logs = db::delivery_logs_for_campaign(&pool, campaign.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].recipient_email, "alice@x.com");
    assert_eq!(db::count_outbox(&pool).await.unwrap(), 0);

    // Once the log accepts the write, the campaign can be closed out.
    sqlx::query("DROP TRIGGER refuse_bob").execute(&pool).await.unwrap();
    d.recorder()
        .record(campaign.id, &bob, &mail_campaign::recorder::DeliveryOutcome::sent_now())
        .await
        .unwrap();
    let counters = d.recorder().finish(campaign.id).await.unwrap();
    assert_eq!(counters.sent_count, 2);
    assert_eq!(db::count_outbox(&pool).await.unwrap(), 1);
}
