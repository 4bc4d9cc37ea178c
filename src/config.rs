//! Configuration loader and validator for the campaign service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub mail: Mail,
    #[serde(default)]
    pub dispatch: Dispatch,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub scheduler_interval_secs: u64,
    pub outbox_poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Smtp,
    Log,
}

/// Outgoing mail settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mail {
    #[serde(default = "default_from_address")]
    pub from_address: String,
    #[serde(default = "default_admin_address")]
    pub admin_address: String,
    pub send_timeout_secs: u64,
    pub transport: TransportKind,
    #[serde(default)]
    pub smtp: Option<Smtp>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    None,
    #[default]
    Starttls,
    Tls,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Smtp {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: TlsMode,
}

/// Dispatch engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dispatch {
    pub concurrency: usize,
    pub fallback_name: String,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self {
            concurrency: 4,
            fallback_name: "Subscriber".into(),
        }
    }
}

fn default_from_address() -> String {
    "no-reply@company.com".into()
}

fn default_admin_address() -> String {
    "admin@company.com".into()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins over the default file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/campaigns.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.mail.send_timeout_secs)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.app.scheduler_interval_secs)
    }

    pub fn outbox_poll_interval(&self) -> Duration {
        Duration::from_millis(self.app.outbox_poll_interval_ms)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.scheduler_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.scheduler_interval_secs must be > 0"));
    }
    if cfg.app.outbox_poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.outbox_poll_interval_ms must be > 0"));
    }

    if cfg.mail.from_address.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.from_address must be non-empty"));
    }
    if cfg.mail.admin_address.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.admin_address must be non-empty"));
    }
    if cfg.mail.send_timeout_secs == 0 {
        return Err(ConfigError::Invalid("mail.send_timeout_secs must be > 0"));
    }
    if cfg.mail.transport == TransportKind::Smtp {
        let Some(smtp) = &cfg.mail.smtp else {
            return Err(ConfigError::Invalid(
                "mail.smtp is required when mail.transport is smtp",
            ));
        };
        if smtp.host.trim().is_empty() {
            return Err(ConfigError::Invalid("mail.smtp.host must be non-empty"));
        }
        if smtp.port == 0 {
            return Err(ConfigError::Invalid("mail.smtp.port must be > 0"));
        }
        if smtp.username.is_some() != smtp.password.is_some() {
            return Err(ConfigError::Invalid(
                "mail.smtp.username and mail.smtp.password must be set together",
            ));
        }
    }

    if cfg.dispatch.concurrency == 0 {
        return Err(ConfigError::Invalid("dispatch.concurrency must be > 0"));
    }
    if cfg.dispatch.fallback_name.trim().is_empty() {
        return Err(ConfigError::Invalid("dispatch.fallback_name must be non-empty"));
    }

    Ok(())
}

/// Returns a complete sample configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  scheduler_interval_secs: 60
  outbox_poll_interval_ms: 500
  max_backoff_seconds: 600

mail:
  from_address: "no-reply@company.com"
  admin_address: "admin@company.com"
  send_timeout_secs: 30
  transport: smtp
  smtp:
    host: "smtp.example.com"
    port: 587
    username: "mailer"
    password: "CHANGE_ME"
    tls: starttls

dispatch:
  concurrency: 4
  fallback_name: "Subscriber"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.mail.smtp.as_ref().unwrap().tls, TlsMode::Starttls);
        assert_eq!(cfg.send_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn dispatch_section_defaults() {
        let yaml = r#"app:
  data_dir: "./data"
  scheduler_interval_secs: 5
  outbox_poll_interval_ms: 100
  max_backoff_seconds: 60
mail:
  send_timeout_secs: 10
  transport: log
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.dispatch, Dispatch::default());
        assert_eq!(cfg.mail.from_address, "no-reply@company.com");
        assert_eq!(cfg.mail.admin_address, "admin@company.com");
    }

    #[test]
    fn smtp_transport_requires_smtp_section() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.mail.smtp = None;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("mail.smtp")),
            _ => panic!("wrong error"),
        }

        cfg.mail.transport = TransportKind::Log;
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_numbers() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.dispatch.concurrency = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.mail.send_timeout_secs = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("send_timeout_secs")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.scheduler_interval_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn credentials_come_in_pairs() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.mail.smtp.as_mut().unwrap().password = None;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.dispatch.fallback_name, "Subscriber");
    }
}
