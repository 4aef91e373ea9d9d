use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for subflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub task: TaskConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub sweeper: SweeperConfig,

    #[serde(default)]
    pub payment: PaymentConfig,

    #[serde(default)]
    pub commerce: CommerceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            task: TaskConfig::default(),
            webhook: WebhookConfig::default(),
            sweeper: SweeperConfig::default(),
            payment: PaymentConfig::default(),
            commerce: CommerceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self, crate::Error> {
        use crate::Error;

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, crate::Error> {
        // Try to load from SUBFLOW_CONFIG env var first
        if let Ok(config_path) = std::env::var("SUBFLOW_CONFIG") {
            return Self::load(&config_path);
        }

        // Try default locations
        let default_paths = [
            "./config/default.toml",
            "./config/production.toml",
            "/etc/subflow/config.toml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        use crate::Error;

        if self.database.pool_size == 0 {
            return Err(Error::Config("Database pool size must be > 0".to_string()));
        }

        if self.task.batch_size == 0 || self.task.batch_size > 100 {
            return Err(Error::Config(
                "task.batch_size must be between 1 and 100".to_string(),
            ));
        }

        if self.task.lease_seconds == 0 {
            return Err(Error::Config("task.lease_seconds must be > 0".to_string()));
        }

        if self.task.worker_count == 0 {
            return Err(Error::Config("task.worker_count must be > 0".to_string()));
        }

        if self.webhook.max_attempts == 0 {
            return Err(Error::Config("webhook.max_attempts must be > 0".to_string()));
        }

        // Sweeper schedule must parse as a cron expression
        if let Err(e) = self.sweeper.schedule.parse::<cron::Schedule>() {
            return Err(Error::Config(format!(
                "sweeper.schedule is not a valid cron expression: {}",
                e
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    #[serde(default = "default_db_name")]
    pub database: String,

    #[serde(default = "default_db_user")]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            database: default_db_name(),
            username: default_db_user(),
            password: String::new(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl DatabaseConfig {
    /// Connection URL; DATABASE_URL wins when set
    pub fn url(&self) -> String {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            return url;
        }
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "subflow".to_string()
}

fn default_db_user() -> String {
    "subflow".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Task queue and dispatcher tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// How long a claim lease lasts before the reaper may recover the task
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    /// Max tasks claimed per batch (hard cap 100)
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: i32,

    /// Base for the exponential retry backoff
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: u64,

    /// Worker poll interval when a claim returns nothing
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// How often the reaper recovers expired claims
    #[serde(default = "default_reap_interval")]
    pub reap_interval_seconds: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            lease_seconds: default_lease_seconds(),
            batch_size: default_batch_size(),
            default_max_attempts: default_max_attempts(),
            backoff_base_seconds: default_backoff_base(),
            poll_interval_seconds: default_poll_interval(),
            worker_count: default_worker_count(),
            reap_interval_seconds: default_reap_interval(),
        }
    }
}

fn default_lease_seconds() -> u64 {
    300
}

fn default_batch_size() -> i64 {
    100
}

fn default_max_attempts() -> i32 {
    3
}

fn default_backoff_base() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    5
}

fn default_worker_count() -> usize {
    4
}

fn default_reap_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_max_attempts")]
    pub max_attempts: i32,

    #[serde(default = "default_webhook_backoff_base")]
    pub retry_backoff_base_seconds: u64,

    #[serde(default = "default_webhook_timeout")]
    pub request_timeout_seconds: u64,

    /// Outbox rows fanned out per relay pass
    #[serde(default = "default_fanout_batch")]
    pub fanout_batch_size: i64,

    /// Pending deliveries dispatched per relay pass
    #[serde(default = "default_dispatch_batch")]
    pub dispatch_batch_size: i64,

    /// Sleep between relay passes
    #[serde(default = "default_relay_interval")]
    pub poll_interval_seconds: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_webhook_max_attempts(),
            retry_backoff_base_seconds: default_webhook_backoff_base(),
            request_timeout_seconds: default_webhook_timeout(),
            fanout_batch_size: default_fanout_batch(),
            dispatch_batch_size: default_dispatch_batch(),
            poll_interval_seconds: default_relay_interval(),
        }
    }
}

fn default_webhook_max_attempts() -> i32 {
    5
}

fn default_webhook_backoff_base() -> u64 {
    60
}

fn default_webhook_timeout() -> u64 {
    30
}

fn default_fanout_batch() -> i64 {
    50
}

fn default_dispatch_batch() -> i64 {
    50
}

fn default_relay_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Cron expression (seconds-resolution, UTC); default runs hourly
    #[serde(default = "default_sweeper_schedule")]
    pub schedule: String,

    /// Subscriptions examined per keyset page
    #[serde(default = "default_sweeper_batch")]
    pub batch_size: i64,

    /// How long past its period end an unrenewed active subscription may
    /// linger before it is expired
    #[serde(default = "default_expire_grace_hours")]
    pub expire_grace_hours: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            schedule: default_sweeper_schedule(),
            batch_size: default_sweeper_batch(),
            expire_grace_hours: default_expire_grace_hours(),
        }
    }
}

fn default_expire_grace_hours() -> i64 {
    72
}

fn default_sweeper_schedule() -> String {
    "0 0 * * * *".to_string()
}

fn default_sweeper_batch() -> i64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    #[serde(default = "default_payment_provider")]
    pub provider_name: String,

    #[serde(default = "default_provider_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            provider_name: default_payment_provider(),
            request_timeout_seconds: default_provider_timeout(),
        }
    }
}

fn default_payment_provider() -> String {
    "sandbox".to_string()
}

fn default_provider_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommerceConfig {
    #[serde(default = "default_commerce_provider")]
    pub provider_name: String,

    #[serde(default = "default_provider_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for CommerceConfig {
    fn default() -> Self {
        Self {
            provider_name: default_commerce_provider(),
            request_timeout_seconds: default_provider_timeout(),
        }
    }
}

fn default_commerce_provider() -> String {
    "sandbox".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_knobs() {
        let config = Config::default();
        assert_eq!(config.task.lease_seconds, 300);
        assert_eq!(config.task.batch_size, 100);
        assert_eq!(config.task.default_max_attempts, 3);
        assert_eq!(config.webhook.max_attempts, 5);
        assert_eq!(config.webhook.retry_backoff_base_seconds, 60);
        assert_eq!(config.payment.provider_name, "sandbox");
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_batch_size_rejected() {
        let mut config = Config::default();
        config.task.batch_size = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        let mut config = Config::default();
        config.sweeper.schedule = "not a cron".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[task]
lease_seconds = 120
worker_count = 2

[webhook]
max_attempts = 7

[sweeper]
schedule = "0 */30 * * * *"
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.task.lease_seconds, 120);
        assert_eq!(config.task.worker_count, 2);
        assert_eq!(config.webhook.max_attempts, 7);
        assert_eq!(config.sweeper.schedule, "0 */30 * * * *");
        // Untouched sections keep defaults
        assert_eq!(config.task.batch_size, 100);
    }
}
