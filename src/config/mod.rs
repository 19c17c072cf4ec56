use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub database_url: String,

    // Pool sizing; writes hold a connection for a full transaction
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    // Outbox relay settings
    #[serde(default = "default_outbox_poll_interval_ms")]
    pub outbox_poll_interval_ms: u64,

    #[serde(default = "default_outbox_batch_size")]
    pub outbox_batch_size: i64,

    // Maintenance workers
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    #[serde(default = "default_outbox_retention_hours")]
    pub outbox_retention_hours: i64,
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_max_connections() -> u32 {
    32
}

fn default_db_min_connections() -> u32 {
    4
}

fn default_db_acquire_timeout_secs() -> u64 {
    3
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_outbox_poll_interval_ms() -> u64 {
    100
}

fn default_outbox_batch_size() -> i64 {
    100
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_outbox_retention_hours() -> i64 {
    24
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        Ok(app_config)
    }
}
