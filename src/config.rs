use config::{Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

/// The named operator-visible knobs the sync core consults.
/// Field names intentionally mirror the source's `config.get(NAME, default)`
/// call sites (`inbox/mailsync/backends/base.py`,
/// `inbox/mailsync/service.py`, `inbox/transactions/actions.py`,
/// `inbox/util/blockstore.py`) so operators migrating a deployment can map
/// one-for-one onto this struct's fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds; a heartbeat older than this is considered dead.
    pub base_alive_threshold: i64,
    /// Messages downloaded before a throttled account pauses.
    pub throttle_count: u32,
    /// Seconds a throttled account pauses after `throttle_count` downloads.
    pub throttle_wait: u64,
    /// Per-process cap on concurrently-syncing accounts.
    pub max_accounts_per_process: usize,
    /// Whether this process may claim unclaimed accounts off the shared queue.
    pub sync_steal_accounts: bool,
    /// `syncback_id -> [shard_id, ...]` static assignment map.
    pub syncback_assignments: std::collections::HashMap<String, Vec<i64>>,
    /// Whether attached-calendar-event import is enabled (see
    /// `ImportAttachedEvents` trait — calendar sync itself is out of scope,
    /// this flag only gates whether the no-op hook is invoked at all).
    pub import_attached_events: bool,
    /// Whether raw MIME bodies are Zstandard-compressed before storage.
    pub compress_raw_mime: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_alive_threshold: 480,
            throttle_count: 200,
            throttle_wait: 60,
            max_accounts_per_process: 150,
            sync_steal_accounts: true,
            syncback_assignments: std::collections::HashMap::new(),
            import_attached_events: true,
            compress_raw_mime: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log: LogConfig,
    /// `sqlx` connection string for the local store.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub sync: SyncConfig,
    /// This process's identifier, used verbatim as `Account.sync_host`:
    /// `"{hostname}:{process_number}"`.
    #[serde(default = "default_process_number")]
    pub process_number: u32,
}

fn default_database_url() -> String {
    "sqlite:data/email_cache.db".to_string()
}

fn default_process_number() -> u32 {
    0
}

/// `"{hostname}:{process_number}"`, this process's identity for account
/// ownership and sync scheduling.
pub fn process_identifier(hostname: &str, process_number: u32) -> String {
    format!("{hostname}:{process_number}")
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let default_config_path = "config/default.toml";
        let path_to_use = config_path.unwrap_or(default_config_path);

        let builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("database_url", default_database_url())?
            .set_default("process_number", 0)?
            .set_default("sync.base_alive_threshold", 480)?
            .set_default("sync.throttle_count", 200)?
            .set_default("sync.throttle_wait", 60)?
            .set_default("sync.max_accounts_per_process", 150)?
            .set_default("sync.sync_steal_accounts", true)?
            .set_default("sync.import_attached_events", true)?
            .set_default("sync.compress_raw_mime", false)?
            .add_source(File::with_name(path_to_use).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_defaults_match_reference_values() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.base_alive_threshold, 480);
        assert_eq!(cfg.throttle_count, 200);
        assert_eq!(cfg.max_accounts_per_process, 150);
        assert!(cfg.sync_steal_accounts);
    }

    #[test]
    fn process_identifier_format() {
        assert_eq!(process_identifier("host-1", 3), "host-1:3");
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load or parse configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: "info".to_string() }
    }
} 