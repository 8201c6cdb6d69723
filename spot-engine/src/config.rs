//! Configuration for the engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// HTTP listen address
    pub listen_addr: String,

    /// Spatial index configuration
    pub geo: GeoConfig,

    /// Reservation ledger configuration
    pub ledger: LedgerConfig,

    /// Expiry sweep configuration
    pub sweeper: SweeperConfig,

    /// Availability feed configuration
    pub feed: FeedConfig,

    /// Audit trail configuration
    pub audit: AuditConfig,

    /// Holder notification configuration
    pub notify: NotifyConfig,

    /// Store configuration
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "spot-engine".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            geo: GeoConfig::default(),
            ledger: LedgerConfig::default(),
            sweeper: SweeperConfig::default(),
            feed: FeedConfig::default(),
            audit: AuditConfig::default(),
            notify: NotifyConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Spatial index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Grid cell edge length (degrees)
    pub cell_size_deg: f64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            cell_size_deg: 0.005, // ~550 m of latitude
        }
    }
}

/// Reservation ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Hold TTL when the caller does not supply one (seconds)
    pub default_hold_ttl_secs: u64,

    /// Upper bound for caller-supplied hold TTLs (seconds)
    pub max_hold_ttl_secs: u64,

    /// Bounded wait for a per-spot lock (milliseconds)
    ///
    /// Ledger calls are synchronous and may block their thread this long.
    /// The HTTP layer runs mutating calls on the blocking pool.
    pub lock_timeout_ms: u64,

    /// Internal retries on version conflict before surfacing it
    pub max_version_retries: u32,

    /// Live (Pending or Active) reservations one holder may have at once; 0 lifts the limit
    pub max_live_per_holder: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_hold_ttl_secs: 5 * 60,
            max_hold_ttl_secs: 15 * 60,
            lock_timeout_ms: 250,
            max_version_retries: 5,
            max_live_per_holder: 1,
        }
    }
}

impl LedgerConfig {
    /// Default hold TTL
    pub fn default_hold_ttl(&self) -> Duration {
        Duration::from_secs(self.default_hold_ttl_secs)
    }

    /// Maximum hold TTL
    pub fn max_hold_ttl(&self) -> Duration {
        Duration::from_secs(self.max_hold_ttl_secs)
    }

    /// Per-spot lock wait
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Expiry sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Run the periodic sweep
    pub enabled: bool,

    /// Sweep interval (seconds)
    pub interval_secs: u64,

    /// Remind holders this long before a hold lapses (seconds); 0 disables
    pub reminder_lead_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            reminder_lead_secs: 60,
        }
    }
}

impl SweeperConfig {
    /// Reminder lead time, if reminders are on
    pub fn reminder_lead(&self) -> Option<Duration> {
        (self.reminder_lead_secs > 0).then(|| Duration::from_secs(self.reminder_lead_secs))
    }
}

/// Availability feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Window over which zone changes are coalesced (milliseconds)
    pub coalesce_window_ms: u64,

    /// Flush early once this many distinct zones are dirty
    pub max_dirty_zones: usize,

    /// Feed actor mailbox capacity
    pub mailbox_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 50,
            max_dirty_zones: 256,
            mailbox_capacity: 4096,
        }
    }
}

/// Audit trail configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Records retained in memory
    pub retained_records: usize,

    /// Audit actor mailbox capacity (records are dropped when full)
    pub mailbox_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retained_records: 10_000,
            mailbox_capacity: 1024,
        }
    }
}

/// Holder notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Notifier mailbox capacity (notices are dropped when full)
    pub mailbox_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1024,
        }
    }
}

/// Store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local maps
    Memory,
    /// RocksDB (requires the `rocksdb` feature)
    Rocksdb,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend
    pub backend: StorageBackend,

    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// RocksDB write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// RocksDB max background jobs (compaction + flush)
    pub max_background_jobs: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from("./data/spots"),
            write_buffer_size_mb: 64,
            max_background_jobs: 2,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = match std::env::var("SPOT_CONFIG") {
            Ok(path) => Config::from_file(path)?,
            Err(_) => Config::default(),
        };

        if let Ok(addr) = std::env::var("SPOT_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Ok(dir) = std::env::var("SPOT_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(dir);
            config.storage.backend = StorageBackend::Rocksdb;
        }

        if let Some(secs) = env_u64("SPOT_SWEEP_INTERVAL_SECS")? {
            config.sweeper.interval_secs = secs;
        }

        if let Some(secs) = env_u64("SPOT_MAX_HOLD_TTL_SECS")? {
            config.ledger.max_hold_ttl_secs = secs;
        }

        if let Some(limit) = env_u64("SPOT_MAX_LIVE_PER_HOLDER")? {
            config.ledger.max_live_per_holder = limit as usize;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.geo.cell_size_deg > 0.0 && self.geo.cell_size_deg <= 10.0) {
            return Err(crate::Error::Config(format!(
                "geo.cell_size_deg must be in (0, 10], got {}",
                self.geo.cell_size_deg
            )));
        }
        if self.ledger.max_hold_ttl_secs == 0 {
            return Err(crate::Error::Config(
                "ledger.max_hold_ttl_secs must be positive".to_string(),
            ));
        }
        if self.ledger.default_hold_ttl_secs > self.ledger.max_hold_ttl_secs {
            return Err(crate::Error::Config(
                "ledger.default_hold_ttl_secs exceeds ledger.max_hold_ttl_secs".to_string(),
            ));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(crate::Error::Config(
                "sweeper.interval_secs must be positive".to_string(),
            ));
        }
        if self.feed.mailbox_capacity == 0
            || self.audit.mailbox_capacity == 0
            || self.notify.mailbox_capacity == 0
        {
            return Err(crate::Error::Config(
                "mailbox capacities must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_u64(name: &str) -> crate::Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| crate::Error::Config(format!("{} is not a number: {}", name, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "spot-engine");
        assert_eq!(config.ledger.max_hold_ttl_secs, 900);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.sweeper.enabled);
        assert_eq!(config.ledger.max_live_per_holder, 1);
        assert_eq!(config.sweeper.reminder_lead(), Some(Duration::from_secs(60)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "listen_addr = \"127.0.0.1:9000\"\n\n[ledger]\nmax_hold_ttl_secs = 600\n\n[sweeper]\ninterval_secs = 5"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.ledger.max_hold_ttl_secs, 600);
        assert_eq!(config.ledger.default_hold_ttl_secs, 300);
        assert_eq!(config.sweeper.interval_secs, 5);
        assert_eq!(config.geo.cell_size_deg, 0.005);
    }

    #[test]
    fn test_validate_rejects_inverted_ttls() {
        let mut config = Config::default();
        config.ledger.default_hold_ttl_secs = 1000;
        config.ledger.max_hold_ttl_secs = 600;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_reminders_can_be_disabled() {
        let mut config = Config::default();
        config.sweeper.reminder_lead_secs = 0;
        assert_eq!(config.sweeper.reminder_lead(), None);

        config.notify.mailbox_capacity = 0;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }
}
