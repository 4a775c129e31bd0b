//! Configuration management for Slidegate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::clock::Clock;
use crate::error::{Result, SlidegateError};
use crate::ratelimit::{ExternalStore, KvBackend, Limiter, ShardedStore};

/// Prefix for environment overrides, e.g. `SLIDEGATE__LIMITER__MAX=100`.
pub const ENV_PREFIX: &str = "SLIDEGATE";

/// Main configuration for a Slidegate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlidegateConfig {
    /// Admission settings
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Record store settings
    #[serde(default)]
    pub store: StoreSettings,
}

/// Admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Hits allowed per window
    #[serde(default = "default_max")]
    pub max: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            max: default_max(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_max() -> u64 {
    60
}

fn default_window_secs() -> u64 {
    60
}

/// Which store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Sharded in-process map
    #[default]
    Memory,
    /// Adapter over an injected key-value backend
    External,
}

/// Record store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Store implementation
    #[serde(default)]
    pub kind: StoreKind,

    /// Shard count for the in-process store
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Expiry sweep period in milliseconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Bound on each external backend call in milliseconds
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            shards: default_shards(),
            sweep_interval_ms: default_sweep_interval(),
            backend_timeout_ms: default_backend_timeout(),
        }
    }
}

fn default_shards() -> usize {
    32
}

fn default_sweep_interval() -> u64 {
    1000
}

fn default_backend_timeout() -> u64 {
    250
}

impl SlidegateConfig {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// Environment variables take precedence over the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: SlidegateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SlidegateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| SlidegateError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.window_secs == 0 {
            return Err(SlidegateError::InvalidWindow);
        }
        if self.store.shards == 0 {
            return Err(SlidegateError::InvalidShardCount);
        }
        if self.store.sweep_interval_ms == 0 {
            return Err(SlidegateError::Config(
                "store.sweep_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.limiter.window_secs)
    }

    /// Build a limiter from this configuration.
    ///
    /// `backend` is required when the store kind is `external` and ignored
    /// otherwise.
    pub fn build_limiter(
        &self,
        clock: Arc<dyn Clock>,
        backend: Option<Arc<dyn KvBackend>>,
    ) -> Result<Limiter> {
        self.validate()?;

        let builder = Limiter::builder()
            .max(self.limiter.max)
            .window(self.window())
            .clock(clock.clone());

        let limiter = match self.store.kind {
            StoreKind::Memory => {
                let store = ShardedStore::new(self.store.shards, clock)?;
                if tokio::runtime::Handle::try_current().is_ok() {
                    store.start_sweeper(Duration::from_millis(self.store.sweep_interval_ms));
                }
                builder.store(Arc::new(store)).build()?
            }
            StoreKind::External => {
                let backend = backend.ok_or_else(|| {
                    SlidegateError::Config(
                        "store.kind is external but no backend was supplied".to_string(),
                    )
                })?;
                let timeout = Duration::from_millis(self.store.backend_timeout_ms);
                builder
                    .store(Arc::new(ExternalStore::with_timeout(backend, timeout)))
                    .build()?
            }
        };

        info!(
            max = self.limiter.max,
            window_secs = self.limiter.window_secs,
            store = ?self.store.kind,
            "Rate limiter configured"
        );
        Ok(limiter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::MemoryBackend;

    #[test]
    fn test_defaults() {
        let config = SlidegateConfig::default();
        assert_eq!(config.limiter.max, 60);
        assert_eq!(config.limiter.window_secs, 60);
        assert_eq!(config.store.kind, StoreKind::Memory);
        assert_eq!(config.store.shards, 32);
        assert_eq!(config.store.sweep_interval_ms, 1000);
        assert_eq!(config.store.backend_timeout_ms, 250);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
limiter:
  max: 5
store:
  kind: external
  backend_timeout_ms: 100
"#;
        let config = SlidegateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.max, 5);
        assert_eq!(config.limiter.window_secs, 60);
        assert_eq!(config.store.kind, StoreKind::External);
        assert_eq!(config.store.backend_timeout_ms, 100);
        assert_eq!(config.store.shards, 32);
    }

    #[test]
    fn test_zero_window_rejected() {
        let yaml = "limiter:\n  window_secs: 0\n";
        assert!(matches!(
            SlidegateConfig::from_yaml(yaml),
            Err(SlidegateError::InvalidWindow)
        ));
    }

    #[test]
    fn test_zero_shards_rejected() {
        let yaml = "store:\n  shards: 0\n";
        assert!(matches!(
            SlidegateConfig::from_yaml(yaml),
            Err(SlidegateError::InvalidShardCount)
        ));
    }

    #[test]
    fn test_unknown_store_kind_rejected() {
        let yaml = "store:\n  kind: carrier-pigeon\n";
        assert!(matches!(
            SlidegateConfig::from_yaml(yaml),
            Err(SlidegateError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("slidegate-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "limiter:\n  max: 7\n  window_secs: 30\n").unwrap();

        let loaded = SlidegateConfig::load(Some(path.as_path()));
        let from_file = SlidegateConfig::from_file(&path);
        std::fs::remove_file(&path).unwrap();

        let loaded = loaded.unwrap();
        assert_eq!(loaded.limiter.max, 7);
        assert_eq!(loaded.limiter.window_secs, 30);
        assert_eq!(from_file.unwrap().limiter.max, 7);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = std::env::temp_dir().join("slidegate-does-not-exist.yaml");
        assert!(matches!(
            SlidegateConfig::load(Some(path.as_path())),
            Err(SlidegateError::ConfigSource(_))
        ));
    }

    #[tokio::test]
    async fn test_build_memory_limiter() {
        let config = SlidegateConfig::from_yaml("limiter:\n  max: 2\n  window_secs: 10\n").unwrap();
        let limiter = config
            .build_limiter(Arc::new(ManualClock::new(1_000)), None)
            .unwrap();

        assert_eq!(limiter.max(), 2);
        assert_eq!(limiter.window(), Duration::from_secs(10));
        assert!(limiter.check("k").await.admitted);
        assert!(limiter.check("k").await.admitted);
        assert!(!limiter.check("k").await.admitted);
    }

    #[tokio::test]
    async fn test_build_external_limiter() {
        let config = SlidegateConfig::from_yaml("store:\n  kind: external\n").unwrap();
        let clock = Arc::new(ManualClock::new(1_000));

        let missing = config.build_limiter(clock.clone(), None);
        assert!(matches!(missing, Err(SlidegateError::Config(_))));

        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new(clock.clone()));
        let limiter = config.build_limiter(clock, Some(backend)).unwrap();
        assert!(limiter.check("k").await.admitted);
    }
}
