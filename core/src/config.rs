use crate::error::{RecoveryError, RecoveryResult};
use crate::quartile::VolumeMeasure;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path:            String,
    pub pool_size:       usize,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path:            "recovery.db".to_string(),
            pool_size:       4,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs:    u64,
    /// TTL for entity-filtered ranking results, which are rarely reused.
    pub filtered_ttl_secs:   u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs:    30 * 60,
            filtered_ttl_secs:   5 * 60,
            sweep_interval_secs: 20 * 60,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn filtered_ttl(&self) -> Duration {
        Duration::from_secs(self.filtered_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub enabled:         bool,
    pub run_on_startup:  bool,
    pub interval_secs:   u64,
    /// Months recomputed on every periodic pass, current month included.
    pub trailing_months: u32,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled:         true,
            run_on_startup:  true,
            interval_secs:   10 * 60,
            trailing_months: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesConfig {
    /// Read closed months from the rollup tables when they exist.
    pub prefer_rollups: bool,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self { prefer_rollups: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub measure: VolumeMeasure,
}

/// Action codes that define the funnel stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionCodes {
    pub right_party:      Vec<String>,
    pub qualified:        Vec<String>,
    pub agreement_action: String,
    pub agreement_kind:   String,
}

impl Default for ActionCodes {
    fn default() -> Self {
        let codes = |list: &[&str]| list.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        Self {
            right_party: codes(&["EIO", "CSA", "ACD", "SCP", "APH", "DEF", "SRP", "APC", "JUR", "DDA"]),
            qualified:   codes(&["CSA", "ACD", "SCP", "APH", "DEF", "SRP", "JUR", "DDA"]),
            agreement_action: "DDA".to_string(),
            agreement_kind:   "NOV".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub database: DatabaseConfig,
    pub cache:    CacheConfig,
    pub refresh:  RefreshConfig,
    pub series:   SeriesConfig,
    pub ranking:  RankingConfig,
    pub actions:  ActionCodes,
}

impl RecoveryConfig {
    /// Load from a JSON file. Missing sections take their defaults.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: RecoveryConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// In-memory, no background refresh loop.
    pub fn default_test() -> Self {
        Self {
            database: DatabaseConfig {
                path:            ":memory:".to_string(),
                pool_size:       1,
                busy_timeout_ms: 1_000,
            },
            refresh: RefreshConfig {
                enabled: false,
                ..RefreshConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> RecoveryResult<()> {
        if self.database.pool_size == 0 {
            return Err(RecoveryError::config("database.pool_size must be at least 1"));
        }
        if self.cache.default_ttl_secs == 0 || self.cache.filtered_ttl_secs == 0 {
            return Err(RecoveryError::config("cache TTLs must be positive"));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(RecoveryError::config("cache.sweep_interval_secs must be positive"));
        }
        if self.refresh.interval_secs == 0 {
            return Err(RecoveryError::config("refresh.interval_secs must be positive"));
        }
        if self.refresh.trailing_months == 0 {
            return Err(RecoveryError::config("refresh.trailing_months must be at least 1"));
        }
        if self.actions.agreement_action.trim().is_empty() {
            return Err(RecoveryError::config("actions.agreement_action is empty"));
        }
        if self.actions.right_party.is_empty() || self.actions.qualified.is_empty() {
            return Err(RecoveryError::config("stage action code lists must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: RecoveryConfig =
            serde_json::from_str(r#"{ "refresh": { "trailing_months": 6 } }"#).unwrap();
        assert_eq!(cfg.refresh.trailing_months, 6);
        assert_eq!(cfg.refresh.interval_secs, 600);
        assert_eq!(cfg.cache.default_ttl_secs, 1800);
        assert_eq!(cfg.actions.agreement_action, "DDA");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_pool_is_rejected() {
        let mut cfg = RecoveryConfig::default_test();
        cfg.database.pool_size = 0;
        assert!(matches!(cfg.validate(), Err(RecoveryError::Configuration(_))));
    }
}
