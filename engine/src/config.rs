//! The configuration surface (§10): a plain serde struct covering every tunable named in §6,
//! loadable from a TOML file or built field-by-field in code. Deliberately not a
//! scope/flag/env-var precedence chain -- that belongs to a CLI front-end, out of scope here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `serde(with = "seconds")` helper: (de)serializes a `Duration` as a whole number of seconds,
/// since neither TOML nor `std::time::Duration` has a native duration type.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_activities: usize,
    pub max_concurrent_orchestrations: usize,
    #[serde(with = "seconds")]
    pub receive_timeout: Duration,
    #[serde(with = "seconds")]
    pub timer_tick_cap: Duration,
    #[serde(with = "seconds")]
    pub archive_retention: Duration,
    #[serde(with = "seconds")]
    pub reaper_initial_delay: Duration,
    #[serde(with = "seconds")]
    pub reaper_success_interval: Duration,
    #[serde(with = "seconds")]
    pub reaper_failure_interval: Duration,
    pub store_path: PathBuf,
    pub store_max_size_bytes: usize,
    /// Fixed at 1: this core is a single-writer LMDB environment. Sharding the store across
    /// multiple environments (the way `sharded_lmdb` does for its content-addressed cache) is a
    /// documented future extension, not implemented here.
    pub lmdb_shard_count: u32,
    /// Parsed with `log::LevelFilter`'s `FromStr` impl at `Engine::start`; kept as a plain string
    /// here so a malformed config value is a clear error at startup rather than a config-parse
    /// failure with no context.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_concurrent_activities: 4,
            max_concurrent_orchestrations: 4,
            receive_timeout: Duration::from_secs(30),
            timer_tick_cap: Duration::from_secs(1),
            archive_retention: Duration::from_secs(24 * 60 * 60),
            reaper_initial_delay: Duration::from_secs(5 * 60),
            reaper_success_interval: Duration::from_secs(60 * 60),
            reaper_failure_interval: Duration::from_secs(10 * 60),
            store_path: PathBuf::from("engine_store"),
            store_max_size_bytes: 1024 * 1024 * 1024,
            lmdb_shard_count: 1,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_file(path: &Path) -> Result<EngineConfig, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Error reading engine config at {path:?}: {e}"))?;
        toml::from_str(&contents).map_err(|e| format!("Error parsing engine config at {path:?}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = EngineConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.max_concurrent_activities, config.max_concurrent_activities);
        assert_eq!(parsed.receive_timeout, config.receive_timeout);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults_for_missing_fields() {
        let parsed: EngineConfig = toml::from_str("max_concurrent_activities = 16\n").unwrap();
        assert_eq!(parsed.max_concurrent_activities, 16);
        assert_eq!(parsed.max_concurrent_orchestrations, EngineConfig::default().max_concurrent_orchestrations);
    }
}
