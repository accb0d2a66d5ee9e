use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub epg: EpgConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache directory override. When unset, the platform application-data
    /// directory is used.
    pub directory: Option<PathBuf>,
    pub channel_validity_hours: u64,
    pub epg_validity_hours: u64,
    pub timeshift_validity_hours: u64,
    /// Settings entries never expire; no window is configurable for them.
    pub max_cache_size_mb: u64,
    /// Entries above this are flagged oversized and eligible for proactive
    /// eviction.
    pub oversize_threshold_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            channel_validity_hours: 24,
            epg_validity_hours: 6,
            timeshift_validity_hours: 6,
            max_cache_size_mb: 500,
            oversize_threshold_mb: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Emit a progress update at most every this many parsed entries.
    pub progress_update_interval: usize,
    #[serde(default)]
    pub memory: MemoryOptions,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            progress_update_interval: 100,
            memory: MemoryOptions::default(),
        }
    }
}

/// Memory-optimization caps for very large playlists. When enabled, entries
/// past a cap are dropped (and counted), not rejected as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryOptions {
    pub enabled: bool,
    /// 0 means unlimited.
    pub max_channels_per_group: usize,
    /// 0 means unlimited.
    pub max_total_channels: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_channels_per_group: 10_000,
            max_total_channels: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpgConfig {
    /// Uniform display offset in whole hours. Stored program times stay in
    /// server time; the offset is applied at query/display boundaries only.
    pub time_offset_hours: i32,
    /// Characters stripped during fallback channel-name matching. This is a
    /// tunable table, not hardcoded logic.
    pub name_match_strip: String,
}

impl Default for EpgConfig {
    fn default() -> Self {
        Self {
            time_offset_hours: 0,
            name_match_strip: " \t-_.()[]:&'+/!".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            initial_backoff_ms: 500,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("IPTV_CORE_CONFIG").unwrap_or_else(|_| "iptv-core.toml".to_string());
        Self::load_from(&config_file)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        if std::path::Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_validity_windows() {
        let config = CacheConfig::default();
        assert_eq!(config.channel_validity_hours, 24);
        assert_eq!(config.epg_validity_hours, 6);
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(
            parsed.ingestion.progress_update_interval,
            config.ingestion.progress_update_interval
        );
    }
}
