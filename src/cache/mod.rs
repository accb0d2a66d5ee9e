//! Disk cache store for channel lists, EPG snapshots and settings.
//!
//! One file per `(kind, fingerprint)` where the fingerprint is an MD5 hash
//! of the source URL. Each file embeds a creation header used for validity
//! checks; writes go to a temp file and are atomically renamed into place,
//! so a concurrent reader sees either the old or the new entry, never a
//! partial one. A cache miss is a normal `Ok(None)`, not an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::errors::CacheError;

/// The kinds of payload the store persists, each with its own validity
/// window and file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Channels,
    Epg,
    Settings,
    Timeshift,
}

impl CacheKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            CacheKind::Channels => "channels",
            CacheKind::Epg => "epg",
            CacheKind::Settings => "settings",
            CacheKind::Timeshift => "timeshift",
        }
    }

    pub fn all() -> [CacheKind; 4] {
        [
            CacheKind::Channels,
            CacheKind::Epg,
            CacheKind::Settings,
            CacheKind::Timeshift,
        ]
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheHeader {
    kind: CacheKind,
    source_url: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEnvelope<T> {
    header: CacheHeader,
    payload: T,
}

/// Summary counts and sizes, total and per kind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatistics {
    pub total_bytes: u64,
    pub total_entries: usize,
    pub by_kind: HashMap<String, KindStatistics>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KindStatistics {
    pub entries: usize,
    pub bytes: u64,
}

pub struct CacheStore {
    root: PathBuf,
    config: CacheConfig,
    // Serializes writers per (kind, fingerprint) file.
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CacheStore {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let root = match &config.directory {
            Some(dir) => dir.clone(),
            None => directories::ProjectDirs::from("", "", "iptv-core")
                .ok_or(CacheError::NoCacheDirectory)?
                .cache_dir()
                .to_path_buf(),
        };
        std::fs::create_dir_all(&root)?;
        debug!("Cache store rooted at {}", root.display());
        Ok(Self {
            root,
            config,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Deterministic fingerprint of a source URL.
    pub fn fingerprint(source_url: &str) -> String {
        format!("{:x}", md5::compute(source_url.as_bytes()))
    }

    pub fn entry_path(&self, kind: CacheKind, source_url: &str) -> PathBuf {
        self.root.join(format!(
            "{}_{}.json",
            Self::fingerprint(source_url),
            kind.suffix()
        ))
    }

    /// Validity window for a kind; `None` means entries never expire.
    pub fn validity_window(&self, kind: CacheKind) -> Option<Duration> {
        match kind {
            CacheKind::Channels => Some(Duration::hours(self.config.channel_validity_hours as i64)),
            CacheKind::Epg => Some(Duration::hours(self.config.epg_validity_hours as i64)),
            CacheKind::Timeshift => {
                Some(Duration::hours(self.config.timeshift_validity_hours as i64))
            }
            CacheKind::Settings => None,
        }
    }

    /// Pure validity predicate: written at `created_at`, is the entry still
    /// valid at `now`?
    pub fn is_entry_valid(&self, kind: CacheKind, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.validity_window(kind) {
            Some(window) => now - created_at < window,
            None => true,
        }
    }

    /// Persist a payload. Write failures surface as `CacheWriteFailure` but
    /// never invalidate the in-memory value being cached.
    pub async fn save<T: Serialize>(
        &self,
        kind: CacheKind,
        source_url: &str,
        payload: &T,
    ) -> Result<(), CacheError> {
        let path = self.entry_path(kind, source_url);
        let lock = self.lock_for(&path).await;
        let _guard = lock.lock().await;

        let envelope = CacheEnvelope {
            header: CacheHeader {
                kind,
                source_url: source_url.to_string(),
                created_at: Utc::now(),
            },
            payload,
        };
        let bytes = serde_json::to_vec(&envelope)?;

        let tmp_path = path.with_extension("json.tmp");
        let write = async {
            tokio::fs::write(&tmp_path, &bytes).await?;
            tokio::fs::rename(&tmp_path, &path).await
        };
        write.await.map_err(|source| CacheError::WriteFailure {
            path: path.display().to_string(),
            source,
        })?;

        debug!(
            "Cached {} bytes of {} data for {}",
            bytes.len(),
            kind.suffix(),
            source_url
        );
        Ok(())
    }

    /// Load a payload if present and still within its validity window.
    pub async fn load<T: DeserializeOwned>(
        &self,
        kind: CacheKind,
        source_url: &str,
    ) -> Result<Option<T>, CacheError> {
        match self.load_any(kind, source_url).await? {
            Some((payload, created_at)) if self.is_entry_valid(kind, created_at, Utc::now()) => {
                Ok(Some(payload))
            }
            Some(_) => {
                debug!("Cache entry for {} expired ({})", source_url, kind.suffix());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Load a payload regardless of expiry, with its creation time. Used by
    /// callers that prefer stale data over an empty result when a fresh
    /// load fails.
    pub async fn load_any<T: DeserializeOwned>(
        &self,
        kind: CacheKind,
        source_url: &str,
    ) -> Result<Option<(T, DateTime<Utc>)>, CacheError> {
        let path = self.entry_path(kind, source_url);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: CacheEnvelope<T> = serde_json::from_slice(&bytes)?;
        Ok(Some((envelope.payload, envelope.header.created_at)))
    }

    pub async fn is_valid(&self, kind: CacheKind, source_url: &str) -> bool {
        match self.cache_date(kind, source_url).await {
            Some(created_at) => self.is_entry_valid(kind, created_at, Utc::now()),
            None => false,
        }
    }

    pub async fn cache_date(&self, kind: CacheKind, source_url: &str) -> Option<DateTime<Utc>> {
        let path = self.entry_path(kind, source_url);
        self.read_header(&path).await.map(|h| h.created_at)
    }

    /// Remove all entries of one kind. Returns the number removed.
    pub async fn clear(&self, kind: CacheKind) -> Result<usize, CacheError> {
        let mut removed = 0;
        for (path, _) in self.entries_of_kind(Some(kind)).await? {
            tokio::fs::remove_file(&path).await?;
            removed += 1;
        }
        info!("Cleared {} {} cache entries", removed, kind.suffix());
        Ok(removed)
    }

    pub async fn clear_all(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for kind in CacheKind::all() {
            removed += self.clear(kind).await?;
        }
        Ok(removed)
    }

    /// Expiry sweep: removes entries past their kind's validity window.
    pub async fn clear_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now();
        let mut removed = 0;
        for (path, kind) in self.entries_of_kind(None).await? {
            if let Some(header) = self.read_header(&path).await {
                if !self.is_entry_valid(kind, header.created_at, now) {
                    tokio::fs::remove_file(&path).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("Expiry sweep removed {} cache entries", removed);
        }
        Ok(removed)
    }

    /// Whether a single entry exceeds the per-source size threshold.
    pub async fn is_oversized(&self, kind: CacheKind, source_url: &str) -> bool {
        let threshold = self.config.oversize_threshold_mb * 1024 * 1024;
        let path = self.entry_path(kind, source_url);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len() > threshold,
            Err(_) => false,
        }
    }

    /// Evict entries over the per-source threshold, largest first, and keep
    /// evicting until the total size fits the configured maximum.
    pub async fn clear_oversized(&self) -> Result<usize, CacheError> {
        let threshold = self.config.oversize_threshold_mb * 1024 * 1024;
        let max_total = self.config.max_cache_size_mb * 1024 * 1024;

        let mut sized: Vec<(PathBuf, u64)> = Vec::new();
        for (path, _) in self.entries_of_kind(None).await? {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                sized.push((path, meta.len()));
            }
        }
        sized.sort_by(|a, b| b.1.cmp(&a.1));
        let mut total: u64 = sized.iter().map(|(_, len)| len).sum();

        let mut removed = 0;
        for (path, len) in sized {
            if len > threshold || total > max_total {
                warn!(
                    "Evicting oversized cache entry {} ({} bytes)",
                    path.display(),
                    len
                );
                tokio::fs::remove_file(&path).await?;
                total = total.saturating_sub(len);
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn total_size_bytes(&self) -> Result<u64, CacheError> {
        Ok(self.statistics().await?.total_bytes)
    }

    pub async fn size_for_kind(&self, kind: CacheKind) -> Result<u64, CacheError> {
        let stats = self.statistics().await?;
        Ok(stats
            .by_kind
            .get(kind.suffix())
            .map(|s| s.bytes)
            .unwrap_or(0))
    }

    pub async fn statistics(&self) -> Result<CacheStatistics, CacheError> {
        let mut stats = CacheStatistics::default();
        for (path, kind) in self.entries_of_kind(None).await? {
            let len = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            stats.total_bytes += len;
            stats.total_entries += 1;
            let entry = stats.by_kind.entry(kind.suffix().to_string()).or_default();
            entry.entries += 1;
            entry.bytes += len;
        }
        Ok(stats)
    }

    async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let key = path.display().to_string();
        let mut locks = self.write_locks.lock().await;
        locks.entry(key).or_default().clone()
    }

    async fn read_header(&self, path: &Path) -> Option<CacheHeader> {
        let bytes = tokio::fs::read(path).await.ok()?;
        let envelope: CacheEnvelope<serde_json::Value> = serde_json::from_slice(&bytes).ok()?;
        Some(envelope.header)
    }

    async fn entries_of_kind(
        &self,
        filter: Option<CacheKind>,
    ) -> Result<Vec<(PathBuf, CacheKind)>, CacheError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") {
                continue;
            }
            let stem = name.trim_end_matches(".json");
            let Some((_, suffix)) = stem.rsplit_once('_') else {
                continue;
            };
            let Some(kind) = CacheKind::all().into_iter().find(|k| k.suffix() == suffix) else {
                continue;
            };
            if filter.is_none() || filter == Some(kind) {
                entries.push((path, kind));
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store_in(dir: &Path) -> CacheStore {
        let config = CacheConfig {
            directory: Some(dir.to_path_buf()),
            ..CacheConfig::default()
        };
        CacheStore::new(config).unwrap()
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = CacheStore::fingerprint("http://example.com/playlist.m3u");
        let b = CacheStore::fingerprint("http://example.com/playlist.m3u");
        let c = CacheStore::fingerprint("http://example.com/other.m3u");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn validity_window_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let window = Duration::hours(24);
        let epsilon = Duration::seconds(1);

        assert!(store.is_entry_valid(CacheKind::Channels, t0, t0 + window - epsilon));
        assert!(!store.is_entry_valid(CacheKind::Channels, t0, t0 + window + epsilon));
        // Settings never expire.
        assert!(store.is_entry_valid(CacheKind::Settings, t0, t0 + Duration::days(10_000)));
    }

    #[tokio::test]
    async fn save_load_and_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let url = "http://example.com/playlist.m3u";

        let miss: Option<Vec<String>> = store.load(CacheKind::Channels, url).await.unwrap();
        assert!(miss.is_none());

        let payload = vec!["a".to_string(), "b".to_string()];
        store.save(CacheKind::Channels, url, &payload).await.unwrap();

        let loaded: Vec<String> = store
            .load(CacheKind::Channels, url)
            .await
            .unwrap()
            .expect("entry should be valid immediately after save");
        assert_eq!(loaded, payload);
        assert!(store.is_valid(CacheKind::Channels, url).await);
        assert!(store.cache_date(CacheKind::Channels, url).await.is_some());
    }

    #[tokio::test]
    async fn clear_removes_only_requested_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let url = "http://example.com/src";

        store.save(CacheKind::Channels, url, &1u32).await.unwrap();
        store.save(CacheKind::Epg, url, &2u32).await.unwrap();

        assert_eq!(store.clear(CacheKind::Channels).await.unwrap(), 1);
        let epg: Option<u32> = store.load(CacheKind::Epg, url).await.unwrap();
        assert_eq!(epg, Some(2));

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_entries, 1);
    }

    #[tokio::test]
    async fn oversize_eviction_respects_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            directory: Some(dir.path().to_path_buf()),
            oversize_threshold_mb: 0, // everything is oversized
            ..CacheConfig::default()
        };
        let store = CacheStore::new(config).unwrap();
        store
            .save(CacheKind::Channels, "http://x", &vec![0u8; 128])
            .await
            .unwrap();
        assert!(store.is_oversized(CacheKind::Channels, "http://x").await);
        assert_eq!(store.clear_oversized().await.unwrap(), 1);
    }
}
