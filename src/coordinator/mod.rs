//! Data coordinator: the single owner of published snapshots.
//!
//! Loads go cache-first, fall back to the network, and fall back again to
//! stale cache when the network fails. Published channel and timeline
//! snapshots are immutable `Arc`s swapped wholesale; readers holding the
//! old snapshot keep a consistent view. A completion from a superseded load
//! of the same source is discarded instead of overwriting the newer one.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheKind, CacheStore};
use crate::config::Config;
use crate::errors::{CacheError, IngestError};
use crate::ingestor::{EpgIngestor, EpgLoadError, LoadStateManager, PlaylistIngestor, ProgressReceiver};
use crate::matcher::ProgramGuide;
use crate::models::{EpgTimeline, LoadProgress, PlaylistIndex};
use crate::timeshift::TimeshiftEngine;
use crate::transfer::TransferClient;

/// Where the data a load call returned actually came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// Fetched and parsed from the network.
    Fresh,
    /// Served from a valid cache entry, no network touched.
    Cached,
    /// Network failed; an expired cache entry was served instead.
    StaleCache,
    /// The document was malformed partway through; the parsed prefix was
    /// published.
    Salvaged,
}

/// Cache payload for `CacheKind::Timeshift`: the enriched index plus how
/// many channels the enrichment actually touched.
#[derive(Serialize, Deserialize)]
struct TimeshiftSnapshot {
    index: PlaylistIndex,
    updated: usize,
}

pub struct DataCoordinator {
    config: Config,
    cache: Arc<CacheStore>,
    state: LoadStateManager,
    playlist: PlaylistIngestor,
    epg: EpgIngestor,
    timeshift: TimeshiftEngine,
    channels: RwLock<Option<Arc<PlaylistIndex>>>,
    timeline: RwLock<Option<Arc<EpgTimeline>>>,
}

impl DataCoordinator {
    pub fn new(config: Config) -> Result<Self, CacheError> {
        let cache = Arc::new(CacheStore::new(config.cache.clone())?);
        let transfer = TransferClient::new(config.transfer.clone());
        Ok(Self {
            playlist: PlaylistIngestor::new(transfer.clone(), config.ingestion.clone()),
            epg: EpgIngestor::new(transfer.clone()),
            timeshift: TimeshiftEngine::new(transfer),
            state: LoadStateManager::new(),
            cache,
            channels: RwLock::new(None),
            timeline: RwLock::new(None),
            config,
        })
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn subscribe_progress(&self) -> ProgressReceiver {
        self.state.subscribe()
    }

    pub async fn cancel_load(&self, load_id: Uuid) -> bool {
        self.state.cancel(load_id).await
    }

    pub async fn load_progress(&self, load_id: Uuid) -> Option<LoadProgress> {
        self.state.get_progress(load_id).await
    }

    pub async fn current_channels(&self) -> Option<Arc<PlaylistIndex>> {
        self.channels.read().await.clone()
    }

    pub async fn current_timeline(&self) -> Option<Arc<EpgTimeline>> {
        self.timeline.read().await.clone()
    }

    /// Guide snapshot bound over the current timeline, or `None` before the
    /// first EPG load.
    pub async fn guide(&self) -> Option<ProgramGuide> {
        let timeline = self.current_timeline().await?;
        Some(ProgramGuide::new(timeline, &self.config.epg))
    }

    /// Load a channel list: valid cache, else network, else stale cache.
    pub async fn load_channels(
        &self,
        url: &str,
    ) -> Result<(Arc<PlaylistIndex>, LoadSource), crate::errors::IngestError> {
        if let Ok(Some(index)) = self.cache.load::<PlaylistIndex>(CacheKind::Channels, url).await {
            info!("Serving channels for {} from cache", url);
            let index = Arc::new(index);
            self.publish_channels(index.clone()).await;
            return Ok((index, LoadSource::Cached));
        }
        self.reload_channels(url).await
    }

    /// Load a channel list from the source unconditionally. Plain paths are
    /// read as local files, everything else goes through the transfer
    /// client.
    pub async fn reload_channels(
        &self,
        url: &str,
    ) -> Result<(Arc<PlaylistIndex>, LoadSource), crate::errors::IngestError> {
        let token = self.state.begin_load(url).await;

        let result = if is_remote(url) {
            self.playlist.ingest_url(url, &self.state, &token).await
        } else {
            self.playlist
                .ingest_file(std::path::Path::new(url), &self.state, &token)
                .await
        };
        match result {
            Ok(load) => {
                let index = Arc::new(load.index);
                if self.state.is_current(&token).await {
                    self.publish_channels(index.clone()).await;
                    if let Err(e) = self
                        .cache
                        .save(CacheKind::Channels, url, index.as_ref())
                        .await
                    {
                        // Cache failure degrades persistence, not the load.
                        warn!("Failed to cache channels for {}: {}", url, e);
                    }
                } else {
                    info!("Discarding superseded channel load for {}", url);
                }
                self.state.complete(token.load_id, index.channel_count()).await;
                Ok((index, LoadSource::Fresh))
            }
            Err(e) => {
                self.state.set_error(token.load_id, e.to_string()).await;
                // Cancellation is a distinct outcome: nothing is published
                // and the stale-cache fallback does not apply.
                if matches!(e, IngestError::Cancelled) {
                    return Err(e);
                }
                match self
                    .cache
                    .load_any::<PlaylistIndex>(CacheKind::Channels, url)
                    .await
                {
                    Ok(Some((index, created_at))) => {
                        warn!(
                            "Channel load of {} failed ({}); serving stale cache from {}",
                            url, e, created_at
                        );
                        let index = Arc::new(index);
                        self.publish_channels(index.clone()).await;
                        Ok((index, LoadSource::StaleCache))
                    }
                    _ => Err(e),
                }
            }
        }
    }

    /// Load an EPG: valid cache, else network (with salvage on a malformed
    /// document), else stale cache.
    pub async fn load_epg(
        &self,
        url: &str,
    ) -> Result<(Arc<EpgTimeline>, LoadSource), EpgLoadError> {
        if let Ok(Some(timeline)) = self.cache.load::<EpgTimeline>(CacheKind::Epg, url).await {
            info!("Serving EPG for {} from cache", url);
            let timeline = Arc::new(timeline);
            self.publish_timeline(timeline.clone()).await;
            return Ok((timeline, LoadSource::Cached));
        }
        self.reload_epg(url).await
    }

    pub async fn reload_epg(
        &self,
        url: &str,
    ) -> Result<(Arc<EpgTimeline>, LoadSource), EpgLoadError> {
        let token = self.state.begin_load(url).await;

        let result = if is_remote(url) {
            self.epg.ingest_url(url, &self.state, &token).await
        } else {
            self.epg
                .ingest_file(std::path::Path::new(url), &self.state, &token)
                .await
        };
        match result {
            Ok(load) => {
                let timeline = Arc::new(load.timeline);
                if self.state.is_current(&token).await {
                    self.publish_timeline(timeline.clone()).await;
                    if let Err(e) = self.cache.save(CacheKind::Epg, url, timeline.as_ref()).await {
                        warn!("Failed to cache EPG for {}: {}", url, e);
                    }
                } else {
                    info!("Discarding superseded EPG load for {}", url);
                }
                self.state.complete(token.load_id, load.stats.programs).await;
                Ok((timeline, LoadSource::Fresh))
            }
            Err(EpgLoadError { error, salvage }) => {
                self.state.set_error(token.load_id, error.to_string()).await;
                // Cancellation publishes nothing, salvage or not.
                if matches!(error, IngestError::Cancelled) {
                    return Err(EpgLoadError {
                        error,
                        salvage: None,
                    });
                }

                if let Some(salvage) = salvage {
                    warn!(
                        "EPG document from {} is malformed; publishing {} salvaged programs",
                        url, salvage.stats.programs
                    );
                    let timeline = Arc::new(salvage.timeline);
                    if self.state.is_current(&token).await {
                        self.publish_timeline(timeline.clone()).await;
                    }
                    return Ok((timeline, LoadSource::Salvaged));
                }

                match self.cache.load_any::<EpgTimeline>(CacheKind::Epg, url).await {
                    Ok(Some((timeline, created_at))) => {
                        warn!(
                            "EPG load of {} failed ({}); serving stale cache from {}",
                            url, error, created_at
                        );
                        let timeline = Arc::new(timeline);
                        self.publish_timeline(timeline.clone()).await;
                        Ok((timeline, LoadSource::StaleCache))
                    }
                    _ => Err(EpgLoadError {
                        error,
                        salvage: None,
                    }),
                }
            }
        }
    }

    /// Enrich the current channel list with provider-side archive flags.
    /// Best-effort: failures keep playlist-declared data. Returns how many
    /// channels were updated.
    pub async fn detect_timeshift(&self, m3u_url: &str) -> usize {
        if let Ok(Some(snapshot)) = self
            .cache
            .load::<TimeshiftSnapshot>(CacheKind::Timeshift, m3u_url)
            .await
        {
            info!("Serving timeshift-enriched channels for {} from cache", m3u_url);
            self.publish_channels(Arc::new(snapshot.index)).await;
            return snapshot.updated;
        }

        let Some(current) = self.current_channels().await else {
            warn!("No channel list loaded, skipping timeshift detection");
            return 0;
        };
        let mut index = (*current).clone();
        let updated = self.timeshift.enrich_from_api(&mut index, m3u_url).await;
        if updated > 0 {
            let index = Arc::new(index);
            self.publish_channels(index.clone()).await;
            let snapshot = TimeshiftSnapshot {
                index: (*index).clone(),
                updated,
            };
            if let Err(e) = self
                .cache
                .save(CacheKind::Timeshift, m3u_url, &snapshot)
                .await
            {
                warn!("Failed to cache timeshift data for {}: {}", m3u_url, e);
            }
        }
        updated
    }

    async fn publish_channels(&self, index: Arc<PlaylistIndex>) {
        *self.channels.write().await = Some(index);
    }

    async fn publish_timeline(&self, timeline: Arc<EpgTimeline>) {
        *self.timeline.write().await = Some(timeline);
    }
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}
