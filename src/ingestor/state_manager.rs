//! Per-load progress tracking, cancellation and generation bookkeeping.
//!
//! Every load attempt gets a [`LoadToken`]. Progress updates are broadcast
//! to subscribers in non-decreasing fraction order, the terminal state is
//! recorded exactly once, and a newer load of the same source bumps the
//! source's generation so a stale in-flight completion can be detected and
//! discarded instead of overwriting the newer result.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, watch, RwLock};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::models::{LoadProgress, LoadState, ProgressInfo};

pub type ProgressSender = broadcast::Sender<LoadProgress>;
pub type ProgressReceiver = broadcast::Receiver<LoadProgress>;

/// Handle for one load attempt. Cheap to clone into the task driving the
/// ingestion.
#[derive(Debug, Clone)]
pub struct LoadToken {
    pub load_id: Uuid,
    pub source_key: String,
    pub generation: u64,
    cancel: watch::Receiver<bool>,
}

impl LoadToken {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

#[derive(Clone)]
pub struct LoadStateManager {
    states: Arc<RwLock<HashMap<Uuid, LoadProgress>>>,
    cancellations: Arc<RwLock<HashMap<Uuid, watch::Sender<bool>>>>,
    generations: Arc<RwLock<HashMap<String, u64>>>,
    progress_tx: ProgressSender,
}

impl LoadStateManager {
    pub fn new() -> Self {
        let (progress_tx, _) = broadcast::channel(1000);
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            cancellations: Arc::new(RwLock::new(HashMap::new())),
            generations: Arc::new(RwLock::new(HashMap::new())),
            progress_tx,
        }
    }

    pub fn subscribe(&self) -> ProgressReceiver {
        self.progress_tx.subscribe()
    }

    /// Register a new load for `source_url` and bump its generation. Any
    /// still-running older load of the same source becomes stale.
    pub async fn begin_load(&self, source_url: &str) -> LoadToken {
        let source_key = CacheStore::fingerprint(source_url);
        let load_id = Uuid::new_v4();

        let generation = {
            let mut generations = self.generations.write().await;
            let entry = generations.entry(source_key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancellations.write().await.insert(load_id, cancel_tx);

        let progress = LoadProgress {
            load_id,
            source_key: source_key.clone(),
            state: LoadState::Connecting,
            progress: ProgressInfo::step("Initializing connection", 0.0),
            started_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            error: None,
        };
        self.states.write().await.insert(load_id, progress.clone());
        let _ = self.progress_tx.send(progress);

        LoadToken {
            load_id,
            source_key,
            generation,
            cancel: cancel_rx,
        }
    }

    /// Whether `token` is still the newest load of its source. Stale
    /// completions must not be published.
    pub async fn is_current(&self, token: &LoadToken) -> bool {
        let generations = self.generations.read().await;
        generations.get(&token.source_key).copied() == Some(token.generation)
    }

    pub async fn update_progress(&self, load_id: Uuid, state: LoadState, progress_info: ProgressInfo) {
        // Check-mutate-broadcast happens under one write lock so a racing
        // terminal transition (e.g. cancel) cannot be overwritten by a
        // stale in-flight update, and no broadcast follows a terminal one.
        let mut states = self.states.write().await;
        let Some(progress) = states.get_mut(&load_id) else {
            return;
        };
        // Terminal states are recorded once; late updates are dropped.
        if progress.completed_at.is_some() {
            return;
        }
        let mut info = progress_info;
        // Progress is non-decreasing within one load.
        if info.fraction < progress.progress.fraction {
            info.fraction = progress.progress.fraction;
        }
        progress.state = state.clone();
        progress.progress = info;
        progress.updated_at = Utc::now();

        if matches!(
            state,
            LoadState::Completed | LoadState::Error | LoadState::Cancelled
        ) {
            progress.completed_at = Some(Utc::now());
        }

        let _ = self.progress_tx.send(progress.clone());
    }

    pub async fn complete(&self, load_id: Uuid, items: usize) {
        self.update_progress(
            load_id,
            LoadState::Completed,
            ProgressInfo {
                current_step: format!("Completed - {} items", items),
                fraction: 1.0,
                total_bytes: None,
                downloaded_bytes: None,
                items_parsed: Some(items),
            },
        )
        .await;
        self.cancellations.write().await.remove(&load_id);
    }

    pub async fn set_error(&self, load_id: Uuid, error: String) {
        {
            let mut states = self.states.write().await;
            if let Some(progress) = states.get_mut(&load_id) {
                if progress.completed_at.is_some() {
                    return;
                }
                progress.state = LoadState::Error;
                progress.error = Some(error);
                progress.updated_at = Utc::now();
                progress.completed_at = Some(Utc::now());

                let _ = self.progress_tx.send(progress.clone());
            }
        }
        self.cancellations.write().await.remove(&load_id);
    }

    /// Request cancellation of an in-flight load. Returns false when the
    /// load is unknown or already finished.
    pub async fn cancel(&self, load_id: Uuid) -> bool {
        let sent = {
            let cancellations = self.cancellations.read().await;
            match cancellations.get(&load_id) {
                Some(tx) => tx.send(true).is_ok(),
                None => false,
            }
        };
        if sent {
            self.update_progress(
                load_id,
                LoadState::Cancelled,
                ProgressInfo::step("Cancelled", 0.0),
            )
            .await;
            self.cancellations.write().await.remove(&load_id);
        }
        sent
    }

    pub async fn get_progress(&self, load_id: Uuid) -> Option<LoadProgress> {
        let states = self.states.read().await;
        states.get(&load_id).cloned()
    }

    pub async fn get_all_progress(&self) -> HashMap<Uuid, LoadProgress> {
        let states = self.states.read().await;
        states.clone()
    }

    /// Drop completed load records older than `max_age_hours`.
    pub async fn cleanup_completed(&self, max_age_hours: i64) {
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
        let mut states = self.states.write().await;
        states.retain(|_, progress| match progress.completed_at {
            Some(completed_at) => completed_at > cutoff,
            None => true,
        });
    }
}

impl Default for LoadStateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn newer_load_makes_older_stale() {
        let manager = LoadStateManager::new();
        let first = manager.begin_load("http://example.com/a.m3u").await;
        assert!(manager.is_current(&first).await);

        let second = manager.begin_load("http://example.com/a.m3u").await;
        assert!(!manager.is_current(&first).await);
        assert!(manager.is_current(&second).await);

        // A different source keeps its own generation line.
        let other = manager.begin_load("http://example.com/b.m3u").await;
        assert!(manager.is_current(&other).await);
        assert!(manager.is_current(&second).await);
    }

    #[tokio::test]
    async fn progress_fraction_never_decreases() {
        let manager = LoadStateManager::new();
        let token = manager.begin_load("http://example.com/a.m3u").await;

        manager
            .update_progress(
                token.load_id,
                LoadState::Downloading,
                ProgressInfo::step("half", 0.5),
            )
            .await;
        manager
            .update_progress(
                token.load_id,
                LoadState::Parsing,
                ProgressInfo::step("regression", 0.2),
            )
            .await;

        let progress = manager.get_progress(token.load_id).await.unwrap();
        assert!(progress.progress.fraction >= 0.5);
    }

    #[tokio::test]
    async fn cancel_flips_token_and_is_terminal() {
        let manager = LoadStateManager::new();
        let token = manager.begin_load("http://example.com/a.m3u").await;
        assert!(!token.is_cancelled());

        assert!(manager.cancel(token.load_id).await);
        assert!(token.is_cancelled());

        let progress = manager.get_progress(token.load_id).await.unwrap();
        assert_eq!(progress.state, LoadState::Cancelled);
        assert!(progress.completed_at.is_some());

        // No further updates after the terminal state.
        manager
            .update_progress(
                token.load_id,
                LoadState::Parsing,
                ProgressInfo::step("late", 0.9),
            )
            .await;
        let progress = manager.get_progress(token.load_id).await.unwrap();
        assert_eq!(progress.state, LoadState::Cancelled);
    }

    #[tokio::test]
    async fn racing_updates_cannot_reopen_a_cancelled_load() {
        let manager = LoadStateManager::new();
        let mut events = manager.subscribe();
        let token = manager.begin_load("http://example.com/a.m3u").await;

        let mut tasks = Vec::new();
        for i in 0..50u32 {
            let manager = manager.clone();
            let load_id = token.load_id;
            tasks.push(tokio::spawn(async move {
                manager
                    .update_progress(
                        load_id,
                        LoadState::Parsing,
                        ProgressInfo::step("tick", i as f32 / 100.0),
                    )
                    .await;
            }));
        }
        assert!(manager.cancel(token.load_id).await);
        for task in tasks {
            task.await.unwrap();
        }

        // However the updates interleaved with the cancel, the record ends
        // terminal and stays that way.
        let progress = manager.get_progress(token.load_id).await.unwrap();
        assert_eq!(progress.state, LoadState::Cancelled);
        assert!(progress.completed_at.is_some());

        // No broadcast may follow the terminal one.
        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        let terminal_pos = received
            .iter()
            .position(|e| e.completed_at.is_some())
            .expect("terminal broadcast must be delivered");
        assert_eq!(terminal_pos, received.len() - 1);
    }
}
