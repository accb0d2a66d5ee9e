//! IPTV data core: playlist and EPG ingestion, guide matching, catch-up URL
//! derivation and a disk cache, coordinated behind immutable published
//! snapshots.
//!
//! The [`coordinator::DataCoordinator`] is the front door: it owns the cache
//! store, the load-state manager and the ingestion engines, and publishes
//! `Arc` snapshots of the channel index and EPG timeline that readers can
//! hold across reloads.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod ingestor;
pub mod matcher;
pub mod models;
pub mod timeshift;
pub mod transfer;
pub mod utils;

pub use cache::{CacheKind, CacheStore};
pub use config::Config;
pub use coordinator::{DataCoordinator, LoadSource};
pub use errors::{CacheError, IngestError, TimeshiftError, TransferError};
pub use matcher::ProgramGuide;
pub use models::{Category, Channel, ChannelKind, EpgTimeline, PlaylistIndex, Program};
pub use timeshift::TimeshiftEngine;
