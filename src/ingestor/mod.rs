//! Ingestion engines: streaming playlist and EPG parsers plus the shared
//! load-state manager that tracks progress, cancellation and staleness.

pub mod epg;
pub mod playlist;
pub mod state_manager;

pub use epg::{EpgIngestor, EpgLoad, EpgLoadError, EpgStats};
pub use playlist::{PlaylistIngestor, PlaylistLoad, PlaylistParser, PlaylistStats};
pub use state_manager::{LoadStateManager, LoadToken, ProgressReceiver};
