//! Error type definitions for the IPTV data core
//!
//! This module defines all error types used throughout the crate,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward.
//!
//! Per-item problems (a malformed playlist entry, a programme with an
//! unparseable timestamp) are never errors: they are absorbed and counted
//! by the ingestion engines. The types here cover the failures that must
//! reach the caller.

use thiserror::Error;

/// Errors surfaced by the ingestion engines.
///
/// A cache miss is deliberately not represented here; "nothing cached" is a
/// normal `Ok(None)` outcome of the cache store.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The source produced no usable content at all.
    #[error("empty source: {url}")]
    EmptySource { url: String },

    /// The document is structurally broken beyond per-item recovery.
    /// A partial result may still be offered for salvage alongside this.
    #[error("malformed document: {message}")]
    MalformedDocument { message: String },

    /// Network failure reported by the transfer client.
    #[error("network failure: {0}")]
    Network(#[from] TransferError),

    /// The load was cancelled by the caller.
    #[error("load cancelled")]
    Cancelled,

    /// Local file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transfer client (HTTP fetch) errors.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("retries exhausted after {attempts} attempts for {url}: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        url: String,
        last_error: String,
    },
}

/// Cache store errors.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Writing a cache entry failed. The in-memory result the write came
    /// from is still valid; callers treat this as a warning.
    #[error("cache write failed for {path}: {source}")]
    WriteFailure {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cache serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no usable cache directory on this platform")]
    NoCacheDirectory,
}

/// Timeshift URL derivation errors.
#[derive(Error, Debug)]
pub enum TimeshiftError {
    /// The catch-up template is missing, empty, or substitution produced an
    /// invalid URL. Callers must not attempt playback on this outcome.
    #[error("catch-up template error: {message}")]
    Template { message: String },

    /// The channel or program does not support time-shifted playback.
    #[error("timeshift not supported: {reason}")]
    NotSupported { reason: String },
}

impl TimeshiftError {
    pub fn template<S: Into<String>>(message: S) -> Self {
        Self::Template {
            message: message.into(),
        }
    }

    pub fn not_supported<S: Into<String>>(reason: S) -> Self {
        Self::NotSupported {
            reason: reason.into(),
        }
    }
}

impl IngestError {
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedDocument {
            message: message.into(),
        }
    }

    pub fn empty_source<S: Into<String>>(url: S) -> Self {
        Self::EmptySource { url: url.into() }
    }
}
