//! Utility helpers shared across the ingestion and timeshift engines.

pub mod time;
