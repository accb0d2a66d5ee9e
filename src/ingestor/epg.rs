//! XMLTV EPG ingestion.
//!
//! The document is downloaded with byte-level progress, then walked as a
//! flat event stream with `quick_xml::Reader` and small per-element
//! accumulators. Programs with unparseable or inverted timestamps are
//! counted and skipped; a parse error partway through a document surfaces
//! whatever was accumulated so far as salvage for the caller to decide on.

use std::time::{Duration, Instant};

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{info, warn};

use crate::errors::IngestError;
use crate::ingestor::state_manager::{LoadStateManager, LoadToken};
use crate::models::{EpgTimeline, LoadState, Program, ProgressInfo};
use crate::transfer::TransferClient;
use crate::utils::time::parse_xmltv_datetime;

const PROGRESS_THROTTLE: Duration = Duration::from_millis(300);
const CANCEL_CHECK_EVERY: usize = 500;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpgStats {
    pub channels: usize,
    pub programs: usize,
    pub malformed_programs: usize,
    pub duplicate_channels: usize,
}

#[derive(Debug, Clone)]
pub struct EpgLoad {
    pub timeline: EpgTimeline,
    pub stats: EpgStats,
}

/// An EPG ingestion failure, possibly carrying the portion of the guide
/// parsed before the failure.
#[derive(Debug)]
pub struct EpgLoadError {
    pub error: IngestError,
    pub salvage: Option<EpgLoad>,
}

impl EpgLoadError {
    fn total(error: IngestError) -> Self {
        Self {
            error,
            salvage: None,
        }
    }
}

impl From<IngestError> for EpgLoadError {
    fn from(error: IngestError) -> Self {
        Self::total(error)
    }
}

impl From<crate::errors::TransferError> for EpgLoadError {
    fn from(error: crate::errors::TransferError) -> Self {
        Self::total(IngestError::Network(error))
    }
}

impl std::fmt::Display for EpgLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.salvage {
            Some(load) => write!(
                f,
                "{} ({} programs salvaged)",
                self.error, load.stats.programs
            ),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for EpgLoadError {}

/// Text-carrying child element currently open.
enum TextTarget {
    DisplayName,
    Title,
    Description,
}

#[derive(Default)]
struct ChannelAccumulator {
    id: String,
    display_name: String,
}

#[derive(Default)]
struct ProgramAccumulator {
    channel_id: String,
    start_raw: String,
    stop_raw: String,
    title: String,
    description: String,
    catchup_id: Option<String>,
    timestamps_malformed: bool,
}

impl ProgramAccumulator {
    fn build(self) -> Option<Program> {
        if self.timestamps_malformed || self.channel_id.is_empty() {
            return None;
        }
        let start = parse_xmltv_datetime(&self.start_raw)?;
        let stop = parse_xmltv_datetime(&self.stop_raw)?;
        if stop <= start {
            return None;
        }
        let has_archive = self.catchup_id.is_some();
        Some(Program {
            title: if self.title.is_empty() {
                "Unknown".to_string()
            } else {
                self.title
            },
            description: if self.description.is_empty() {
                None
            } else {
                Some(self.description)
            },
            start_time: start,
            end_time: stop,
            channel_id: self.channel_id,
            has_archive,
            archive_url: self.catchup_id,
            archive_days: None,
        })
    }
}

pub struct EpgIngestor {
    transfer: TransferClient,
}

impl EpgIngestor {
    pub fn new(transfer: TransferClient) -> Self {
        Self { transfer }
    }

    /// Download and parse an XMLTV guide from a remote URL.
    pub async fn ingest_url(
        &self,
        url: &str,
        state: &LoadStateManager,
        token: &LoadToken,
    ) -> Result<EpgLoad, EpgLoadError> {
        info!("Starting EPG ingestion from {}", url);
        state
            .update_progress(
                token.load_id,
                LoadState::Connecting,
                ProgressInfo::step("Connecting to EPG source", 0.05),
            )
            .await;

        let mut fetch = self.transfer.fetch(url).await?;
        let total_bytes = fetch.content_length;
        let mut body: Vec<u8> = Vec::with_capacity(total_bytes.unwrap_or(0) as usize);
        let mut last_report = Instant::now();

        while let Some(chunk) = fetch.next_chunk().await {
            if token.is_cancelled() {
                info!("EPG load of {} cancelled during download", url);
                return Err(EpgLoadError::total(IngestError::Cancelled));
            }
            let chunk = chunk.map_err(IngestError::Network)?;
            body.extend_from_slice(&chunk);

            if last_report.elapsed() >= PROGRESS_THROTTLE {
                last_report = Instant::now();
                let fraction = match total_bytes {
                    Some(total) if total > 0 => {
                        0.05 + 0.5 * (body.len() as f32 / total as f32).min(1.0)
                    }
                    _ => 0.3,
                };
                state
                    .update_progress(
                        token.load_id,
                        LoadState::Downloading,
                        ProgressInfo {
                            current_step: format!("Downloaded {} KB", body.len() / 1024),
                            fraction,
                            total_bytes,
                            downloaded_bytes: Some(body.len() as u64),
                            items_parsed: None,
                        },
                    )
                    .await;
            }
        }

        self.parse(&body, url, state, Some(token)).await
    }

    /// Parse an XMLTV guide from a local file.
    pub async fn ingest_file(
        &self,
        path: &std::path::Path,
        state: &LoadStateManager,
        token: &LoadToken,
    ) -> Result<EpgLoad, EpgLoadError> {
        info!("Starting EPG ingestion from file {}", path.display());
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| EpgLoadError::total(IngestError::Io(e)))?;
        self.parse(&body, &path.display().to_string(), state, Some(token))
            .await
    }

    /// Parse a complete XMLTV document. Progress is emitted on a time
    /// throttle so tight parse loops do not flood subscribers.
    pub async fn parse(
        &self,
        bytes: &[u8],
        source: &str,
        state: &LoadStateManager,
        token: Option<&LoadToken>,
    ) -> Result<EpgLoad, EpgLoadError> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(EpgLoadError::total(IngestError::empty_source(source)));
        }

        let mut reader = Reader::from_reader(bytes);
        reader.config_mut().trim_text(true);

        let mut timeline = EpgTimeline::default();
        let mut stats = EpgStats::default();
        let mut channel_acc: Option<ChannelAccumulator> = None;
        let mut program_acc: Option<ProgramAccumulator> = None;
        let mut text_target: Option<TextTarget> = None;

        let total = bytes.len();
        let mut buf = Vec::new();
        let mut events = 0usize;
        let mut last_report = Instant::now();

        loop {
            events += 1;
            if events % CANCEL_CHECK_EVERY == 0 {
                if let Some(token) = token {
                    if token.is_cancelled() {
                        info!("EPG load of {} cancelled during parse", source);
                        return Err(EpgLoadError::total(IngestError::Cancelled));
                    }
                    if last_report.elapsed() >= PROGRESS_THROTTLE {
                        last_report = Instant::now();
                        let fraction =
                            0.55 + 0.4 * (reader.buffer_position() as f32 / total as f32).min(1.0);
                        state
                            .update_progress(
                                token.load_id,
                                LoadState::Parsing,
                                ProgressInfo {
                                    current_step: format!("Parsed {} programs", stats.programs),
                                    fraction,
                                    total_bytes: Some(total as u64),
                                    downloaded_bytes: Some(total as u64),
                                    items_parsed: Some(stats.programs),
                                },
                            )
                            .await;
                    }
                }
            }

            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => match e.name().as_ref() {
                    b"channel" => {
                        let mut acc = ChannelAccumulator::default();
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"id" {
                                acc.id = String::from_utf8_lossy(&attr.value).into_owned();
                            }
                        }
                        channel_acc = Some(acc);
                    }
                    b"display-name" if channel_acc.is_some() => {
                        text_target = Some(TextTarget::DisplayName);
                    }
                    b"programme" => {
                        let mut acc = ProgramAccumulator::default();
                        for attr in e.attributes().flatten() {
                            let value = String::from_utf8_lossy(&attr.value).into_owned();
                            match attr.key.as_ref() {
                                b"start" => acc.start_raw = value,
                                b"stop" => acc.stop_raw = value,
                                b"channel" => acc.channel_id = value,
                                b"catchup-id" => acc.catchup_id = Some(value),
                                _ => {}
                            }
                        }
                        program_acc = Some(acc);
                    }
                    b"title" if program_acc.is_some() => {
                        text_target = Some(TextTarget::Title);
                    }
                    b"desc" if program_acc.is_some() => {
                        text_target = Some(TextTarget::Description);
                    }
                    _ => {}
                },
                Ok(Event::Text(ref t)) => {
                    if let Some(target) = &text_target {
                        let text = t.unescape().unwrap_or(std::borrow::Cow::Borrowed(""));
                        match target {
                            TextTarget::DisplayName => {
                                if let Some(acc) = channel_acc.as_mut() {
                                    // Keep the first display name only.
                                    if acc.display_name.is_empty() {
                                        acc.display_name = text.into_owned();
                                    }
                                }
                            }
                            TextTarget::Title => {
                                if let Some(acc) = program_acc.as_mut() {
                                    acc.title.push_str(&text);
                                }
                            }
                            TextTarget::Description => {
                                if let Some(acc) = program_acc.as_mut() {
                                    acc.description.push_str(&text);
                                }
                            }
                        }
                    }
                }
                Ok(Event::End(ref e)) => match e.name().as_ref() {
                    b"channel" => {
                        if let Some(acc) = channel_acc.take() {
                            if !acc.id.is_empty() {
                                if timeline.declare_channel(&acc.id, &acc.display_name) {
                                    stats.channels += 1;
                                } else {
                                    stats.duplicate_channels += 1;
                                }
                            }
                        }
                        text_target = None;
                    }
                    b"programme" => {
                        if let Some(acc) = program_acc.take() {
                            match acc.build() {
                                Some(program) => {
                                    timeline.insert(program);
                                    stats.programs += 1;
                                }
                                None => stats.malformed_programs += 1,
                            }
                        }
                        text_target = None;
                    }
                    b"display-name" | b"title" | b"desc" => {
                        text_target = None;
                    }
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("XMLTV parse error in {}: {}", source, e);
                    let salvage = if stats.programs > 0 || stats.channels > 0 {
                        Some(EpgLoad {
                            timeline,
                            stats: stats.clone(),
                        })
                    } else {
                        None
                    };
                    return Err(EpgLoadError {
                        error: IngestError::malformed(format!(
                            "XMLTV parse error at byte {}: {}",
                            reader.buffer_position(),
                            e
                        )),
                        salvage,
                    });
                }
            }
            buf.clear();
        }

        if stats.malformed_programs > 0 {
            warn!(
                "Skipped {} programs with malformed timestamps in {}",
                stats.malformed_programs, source
            );
        }
        info!(
            "EPG ingestion completed for {}: {} channels, {} programs",
            source, stats.channels, stats.programs
        );

        Ok(EpgLoad { timeline, stats })
    }
}
