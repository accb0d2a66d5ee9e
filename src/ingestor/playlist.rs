//! Streaming M3U playlist ingestion.
//!
//! Single forward pass over lines: an `#EXTINF` metadata line opens an
//! entry, the following URL line closes it. The parser is fed in chunks so
//! very large playlists never have to sit in memory as one string, and the
//! pending entry survives a chunk boundary that splits a line. Malformed
//! entries are skipped and counted, never fatal.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::config::{IngestionConfig, MemoryOptions};
use crate::errors::IngestError;
use crate::ingestor::state_manager::{LoadStateManager, LoadToken};
use crate::models::{
    CatchupSource, Channel, ChannelKind, LoadState, PlaylistIndex, ProgressInfo,
};
use crate::transfer::TransferClient;

/// Per-load diagnostics: what was skipped or dropped and why.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaylistStats {
    pub lines: usize,
    pub entries_parsed: usize,
    pub malformed_entries: usize,
    pub dropped_channels: usize,
}

/// Result of one playlist load.
#[derive(Debug, Clone)]
pub struct PlaylistLoad {
    pub index: PlaylistIndex,
    pub stats: PlaylistStats,
}

/// Accumulates bytes and yields complete lines; the tail of a line split by
/// a chunk boundary stays buffered until the rest arrives.
struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn push(&mut self, chunk: &[u8], lines: &mut Vec<String>) {
        self.buf.extend_from_slice(chunk);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the newline
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
    }

    fn finish(mut self, lines: &mut Vec<String>) {
        if !self.buf.is_empty() {
            lines.push(String::from_utf8_lossy(&self.buf).into_owned());
            self.buf.clear();
        }
    }
}

/// Attributes and display name scanned from one `#EXTINF` line.
#[derive(Debug)]
struct PendingEntry {
    name: String,
    attributes: HashMap<String, String>,
}

/// Builds the organized index while enforcing the memory-optimization caps.
struct IndexBuilder {
    index: PlaylistIndex,
    memory: MemoryOptions,
    dropped: usize,
}

impl IndexBuilder {
    fn new(memory: MemoryOptions) -> Self {
        Self {
            index: PlaylistIndex::default(),
            memory,
            dropped: 0,
        }
    }

    fn push(&mut self, channel: Channel) {
        if self.memory.enabled
            && self.memory.max_total_channels > 0
            && self.index.channels.len() >= self.memory.max_total_channels
        {
            self.dropped += 1;
            return;
        }

        let group_indices = self
            .index
            .channels_by_group
            .entry(channel.group.clone())
            .or_default();

        if self.memory.enabled
            && self.memory.max_channels_per_group > 0
            && group_indices.len() >= self.memory.max_channels_per_group
        {
            self.dropped += 1;
            return;
        }

        if group_indices.is_empty() && !self.index.groups.contains(&channel.group) {
            self.index.groups.push(channel.group.clone());
            self.index
                .groups_by_category
                .entry(channel.category)
                .or_default()
                .push(channel.group.clone());
        }

        group_indices.push(self.index.channels.len());
        self.index.channels.push(channel);
    }
}

/// Chunk-fed parser state machine. The only state carried between chunks is
/// the line assembler tail and the pending entry, so any chunking of the
/// same document produces the same index.
pub struct PlaylistParser {
    assembler: LineAssembler,
    pending: Option<PendingEntry>,
    builder: IndexBuilder,
    stats: PlaylistStats,
    line_queue: Vec<String>,
}

impl PlaylistParser {
    pub fn new(memory: MemoryOptions) -> Self {
        Self {
            assembler: LineAssembler::new(),
            pending: None,
            builder: IndexBuilder::new(memory),
            stats: PlaylistStats::default(),
            line_queue: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        let mut lines = std::mem::take(&mut self.line_queue);
        lines.clear();
        self.assembler.push(chunk, &mut lines);
        for line in &lines {
            self.feed_line(line);
        }
        self.line_queue = lines;
    }

    pub fn entries_parsed(&self) -> usize {
        self.stats.entries_parsed
    }

    fn feed_line(&mut self, raw: &str) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }
        self.stats.lines += 1;

        if line.starts_with("#EXTINF:") {
            if self.pending.take().is_some() {
                // Metadata line without a following URL.
                self.stats.malformed_entries += 1;
            }
            match parse_extinf(line) {
                Some(entry) => self.pending = Some(entry),
                None => self.stats.malformed_entries += 1,
            }
        } else if line.starts_with('#') {
            // #EXTM3U header, #EXTGRP and friends: ignored.
        } else {
            match self.pending.take() {
                Some(entry) => {
                    let channel = build_channel(entry, line);
                    self.stats.entries_parsed += 1;
                    self.builder.push(channel);
                }
                None => {
                    // URL line without a preceding metadata line.
                    self.stats.malformed_entries += 1;
                }
            }
        }
    }

    pub fn finish(mut self, source: &str) -> Result<PlaylistLoad, IngestError> {
        let mut lines = std::mem::take(&mut self.line_queue);
        let assembler = std::mem::replace(&mut self.assembler, LineAssembler::new());
        assembler.finish(&mut lines);
        for line in &lines {
            self.feed_line(line);
        }
        if self.pending.take().is_some() {
            self.stats.malformed_entries += 1;
        }

        if self.stats.lines == 0 {
            return Err(IngestError::empty_source(source));
        }

        self.stats.dropped_channels = self.builder.dropped;
        if self.stats.dropped_channels > 0 {
            debug!(
                "Memory optimization dropped {} channels for {}",
                self.stats.dropped_channels, source
            );
        }

        Ok(PlaylistLoad {
            index: self.builder.index,
            stats: self.stats,
        })
    }
}

/// Parse an `#EXTINF` line into attributes plus the trailing display name.
fn parse_extinf(line: &str) -> Option<PendingEntry> {
    let content = line.strip_prefix("#EXTINF:")?;
    let comma_pos = content.rfind(',')?;
    let (attrs_part, name) = content.split_at(comma_pos);
    let name = name.trim_start_matches(',').trim();

    let attributes = parse_attributes(attrs_part);
    Some(PendingEntry {
        name: name.to_string(),
        attributes,
    })
}

/// Tolerant key="value" / key=value scanner: arbitrary order, quoted or
/// unquoted values, unknown keys kept for the caller to ignore.
fn parse_attributes(attrs_part: &str) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    let mut chars = attrs_part.chars().peekable();
    let mut current_key = String::new();
    let mut current_value = String::new();
    let mut in_quotes = false;
    let mut in_value = false;

    while let Some(ch) = chars.next() {
        match ch {
            ' ' | '\t' if !in_quotes => {
                if in_value {
                    if !current_key.is_empty() && !current_value.is_empty() {
                        attributes.insert(
                            current_key.trim().to_ascii_lowercase(),
                            current_value.clone(),
                        );
                    }
                    current_key.clear();
                    current_value.clear();
                    in_value = false;
                }
            }
            '=' if !in_quotes && !in_value => {
                in_value = true;
                if chars.peek() == Some(&'"') {
                    chars.next();
                    in_quotes = true;
                }
            }
            '"' if in_value => {
                in_quotes = false;
                if !current_key.is_empty() {
                    attributes.insert(
                        current_key.trim().to_ascii_lowercase(),
                        current_value.clone(),
                    );
                }
                current_key.clear();
                current_value.clear();
                in_value = false;
            }
            _ => {
                if in_value {
                    current_value.push(ch);
                } else {
                    current_key.push(ch);
                }
            }
        }
    }

    if in_value && !current_key.is_empty() && !current_value.is_empty() {
        attributes.insert(current_key.trim().to_ascii_lowercase(), current_value);
    }

    attributes
}

/// Classify a playlist entry as live, movie or series from its URL shape
/// and group name. Live streams typically end in a numeric stream id or a
/// transport extension; VOD entries carry container extensions or
/// /movie/ /series/ path segments.
fn classify(url: &str, group: &str) -> ChannelKind {
    let path = url.split('?').next().unwrap_or(url).to_ascii_lowercase();

    if path.contains("/series/") {
        return ChannelKind::Series;
    }
    if path.contains("/movie/") || path.contains("/movies/") {
        return ChannelKind::Movie;
    }

    const CONTAINER_EXTENSIONS: [&str; 7] =
        [".mp4", ".mkv", ".avi", ".mov", ".wmv", ".flv", ".webm"];
    if CONTAINER_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        let group_lower = group.to_lowercase();
        if group_lower.contains("series") || group_lower.contains("show") {
            return ChannelKind::Series;
        }
        return ChannelKind::Movie;
    }

    ChannelKind::Live
}

fn build_channel(entry: PendingEntry, url: &str) -> Channel {
    let attrs = &entry.attributes;
    let group = attrs
        .get("group-title")
        .cloned()
        .unwrap_or_else(|| "Uncategorized".to_string());

    let mut channel = Channel::new(entry.name, url, group);
    channel.id = attrs.get("tvg-id").cloned().filter(|s| !s.is_empty());
    channel.logo_url = attrs.get("tvg-logo").cloned().filter(|s| !s.is_empty());
    channel.kind = classify(url, &channel.group);

    // Catch-up metadata. Unknown scheme names mean "no support", silently.
    channel.catchup_source = attrs.get("catchup").and_then(|v| CatchupSource::parse(v));
    channel.catchup_days = attrs
        .get("catchup-days")
        .or_else(|| attrs.get("tvg-rec"))
        .and_then(|v| v.trim().parse::<u32>().ok())
        // A declared scheme without a day count gets the common 7-day
        // provider default.
        .unwrap_or(if channel.catchup_source.is_some() { 7 } else { 0 });
    channel.catchup_template = attrs
        .get("catchup-source")
        .or_else(|| attrs.get("catchup-template"))
        .cloned()
        .filter(|s| !s.is_empty());
    channel.catchup_correction_secs = attrs
        .get("catchup-correction")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|hours| (hours * 3600.0) as i64)
        .unwrap_or(0);
    channel.supports_catchup = channel.catchup_source.is_some() && channel.catchup_days > 0;

    channel
}

pub struct PlaylistIngestor {
    transfer: TransferClient,
    config: IngestionConfig,
}

impl PlaylistIngestor {
    pub fn new(transfer: TransferClient, config: IngestionConfig) -> Self {
        Self { transfer, config }
    }

    /// Ingest a playlist from a remote URL, streaming chunks straight into
    /// the parser.
    pub async fn ingest_url(
        &self,
        url: &str,
        state: &LoadStateManager,
        token: &LoadToken,
    ) -> Result<PlaylistLoad, IngestError> {
        info!("Starting playlist ingestion from {}", url);
        state
            .update_progress(
                token.load_id,
                LoadState::Connecting,
                ProgressInfo::step("Connecting to playlist source", 0.05),
            )
            .await;

        let mut fetch = self.transfer.fetch(url).await?;
        let total_bytes = fetch.content_length;

        let mut parser = PlaylistParser::new(self.config.memory.clone());
        let mut downloaded = 0u64;
        let mut last_reported_entries = 0usize;

        while let Some(chunk) = fetch.next_chunk().await {
            if token.is_cancelled() {
                info!("Playlist load of {} cancelled", url);
                return Err(IngestError::Cancelled);
            }
            let chunk = chunk?;
            downloaded += chunk.len() as u64;
            parser.feed(&chunk);

            if parser.entries_parsed()
                >= last_reported_entries + self.config.progress_update_interval
            {
                last_reported_entries = parser.entries_parsed();
                let fraction = match total_bytes {
                    Some(total) if total > 0 => {
                        0.1 + 0.8 * (downloaded as f32 / total as f32).min(1.0)
                    }
                    _ => 0.5,
                };
                state
                    .update_progress(
                        token.load_id,
                        LoadState::Parsing,
                        ProgressInfo {
                            current_step: format!(
                                "Parsed {} channels",
                                parser.entries_parsed()
                            ),
                            fraction,
                            total_bytes,
                            downloaded_bytes: Some(downloaded),
                            items_parsed: Some(parser.entries_parsed()),
                        },
                    )
                    .await;
            }
        }

        let load = parser.finish(url)?;
        self.log_outcome(url, &load);
        Ok(load)
    }

    /// Ingest a playlist from a local file, chunked so large files are not
    /// read into memory whole.
    pub async fn ingest_file(
        &self,
        path: &std::path::Path,
        state: &LoadStateManager,
        token: &LoadToken,
    ) -> Result<PlaylistLoad, IngestError> {
        use tokio::io::AsyncReadExt;

        info!("Starting playlist ingestion from file {}", path.display());
        let mut file = tokio::fs::File::open(path).await?;
        let total_bytes = file.metadata().await.ok().map(|m| m.len());

        let mut parser = PlaylistParser::new(self.config.memory.clone());
        let mut buf = vec![0u8; 64 * 1024];
        let mut read_total = 0u64;
        let mut last_reported_entries = 0usize;

        loop {
            if token.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            read_total += n as u64;
            parser.feed(&buf[..n]);

            if parser.entries_parsed()
                >= last_reported_entries + self.config.progress_update_interval
            {
                last_reported_entries = parser.entries_parsed();
                let fraction = match total_bytes {
                    Some(total) if total > 0 => {
                        0.1 + 0.8 * (read_total as f32 / total as f32).min(1.0)
                    }
                    _ => 0.5,
                };
                state
                    .update_progress(
                        token.load_id,
                        LoadState::Parsing,
                        ProgressInfo {
                            current_step: format!(
                                "Parsed {} channels",
                                parser.entries_parsed()
                            ),
                            fraction,
                            total_bytes,
                            downloaded_bytes: Some(read_total),
                            items_parsed: Some(parser.entries_parsed()),
                        },
                    )
                    .await;
            }
        }

        let load = parser.finish(&path.display().to_string())?;
        self.log_outcome(&path.display().to_string(), &load);
        Ok(load)
    }

    fn log_outcome(&self, source: &str, load: &PlaylistLoad) {
        info!(
            "Playlist ingestion completed for {}: {} channels in {} groups ({} malformed, {} dropped)",
            source,
            load.index.channel_count(),
            load.index.groups.len(),
            load.stats.malformed_entries,
            load.stats.dropped_channels,
        );
        if load.stats.malformed_entries > 0 {
            warn!(
                "Skipped {} malformed entries in {}",
                load.stats.malformed_entries, source
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;

    fn parse_str(content: &str) -> Result<PlaylistLoad, IngestError> {
        parse_with_options(content, MemoryOptions::default())
    }

    fn parse_with_options(
        content: &str,
        memory: MemoryOptions,
    ) -> Result<PlaylistLoad, IngestError> {
        let mut parser = PlaylistParser::new(memory);
        parser.feed(content.as_bytes());
        parser.finish("test")
    }

    #[test]
    fn bbc_one_scenario() {
        let load = parse_str(
            "#EXTM3U\n#EXTINF:-1 tvg-id=\"bbc1\" group-title=\"News\",BBC One\nhttp://x/bbc1.ts\n",
        )
        .unwrap();

        assert_eq!(load.index.channel_count(), 1);
        let channel = &load.index.channels[0];
        assert_eq!(channel.name, "BBC One");
        assert_eq!(channel.group, "News");
        assert_eq!(channel.category, Category::Tv);
        assert_eq!(channel.id.as_deref(), Some("bbc1"));
        assert_eq!(channel.kind, ChannelKind::Live);
        assert!(!channel.supports_catchup);
        assert!(!channel.url.is_empty());
    }

    #[test]
    fn per_group_cap_drops_and_counts() {
        let mut content = String::from("#EXTM3U\n");
        for i in 0..5 {
            content.push_str(&format!(
                "#EXTINF:-1 group-title=\"Big\",Channel {i}\nhttp://x/{i}.ts\n"
            ));
        }
        let memory = MemoryOptions {
            enabled: true,
            max_channels_per_group: 2,
            max_total_channels: 0,
        };
        let load = parse_with_options(&content, memory).unwrap();
        assert_eq!(load.index.channels_in_group("Big").len(), 2);
        assert_eq!(load.stats.dropped_channels, 3);
    }

    #[test]
    fn caps_ignored_when_optimization_disabled() {
        let mut content = String::from("#EXTM3U\n");
        for i in 0..5 {
            content.push_str(&format!(
                "#EXTINF:-1 group-title=\"Big\",Channel {i}\nhttp://x/{i}.ts\n"
            ));
        }
        let memory = MemoryOptions {
            enabled: false,
            max_channels_per_group: 2,
            max_total_channels: 2,
        };
        let load = parse_with_options(&content, memory).unwrap();
        assert_eq!(load.index.channel_count(), 5);
        assert_eq!(load.stats.dropped_channels, 0);
    }

    #[test]
    fn chunk_boundary_inside_a_line_is_harmless() {
        let content =
            "#EXTM3U\n#EXTINF:-1 tvg-id=\"bbc1\" group-title=\"News\",BBC One\nhttp://x/bbc1.ts\n";
        // Split at every possible byte position and compare to one-shot.
        let whole = parse_str(content).unwrap();
        for split in 1..content.len() {
            let mut parser = PlaylistParser::new(MemoryOptions::default());
            parser.feed(&content.as_bytes()[..split]);
            parser.feed(&content.as_bytes()[split..]);
            let load = parser.finish("test").unwrap();
            assert_eq!(load.index.channels, whole.index.channels, "split {split}");
        }
    }

    #[test]
    fn malformed_entries_are_counted_not_fatal() {
        let load = parse_str(
            "#EXTM3U\n\
             http://orphan.example/1.ts\n\
             #EXTINF:-1 group-title=\"A\",First\n\
             #EXTINF:-1 group-title=\"A\",Second\n\
             http://x/2.ts\n",
        )
        .unwrap();
        // Orphan URL + EXTINF replaced by another EXTINF.
        assert_eq!(load.stats.malformed_entries, 2);
        assert_eq!(load.index.channel_count(), 1);
        assert_eq!(load.index.channels[0].name, "Second");
    }

    #[test]
    fn empty_stream_is_empty_source() {
        let err = parse_str("").unwrap_err();
        assert!(matches!(err, IngestError::EmptySource { .. }));
        let err = parse_str("\n\n  \n").unwrap_err();
        assert!(matches!(err, IngestError::EmptySource { .. }));
    }

    #[test]
    fn reparse_is_idempotent() {
        let content = "#EXTM3U\n\
            #EXTINF:-1 tvg-id=\"a\" group-title=\"News\",A\nhttp://x/a.ts\n\
            #EXTINF:-1 tvg-id=\"b\" group-title=\"Movies Now\",B\nhttp://x/movie/b.mp4\n\
            #EXTINF:-1 tvg-id=\"c\" group-title=\"News\",C\nhttp://x/c.ts\n";
        let first = parse_str(content).unwrap();
        let second = parse_str(content).unwrap();
        assert_eq!(first.index.channels, second.index.channels);
        assert_eq!(first.index.groups, second.index.groups);
        assert_eq!(
            first.index.groups_by_category,
            second.index.groups_by_category
        );
    }

    #[test]
    fn groups_preserve_first_seen_order() {
        let content = "#EXTINF:-1 group-title=\"Zeta\",1\nhttp://x/1.ts\n\
            #EXTINF:-1 group-title=\"Alpha\",2\nhttp://x/2.ts\n\
            #EXTINF:-1 group-title=\"Zeta\",3\nhttp://x/3.ts\n";
        let load = parse_str(content).unwrap();
        assert_eq!(load.index.groups, vec!["Zeta", "Alpha"]);
    }

    #[test]
    fn catchup_attributes_parsed() {
        let load = parse_str(
            "#EXTINF:-1 tvg-id=\"s1\" catchup=\"shift\" catchup-days=\"5\" group-title=\"TV\",S1\n\
             http://x/s1.ts\n\
             #EXTINF:-1 tvg-id=\"s2\" catchup=\"bogus\" catchup-days=\"5\" group-title=\"TV\",S2\n\
             http://x/s2.ts\n\
             #EXTINF:-1 tvg-id=\"s3\" catchup=\"append\" catchup-source=\"?utc={utc}&lutc={lutc}\" group-title=\"TV\",S3\n\
             http://x/s3.ts\n",
        )
        .unwrap();

        let s1 = &load.index.channels[0];
        assert!(s1.supports_catchup);
        assert_eq!(s1.catchup_days, 5);
        assert_eq!(s1.catchup_source, Some(CatchupSource::Shift));

        // Unknown scheme: unsupported, not an error.
        let s2 = &load.index.channels[1];
        assert!(!s2.supports_catchup);
        assert_eq!(s2.catchup_source, None);

        let s3 = &load.index.channels[2];
        assert!(s3.supports_catchup);
        assert_eq!(s3.catchup_days, 7); // provider default when unspecified
        assert_eq!(s3.catchup_template.as_deref(), Some("?utc={utc}&lutc={lutc}"));
    }

    #[test]
    fn vod_classification_from_url_shape() {
        assert_eq!(classify("http://x/stream/123456", "TV"), ChannelKind::Live);
        assert_eq!(classify("http://x/a/b/99.ts", "TV"), ChannelKind::Live);
        assert_eq!(classify("http://x/movie/42.mp4", "VOD"), ChannelKind::Movie);
        assert_eq!(
            classify("http://x/series/42.mkv", "Whatever"),
            ChannelKind::Series
        );
        assert_eq!(
            classify("http://x/files/thing.mkv", "TV Shows"),
            ChannelKind::Series
        );
        assert_eq!(classify("http://x/files/thing.avi", "VOD"), ChannelKind::Movie);
    }

    #[test]
    fn unquoted_and_unknown_attributes_tolerated() {
        let attrs = parse_attributes("-1 tvg-id=abc xui-id=\"7\" tvg-logo=\"http://l/x.png\"");
        assert_eq!(attrs.get("tvg-id").map(String::as_str), Some("abc"));
        assert_eq!(attrs.get("xui-id").map(String::as_str), Some("7"));
        assert_eq!(
            attrs.get("tvg-logo").map(String::as_str),
            Some("http://l/x.png")
        );
    }
}
