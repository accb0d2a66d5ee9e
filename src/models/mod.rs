//! Core data model: channels, programs, timelines and load progress.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a playlist entry actually is. Exactly one of these per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Live,
    Movie,
    Series,
}

/// Provider catch-up scheme declared in playlist metadata.
///
/// Unknown values are treated as unsupported rather than erroring, so this
/// parses to `Option` instead of a `Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CatchupSource {
    #[default]
    Default,
    Append,
    Shift,
    Flussonic,
    XtreamCodes,
}

impl CatchupSource {
    /// Parse a playlist `catchup=` value. `None` means "not a scheme we
    /// know", which downstream reads as "no catch-up support".
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "default" | "1" => Some(Self::Default),
            "append" => Some(Self::Append),
            "shift" | "timeshift" => Some(Self::Shift),
            "flussonic" | "flussonic-hls" | "fs" => Some(Self::Flussonic),
            "xc" | "xtream" => Some(Self::XtreamCodes),
            _ => None,
        }
    }
}

/// Display category a group is filed under. Derived from the group name;
/// "Favorites" is reserved and always present in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Favorites,
    Tv,
    Movies,
    Series,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Favorites => "Favorites",
            Category::Tv => "TV",
            Category::Movies => "Movies",
            Category::Series => "Series",
        }
    }

    /// Classify a group name. Pure function: the same name always yields
    /// the same category. Keyword precedence is fixed: sports groups stay
    /// under TV even when they also mention movies. A group literally
    /// named "Favorites" maps to the favorites category; anything merely
    /// containing the word stays where its other keywords put it.
    pub fn for_group(group_name: &str) -> Category {
        if group_name.eq_ignore_ascii_case("favorites") {
            return Category::Favorites;
        }
        let lower = group_name.to_lowercase();
        if lower.contains("sport") {
            Category::Tv
        } else if lower.contains("movie") || lower.contains("vod") || lower.contains("film") {
            Category::Movies
        } else if lower.contains("series") || lower.contains("show") {
            Category::Series
        } else {
            Category::Tv
        }
    }

    /// Display order for category listings.
    pub fn all() -> [Category; 4] {
        [
            Category::Favorites,
            Category::Tv,
            Category::Movies,
            Category::Series,
        ]
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// VOD metadata populated lazily for movie/series entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VodMetadata {
    pub movie_id: Option<String>,
    pub description: Option<String>,
    pub genre: Option<String>,
    pub duration: Option<String>,
    pub year: Option<String>,
    pub rating: Option<String>,
    pub director: Option<String>,
    pub cast: Option<String>,
}

/// One playlist entry. Programs are not owned here; the EPG timeline holds
/// them and the matcher binds the two by id or name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// tvg-id from the playlist, when present.
    pub id: Option<String>,
    pub name: String,
    pub url: String,
    pub group: String,
    pub category: Category,
    pub logo_url: Option<String>,
    pub kind: ChannelKind,

    // Catch-up capability, from playlist attributes and/or API enrichment.
    pub supports_catchup: bool,
    pub catchup_days: u32,
    pub catchup_source: Option<CatchupSource>,
    pub catchup_template: Option<String>,
    /// Per-channel correction applied to catch-up start instants, seconds.
    pub catchup_correction_secs: i64,

    pub vod: Option<VodMetadata>,
}

impl Channel {
    pub fn new(name: impl Into<String>, url: impl Into<String>, group: impl Into<String>) -> Self {
        let group = group.into();
        let category = Category::for_group(&group);
        Self {
            id: None,
            name: name.into(),
            url: url.into(),
            group,
            category,
            logo_url: None,
            kind: ChannelKind::Live,
            supports_catchup: false,
            catchup_days: 0,
            catchup_source: None,
            catchup_template: None,
            catchup_correction_secs: 0,
            vod: None,
        }
    }
}

/// One guide entry. `start_time`/`end_time` are server-time instants;
/// display offsets are applied at query time, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Foreign key into the timeline, not ownership.
    pub channel_id: String,
    pub has_archive: bool,
    pub archive_url: Option<String>,
    pub archive_days: Option<u32>,
}

impl Program {
    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }
}

/// Per-channel ordered program timeline. Built once per EPG load, then
/// published immutably behind an `Arc` and replaced wholesale on reload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpgTimeline {
    programs: HashMap<String, Vec<Program>>,
    /// Channel id -> display name. Duplicate `<channel>` declarations merge
    /// with the first display name winning.
    channel_names: HashMap<String, String>,
}

impl EpgTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping each channel's list ordered by `start_time`. Most
    /// feeds are already chronological, so the common case is a push.
    pub fn insert(&mut self, program: Program) {
        let list = self.programs.entry(program.channel_id.clone()).or_default();
        match list.last() {
            Some(last) if last.start_time > program.start_time => {
                let pos = list.partition_point(|p| p.start_time <= program.start_time);
                list.insert(pos, program);
            }
            _ => list.push(program),
        }
    }

    /// Register a channel declaration. First display name wins.
    pub fn declare_channel(&mut self, channel_id: &str, display_name: &str) -> bool {
        if self.channel_names.contains_key(channel_id) {
            false
        } else {
            self.channel_names
                .insert(channel_id.to_string(), display_name.to_string());
            true
        }
    }

    pub fn programs_for(&self, channel_id: &str) -> Option<&[Program]> {
        self.programs.get(channel_id).map(|v| v.as_slice())
    }

    pub fn display_name(&self, channel_id: &str) -> Option<&str> {
        self.channel_names.get(channel_id).map(|s| s.as_str())
    }

    pub fn channel_names(&self) -> &HashMap<String, String> {
        &self.channel_names
    }

    pub fn channel_count(&self) -> usize {
        self.programs.len()
    }

    pub fn program_count(&self) -> usize {
        self.programs.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(|s| s.as_str())
    }
}

/// Organized result of one playlist load: channels in source order plus the
/// group/category structure derived from them. Loading the same playlist
/// twice yields an identical index, order included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistIndex {
    pub channels: Vec<Channel>,
    /// Group names in first-seen order.
    pub groups: Vec<String>,
    /// Group name -> indices into `channels`, preserving source order.
    pub channels_by_group: HashMap<String, Vec<usize>>,
    /// Category -> group names in first-seen order.
    pub groups_by_category: HashMap<Category, Vec<String>>,
}

impl Default for PlaylistIndex {
    fn default() -> Self {
        // "Favorites" is reserved and always present, even when empty.
        let mut groups_by_category: HashMap<Category, Vec<String>> = HashMap::new();
        for category in Category::all() {
            groups_by_category.insert(category, Vec::new());
        }
        Self {
            channels: Vec::new(),
            groups: Vec::new(),
            channels_by_group: HashMap::new(),
            groups_by_category,
        }
    }
}

impl PlaylistIndex {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channels_in_group(&self, group: &str) -> Vec<&Channel> {
        self.channels_by_group
            .get(group)
            .map(|indices| indices.iter().map(|&i| &self.channels[i]).collect())
            .unwrap_or_default()
    }

    pub fn groups_in_category(&self, category: Category) -> &[String] {
        self.groups_by_category
            .get(&category)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Lifecycle of one load attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Connecting,
    Downloading,
    Parsing,
    Completed,
    Cancelled,
    Error,
}

/// Progress snapshot delivered to subscribers at bounded intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub current_step: String,
    /// 0.0 ..= 1.0, non-decreasing within one load.
    pub fraction: f32,
    pub total_bytes: Option<u64>,
    pub downloaded_bytes: Option<u64>,
    pub items_parsed: Option<usize>,
}

impl ProgressInfo {
    pub fn step(current_step: impl Into<String>, fraction: f32) -> Self {
        Self {
            current_step: current_step.into(),
            fraction,
            total_bytes: None,
            downloaded_bytes: None,
            items_parsed: None,
        }
    }
}

/// Full progress record for one load, broadcast on every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadProgress {
    pub load_id: Uuid,
    pub source_key: String,
    pub state: LoadState,
    pub progress: ProgressInfo,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn program(channel: &str, start_hour: u32) -> Program {
        Program {
            title: format!("p{start_hour}"),
            description: None,
            start_time: Utc.with_ymd_and_hms(2024, 1, 1, start_hour, 0, 0).unwrap(),
            end_time: Utc
                .with_ymd_and_hms(2024, 1, 1, start_hour + 1, 0, 0)
                .unwrap(),
            channel_id: channel.to_string(),
            has_archive: false,
            archive_url: None,
            archive_days: None,
        }
    }

    #[test]
    fn category_is_pure_and_precedence_fixed() {
        assert_eq!(Category::for_group("News"), Category::Tv);
        assert_eq!(Category::for_group("Sports Movies"), Category::Tv);
        assert_eq!(Category::for_group("VOD Action"), Category::Movies);
        assert_eq!(Category::for_group("TV Shows"), Category::Series);
        // Only the exact group name routes to favorites.
        assert_eq!(Category::for_group("Favorites"), Category::Favorites);
        assert_eq!(Category::for_group("favorites"), Category::Favorites);
        assert_eq!(Category::for_group("My Favorites"), Category::Tv);
        // Re-running classification always yields the same category.
        for name in ["News", "sports", "My Movies", "Kids Shows"] {
            assert_eq!(Category::for_group(name), Category::for_group(name));
        }
    }

    #[test]
    fn timeline_insert_keeps_start_order() {
        let mut timeline = EpgTimeline::new();
        for hour in [12, 10, 11, 9] {
            timeline.insert(program("ch1", hour));
        }
        let programs = timeline.programs_for("ch1").unwrap();
        let starts: Vec<_> = programs.iter().map(|p| p.start_time).collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
        assert_eq!(timeline.program_count(), 4);
    }

    #[test]
    fn duplicate_channel_declarations_keep_first_name() {
        let mut timeline = EpgTimeline::new();
        assert!(timeline.declare_channel("bbc1", "BBC One"));
        assert!(!timeline.declare_channel("bbc1", "BBC One HD"));
        assert_eq!(timeline.display_name("bbc1"), Some("BBC One"));
    }

    #[test]
    fn catchup_source_unknown_is_unsupported() {
        assert_eq!(CatchupSource::parse("append"), Some(CatchupSource::Append));
        assert_eq!(CatchupSource::parse("SHIFT"), Some(CatchupSource::Shift));
        assert_eq!(CatchupSource::parse("bogus"), None);
        assert_eq!(CatchupSource::parse(""), None);
    }
}
