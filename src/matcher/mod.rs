//! Channel-to-timeline binding and guide queries.
//!
//! A [`ProgramGuide`] wraps one published timeline snapshot. Binding tries
//! the playlist tvg-id first and falls back to normalized display-name
//! matching. All queries are read-only; a reload publishes a whole new
//! guide instead of mutating this one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::EpgConfig;
use crate::models::{Channel, EpgTimeline, Program};
use crate::utils::time;

/// Case-folds and strips a configurable character table so "BBC One HD",
/// "bbc-one.hd" and "BBC ONE (HD)" all collapse to the same key.
#[derive(Debug, Clone)]
pub struct NameNormalizer {
    strip: HashSet<char>,
}

impl NameNormalizer {
    pub fn new(strip_table: &str) -> Self {
        Self {
            strip: strip_table.chars().collect(),
        }
    }

    pub fn normalize(&self, name: &str) -> String {
        name.chars()
            .filter(|c| !self.strip.contains(c))
            .flat_map(char::to_lowercase)
            .collect()
    }
}

/// One immutable guide snapshot bound over a timeline.
pub struct ProgramGuide {
    timeline: Arc<EpgTimeline>,
    normalizer: NameNormalizer,
    /// Normalized display name -> channel id. Collisions keep the smallest
    /// id so rebuilding from the same timeline is deterministic.
    name_index: HashMap<String, String>,
    offset_hours: i32,
}

impl ProgramGuide {
    pub fn new(timeline: Arc<EpgTimeline>, config: &EpgConfig) -> Self {
        let normalizer = NameNormalizer::new(&config.name_match_strip);
        let mut name_index: HashMap<String, String> = HashMap::new();
        for (id, display_name) in timeline.channel_names() {
            let key = normalizer.normalize(display_name);
            if key.is_empty() {
                continue;
            }
            match name_index.get(&key) {
                Some(existing) if existing <= id => {}
                _ => {
                    name_index.insert(key, id.clone());
                }
            }
        }
        Self {
            timeline,
            normalizer,
            name_index,
            offset_hours: config.time_offset_hours,
        }
    }

    pub fn timeline(&self) -> &EpgTimeline {
        &self.timeline
    }

    /// Resolve a playlist channel to a timeline channel id: exact tvg-id
    /// match first, then normalized display-name match.
    pub fn bind<'a>(&'a self, channel: &'a Channel) -> Option<&'a str> {
        if let Some(id) = &channel.id {
            if self.timeline.programs_for(id).is_some() || self.timeline.display_name(id).is_some()
            {
                return Some(id.as_str());
            }
        }
        let key = self.normalizer.normalize(&channel.name);
        self.name_index.get(&key).map(|s| s.as_str())
    }

    pub fn programs_for<'a>(&'a self, channel: &'a Channel) -> Option<&'a [Program]> {
        let id = self.bind(channel)?;
        self.timeline.programs_for(id)
    }

    /// The program airing at `at` on this channel, or `None` in a gap.
    pub fn current_program<'a>(
        &'a self,
        channel: &'a Channel,
        at: DateTime<Utc>,
    ) -> Option<&'a Program> {
        let programs = self.programs_for(channel)?;
        let idx = programs.partition_point(|p| p.start_time <= at);
        if idx == 0 {
            return None;
        }
        let candidate = &programs[idx - 1];
        (candidate.end_time > at).then_some(candidate)
    }

    /// The first program starting strictly after `now`.
    pub fn next_program<'a>(
        &'a self,
        channel: &'a Channel,
        now: DateTime<Utc>,
    ) -> Option<&'a Program> {
        let programs = self.programs_for(channel)?;
        let idx = programs.partition_point(|p| p.start_time <= now);
        programs.get(idx)
    }

    /// Programs overlapping `[from, to)` as one contiguous slice. Guide
    /// timelines are non-overlapping per channel, so end times are ordered
    /// too and both bounds binary-search.
    pub fn programs_in_range<'a>(
        &'a self,
        channel: &'a Channel,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> &'a [Program] {
        let Some(programs) = self.programs_for(channel) else {
            return &[];
        };
        let lower = programs.partition_point(|p| p.end_time <= from);
        let upper = programs.partition_point(|p| p.start_time < to);
        if lower >= upper {
            return &[];
        }
        &programs[lower..upper]
    }

    /// "Now" expressed in guide time. Feed timestamps run `offset_hours`
    /// ahead of wall-clock UTC, so querying the current instant means
    /// shifting now in the display direction.
    pub fn adjusted_now(&self) -> DateTime<Utc> {
        time::adjusted_current_time(self.offset_hours)
    }

    pub fn current_program_now<'a>(&'a self, channel: &'a Channel) -> Option<&'a Program> {
        self.current_program(channel, self.adjusted_now())
    }

    pub fn next_program_now<'a>(&'a self, channel: &'a Channel) -> Option<&'a Program> {
        self.next_program(channel, self.adjusted_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn program(channel: &str, title: &str, start_hour: u32, end_hour: u32) -> Program {
        Program {
            title: title.to_string(),
            description: None,
            start_time: Utc.with_ymd_and_hms(2024, 1, 1, start_hour, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2024, 1, 1, end_hour, 0, 0).unwrap(),
            channel_id: channel.to_string(),
            has_archive: false,
            archive_url: None,
            archive_days: None,
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
    }

    /// 18-19 and 20-21 with a gap between.
    fn guide() -> (ProgramGuide, Channel) {
        let mut timeline = EpgTimeline::new();
        timeline.declare_channel("bbc1", "BBC One HD");
        timeline.insert(program("bbc1", "Evening News", 18, 19));
        timeline.insert(program("bbc1", "Late Film", 20, 21));
        let guide = ProgramGuide::new(Arc::new(timeline), &EpgConfig::default());

        let mut channel = Channel::new("BBC One HD", "http://x/bbc1.ts", "News");
        channel.id = Some("bbc1".to_string());
        (guide, channel)
    }

    #[test]
    fn current_program_inside_and_in_gaps() {
        let (guide, channel) = guide();

        let hit = guide.current_program(&channel, at(18, 30)).unwrap();
        assert_eq!(hit.title, "Evening News");

        // Boundary: start inclusive, end exclusive.
        assert!(guide.current_program(&channel, at(18, 0)).is_some());
        assert!(guide.current_program(&channel, at(19, 0)).is_none());

        // Before the first, in the gap, after the last.
        assert!(guide.current_program(&channel, at(17, 0)).is_none());
        assert!(guide.current_program(&channel, at(19, 30)).is_none());
        assert!(guide.current_program(&channel, at(22, 0)).is_none());
    }

    #[test]
    fn next_program_skips_the_gap() {
        let (guide, channel) = guide();
        let next = guide.next_program(&channel, at(19, 30)).unwrap();
        assert_eq!(next.title, "Late Film");
        assert!(guide.next_program(&channel, at(21, 30)).is_none());
    }

    #[test]
    fn range_query_returns_contiguous_slice() {
        let (guide, channel) = guide();
        let slice = guide.programs_in_range(&channel, at(18, 30), at(20, 30));
        assert_eq!(slice.len(), 2);
        assert!(guide
            .programs_in_range(&channel, at(19, 10), at(19, 50))
            .is_empty());
    }

    #[test]
    fn binds_by_tvg_id_then_normalized_name() {
        let (guide, mut channel) = guide();
        assert_eq!(guide.bind(&channel), Some("bbc1"));

        // No tvg-id: falls back to name matching through the strip table.
        channel.id = None;
        channel.name = "bbc-one.(hd)".to_string();
        assert_eq!(guide.bind(&channel), Some("bbc1"));

        // tvg-id unknown to the guide: name fallback still applies.
        channel.id = Some("nonsense".to_string());
        assert_eq!(guide.bind(&channel), Some("bbc1"));

        channel.id = None;
        channel.name = "Completely Different".to_string();
        assert_eq!(guide.bind(&channel), None);
    }

    #[test]
    fn adjusted_now_shifts_into_guide_time() {
        let mut config = EpgConfig::default();
        config.time_offset_hours = 2;
        let guide = ProgramGuide::new(Arc::new(EpgTimeline::new()), &config);

        let delta = guide.adjusted_now() - Utc::now();
        let minutes = delta.num_minutes();
        assert!((119..=121).contains(&minutes), "got {minutes} minutes");
    }

    #[test]
    fn normalizer_strips_configured_table() {
        let normalizer = NameNormalizer::new(" -.()");
        assert_eq!(normalizer.normalize("BBC One (HD)"), "bbconehd");
        assert_eq!(normalizer.normalize("bbc-one.hd"), "bbconehd");
    }
}
