//! Catch-up / timeshift URL engine.
//!
//! Eligibility is policy: only fully finished programs inside the channel's
//! retention window get archive URLs, never in-progress ones. Generation is
//! pure string work per provider scheme; the only network path is the
//! optional Xtream API enrichment, which is best-effort and never fails a
//! playlist load.

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, Timelike, Utc};
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::TimeshiftError;
use crate::models::{CatchupSource, Channel, ChannelKind, PlaylistIndex, Program};
use crate::transfer::TransferClient;

/// What the reverse derivation recovers from a catch-up URL: the live URL
/// and, where the scheme encodes it, the original start instant.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredLive {
    pub live_url: String,
    pub start: Option<DateTime<Utc>>,
}

/// Substitution inputs for one archive URL.
struct TemplateContext {
    start: DateTime<Utc>,
    duration_secs: i64,
    now: DateTime<Utc>,
    window_secs: i64,
}

impl TemplateContext {
    /// Seconds to shift back from live, clamped to `[0, window]`.
    fn offset_secs(&self) -> i64 {
        (self.now - self.start)
            .num_seconds()
            .clamp(0, self.window_secs)
    }
}

/// Expand the known catch-up placeholders. Unresolved placeholders left in
/// the output are a template error, not a silent passthrough.
fn substitute_template(template: &str, ctx: &TemplateContext) -> Result<String, TimeshiftError> {
    if template.trim().is_empty() {
        return Err(TimeshiftError::template("empty catch-up template"));
    }

    let start_epoch = ctx.start.timestamp().to_string();
    let now_epoch = ctx.now.timestamp().to_string();
    let duration = ctx.duration_secs.to_string();
    let offset = ctx.offset_secs().to_string();

    let mut out = template.to_string();
    // Longest tokens first so "${start}" is never half-eaten by "{start}".
    for (token, value) in [
        ("${start}", start_epoch.as_str()),
        ("${timestamp}", now_epoch.as_str()),
        ("{utc}", start_epoch.as_str()),
        ("{lutc}", now_epoch.as_str()),
        ("{duration}", duration.as_str()),
        ("{offset}", offset.as_str()),
    ] {
        out = out.replace(token, value);
    }
    out = out.replace("{Y}", &format!("{:04}", ctx.start.year()));
    out = out.replace("{m}", &format!("{:02}", ctx.start.month()));
    out = out.replace("{d}", &format!("{:02}", ctx.start.day()));
    out = out.replace("{H}", &format!("{:02}", ctx.start.hour()));
    out = out.replace("{M}", &format!("{:02}", ctx.start.minute()));
    out = out.replace("{S}", &format!("{:02}", ctx.start.second()));

    if out.contains('{') || out.contains('}') {
        return Err(TimeshiftError::template(format!(
            "unresolved placeholder in catch-up template: {out}"
        )));
    }
    Ok(out)
}

/// Join a substituted query fragment onto a live URL with `?` or `&`.
fn append_fragment(live_url: &str, fragment: &str) -> String {
    let fragment = fragment.trim_start_matches(['?', '&']);
    if live_url.contains('?') {
        format!("{live_url}&{fragment}")
    } else {
        format!("{live_url}?{fragment}")
    }
}

/// Xtream-style credentials from a playlist URL: `username=`/`password=`
/// query pairs first, then the path-segment form
/// (`http://host/user/pass/playlist.m3u`) as a best-effort fallback.
pub fn extract_credentials(m3u_url: &str) -> Option<(String, String)> {
    let parsed = Url::parse(m3u_url).ok()?;
    let mut username = None;
    let mut password = None;
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "username" => username = Some(value.into_owned()),
            "password" => password = Some(value.into_owned()),
            _ => {}
        }
    }
    if let (Some(username), Some(password)) = (username, password) {
        return Some((username, password));
    }

    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    if segments.len() >= 3 {
        return Some((segments[0].to_string(), segments[1].to_string()));
    }
    None
}

/// Numeric stream id from the trailing path segment of a live URL, with any
/// container extension stripped.
pub fn extract_stream_id(channel_url: &str) -> Option<String> {
    let parsed = Url::parse(channel_url).ok()?;
    let last = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let id = last.split('.').next().unwrap_or(last);
    (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())).then(|| id.to_string())
}

/// `/live/user/pass/id` or `/user/pass/id` segments from an Xtream live URL.
fn xtream_url_parts(channel_url: &str) -> Option<(String, String, String, String)> {
    let parsed = Url::parse(channel_url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    let (user, pass, id_segment) = match segments.as_slice() {
        ["live", user, pass, id] => (user, pass, id),
        [user, pass, id] => (user, pass, id),
        _ => return None,
    };
    let id = id_segment.split('.').next().unwrap_or(id_segment);
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let base = format!(
        "{}://{}",
        parsed.scheme(),
        parsed.port().map_or_else(
            || parsed.host_str().unwrap_or_default().to_string(),
            |p| format!("{}:{}", parsed.host_str().unwrap_or_default(), p)
        )
    );
    Some((base, user.to_string(), pass.to_string(), id.to_string()))
}

pub struct TimeshiftEngine {
    transfer: TransferClient,
}

impl TimeshiftEngine {
    pub fn new(transfer: TransferClient) -> Self {
        Self { transfer }
    }

    pub fn channel_supports_timeshift(channel: &Channel) -> bool {
        channel.supports_catchup && channel.catchup_days > 0
    }

    /// Finished-programs-only policy: eligible iff the channel supports
    /// catch-up, the program has ended, and its start is still inside the
    /// retention window.
    pub fn program_supports_timeshift(
        channel: &Channel,
        program: &Program,
        now: DateTime<Utc>,
    ) -> bool {
        if !Self::channel_supports_timeshift(channel) {
            return false;
        }
        if program.end_time > now {
            return false;
        }
        now - program.start_time <= Duration::days(channel.catchup_days as i64)
    }

    /// Archive URL for a finished program.
    pub fn generate_url_for_program(
        channel: &Channel,
        program: &Program,
        now: DateTime<Utc>,
    ) -> Result<String, TimeshiftError> {
        if !Self::program_supports_timeshift(channel, program, now) {
            return Err(TimeshiftError::not_supported(if program.end_time > now {
                "program has not finished airing"
            } else {
                "program is outside the catch-up window"
            }));
        }
        let start = program.start_time + Duration::seconds(channel.catchup_correction_secs);
        Self::generate_url(channel, start, program.duration().num_seconds(), now)
    }

    /// Archive URL for an arbitrary span on a channel. Callers that bypass
    /// the program check still get window validation via offset clamping.
    pub fn generate_url(
        channel: &Channel,
        start: DateTime<Utc>,
        duration_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<String, TimeshiftError> {
        if !Self::channel_supports_timeshift(channel) {
            return Err(TimeshiftError::not_supported(
                "channel does not declare catch-up support",
            ));
        }
        let ctx = TemplateContext {
            start,
            duration_secs,
            now,
            window_secs: channel.catchup_days as i64 * 86_400,
        };

        let source = channel.catchup_source.unwrap_or_default();
        let raw = match source {
            CatchupSource::Default => match &channel.catchup_template {
                Some(template) => {
                    let expanded = substitute_template(template, &ctx)?;
                    if expanded.starts_with('?') || expanded.starts_with('&') {
                        append_fragment(&channel.url, &expanded)
                    } else {
                        expanded
                    }
                }
                None => Self::xtream_timeshift_url(channel, &ctx)?,
            },
            CatchupSource::Append => {
                let template = channel.catchup_template.as_deref().ok_or_else(|| {
                    TimeshiftError::template("append catch-up requires a template")
                })?;
                append_fragment(&channel.url, &substitute_template(template, &ctx)?)
            }
            CatchupSource::Shift => append_fragment(
                &channel.url,
                &format!("utc={}&lutc={}", ctx.start.timestamp(), ctx.now.timestamp()),
            ),
            CatchupSource::Flussonic => Self::flussonic_url(channel, &ctx)?,
            CatchupSource::XtreamCodes => Self::xtream_timeshift_url(channel, &ctx)?,
        };

        // Parse-validate; the normalized form comes back percent-escaped.
        let validated = Url::parse(&raw).map_err(|e| {
            TimeshiftError::template(format!("generated catch-up URL is invalid: {raw}: {e}"))
        })?;
        Ok(validated.to_string())
    }

    /// `.../index.m3u8` (or `/mpegts`) -> `.../archive-{start}-{duration}.m3u8`.
    fn flussonic_url(channel: &Channel, ctx: &TemplateContext) -> Result<String, TimeshiftError> {
        let archive = format!(
            "archive-{}-{}.m3u8",
            ctx.start.timestamp(),
            ctx.duration_secs
        );
        let url = &channel.url;
        if let Some(base) = url.strip_suffix("index.m3u8") {
            return Ok(format!("{base}{archive}"));
        }
        if let Some(base) = url.strip_suffix("mpegts") {
            return Ok(format!("{base}{archive}"));
        }
        if let Some(template) = &channel.catchup_template {
            let expanded = substitute_template(template, ctx)?;
            return Ok(if expanded.starts_with('?') || expanded.starts_with('&') {
                append_fragment(url, &expanded)
            } else {
                expanded
            });
        }
        Err(TimeshiftError::template(format!(
            "cannot derive flussonic archive URL from {url}"
        )))
    }

    /// `{base}/streaming/timeshift.php?...` derived from Xtream URL parts.
    fn xtream_timeshift_url(
        channel: &Channel,
        ctx: &TemplateContext,
    ) -> Result<String, TimeshiftError> {
        let (base, user, pass, id) = xtream_url_parts(&channel.url).ok_or_else(|| {
            TimeshiftError::template(format!(
                "no catch-up template and URL is not Xtream-shaped: {}",
                channel.url
            ))
        })?;
        let duration_mins = (ctx.duration_secs.max(60) + 59) / 60;
        Ok(format!(
            "{base}/streaming/timeshift.php?username={}&password={}&stream={id}&start={}&duration={duration_mins}",
            urlencoding::encode(&user),
            urlencoding::encode(&pass),
            ctx.start.format("%Y-%m-%d:%H-%M"),
        ))
    }

    /// Best-effort inverse of the generation schemes. `None` when the URL
    /// does not look like one of ours or the inverse is ambiguous.
    pub fn live_url_for(timeshift_url: &str) -> Option<RecoveredLive> {
        let parsed = Url::parse(timeshift_url).ok()?;

        if parsed.path().ends_with("timeshift.php") {
            let mut user = None;
            let mut pass = None;
            let mut stream = None;
            let mut start = None;
            for (key, value) in parsed.query_pairs() {
                match key.as_ref() {
                    "username" => user = Some(value.into_owned()),
                    "password" => pass = Some(value.into_owned()),
                    "stream" => stream = Some(value.into_owned()),
                    "start" => {
                        start = NaiveDateTime::parse_from_str(&value, "%Y-%m-%d:%H-%M")
                            .ok()
                            .map(|dt| dt.and_utc());
                    }
                    _ => {}
                }
            }
            let host = parsed.host_str()?;
            let base = match parsed.port() {
                Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
                None => format!("{}://{}", parsed.scheme(), host),
            };
            return Some(RecoveredLive {
                live_url: format!("{base}/{}/{}/{}", user?, pass?, stream?),
                start,
            });
        }

        let last_segment = parsed
            .path_segments()
            .and_then(|s| s.filter(|p| !p.is_empty()).last())
            .unwrap_or_default()
            .to_string();
        if last_segment.starts_with("archive-") && last_segment.ends_with(".m3u8") {
            let base = timeshift_url.strip_suffix(&last_segment)?;
            let start = last_segment
                .strip_prefix("archive-")
                .and_then(|s| s.strip_suffix(".m3u8"))
                .and_then(|s| s.split('-').next())
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(|epoch| DateTime::from_timestamp(epoch, 0));
            return Some(RecoveredLive {
                live_url: format!("{base}index.m3u8"),
                start,
            });
        }

        if parsed.query_pairs().any(|(k, _)| k == "utc" || k == "lutc") {
            let start = parsed
                .query_pairs()
                .find(|(k, _)| k == "utc")
                .and_then(|(_, v)| v.parse::<i64>().ok())
                .and_then(|epoch| DateTime::from_timestamp(epoch, 0));
            let mut stripped = parsed.clone();
            let kept: Vec<(String, String)> = parsed
                .query_pairs()
                .filter(|(k, _)| k != "utc" && k != "lutc")
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            if kept.is_empty() {
                stripped.set_query(None);
            } else {
                stripped.query_pairs_mut().clear().extend_pairs(kept);
            }
            return Some(RecoveredLive {
                live_url: stripped.to_string(),
                start,
            });
        }

        None
    }

    /// Override archive flags from the provider's Xtream API. Failures are
    /// logged and leave playlist-declared data untouched. Returns how many
    /// channels were updated.
    pub async fn enrich_from_api(&self, index: &mut PlaylistIndex, m3u_url: &str) -> usize {
        let Some((username, password)) = extract_credentials(m3u_url) else {
            debug!("No Xtream credentials in playlist URL, skipping API enrichment");
            return 0;
        };
        let Ok(parsed) = Url::parse(m3u_url) else {
            return 0;
        };
        let base = format!(
            "{}://{}",
            parsed.scheme(),
            parsed.port().map_or_else(
                || parsed.host_str().unwrap_or_default().to_string(),
                |p| format!("{}:{}", parsed.host_str().unwrap_or_default(), p)
            )
        );
        let api_url = format!(
            "{base}/player_api.php?username={}&password={}&action=get_live_streams",
            urlencoding::encode(&username),
            urlencoding::encode(&password)
        );

        let body = match self.transfer.fetch_bytes(&api_url).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Timeshift API enrichment failed, keeping playlist data: {e}");
                return 0;
            }
        };
        let records: serde_json::Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => {
                warn!("Timeshift API returned unparseable JSON: {e}");
                return 0;
            }
        };
        let Some(records) = records.as_array() else {
            warn!("Timeshift API response is not an array");
            return 0;
        };

        // stream id -> (archive enabled, retention days). Providers are
        // inconsistent about number vs string fields, so read both.
        let mut archive_by_id = std::collections::HashMap::new();
        for record in records {
            let Some(id) = value_as_string(record.get("stream_id")) else {
                continue;
            };
            let archive = value_as_i64(record.get("tv_archive")).unwrap_or(0);
            let days = value_as_i64(record.get("tv_archive_duration")).unwrap_or(0);
            archive_by_id.insert(id, (archive > 0, days.max(0) as u32));
        }

        let mut updated = 0;
        for channel in &mut index.channels {
            if channel.kind != ChannelKind::Live {
                continue;
            }
            let Some(id) = extract_stream_id(&channel.url) else {
                continue;
            };
            if let Some(&(enabled, days)) = archive_by_id.get(&id) {
                channel.supports_catchup = enabled && days > 0;
                channel.catchup_days = days;
                if channel.supports_catchup && channel.catchup_source.is_none() {
                    channel.catchup_source = Some(CatchupSource::Default);
                }
                updated += 1;
            }
        }
        info!(
            "Timeshift API enrichment updated {} of {} channels",
            updated,
            index.channels.len()
        );
        updated
    }
}

fn value_as_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_i64(value: Option<&serde_json::Value>) -> Option<i64> {
    match value? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
