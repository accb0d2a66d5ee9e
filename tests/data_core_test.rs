//! End-to-end flow: playlist file -> coordinator -> cache -> guide ->
//! catch-up URL, all on local fixtures.

use chrono::{Duration, TimeZone, Utc};
use iptv_core::cache::CacheKind;
use iptv_core::config::{CacheConfig, Config};
use iptv_core::models::Category;
use iptv_core::timeshift::TimeshiftEngine;
use iptv_core::{DataCoordinator, LoadSource};

const PLAYLIST: &str = "#EXTM3U\n\
#EXTINF:-1 tvg-id=\"bbc1\" tvg-logo=\"http://logo/bbc1.png\" group-title=\"News\" catchup=\"shift\" catchup-days=\"7\",BBC One\n\
http://stream.example/bbc1.ts\n\
#EXTINF:-1 tvg-id=\"film1\" group-title=\"Movies Now\",Film Channel\n\
http://stream.example/movie/film1.mp4\n\
#EXTINF:-1 group-title=\"News\",Uncatalogued News\n\
http://stream.example/news2.ts\n";

const GUIDE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv>
  <channel id="bbc1"><display-name>BBC One</display-name></channel>
  <programme start="20240601180000 +0000" stop="20240601190000 +0000" channel="bbc1">
    <title>Evening News</title>
    <desc>Headlines</desc>
  </programme>
  <programme start="20240601190000 +0000" stop="20240601200000 +0000" channel="bbc1">
    <title>Quiz Night</title>
  </programme>
</tv>"#;

struct Fixture {
    _dir: tempfile::TempDir,
    playlist_path: String,
    guide_path: String,
    cache_dir: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let playlist_path = dir.path().join("playlist.m3u");
    let guide_path = dir.path().join("guide.xml");
    let cache_dir = dir.path().join("cache");
    std::fs::write(&playlist_path, PLAYLIST).unwrap();
    std::fs::write(&guide_path, GUIDE).unwrap();
    Fixture {
        playlist_path: playlist_path.display().to_string(),
        guide_path: guide_path.display().to_string(),
        cache_dir,
        _dir: dir,
    }
}

fn coordinator(cache_dir: &std::path::Path) -> DataCoordinator {
    let config = Config {
        cache: CacheConfig {
            directory: Some(cache_dir.to_path_buf()),
            ..CacheConfig::default()
        },
        ..Config::default()
    };
    DataCoordinator::new(config).unwrap()
}

#[tokio::test]
async fn playlist_file_loads_and_is_organized() {
    let fx = fixture();
    let coordinator = coordinator(&fx.cache_dir);

    let (index, source) = coordinator.load_channels(&fx.playlist_path).await.unwrap();
    assert_eq!(source, LoadSource::Fresh);
    assert_eq!(index.channel_count(), 3);
    assert_eq!(index.groups, vec!["News", "Movies Now"]);
    assert_eq!(index.groups_in_category(Category::Tv), ["News"]);
    assert_eq!(index.groups_in_category(Category::Movies), ["Movies Now"]);
    // Favorites is reserved and present even when empty.
    assert!(index.groups_in_category(Category::Favorites).is_empty());

    let news = index.channels_in_group("News");
    assert_eq!(news.len(), 2);
    assert_eq!(news[0].name, "BBC One");
    assert!(news[0].supports_catchup);
}

#[tokio::test]
async fn second_load_is_served_from_cache() {
    let fx = fixture();

    {
        let first = coordinator(&fx.cache_dir);
        let (_, source) = first.load_channels(&fx.playlist_path).await.unwrap();
        assert_eq!(source, LoadSource::Fresh);
    }

    // A fresh coordinator over the same cache directory hits the disk cache.
    let second = coordinator(&fx.cache_dir);
    let (index, source) = second.load_channels(&fx.playlist_path).await.unwrap();
    assert_eq!(source, LoadSource::Cached);
    assert_eq!(index.channel_count(), 3);

    assert!(
        second
            .cache()
            .is_valid(CacheKind::Channels, &fx.playlist_path)
            .await
    );
}

#[tokio::test]
async fn guide_binds_and_answers_now_next() {
    let fx = fixture();
    let coordinator = coordinator(&fx.cache_dir);

    coordinator.load_channels(&fx.playlist_path).await.unwrap();
    let (timeline, source) = coordinator.load_epg(&fx.guide_path).await.unwrap();
    assert_eq!(source, LoadSource::Fresh);
    assert_eq!(timeline.program_count(), 2);

    let index = coordinator.current_channels().await.unwrap();
    let guide = coordinator.guide().await.unwrap();
    let bbc = index
        .channels
        .iter()
        .find(|c| c.name == "BBC One")
        .unwrap();

    let at = Utc.with_ymd_and_hms(2024, 6, 1, 18, 30, 0).unwrap();
    let current = guide.current_program(bbc, at).unwrap();
    assert_eq!(current.title, "Evening News");
    let next = guide.next_program(bbc, at).unwrap();
    assert_eq!(next.title, "Quiz Night");

    // After the last program the guide goes quiet rather than guessing.
    let late = Utc.with_ymd_and_hms(2024, 6, 1, 23, 0, 0).unwrap();
    assert!(guide.current_program(bbc, late).is_none());
    assert!(guide.next_program(bbc, late).is_none());

    // Channels without guide data answer None, not an error.
    let unlisted = index
        .channels
        .iter()
        .find(|c| c.name == "Uncatalogued News")
        .unwrap();
    assert!(guide.current_program(unlisted, at).is_none());
}

#[tokio::test]
async fn finished_program_gets_a_catchup_url() {
    let fx = fixture();
    let coordinator = coordinator(&fx.cache_dir);

    coordinator.load_channels(&fx.playlist_path).await.unwrap();
    coordinator.load_epg(&fx.guide_path).await.unwrap();

    let index = coordinator.current_channels().await.unwrap();
    let guide = coordinator.guide().await.unwrap();
    let bbc = index
        .channels
        .iter()
        .find(|c| c.name == "BBC One")
        .unwrap();

    let program = guide
        .programs_for(bbc)
        .unwrap()
        .first()
        .cloned()
        .unwrap();

    // Two hours after it ended: inside the 7-day window.
    let now = program.end_time + Duration::hours(2);
    assert!(TimeshiftEngine::program_supports_timeshift(bbc, &program, now));
    let url = TimeshiftEngine::generate_url_for_program(bbc, &program, now).unwrap();
    assert_eq!(
        url,
        format!(
            "http://stream.example/bbc1.ts?utc={}&lutc={}",
            program.start_time.timestamp(),
            now.timestamp()
        )
    );

    // Eight days later the window has closed.
    let too_late = program.end_time + Duration::days(8);
    assert!(!TimeshiftEngine::program_supports_timeshift(
        bbc, &program, too_late
    ));
    assert!(TimeshiftEngine::generate_url_for_program(bbc, &program, too_late).is_err());
}

#[tokio::test]
async fn empty_playlist_is_an_error_and_nothing_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let playlist_path = dir.path().join("empty.m3u");
    std::fs::write(&playlist_path, "").unwrap();

    let coordinator = coordinator(&dir.path().join("cache"));
    let result = coordinator
        .load_channels(&playlist_path.display().to_string())
        .await;
    assert!(result.is_err());
    assert!(coordinator.current_channels().await.is_none());
}
