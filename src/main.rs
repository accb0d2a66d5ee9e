use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iptv_core::{
    cache::CacheKind,
    config::Config,
    matcher::ProgramGuide,
    models::Category,
    timeshift::TimeshiftEngine,
    utils::time::format_time_range,
    DataCoordinator,
};

#[derive(Parser)]
#[command(name = "iptv-core")]
#[command(version = "0.1.0")]
#[command(about = "IPTV playlist/EPG ingestion, guide and catch-up toolkit")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "iptv-core.toml")]
    config: String,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a playlist and print the organized channel index
    Channels {
        /// Playlist URL or local file path
        url: String,
        /// Bypass the cache and fetch fresh
        #[arg(long)]
        force: bool,
        /// Only print channels of one group
        #[arg(long)]
        group: Option<String>,
    },
    /// Load an XMLTV guide and print a summary
    Epg {
        /// EPG URL
        url: String,
        /// Bypass the cache and fetch fresh
        #[arg(long)]
        force: bool,
    },
    /// Show now/next for a channel, binding playlist and guide
    Guide {
        /// Playlist URL
        #[arg(long)]
        playlist: String,
        /// EPG URL
        #[arg(long)]
        epg: String,
        /// Channel name to look up
        channel: String,
    },
    /// Detect provider-side catch-up support and summarize it
    Timeshift {
        /// Xtream-style playlist URL carrying username/password
        url: String,
    },
    /// Cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print entry counts and sizes per kind
    Stats,
    /// Remove expired entries
    Sweep,
    /// Remove all entries, or only one kind
    Clear {
        #[arg(long, value_parser = parse_kind)]
        kind: Option<CacheKind>,
    },
}

fn parse_kind(value: &str) -> Result<CacheKind, String> {
    CacheKind::all()
        .into_iter()
        .find(|k| k.suffix() == value)
        .ok_or_else(|| format!("unknown cache kind: {value}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("iptv_core={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    std::env::set_var("IPTV_CORE_CONFIG", &cli.config);
    let config = Config::load()?;
    let coordinator = DataCoordinator::new(config.clone())?;

    match cli.command {
        Command::Channels { url, force, group } => {
            let (index, source) = if force {
                coordinator.reload_channels(&url).await?
            } else {
                coordinator.load_channels(&url).await?
            };
            info!("Loaded {} channels ({:?})", index.channel_count(), source);

            match group {
                Some(group) => {
                    for channel in index.channels_in_group(&group) {
                        println!("{}\t{}", channel.name, channel.url);
                    }
                }
                None => {
                    for category in Category::all() {
                        let groups = index.groups_in_category(category);
                        if groups.is_empty() {
                            continue;
                        }
                        println!("{category}:");
                        for group in groups {
                            println!(
                                "  {} ({} channels)",
                                group,
                                index.channels_in_group(group).len()
                            );
                        }
                    }
                }
            }
        }

        Command::Epg { url, force } => {
            let result = if force {
                coordinator.reload_epg(&url).await
            } else {
                coordinator.load_epg(&url).await
            };
            let (timeline, source) = result.map_err(|e| anyhow::anyhow!(e.to_string()))?;
            println!(
                "{} channels, {} programs ({:?})",
                timeline.channel_count(),
                timeline.program_count(),
                source
            );
        }

        Command::Guide {
            playlist,
            epg,
            channel,
        } => {
            coordinator.load_channels(&playlist).await?;
            coordinator
                .load_epg(&epg)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;

            let index = coordinator
                .current_channels()
                .await
                .ok_or_else(|| anyhow::anyhow!("no channels loaded"))?;
            let guide: ProgramGuide = coordinator
                .guide()
                .await
                .ok_or_else(|| anyhow::anyhow!("no guide loaded"))?;

            let target = index
                .channels
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(&channel))
                .ok_or_else(|| anyhow::anyhow!("channel not found: {channel}"))?;

            let offset = config.epg.time_offset_hours;
            match guide.current_program_now(target) {
                Some(program) => println!(
                    "Now: {} ({})",
                    program.title,
                    format_time_range(program.start_time, program.end_time, offset)
                ),
                None => println!("Now: no program information"),
            }
            match guide.next_program_now(target) {
                Some(program) => println!(
                    "Next: {} ({})",
                    program.title,
                    format_time_range(program.start_time, program.end_time, offset)
                ),
                None => println!("Next: no program information"),
            }
        }

        Command::Timeshift { url } => {
            coordinator.load_channels(&url).await?;
            let updated = coordinator.detect_timeshift(&url).await;
            let index = coordinator
                .current_channels()
                .await
                .ok_or_else(|| anyhow::anyhow!("no channels loaded"))?;
            let supported = index
                .channels
                .iter()
                .filter(|c| TimeshiftEngine::channel_supports_timeshift(c))
                .count();
            println!(
                "{} of {} channels support catch-up ({} updated from API) as of {}",
                supported,
                index.channel_count(),
                updated,
                Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
            );
        }

        Command::Cache { action } => match action {
            CacheAction::Stats => {
                let stats = coordinator.cache().statistics().await?;
                println!(
                    "{} entries, {} bytes total",
                    stats.total_entries, stats.total_bytes
                );
                for (kind, kind_stats) in &stats.by_kind {
                    println!("  {}: {} entries, {} bytes", kind, kind_stats.entries, kind_stats.bytes);
                }
            }
            CacheAction::Sweep => {
                let removed = coordinator.cache().clear_expired().await?;
                println!("Removed {removed} expired entries");
            }
            CacheAction::Clear { kind } => {
                let removed = match kind {
                    Some(kind) => coordinator.cache().clear(kind).await?,
                    None => coordinator.cache().clear_all().await?,
                };
                println!("Removed {removed} entries");
            }
        },
    }

    Ok(())
}
