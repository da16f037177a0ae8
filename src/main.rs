use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use podmirror::{
    CacheLayer, CallBudget, Config, JsonStore, ReqwestClient, SyncEngine, SystemClock,
    UpstreamClient, format_duration, parse_date, render_rdf, render_rss, sanitize_text,
};

/// Mirror a rate-limited podcast catalog and re-publish it as feeds
#[derive(Parser, Debug)]
#[command(name = "podmirror")]
#[command(about = "Mirror a rate-limited podcast catalog and re-publish it as RSS and RDF feeds")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to podmirror.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Quiet mode - only print command output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List one page of the upstream podcast catalog
    Podcasts {
        #[arg(long, default_value = "1")]
        page: usize,
        #[arg(long, default_value = "50")]
        hits: usize,
    },

    /// Show a podcast's episodes, refreshing the store when it is stale
    Episodes {
        podcast_id: String,

        /// Show this page of the upstream listing instead of the stored set
        #[arg(long)]
        page: Option<usize>,

        #[arg(long, default_value = "20")]
        hits: usize,
    },

    /// Show the full record of one episode
    Detail {
        podcast_id: String,
        episode_id: String,
    },

    /// Find the podcast whose title is closest to a query
    Search {
        #[arg(required = true)]
        query: Vec<String>,
    },

    /// Render a podcast feed
    Feed {
        podcast_id: String,

        #[arg(short, long, value_enum, default_value_t = FeedFormat::Rss)]
        format: FeedFormat,

        /// Write the document here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show every podcast with its latest episode
    Directory,

    /// Fetch episodes by id and merge those of known podcasts
    Lookup {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Fetch full descriptions for episodes that only have summary text
    Backfill { podcast_id: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FeedFormat {
    Rss,
    Rdf,
}

type Engine = SyncEngine<ReqwestClient, JsonStore>;

fn init_logging(config: &Config, quiet: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if quiet { "warn" } else { config.loglevel.as_str() })
    });
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn build_engine(config: &Config) -> Result<Engine> {
    let clock = SystemClock::shared();
    let budget = Arc::new(CallBudget::new(
        config.min_interval(),
        config.budget.capacity,
        clock.clone(),
    ));
    let upstream = UpstreamClient::new(
        ReqwestClient::with_timeout(config.request_timeout()),
        config.upstream_options()?,
        budget,
        clock.clone(),
    );
    let store = JsonStore::open(&config.store.data_dir).with_context(|| {
        format!(
            "Failed to open store at {}",
            config.store.data_dir.display()
        )
    })?;

    Ok(SyncEngine::new(
        upstream,
        store,
        CacheLayer::with_capacity(config.cache_ttl(), config.cache.max_entries, clock.clone()),
        config.sync_options(),
        clock,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Invalid configuration")?;
    init_logging(&config, args.quiet);
    let engine = build_engine(&config)?;

    match args.command {
        Command::Podcasts { page, hits } => {
            let listing = engine.podcasts(page, hits).await?;
            println!(
                "{} podcasts (page {}, {} shown)",
                listing.total.to_string().cyan(),
                page,
                listing.items.len()
            );
            for podcast in listing.items {
                println!("  {} {}", podcast.id.dimmed(), podcast.title.bold());
            }
        }

        Command::Episodes {
            podcast_id,
            page: Some(page),
            hits,
        } => {
            let listing = engine.episode_page(&podcast_id, page, hits).await?;
            println!(
                "{} episodes upstream (page {}, {} shown)",
                listing.total.to_string().cyan(),
                page,
                listing.items.len()
            );
            for episode in listing.items {
                let date = episode
                    .date
                    .as_deref()
                    .and_then(parse_date)
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "----------".to_string());
                println!("  {} {} {}", date.dimmed(), episode.id.dimmed(), episode.title);
            }
        }

        Command::Episodes {
            podcast_id,
            page: None,
            ..
        } => {
            let result = engine.podcast_episodes(&podcast_id).await?;
            if result.served_stale {
                eprintln!(
                    "{} upstream unavailable, showing stored episodes",
                    "warning:".yellow().bold()
                );
            }
            println!(
                "{} • {} episodes",
                result.podcast.title.bold().green(),
                result.episodes.len().to_string().cyan()
            );
            for episode in &result.episodes {
                let date = episode
                    .publication_date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "----------".to_string());
                let duration = episode
                    .duration_seconds
                    .map(format_duration)
                    .unwrap_or_default();
                println!("  {} {} {}", date.dimmed(), episode.title, duration.dimmed());
            }
        }

        Command::Feed {
            podcast_id,
            format,
            output,
        } => {
            let result = engine.podcast_episodes(&podcast_id).await?;
            let options = config.feed_options()?;
            let now = chrono::Utc::now();
            let document = match format {
                FeedFormat::Rss => render_rss(&result.podcast, &result.episodes, &options, now)?,
                FeedFormat::Rdf => render_rdf(&result.podcast, &result.episodes, &options, now)?,
            };

            match output {
                Some(path) => {
                    tokio::fs::write(&path, document)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    if !args.quiet {
                        eprintln!("{} wrote {}", "✓".green(), path.display());
                    }
                }
                None => print!("{document}"),
            }
        }

        Command::Detail {
            podcast_id,
            episode_id,
        } => {
            let episode = engine.episode_detail(&podcast_id, &episode_id).await?;
            let duration = episode
                .milliseconds
                .map(|ms| format_duration(ms / 1000))
                .unwrap_or_default();
            println!("{} {}", episode.title.bold().green(), duration.dimmed());
            if let Some(date) = episode.date.as_deref().and_then(parse_date) {
                println!("{}", date.to_rfc2822().dimmed());
            }
            println!("{}", episode.episode_raw_url.cyan());
            println!();
            println!("{}", sanitize_text(&episode.best_description()));
        }

        Command::Search { query } => {
            let hit = engine.search(&query.join(" ")).await?;
            println!(
                "{} {} {}",
                hit.podcast_id.dimmed(),
                hit.podcast_title.bold().green(),
                format!("({:.0}% match)", hit.score * 100.0).dimmed()
            );
            match (hit.episode_title, hit.episode_url) {
                (Some(title), Some(url)) => println!("  {title}\n  {}", url.cyan()),
                _ => println!("  {}", "no episodes".dimmed()),
            }
        }

        Command::Directory => {
            let directory = engine.directory().await?;
            for entry in directory.newest_first() {
                let latest = match (&entry.latest_date, &entry.latest_episode_title) {
                    (Some(date), Some(title)) => format!("{} {}", date.format("%Y-%m-%d"), title),
                    _ => "no episodes".to_string(),
                };
                println!(
                    "  {} {} {}",
                    entry.podcast_id.dimmed(),
                    entry.title.bold(),
                    latest.dimmed()
                );
            }
        }

        Command::Lookup { ids } => {
            let stored = engine.lookup_episodes(&ids).await?;
            if stored.is_empty() {
                bail!("None of the requested episodes belong to a stored podcast");
            }
            for episode in stored {
                println!("  {} {}", episode.external_id.dimmed(), episode.title);
            }
        }

        Command::Backfill { podcast_id } => {
            let report = engine.backfill_descriptions(&podcast_id).await?;
            println!(
                "{} verified, {} without detail, {} missing, {} store failures",
                report.verified.to_string().green(),
                report.fetch_failed.to_string().yellow(),
                report.missing,
                report.store_failed.to_string().red()
            );
        }
    }

    Ok(())
}
