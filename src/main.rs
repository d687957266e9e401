//! Sumi-Harvest main entry point
//!
//! This is the command-line interface for the Sumi-Harvest crawl engine.

use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use sumi_harvest::config::{load_config_with_hash, validate, Config};
use sumi_harvest::crawler::DownloadOptions;
use sumi_harvest::{Crawler, ResponseContext};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Sumi-Harvest: a concurrent crawl and download engine
///
/// Sumi-Harvest fetches the configured seed pages, follows the links it
/// finds under a concurrency ceiling and a dispatch interval, and downloads
/// linked files matching the requested extensions.
#[derive(Parser, Debug)]
#[command(name = "sumi-harvest")]
#[command(version)]
#[command(about = "A concurrent crawl and download engine", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Additional seed URL (repeatable)
    #[arg(long = "seed", value_name = "URL")]
    seeds: Vec<String>,

    /// Stop following links once this many pages have been queued
    #[arg(long, value_name = "N")]
    max_pages: Option<usize>,

    /// Only follow links on the seed hosts
    #[arg(long)]
    same_host: bool,

    /// Download linked files with this extension (repeatable, e.g. pdf)
    #[arg(long = "download", value_name = "EXT")]
    downloads: Vec<String>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let mut config = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            cfg
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    config.seeds.extend(cli.seeds.iter().cloned());
    validate(&config)?;
    if config.seeds.is_empty() {
        return Err("no seed URLs: add `seeds` to the config or pass --seed".into());
    }

    let harvest = Arc::new(Harvest::new(&config, &cli));
    let crawler = Crawler::builder(config)
        .provider({
            let harvest = harvest.clone();
            move |context: ResponseContext| {
                let harvest = harvest.clone();
                async move { harvest.extract(&context) }
            }
        })
        .build()?;

    // Ctrl-C cancels every in-flight operation
    let state = crawler.run_state().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling crawl");
            state.cancel();
        }
    });

    let mut errors = crawler.subscribe_errors();
    let drain = tokio::spawn(async move {
        let mut reported = 0u64;
        loop {
            match errors.recv().await {
                // The engine already logged the failure itself
                Ok(_) => reported += 1,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Error log fell behind, {} events skipped", skipped);
                    reported += skipped;
                }
                Err(RecvError::Closed) => break,
            }
        }
        reported
    });

    let summary = crawler.run().await;
    let cancelled = crawler.run_state().is_cancelled();

    // Dropping the crawler closes the error channel and ends the drain
    drop(crawler);
    let reported = drain.await.unwrap_or(0);

    println!("{}", summary);
    println!("Pages seen: {}", harvest.pages_seen());
    println!("Errors reported: {}", reported);

    if cancelled {
        tracing::warn!("Crawl was cancelled before completion");
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_harvest=info,warn"),
            1 => EnvFilter::new("sumi_harvest=debug,info"),
            2 => EnvFilter::new("sumi_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Missing content types are assumed to be HTML
fn is_html(content_type: Option<&str>) -> bool {
    content_type.map_or(true, |value| {
        let essence = value.split(';').next().unwrap_or("").trim();
        essence.eq_ignore_ascii_case("text/html") || essence.eq_ignore_ascii_case("application/xhtml+xml")
    })
}

/// Extraction policy of the command-line crawl
struct Harvest {
    frontier: Mutex<Frontier>,
    pages: AtomicUsize,
    max_pages: Option<usize>,
    hosts: Option<HashSet<String>>,
    extensions: Vec<String>,
    download_dir: PathBuf,
}

/// URLs already queued, so each is fetched at most once
#[derive(Default)]
struct Frontier {
    visited: HashSet<String>,
    pages: usize,
}

impl Harvest {
    fn new(config: &Config, cli: &Cli) -> Self {
        let mut frontier = Frontier::default();
        for seed in &config.seeds {
            if frontier.visited.insert(seed.clone()) {
                frontier.pages += 1;
            }
        }

        let hosts = cli.same_host.then(|| {
            config
                .seeds
                .iter()
                .filter_map(|seed| Url::parse(seed).ok())
                .filter_map(|url| url.host_str().map(str::to_string))
                .collect()
        });

        Self {
            frontier: Mutex::new(frontier),
            pages: AtomicUsize::new(0),
            max_pages: cli.max_pages,
            hosts,
            extensions: cli
                .downloads
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            download_dir: PathBuf::from(&config.output.download_dir),
        }
    }

    fn pages_seen(&self) -> usize {
        self.pages.load(Ordering::Relaxed)
    }

    /// Logs the page, queues matching downloads and follows new links
    fn extract(&self, context: &ResponseContext) -> anyhow::Result<()> {
        if !is_html(context.response().content_type()) {
            tracing::debug!("Skipping non-HTML response from {}", context.url());
            return Ok(());
        }

        let (title, links) = {
            let document = context.document();
            (document.title(), document.links())
        };

        let seen = self.pages.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            "[{}] {} {} {}",
            seen,
            context.status().as_u16(),
            context.url(),
            title.as_deref().unwrap_or("")
        );

        for link in links {
            let Ok(url) = Url::parse(&link) else {
                continue;
            };

            if let Some(filename) = self.download_name(&url) {
                if self.claim(&link, false) {
                    let target = self.download_dir.join(filename);
                    context.queue_download(link, target, DownloadOptions::default());
                }
                continue;
            }

            if !self.on_allowed_host(&url) {
                continue;
            }
            if self.claim(&link, true) {
                context.follow(link);
            }
        }

        Ok(())
    }

    /// File name for `url` when its extension was requested
    fn download_name(&self, url: &Url) -> Option<String> {
        if self.extensions.is_empty() {
            return None;
        }
        let name = url.path_segments()?.last()?;
        let (_, ext) = name.rsplit_once('.')?;
        self.extensions
            .contains(&ext.to_ascii_lowercase())
            .then(|| name.to_string())
    }

    fn on_allowed_host(&self, url: &Url) -> bool {
        match (&self.hosts, url.host_str()) {
            (None, _) => true,
            (Some(hosts), Some(host)) => hosts.contains(host),
            (Some(_), None) => false,
        }
    }

    /// Marks `link` visited; pages also count against --max-pages
    fn claim(&self, link: &str, is_page: bool) -> bool {
        let mut frontier = self
            .frontier
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if is_page {
            if let Some(max) = self.max_pages {
                if frontier.pages >= max {
                    return false;
                }
            }
        }
        if !frontier.visited.insert(link.to_string()) {
            return false;
        }
        if is_page {
            frontier.pages += 1;
        }
        true
    }
}
