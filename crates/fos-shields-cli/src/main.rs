//! fos-shields: drive the shield pipeline outside a web view
//!
//! Loads a configuration and its lists, classifies requests the way the
//! browser's transport would, and edits per-domain shield state.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use fos_shields::{InterceptRequest, Shield, Shields, ShieldsConfig};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "fos-shields")]
#[command(about = "fOS shields: classify requests and manage per-site shields")]
struct Cli {
    /// TOML configuration (built-in defaults when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify requests made by one page
    Classify {
        /// URL of the page's main document
        #[arg(short, long)]
        page: String,

        /// Accept header sent with every request
        #[arg(short, long)]
        accept: Option<String>,

        /// Request URLs
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Replay a request log, one `<page-url> <request-url> [accept]` per line
    Replay {
        input: PathBuf,

        /// Pages classified in parallel
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
    },

    /// Per-domain shield state
    Shield {
        #[command(subcommand)]
        action: ShieldAction,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum ShieldAction {
    /// Override one shield for a domain
    Set {
        domain: String,
        /// adblock_and_tp, httpse, safebrowsing, noscript or fp_protection
        shield: Shield,
        value: Toggle,
    },

    /// Turn every shield off for a domain, or back on
    AllOff { domain: String, value: Toggle },

    /// Show stored and effective shields for a domain
    Show { domain: String },

    /// Forget every per-domain override
    Clear,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
    Default,
}

impl Toggle {
    fn value(self) -> Option<bool> {
        match self {
            Self::On => Some(true),
            Self::Off => Some(false),
            Self::Default => None,
        }
    }
}

/// One replayed request
struct LogEntry {
    line: usize,
    page: String,
    url: String,
    accept: Option<String>,
}

#[derive(Serialize)]
struct ReplayRecord {
    line: usize,
    page: String,
    url: String,
    verdict: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ShieldsConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => ShieldsConfig::default(),
    };

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let shields = Shields::new(config)?;

    match cli.command {
        Commands::Classify { page, accept, urls } => {
            load_lists(&shields).await?;
            cmd_classify(&shields, &page, accept.as_deref(), &urls)?;
        }
        Commands::Replay { input, workers } => {
            load_lists(&shields).await?;
            cmd_replay(&shields, &input, workers)?;
        }
        Commands::Shield { action } => cmd_shield(&shields, action)?,
        Commands::Config => {}
    }

    for action in shields.host_actions().try_iter() {
        info!("Host action: {:?}", action);
    }

    Ok(())
}

async fn load_lists(shields: &Shields) -> Result<()> {
    let report = shields.load_lists().await?;
    info!(
        "Lists: ad-block {:?}, trackers {:?}, bad domains {:?}, https rules {:?}",
        report.ad_block_rules, report.tracker_domains, report.bad_domains, report.https_rules
    );
    for matcher in shields.interceptor().matchers().iter() {
        if !matcher.is_loaded() {
            warn!("{} has no list; it will match nothing", matcher.kind());
        }
    }
    Ok(())
}

fn cmd_classify(shields: &Shields, page: &str, accept: Option<&str>, urls: &[String]) -> Result<()> {
    let session = shields.new_session();
    shields.on_main_frame_navigation_start(&session, &page_domain(page)?);

    for url in urls {
        let mut request = InterceptRequest::get(url.as_str()).with_main_document(page);
        if let Some(accept) = accept {
            request = request.with_accept(accept);
        }
        let verdict = shields.classify(&session, &request);
        println!("{}\t{}", verdict, url);
    }

    let stats = shields.on_main_frame_navigation_end(&session);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if shields.fingerprint_protection_enabled(&session) {
        info!("Fingerprint protection is on for {}", page);
    }
    Ok(())
}

fn cmd_replay(shields: &Shields, input: &Path, workers: usize) -> Result<()> {
    let content = std::fs::read_to_string(input)
        .with_context(|| format!("reading request log {}", input.display()))?;
    let entries = parse_log(&content)?;

    // One session per page, in order of first appearance
    let mut pages: Vec<Vec<LogEntry>> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    for entry in entries {
        let slot = *index.entry(entry.page.clone()).or_insert_with(|| {
            pages.push(Vec::new());
            pages.len() - 1
        });
        pages[slot].push(entry);
    }

    let (job_tx, job_rx) = crossbeam_channel::unbounded::<Vec<LogEntry>>();
    let (out_tx, out_rx) = crossbeam_channel::unbounded::<Result<Vec<ReplayRecord>>>();
    for page in pages {
        job_tx.send(page)?;
    }
    drop(job_tx);

    std::thread::scope(|scope| {
        for _ in 0..workers.max(1) {
            let job_rx = job_rx.clone();
            let out_tx = out_tx.clone();
            scope.spawn(move || {
                for page in job_rx.iter() {
                    if out_tx.send(replay_page(shields, page)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(out_tx);

    let mut records = Vec::new();
    for result in out_rx.iter() {
        records.extend(result?);
    }
    records.sort_by_key(|r| r.line);

    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    let (total, intercepted, cache_hits, failures) = shields.interceptor().stats();
    info!(
        "Replayed {} requests: {} intercepted, {} cache hits, {} matcher failures, avg {} ns",
        total,
        intercepted,
        cache_hits,
        failures,
        shields.interceptor().avg_check_time_ns()
    );
    Ok(())
}

fn replay_page(shields: &Shields, entries: Vec<LogEntry>) -> Result<Vec<ReplayRecord>> {
    let Some(first) = entries.first() else {
        return Ok(Vec::new());
    };
    let session = shields.new_session();
    shields.on_main_frame_navigation_start(&session, &page_domain(&first.page)?);

    let records = entries
        .into_iter()
        .map(|entry| {
            let mut request = InterceptRequest::get(entry.url.as_str()).with_main_document(entry.page.as_str());
            if let Some(accept) = &entry.accept {
                request = request.with_accept(accept);
            }
            let verdict = shields.classify(&session, &request);
            ReplayRecord {
                line: entry.line,
                page: entry.page,
                url: entry.url,
                verdict: verdict.to_string(),
            }
        })
        .collect();

    let stats = shields.on_main_frame_navigation_end(&session);
    info!(
        "{}: {} blocked or upgraded",
        session.page_domain().unwrap_or_default(),
        stats.total()
    );
    Ok(records)
}

fn parse_log(content: &str) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(page), Some(url)) = (fields.next(), fields.next()) else {
            bail!("line {}: expected `<page-url> <request-url> [accept]`", n + 1);
        };
        entries.push(LogEntry {
            line: n + 1,
            page: page.to_string(),
            url: url.to_string(),
            accept: fields.next().map(str::to_string),
        });
    }
    Ok(entries)
}

fn cmd_shield(shields: &Shields, action: ShieldAction) -> Result<()> {
    if shields.config().state_path.is_none() && !matches!(action, ShieldAction::Show { .. }) {
        warn!("No state_path configured; the change will not outlive this process");
    }

    match action {
        ShieldAction::Set { domain, shield, value } => {
            let state = shields.set_shield(&domain, shield, value.value());
            println!("{}", serde_json::to_string_pretty(&state.to_map())?);
        }
        ShieldAction::AllOff { domain, value } => {
            let state = shields.set_all_off(&domain, value.value().unwrap_or(false));
            println!("{}", serde_json::to_string_pretty(&state.to_map())?);
        }
        ShieldAction::Show { domain } => {
            let stored = shields.shield_state(&domain);
            let effective = shields.effective_policy(&domain);
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "domain": domain,
                    "stored": stored.to_map(),
                    "effective": effective,
                }))?
            );
        }
        ShieldAction::Clear => shields.clear_private_data(),
    }

    shields.flush();
    Ok(())
}

fn page_domain(page: &str) -> Result<String> {
    let url = Url::parse(page).with_context(|| format!("invalid page URL {}", page))?;
    match url.host_str() {
        Some(host) => Ok(host.to_string()),
        None => bail!("page URL {} has no host", page),
    }
}
