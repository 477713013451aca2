//! feedctl: load a reconciled feed from a simulated shard network
//!
//! The network is described by a JSON fixture (see `demos/network.json`).
//! Each page is reconciled to quorum, backfilled and identity-checked before
//! it is printed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use feed_reconciler::config::Config;
use feed_reconciler::feed::{
    ContentFeed, ConversationFeed, FeedEntry, FeedFilter, FeedProfile, ReactionFeed, TagFeed,
};
use feed_reconciler::identity::IdentityCache;
use feed_reconciler::logging::init_tracing;
use feed_reconciler::reconcile::{FeedReport, FeedSession, LoadOutcome};
use feed_reconciler::transport::NetworkFixture;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FeedKind {
    /// Subscriptions, publisher and thread feeds
    Content,
    /// Network-ranked content confirmed by several peers
    Global,
    Reactions,
    Conversations,
    Tags,
}

#[derive(Parser)]
#[command(name = "feedctl")]
#[command(about = "Reconcile a feed across shards to quorum")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "feed-reconciler.toml", env = "FEED_RECONCILER_CONFIG")]
    config: PathBuf,

    /// JSON description of the shard network
    #[arg(long, env = "FEED_RECONCILER_FIXTURE")]
    fixture: PathBuf,

    #[arg(long, value_enum, default_value = "content")]
    feed: FeedKind,

    /// subscriptions | global | publisher:<id> | thread:<chain>:<root> | tag:<tag>
    /// | conversations:<id>
    #[arg(long, default_value = "subscriptions")]
    filter: String,

    /// Pages to load, following the cursor each time
    #[arg(long, default_value_t = 1)]
    pages: usize,

    /// Confirmations per shard (overrides config file)
    #[arg(long)]
    quorum: Option<usize>,

    /// Log level (overrides config file)
    #[arg(long, env = "FEED_RECONCILER_LOG")]
    log_level: Option<String>,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

fn profile_for(kind: FeedKind, quorum: usize) -> Arc<dyn FeedProfile> {
    match kind {
        FeedKind::Content => Arc::new(ContentFeed::subscriptions()),
        FeedKind::Global => Arc::new(ContentFeed::global(quorum)),
        FeedKind::Reactions => Arc::new(ReactionFeed),
        FeedKind::Conversations => Arc::new(ConversationFeed::new(quorum)),
        FeedKind::Tags => Arc::new(TagFeed::new(quorum)),
    }
}

fn print_entry(entry: &FeedEntry, depth: usize) {
    let item = &entry.item;
    let author = entry
        .publisher
        .as_ref()
        .map(|p| p.name.clone())
        .unwrap_or_else(|| item.publisher_id.short());
    let text = item.payload.get("text").and_then(|t| t.as_str()).unwrap_or("");
    println!(
        "{:indent$}{} {:<8} {:>12} {:<12} {}",
        "",
        item.id.short(),
        item.kind.label(),
        item.timestamp,
        author,
        text,
        indent = depth * 2
    );
    for reply in &entry.replies {
        print_entry(reply, depth + 1);
    }
}

fn print_report(page: usize, report: &FeedReport) {
    println!(
        "-- page {} ({} entries, quorate: {}, backfill rounds: {}) --",
        page,
        report.feed.len(),
        report.summary.quorate,
        report.summary.backfill_rounds
    );
    for entry in report.feed.iter() {
        print_entry(entry, 0);
    }
    for warning in &report.summary.warnings {
        println!("warning {}: {:?}", warning.code(), warning);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    if let Some(quorum) = cli.quorum {
        config.reconcile.quorum = quorum;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate()?;
    init_tracing(&config.logging)?;

    info!("Config file: {}", cli.config.display());
    info!("Fixture: {}", cli.fixture.display());

    let fixture = NetworkFixture::load(&cli.fixture)
        .with_context(|| format!("loading fixture {}", cli.fixture.display()))?;
    config.network.app_name = fixture.app_name.clone();
    let network = Arc::new(fixture.build()?);

    let profile = profile_for(cli.feed, config.reconcile.quorum);
    let filter: FeedFilter = cli.filter.parse()?;
    let identities = Arc::new(IdentityCache::new(config.identity.cache_config()));
    let session = FeedSession::new(profile, network, identities, config);

    let mut page = None;
    let mut last = None;
    for number in 1..=cli.pages.max(1) {
        let outcome = session.load(filter.clone(), page.take()).await?;
        let LoadOutcome::Published(report) = outcome else {
            warn!("load dropped while another was in flight");
            break;
        };

        if !cli.json {
            print_report(number, &report);
        }
        let exhausted = report.appended == Some(false);
        last = Some(report);
        if exhausted {
            info!(page = number, "no older items");
            break;
        }
        page = Some(session.next_page().await);
    }

    if cli.json {
        if let Some(report) = last {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
