use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wiki_search_indexer::config::Config;
use wiki_search_indexer::search::{
    ChannelObserver, ClusterClient, HttpClusterClient, InMemoryCluster, MemoryContentStore,
    SearchError, SearchOptions, SearchService, SearchTerms, SortAxis, SortOrder, SyncEvent,
    TermKey, Viewer,
};
use wiki_search_indexer::AppError;

/// Rejected search terms
const EXIT_USAGE: i32 = 2;
/// Configuration that cannot start the service
const EXIT_CONFIG: i32 = 78;

#[derive(Parser)]
#[command(name = "wiki-search-admin")]
#[command(about = "Administer and query the wiki search index", long_about = None)]
struct Cli {
    /// Configuration file (defaults to $CONFIG_PATH or config/default.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Override the cluster URI
    #[arg(long, global = true, env = "WIKI_SEARCH_URI")]
    uri: Option<String>,

    /// Override the cluster protocol version (7 or 8)
    #[arg(long, global = true)]
    protocol_version: Option<u8>,

    /// Use an in-process cluster instead of the configured one
    #[arg(long, global = true)]
    memory: bool,

    /// JSON array of documents seeding the content store
    #[arg(short, long, global = true)]
    documents: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show cluster version and nodes
    Info,

    /// Show cluster health
    Health,

    /// Show index set status
    Status,

    /// Normalize the index set
    Normalize,

    /// Rebuild the index from the content store
    Rebuild,

    /// Run a search
    Search {
        /// Raw terms object, e.g. '{"match": ["deploy"], "tag": ["ops"]}'
        #[arg(long, conflicts_with_all = ["match_", "not_match", "phrase", "not_phrase", "prefix", "not_prefix", "tag", "not_tag"])]
        terms: Option<String>,

        #[arg(long = "match")]
        match_: Vec<String>,

        #[arg(long)]
        not_match: Vec<String>,

        #[arg(long)]
        phrase: Vec<String>,

        #[arg(long)]
        not_phrase: Vec<String>,

        #[arg(long)]
        prefix: Vec<String>,

        #[arg(long)]
        not_prefix: Vec<String>,

        #[arg(long)]
        tag: Vec<String>,

        #[arg(long)]
        not_tag: Vec<String>,

        /// Viewer id; anonymous when omitted
        #[arg(short, long)]
        user: Option<String>,

        /// Viewer group ids
        #[arg(short, long, requires = "user")]
        group: Vec<String>,

        #[arg(long, default_value = "0")]
        offset: usize,

        #[arg(long, default_value = "50")]
        limit: usize,

        /// relationScore, createdAt or updatedAt
        #[arg(long, default_value = "relationScore")]
        sort: SortAxis,

        /// Sort ascending instead of descending
        #[arg(long)]
        asc: bool,
    },
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "wiki_search_indexer={level},wiki_search_admin={level}",
            level = config.observability.log_level
        )
        .into()
    });
    let registry = tracing_subscriber::registry().with(filter);

    if config.observability.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Exit status for a failed command, taken from the first typed error in the chain
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(search) = cause.downcast_ref::<SearchError>() {
            return if search.is_validation() { EXIT_USAGE } else { 1 };
        }
        if let Some(app) = cause.downcast_ref::<AppError>() {
            return if app.is_fatal() { EXIT_CONFIG } else { 1 };
        }
    }
    1
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(uri) = &cli.uri {
        config.search.uri = uri.clone();
    }
    if let Some(version) = cli.protocol_version {
        config.search.protocol_version = version;
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config);

    let store = match &cli.documents {
        Some(path) => MemoryContentStore::from_json_file(path)
            .with_context(|| format!("Failed to load documents from {}", path))?,
        None => MemoryContentStore::new(),
    };

    let client: Arc<dyn ClusterClient> = if cli.memory {
        Arc::new(InMemoryCluster::new(config.search.protocol()?))
    } else {
        Arc::new(HttpClusterClient::new(&config.search)?)
    };

    let (observer, mut events) = ChannelObserver::channel();
    let service = SearchService::new(
        config.search.clone(),
        client,
        Arc::new(store.clone()),
        Arc::new(observer),
    )?;

    let progress = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SyncEvent::AddProgress {
                    total_count,
                    processed_count,
                } => info!(total = total_count, processed = processed_count, "Indexing"),
                SyncEvent::AddFinished {
                    total_count,
                    processed_count,
                } => info!(total = total_count, processed = processed_count, "Indexing finished"),
                SyncEvent::RebuildFailed { error } => warn!(error = %error, "Rebuild failed"),
            }
        }
    });

    match cli.command {
        Commands::Info => print_json(&service.cluster_info().await?)?,

        Commands::Health => print_json(&service.cluster_health().await?)?,

        Commands::Status => print_json(&service.index_admin_status().await?)?,

        Commands::Normalize => {
            service.normalize_indices().await?;
            print_json(&service.index_admin_status().await?)?;
        }

        Commands::Rebuild => {
            service.normalize_indices().await?;
            let report = service.rebuild_index().await?;
            print_json(&report)?;
        }

        Commands::Search {
            terms,
            match_,
            not_match,
            phrase,
            not_phrase,
            prefix,
            not_prefix,
            tag,
            not_tag,
            user,
            group,
            offset,
            limit,
            sort,
            asc,
        } => {
            service.init().await?;
            if cli.memory && !store.is_empty() {
                service.on_descendants_updated("/").await?;
            }

            let terms = match terms {
                Some(raw) => {
                    let payload: serde_json::Value =
                        serde_json::from_str(&raw).context("--terms must be a JSON object")?;
                    SearchTerms::from_json(&payload)?
                }
                None => SearchTerms::new()
                    .with(TermKey::Match, match_)
                    .with(TermKey::NotMatch, not_match)
                    .with(TermKey::Phrase, phrase)
                    .with(TermKey::NotPhrase, not_phrase)
                    .with(TermKey::Prefix, prefix)
                    .with(TermKey::NotPrefix, not_prefix)
                    .with(TermKey::Tag, tag)
                    .with(TermKey::NotTag, not_tag),
            };

            let viewer = user.map(|id| Viewer::new(id).with_groups(group));
            let order = if asc {
                SortOrder::Ascending
            } else {
                SortOrder::Descending
            };
            let options = SearchOptions::new()
                .with_offset(offset)
                .with_limit(limit)
                .with_sort(sort, order);

            let results = service.search(&terms, viewer.as_ref(), &options).await?;
            print_json(&results)?;
        }
    }

    drop(service);
    if let Err(e) = progress.await {
        warn!(error = %e, "Progress logging task failed");
    }
    Ok(())
}
