use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use linksync::cache::{
    CacheError, CacheKey, EntrySnapshot, FetchError, Fetcher, Mutation, ResolveOptions, RetryPolicy,
    SyncConfig,
};
use linksync::cache_manager::CacheManager;
use linksync::http_fetcher::WriteRequest;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the link-in-bio API
    #[arg(long, global = true, default_value = "http://localhost:8080/api")]
    base_url: String,

    /// Staleness threshold for resources without a class default (seconds)
    #[arg(long, global = true)]
    stale_secs: Option<u64>,

    /// Attempts per fetch before giving up
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Per-attempt fetch timeout (seconds)
    #[arg(long, global = true)]
    fetch_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve one key and print its value
    Resolve {
        /// Key such as `links:list` or `notifications:userA`
        key: String,
        /// Ignore the cached value and refetch
        #[arg(long)]
        force: bool,
    },
    /// Print every change of a key until interrupted
    Watch { key: String },
    /// Run the optimistic update and rollback walkthrough against an
    /// in-memory backend
    Demo,
}

impl Args {
    fn sync_config(&self) -> SyncConfig {
        let mut config = CacheManager::default_config();
        if let Some(secs) = self.stale_secs {
            config = config.with_default_stale_time(Duration::from_secs(secs));
        }
        if let Some(max_attempts) = self.max_attempts {
            config = config.with_retry(RetryPolicy {
                max_attempts,
                ..RetryPolicy::default()
            });
        }
        if let Some(secs) = self.fetch_timeout_secs {
            config = config.with_fetch_timeout(Some(Duration::from_secs(secs)));
        }
        config
    }
}

fn parse_key(raw: &str) -> Result<CacheKey> {
    CacheKey::parse(raw).ok_or_else(|| anyhow!("invalid key: {raw:?}"))
}

fn print_snapshot(snapshot: &EntrySnapshot<Value>) {
    let value = snapshot
        .value
        .as_ref()
        .map_or_else(|| "-".to_string(), Value::to_string);
    println!(
        "[v{}] {} {:?} pending={} {}",
        snapshot.version, snapshot.key, snapshot.status, snapshot.pending_mutations, value
    );
    if let Some(error) = &snapshot.error {
        println!("      last error: {error}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("linksync=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.sync_config();

    match args.command {
        Command::Resolve { key, force } => resolve(config, &args.base_url, &key, force).await,
        Command::Watch { key } => watch(config, &args.base_url, &key).await,
        Command::Demo => demo(config).await,
    }
}

async fn resolve(config: SyncConfig, base_url: &str, raw_key: &str, force: bool) -> Result<()> {
    let key = parse_key(raw_key)?;
    let manager = CacheManager::initialize(config, base_url).await?;

    let options = if force {
        ResolveOptions::forced()
    } else {
        ResolveOptions::default()
    };
    let outcome = manager.cache().resolve(&key, options).await;
    manager.shutdown().await;

    let resolved = outcome.with_context(|| format!("resolving {key}"))?;
    println!("{}", serde_json::to_string_pretty(&resolved.value)?);
    if let Some(error) = resolved.error {
        let hint = match &error {
            CacheError::FetchFailed { source, .. } if source.is_connectivity() => " (offline?)",
            _ => "",
        };
        eprintln!("warning: showing cached value, refresh failed{hint}: {error}");
    }
    Ok(())
}

async fn watch(config: SyncConfig, base_url: &str, raw_key: &str) -> Result<()> {
    let key = parse_key(raw_key)?;
    let manager = CacheManager::initialize(config, base_url).await?;
    let (_subscription, mut updates) = manager.cache().subscribe_stream(&key);
    eprintln!("watching {key}, ctrl-c to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for ctrl-c")?;
                break;
            }
            update = updates.next() => {
                let Some(snapshot) = update else { break };
                print_snapshot(&snapshot);
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

/// In-memory backend for the demo: serves a fixed link list and rejects
/// the first write it receives.
struct DemoBackend {
    writes: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl Fetcher for DemoBackend {
    type Value = Value;
    type Payload = WriteRequest;

    async fn read(&self, key: &CacheKey) -> Result<Value, FetchError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        match key.resource() {
            "links" => Ok(json!([{ "id": 1 }])),
            _ => Ok(json!([])),
        }
    }

    async fn write(
        &self,
        _key: &CacheKey,
        _payload: WriteRequest,
    ) -> Result<Option<Value>, FetchError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let n = self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n == 0 {
            return Err(FetchError::Transport("connection reset".to_string()));
        }
        Ok(None)
    }
}

fn prepend(item: Value) -> impl Fn(Option<&Value>) -> Value + Send + Sync + 'static {
    move |current| {
        let mut items = vec![item.clone()];
        if let Some(Value::Array(existing)) = current {
            items.extend(existing.iter().cloned());
        }
        Value::Array(items)
    }
}

async fn demo(config: SyncConfig) -> Result<()> {
    let backend = Arc::new(DemoBackend {
        writes: std::sync::atomic::AtomicUsize::new(0),
    });
    let manager = CacheManager::with_fetcher(config, backend);
    let cache = manager.cache().clone();
    let key = parse_key("links:list")?;

    let _subscription = cache.subscribe(&key, print_snapshot);
    let first = cache.resolve(&key, ResolveOptions::default()).await?;
    println!("resolved: {}", first.value);

    let link = json!({ "id": 2 });
    match cache
        .mutate(&key, Mutation::new(WriteRequest::post(link.clone()), prepend(link.clone())))
        .await
    {
        Ok(_) => println!("write accepted"),
        Err(error) => println!("write rejected, reverted: {error}"),
    }

    cache
        .mutate(&key, Mutation::new(WriteRequest::post(link.clone()), prepend(link)))
        .await?;
    println!("retry accepted");

    let summary = json!({
        "stats": cache.stats(),
        "metrics": cache.metrics(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    manager.shutdown().await;
    Ok(())
}
