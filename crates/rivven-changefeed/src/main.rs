//! rivven-changefeed - Change feed processor demo runtime
//!
//! # Usage
//!
//! ```bash
//! # Three hosts sharing four partitions, splitting one midway
//! rivven-changefeed simulate --workers 3 --partitions 4 --records 5000 --split-after 2500
//!
//! # Same, with intervals from a config file
//! rivven-changefeed -c changefeed.yaml simulate
//!
//! # Print the default configuration
//! rivven-changefeed options
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rivven_changefeed::{
    ChangeFeedError, ChangeFeedProcessor, DocumentLeaseManager, FnObserverFactory,
    InMemoryChangeFeed, InMemoryDocumentStore, ObserverContext, PartitionKeyRange,
    ProcessorOptions,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rivven-changefeed")]
#[command(version, about = "Lease-based change feed processor for Rivven")]
struct Cli {
    /// Path to a YAML file with processor options
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run several hosts against an in-memory partitioned feed
    Simulate {
        /// Number of cooperating hosts
        #[arg(long, default_value_t = 3)]
        workers: usize,
        /// Initial number of partitions
        #[arg(long, default_value_t = 4)]
        partitions: usize,
        /// Number of changes to append
        #[arg(long, default_value_t = 1000)]
        records: u64,
        /// Split the first partition after this many changes
        #[arg(long)]
        split_after: Option<u64>,
        /// Give up waiting for delivery after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Print the default processor options as YAML
    Options,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Options => {
            let yaml = serde_yaml::to_string(&ProcessorOptions::default())
                .context("Failed to render options")?;
            print!("{}", yaml);
            Ok(())
        }
        Commands::Simulate {
            workers,
            partitions,
            records,
            split_after,
            timeout_secs,
        } => {
            let options = load_options(cli.config.as_deref())?;
            simulate(
                options,
                workers,
                partitions,
                records,
                split_after,
                Duration::from_secs(timeout_secs),
            )
            .await
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn load_options(path: Option<&Path>) -> Result<ProcessorOptions> {
    let Some(path) = path else {
        return Ok(ProcessorOptions::for_testing("simulation"));
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let options: ProcessorOptions = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    options.validate().context("Invalid processor options")?;
    Ok(options)
}

/// Key halfway through a partition, if it is wide enough to split
fn midpoint(partition: &PartitionKeyRange) -> Option<String> {
    let parse = |key: &str, default: u32| {
        if key.is_empty() {
            Some(default)
        } else {
            u32::from_str_radix(key, 16).ok()
        }
    };
    let low = parse(&partition.min_inclusive, 0)?;
    let high = parse(&partition.max_exclusive, 0xFF)?;
    let mid = (low + high) / 2;
    (mid > low).then(|| format!("{:02X}", mid))
}

struct SimulatedHost {
    name: String,
    processor: ChangeFeedProcessor,
    delivered: Arc<AtomicU64>,
}

async fn simulate(
    base: ProcessorOptions,
    workers: usize,
    partitions: usize,
    records: u64,
    split_after: Option<u64>,
    timeout: Duration,
) -> Result<()> {
    if workers == 0 {
        bail!("at least one worker is required");
    }

    let feed = Arc::new(InMemoryChangeFeed::new("simulation", partitions));
    let store = Arc::new(InMemoryDocumentStore::new());
    let total = Arc::new(AtomicU64::new(0));

    let mut hosts = Vec::with_capacity(workers);
    for i in 1..=workers {
        let name = format!("worker-{}", i);
        let options = ProcessorOptions {
            host_name: name.clone(),
            ..base.clone()
        };

        let delivered = Arc::new(AtomicU64::new(0));
        let observer = FnObserverFactory::new({
            let delivered = delivered.clone();
            let total = total.clone();
            move |_ctx: ObserverContext, changes: Vec<serde_json::Value>| {
                let delivered = delivered.clone();
                let total = total.clone();
                async move {
                    let count = changes.len() as u64;
                    delivered.fetch_add(count, Ordering::Relaxed);
                    total.fetch_add(count, Ordering::Relaxed);
                    Ok::<(), ChangeFeedError>(())
                }
            }
        });

        let leases = Arc::new(DocumentLeaseManager::new(
            store.clone(),
            options.lease_prefix.clone(),
            name.clone(),
        ));
        let processor = ChangeFeedProcessor::builder()
            .options(options)
            .feed(feed.clone())
            .leases(leases)
            .observer_factory(Arc::new(observer))
            .build()
            .with_context(|| format!("Failed to build processor {}", name))?;
        processor
            .start()
            .await
            .with_context(|| format!("Failed to start processor {}", name))?;

        hosts.push(SimulatedHost {
            name,
            processor,
            delivered,
        });
    }

    info!(workers, partitions, records, "Appending changes");
    for n in 0..records {
        feed.append(InMemoryChangeFeed::key_for(n), json!({ "id": n }));
        if split_after == Some(n + 1) {
            let first = feed.partitions().into_iter().next();
            match first.as_ref().and_then(|p| midpoint(p).map(|at| (p, at))) {
                Some((partition, at)) => {
                    feed.split(&partition.id, &at)?;
                }
                None => warn!("First partition is too narrow to split"),
            }
        }
    }

    let deadline = tokio::time::Instant::now() + timeout;
    while total.load(Ordering::Relaxed) < records {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                delivered = total.load(Ordering::Relaxed),
                records, "Timed out waiting for delivery"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let leases = hosts[0].processor.current_state().await?;
    for host in &hosts {
        host.processor.stop().await;
    }

    println!("Leases:");
    for lease in &leases {
        println!(
            "  {:<12} owner={}",
            lease.lease_token,
            lease.owner.as_deref().unwrap_or("-")
        );
    }
    println!("Delivered changes:");
    for host in &hosts {
        println!(
            "  {:<12} {}",
            host.name,
            host.delivered.load(Ordering::Relaxed)
        );
    }
    println!(
        "Total: {} delivered for {} appended",
        total.load(Ordering::Relaxed),
        records
    );
    Ok(())
}
