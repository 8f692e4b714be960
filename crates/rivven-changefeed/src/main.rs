//! rivven-changefeed - change feed processor tooling
//!
//! # Usage
//!
//! ```bash
//! # Run three hosts against an in-memory container for 10 seconds
//! rivven-changefeed simulate --hosts 3 --partitions 4 --documents 500
//!
//! # Same, splitting partition 0 half way through
//! rivven-changefeed simulate --split 0
//!
//! # Validate a processor configuration file
//! rivven-changefeed -c changefeed.yaml validate
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use rand::Rng;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rivven_changefeed::store::memory::{InMemoryFeedContainer, InMemoryLeaseContainer};
use rivven_changefeed::{
    ChangeFeedConfig, ChangeFeedObserver, ChangeFeedObserverContext, ChangeFeedProcessor,
    ChangeFeedProcessorOptions, StartFrom,
};

#[derive(Parser)]
#[command(name = "rivven-changefeed")]
#[command(version, about = "Lease-coordinated change feed processing")]
struct Cli {
    /// Path to configuration file
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
    /// Run several hosts against in-memory containers
    Simulate {
        /// Number of processor hosts
        #[arg(long, default_value_t = 3)]
        hosts: usize,
        /// Number of initial partitions
        #[arg(long, default_value_t = 4)]
        partitions: usize,
        /// Documents written over the run
        #[arg(long, default_value_t = 500)]
        documents: usize,
        /// Run time in seconds
        #[arg(long, default_value_t = 10)]
        duration: u64,
        /// Partition key range id to split half way through
        #[arg(long)]
        split: Option<String>,
    },
    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => Some(
            ChangeFeedConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
        ),
        None => None,
    };

    match cli.command {
        Commands::Validate => {
            let config = config.context("validate requires --config")?;
            validate_config(&config);
            Ok(())
        }
        Commands::Simulate {
            hosts,
            partitions,
            documents,
            duration,
            split,
        } => {
            let options = config
                .map(|c| c.processor)
                .unwrap_or_else(simulation_options);
            simulate(options, hosts, partitions, documents, duration, split).await
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

/// Short intervals so a simulation converges within seconds
fn simulation_options() -> ChangeFeedProcessorOptions {
    ChangeFeedProcessorOptions {
        lease_renew_interval_ms: 500,
        lease_acquire_interval_ms: 1_000,
        lease_expiration_interval_ms: 3_000,
        feed_poll_delay_ms: 200,
        start_from: StartFrom::Beginning,
        bootstrap_retry_delay_ms: 500,
        ..Default::default()
    }
}

fn validate_config(config: &ChangeFeedConfig) {
    let options = &config.processor;
    println!("✓ Configuration valid!\n");
    println!("Host: {}", config.host_name.as_deref().unwrap_or("<generated>"));
    println!("Leases:");
    println!("  Prefix: '{}'", options.lease_prefix);
    println!("  Renew interval: {}ms", options.lease_renew_interval_ms);
    println!("  Acquire interval: {}ms", options.lease_acquire_interval_ms);
    println!("  Expiration interval: {}ms", options.lease_expiration_interval_ms);
    println!("Feed:");
    println!("  Poll delay: {}ms", options.feed_poll_delay_ms);
    println!("  Max items per page: {}", options.max_items_per_page);
    println!("  Start from: {:?}", options.start_from);
    println!("Checkpoint: {:?}", options.checkpoint);
    println!(
        "Scale: min {} / max {}",
        options.min_scale_count,
        if options.max_scale_count == 0 {
            "unbounded".to_string()
        } else {
            options.max_scale_count.to_string()
        }
    );
}

struct CountingObserver {
    host: String,
    processed: Arc<AtomicUsize>,
}

#[async_trait]
impl ChangeFeedObserver for CountingObserver {
    async fn process_changes(
        &self,
        ctx: &ChangeFeedObserverContext,
        documents: Vec<Value>,
    ) -> anyhow::Result<()> {
        tracing::debug!(
            host = %self.host,
            lease_token = ctx.lease_token(),
            count = documents.len(),
            "Processed changes"
        );
        self.processed.fetch_add(documents.len(), Ordering::Relaxed);
        Ok(())
    }
}

async fn simulate(
    options: ChangeFeedProcessorOptions,
    hosts: usize,
    partitions: usize,
    documents: usize,
    duration: u64,
    split: Option<String>,
) -> Result<()> {
    let feed = Arc::new(InMemoryFeedContainer::new("simulation", partitions));
    let leases = Arc::new(InMemoryLeaseContainer::new("leases"));

    let mut processors = Vec::with_capacity(hosts);
    for i in 0..hosts {
        let host = format!("host-{i}");
        let processed = Arc::new(AtomicUsize::new(0));
        let observer = Arc::new(CountingObserver {
            host: host.clone(),
            processed: processed.clone(),
        });
        let processor = ChangeFeedProcessor::builder()
            .host_name(host.clone())
            .options(options.clone())
            .feed_container(feed.clone())
            .lease_container(leases.clone())
            .observer_factory(move || observer.clone() as Arc<dyn ChangeFeedObserver>)
            .build()?;
        processor.start().await?;
        processors.push((host, processor, processed));
    }

    let run_time = Duration::from_secs(duration.max(1));
    // Writes take the first half of the run, the rest lets readers catch up.
    let write_delay = run_time.div_f64(documents.max(1) as f64 * 2.0);
    let mut split_pending = split;
    for n in 0..documents {
        let key = format!("key-{}", rand::thread_rng().gen_range(0..1_000));
        feed.upsert(&key, json!({ "id": n, "pk": key }));
        if n == documents / 2 {
            if let Some(range_id) = split_pending.take() {
                let (left, right) = feed.split(&range_id)?;
                info!(range_id = %range_id, left = %left, right = %right, "Split partition");
            }
        }
        tokio::time::sleep(write_delay).await;
    }
    tokio::time::sleep(run_time / 2).await;

    let mut total = 0;
    println!("\nProcessed documents:");
    for (host, processor, processed) in &processors {
        let count = processed.load(Ordering::Relaxed);
        total += count;
        println!(
            "  {host}: {count} (leases: {})",
            processor.owned_lease_tokens().await.join(", ")
        );
    }
    println!("  total: {total} of {documents} written (replays after failover count twice)");

    println!("\nLeases:");
    if let Some((_, processor, _)) = processors.first() {
        for lease in processor.current_state().await? {
            println!(
                "  {} {} owner={}",
                lease.lease_token,
                lease.feed_range,
                lease.owner.as_deref().unwrap_or("-")
            );
        }
    }

    for (_, processor, _) in &processors {
        processor.stop().await?;
    }
    Ok(())
}
