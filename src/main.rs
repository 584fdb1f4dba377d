use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{StoreBackend, TollgateConfig};
use tollgate::ratelimit::{
    Admission, BucketId, BucketLimit, BucketStore, OutageGuard, OutageStats, RateLimiter,
};
use tollgate::store::{MemoryBucketStore, RedisBucketStore};
use tollgate::usage::{TracingSink, UsageEvent, UsageRecorder, UsageStats};

/// Distributed token-bucket rate limiter.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `tollgate=debug` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Use an in-process store instead of the configured one
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that the bucket store is reachable
    Ping,

    /// Make one admission decision
    Check {
        #[command(flatten)]
        bucket: BucketArgs,
    },

    /// Race many concurrent callers against one bucket
    Bench {
        #[command(flatten)]
        bucket: BucketArgs,

        /// Concurrent callers
        #[arg(long, default_value_t = 64)]
        concurrency: usize,

        /// Calls per caller
        #[arg(long, default_value_t = 10)]
        calls: usize,
    },
}

#[derive(Debug, clap::Args)]
struct BucketArgs {
    #[arg(long)]
    tenant: String,

    #[arg(long)]
    endpoint: String,

    /// Override the configured capacity
    #[arg(long)]
    capacity: Option<u32>,

    /// Override the configured refill rate (tokens per second)
    #[arg(long)]
    refill_rate: Option<f64>,

    #[arg(long, default_value_t = 1)]
    requested: u32,
}

impl BucketArgs {
    fn limit(&self, config: &TollgateConfig) -> BucketLimit {
        let configured = config.limits.for_endpoint(&self.endpoint);
        BucketLimit::new(
            self.capacity.unwrap_or(configured.capacity),
            self.refill_rate.unwrap_or(configured.refill_rate),
        )
    }

    fn id(&self) -> BucketId {
        BucketId::new(self.tenant.as_str(), self.endpoint.as_str())
    }
}

#[derive(Debug, Serialize)]
struct CheckReport {
    bucket: String,
    proceeds: bool,
    status: u16,
    admission: String,
    tokens_remaining: Option<f64>,
    elapsed_ms: f64,
}

#[derive(Debug, Serialize)]
struct BenchReport {
    bucket: String,
    capacity: u32,
    refill_rate: f64,
    calls: usize,
    admitted: usize,
    rate_limited: usize,
    errors: usize,
    elapsed_ms: f64,
    outage: OutageStats,
    usage: UsageStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref(), cli.log_json);

    let mut config = TollgateConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if cli.memory {
        config.store.backend = StoreBackend::Memory;
    }
    info!(backend = ?config.store.backend, key_prefix = %config.store.key_prefix, "Configuration loaded");

    match config.store.backend {
        StoreBackend::Redis => {
            let store = RedisBucketStore::connect(&config.store.redis, config.store.idle_ttl())
                .await
                .context("connecting to Redis")?;
            run(cli.command, store, &config).await
        }
        StoreBackend::Memory => {
            let store = MemoryBucketStore::new(config.store.idle_ttl());
            run(cli.command, store, &config).await
        }
    }
}

fn init_tracing(level: Option<&str>, json: bool) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

async fn run<S: BucketStore + 'static>(
    command: Command,
    store: S,
    config: &TollgateConfig,
) -> anyhow::Result<()> {
    let limiter = Arc::new(
        RateLimiter::new(store)
            .with_key_prefix(config.store.key_prefix.as_str())
            .with_rules(config.limits.clone()),
    );

    match command {
        Command::Ping => {
            limiter.store().ping().await.context("pinging bucket store")?;
            println!("{}", serde_json::json!({ "status": "ok" }));
        }
        Command::Check { bucket } => {
            let guard = OutageGuard::new(config.outage.clone());
            let started = Instant::now();
            let result = limiter.allow(&bucket.id(), bucket.limit(config), bucket.requested).await;
            let admission = guard.resolve(result);

            let report = CheckReport {
                bucket: bucket.id().to_string(),
                proceeds: admission.proceeds(),
                status: admission.status_code(),
                tokens_remaining: tokens_of(&admission),
                admission: format!("{:?}", admission),
                elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Bench {
            bucket,
            concurrency,
            calls,
        } => {
            let report = bench(limiter, config, &bucket, concurrency, calls).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn bench<S: BucketStore + 'static>(
    limiter: Arc<RateLimiter<S>>,
    config: &TollgateConfig,
    bucket: &BucketArgs,
    concurrency: usize,
    calls: usize,
) -> anyhow::Result<BenchReport> {
    let limit = bucket.limit(config);
    let id = bucket.id();
    let guard = Arc::new(OutageGuard::new(config.outage.clone()));
    let usage = Arc::new(UsageRecorder::spawn(Arc::new(TracingSink), config.usage.clone()));

    info!(bucket = %id, concurrency, calls, "Starting bench");
    let started = Instant::now();

    let tasks = (0..concurrency.max(1)).map(|_| {
        let limiter = limiter.clone();
        let guard = guard.clone();
        let usage = usage.clone();
        let id = id.clone();
        let requested = bucket.requested;
        tokio::spawn(async move {
            let mut outcomes = Vec::with_capacity(calls);
            for _ in 0..calls {
                let admission = guard.resolve(limiter.allow(&id, limit, requested).await);
                if let Admission::Allowed { .. } = admission {
                    usage.record(UsageEvent::new(id.tenant.as_str(), id.endpoint.as_str(), requested));
                }
                outcomes.push(admission);
            }
            outcomes
        })
    });

    let mut admitted = 0;
    let mut rate_limited = 0;
    let mut errors = 0;
    for outcome in futures::future::join_all(tasks).await {
        for admission in outcome.context("bench task panicked")? {
            match admission {
                Admission::Allowed { .. } => admitted += 1,
                Admission::RateLimited { .. } => rate_limited += 1,
                _ => errors += 1,
            }
        }
    }
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    let usage = Arc::try_unwrap(usage)
        .map_err(|_| anyhow::anyhow!("usage recorder still shared"))?
        .shutdown()
        .await;

    Ok(BenchReport {
        bucket: id.to_string(),
        capacity: limit.capacity,
        refill_rate: limit.refill_rate,
        calls: concurrency.max(1) * calls,
        admitted,
        rate_limited,
        errors,
        elapsed_ms,
        outage: guard.stats(),
        usage,
    })
}

fn tokens_of(admission: &Admission) -> Option<f64> {
    match admission {
        Admission::Allowed { tokens_remaining } | Admission::RateLimited { tokens_remaining } => {
            Some(*tokens_remaining)
        }
        _ => None,
    }
}
