mod sim;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bucket_dispatch::{Dispatcher, DispatcherConfig};
use clap::Parser;
use futures::future::join_all;
use sim::SimulatedApi;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Drive the dispatcher against a simulated rate-limited API
#[derive(Debug, Parser)]
#[command(name = "bucket-dispatch", version, about)]
struct Args {
    /// Number of distinct documents (major parameters) to spread requests over
    #[arg(long, default_value_t = 4)]
    buckets: usize,

    /// Requests submitted per bucket
    #[arg(long, default_value_t = 20)]
    requests: usize,

    /// Requests the simulated API allows per bucket and window
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    quota: u32,

    #[arg(long, default_value_t = 1000)]
    window_ms: u64,

    /// Simulated network latency per request
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,

    /// Answer every n-th request with a global 429 (0 disables)
    #[arg(long, default_value_t = 0)]
    global_every: u64,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = DispatcherConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("bucket_dispatch={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting dispatcher simulation");
    tracing::info!(
        buckets = args.buckets,
        requests = args.requests,
        quota = args.quota,
        window_ms = args.window_ms,
        max_throttle_retries = ?config.max_throttle_retries,
        "Configuration"
    );

    let api = Arc::new(SimulatedApi::new(
        args.quota,
        Duration::from_millis(args.window_ms),
        Duration::from_millis(args.latency_ms),
        args.global_every,
        &config.headers,
    )?);
    let dispatcher = Dispatcher::new(config)
        .map_err(|e| anyhow::anyhow!("Failed to create dispatcher: {}", e))?;

    let started = Instant::now();
    let mut handles = Vec::with_capacity(args.buckets * args.requests);
    for _ in 0..args.requests {
        for bucket in 0..args.buckets {
            let document = format!("document-{bucket}");
            let api = Arc::clone(&api);
            let target = document.clone();
            handles.push(dispatcher.submit("translate", Some(document), move || {
                let api = Arc::clone(&api);
                let target = target.clone();
                async move { api.handle(&target).await }
            }));
        }
    }

    let outcomes = join_all(handles.iter().map(|handle| handle.wait())).await;
    for err in outcomes.iter().filter_map(|outcome| outcome.as_ref().err()) {
        tracing::warn!(%err, "Request failed");
    }

    tracing::info!(
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        active_buckets = dispatcher.active_bucket_count(),
        "Simulation finished"
    );
    println!("{}", serde_json::to_string_pretty(&dispatcher.stats())?);

    Ok(())
}
