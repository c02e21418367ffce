use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hdrhistogram::Histogram;
use quanta::Instant;
use tier_gate::Gate;
use tier_gate::GateConfig;
use tier_gate::GateRequest;
use tier_gate::GateResponse;
use tier_gate::MemoryStore;
use tier_gate::Principal;
use tier_gate::SystemClock;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;
use tower::service_fn;
use tower_tier_gate::GateError;
use tower_tier_gate::ManagedAdmissionLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Drives concurrent requests through the managed admission stack and reports
/// what the gate let through.
#[derive(Debug, Parser)]
#[command(name = "gate-load")]
struct Args {
    /// TOML configuration; `TIER_GATE__*` environment variables apply on top.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use an in-process store instead of connecting to Redis.
    #[arg(long)]
    memory: bool,

    /// Total requests to send.
    #[arg(long, default_value_t = 10_000)]
    requests: usize,

    /// Distinct principals the requests are spread over.
    #[arg(long, default_value_t = 100)]
    principals: usize,

    /// Distinct paths the requests are spread over.
    #[arg(long, default_value_t = 10)]
    paths: usize,

    /// Simulated handler latency.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5ms")]
    handler_latency: Duration,

    /// Deadline for admission plus handling.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "500ms")]
    max_wait: Duration,
}

#[derive(Debug, Default)]
struct Outcomes {
    rate_limited: usize,
    store_unavailable: usize,
    timeouts: usize,
    sheds: usize,
    handler: usize,
    unknown: usize,
}

impl Outcomes {
    fn record(&mut self, err: &BoxError) {
        match err.downcast_ref::<GateError>() {
            Some(GateError::RateLimited { .. }) => self.rate_limited += 1,
            Some(GateError::StoreUnavailable) => self.store_unavailable += 1,
            Some(GateError::Timeout) => self.timeouts += 1,
            Some(GateError::Overloaded) => self.sheds += 1,
            Some(GateError::Handler(_)) => self.handler += 1,
            Some(GateError::Internal(_)) | None => self.unknown += 1,
        }
    }

    fn total(&self) -> usize {
        self.rate_limited
            + self.store_unavailable
            + self.timeouts
            + self.sheds
            + self.handler
            + self.unknown
    }
}

async fn build_gate(args: &Args) -> Result<Gate, BoxError> {
    let config = GateConfig::load(args.config.as_deref())?;
    if args.memory {
        let clock = Arc::new(SystemClock);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        Ok(Gate::from_store(&config, store, clock)?)
    } else {
        Ok(Gate::connect(&config).await?)
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let gate = Arc::new(build_gate(&args).await?);
    info!(?args, "starting load run");

    let latency = args.handler_latency;
    let handler = service_fn(move |req: GateRequest| async move {
        sleep(latency).await;
        Ok::<_, BoxError>(GateResponse::ok(format!("{} {}", req.method, req.path)))
    });
    let svc = ManagedAdmissionLayer::new(gate.clone(), args.max_wait).layer(handler);

    let mut elapsed_us = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)?;
    let mut outcomes = Outcomes::default();
    let mut tasks = JoinSet::new();
    let barrier = Arc::new(Barrier::new(args.requests));

    let start = Instant::now();
    for i in 0..args.requests {
        let mut local_svc = svc.clone();
        let bar = barrier.clone();
        let principal = Principal::user(format!("load-{}", i % args.principals.max(1)), None);
        let path = format!("/load/{}", i % args.paths.max(1));

        tasks.spawn(async move {
            bar.wait().await;
            let req_start = Instant::now();
            let res = match local_svc.ready().await {
                Ok(ready) => ready.call(GateRequest::get(path, principal)).await,
                Err(err) => Err(err),
            };
            (res, Instant::now().duration_since(req_start))
        });
    }

    let mut success = 0usize;
    let mut hits = 0usize;
    while let Some(task) = tasks.join_next().await {
        let (res, elapsed) = task?;
        match res {
            Ok(response) => {
                success += 1;
                if response.header(tier_gate::X_CACHE) == Some("HIT") {
                    hits += 1;
                }
                elapsed_us.record(elapsed.as_micros() as u64)?;
            }
            Err(err) => outcomes.record(&err),
        }
    }

    let total = Instant::now().duration_since(start);
    println!("--- gate-load ---");
    println!("Total Duration:  {:.2?}", total);
    println!("Success/Total:   {}/{}", success, args.requests);
    println!("Cache Hits:      {}", hits);
    println!(
        "Success Rate:    {:.2} req/sec (Goodput)",
        success as f64 / total.as_secs_f64()
    );
    if success > 0 {
        println!("P50 (Elapsed):   {}µs", elapsed_us.value_at_quantile(0.5));
        println!("P99 (Elapsed):   {}µs", elapsed_us.value_at_quantile(0.99));
    }

    println!("Errors:          {}", outcomes.total());
    if outcomes.total() > 0 {
        println!("  └─ RateLimited:       {}", outcomes.rate_limited);
        println!("  └─ StoreUnavailable:  {}", outcomes.store_unavailable);
        println!("  └─ Timeouts:          {}", outcomes.timeouts);
        println!("  └─ LoadSheds:         {}", outcomes.sheds);
        println!("  └─ Handler:           {}", outcomes.handler);
        println!("  └─ Unknown:           {}", outcomes.unknown);
    }

    let report = gate.report().await;
    println!("Gate Report:     {:?}", report);
    Ok(())
}
