//! Flowgate - demo gateway runtime
//!
//! Wires a demo pipeline (stamp → backend) to a synthetic task generator
//! and serves the statistics API, until Ctrl-C.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use flowgate::api::{start_api_server, StatsCollector};
use flowgate::balancer::{BackendSpec, LoadBalance, Policy, Server, ServerPool};
use flowgate::pipeline::BucketValue;
use flowgate::{
    Error, Flow, InstanceScope, LinearPipeline, Pipeline, PipelineConfig, PipelineContext,
    Plugin, Result, StatisticsKind, Task,
};
use flowgate::plugin::StaticPlugins;
use flowgate::task::QueueSource;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        println!("Flowgate v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Flowgate v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(args))?;

    info!("Goodbye!");
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    // Demo backend pool: two servers, round robin.
    let backend_spec = BackendSpec {
        servers: vec![
            Server {
                url: "http://127.0.0.1:9001".to_string(),
                scheme: None,
                tags: vec!["demo".to_string()],
                weight: 50,
            },
            Server {
                url: "http://127.0.0.1:9002".to_string(),
                scheme: None,
                tags: vec!["demo".to_string()],
                weight: 50,
            },
        ],
        servers_tags: vec![],
        load_balance: LoadBalance {
            policy: Policy::RoundRobin,
            header_hash_key: String::new(),
        },
    };
    let pool = Arc::new(ServerPool::new(&backend_spec)?);

    let provider = StaticPlugins::new()
        .with(Arc::new(StampPlugin::new()))
        .with(Arc::new(BackendPlugin::new(pool)));

    let (source, handle) = QueueSource::new(64);
    let pipeline = Arc::new(LinearPipeline::new(
        PipelineConfig::new(
            "demo",
            vec!["stamp".to_string(), "backend".to_string()],
            4,
        ),
        Arc::new(provider),
        source,
    )?);

    let collector = StatsCollector::new();
    collector.register(pipeline.statistics().clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let api_handle = args.api_listen.map(|addr| {
        tokio::spawn(start_api_server(addr, collector.clone(), shutdown_rx.clone()))
    });

    // Synthetic task generator standing in for the HTTP front-end.
    let generator = tokio::spawn(async move {
        let mut n: u64 = 0;
        loop {
            let task = Task::new()
                .with_client_ip(format!("10.0.0.{}", n % 8 + 1))
                .with_header("X-Request-Id", Uuid::new_v4().to_string());
            if !handle.push(task).await {
                break;
            }
            n += 1;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    let runner = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");

    let _ = shutdown_tx.send(true);
    generator.abort();
    pipeline.stop();
    if let Ok(result) = runner.await {
        result?;
    }
    pipeline.close().await?;
    if let Some(handle) = api_handle {
        let _ = handle.await;
    }

    let stats = pipeline.statistics();
    info!(
        "processed {} tasks ({} failed)",
        stats.task_execution_count(StatisticsKind::All),
        stats.task_execution_count(StatisticsKind::Failure),
    );
    Ok(())
}

/// Stamps every task with a request id and counts throughput in its bucket.
struct StampPlugin {
    id: String,
}

impl StampPlugin {
    fn new() -> Self {
        Self {
            id: format!("stamp-{}", Uuid::new_v4()),
        }
    }
}

#[async_trait]
impl Plugin for StampPlugin {
    fn name(&self) -> &str {
        "stamp"
    }

    fn instance_id(&self) -> &str {
        &self.id
    }

    async fn run(&self, ctx: &PipelineContext, task: &mut Task) -> Result<Flow> {
        let bucket = ctx.data_bucket(self.name(), InstanceScope::Specific(self.id.clone()))?;
        let counter = bucket.query_data_with_bind_default("processed", || {
            Ok(Arc::new(AtomicU64::new(0)) as BucketValue)
        })?;
        if let Ok(counter) = counter.downcast::<AtomicU64>() {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        task.set_value("request_id", Arc::new(Uuid::new_v4().to_string()));
        Ok(Flow::Continue)
    }
}

/// Picks a backend server for the task.
struct BackendPlugin {
    id: String,
    pool: Arc<ServerPool>,
}

impl BackendPlugin {
    fn new(pool: Arc<ServerPool>) -> Self {
        Self {
            id: format!("backend-{}", Uuid::new_v4()),
            pool,
        }
    }
}

#[async_trait]
impl Plugin for BackendPlugin {
    fn name(&self) -> &str {
        "backend"
    }

    fn instance_id(&self) -> &str {
        &self.id
    }

    async fn run(&self, _ctx: &PipelineContext, task: &mut Task) -> Result<Flow> {
        let server = self
            .pool
            .next(&*task)
            .ok_or_else(|| Error::plugin_run(self.name(), "no backend available"))?;
        debug!("dispatching {} -> {}", task.real_ip(), server.url);
        task.set_value("backend_url", Arc::new(server.url.clone()));
        Ok(Flow::Continue)
    }
}

/// Command line arguments
struct Args {
    version: bool,
    api_listen: Option<SocketAddr>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut version = false;
        let mut api_listen = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--api" => {
                    if i + 1 < args.len() {
                        api_listen = args[i + 1].parse().ok();
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => {}
            }
            i += 1;
        }

        Self { version, api_listen }
    }
}

fn print_help() {
    println!(
        r#"Flowgate - pipeline-driven request gateway core

USAGE:
    flowgate [OPTIONS]

OPTIONS:
    --api <ADDR>            Statistics API listen address (e.g., 127.0.0.1:9090)
    -v, --version           Print version information
    -h, --help              Print help information

STATS API ENDPOINTS:
    GET /pipelines                     Registered pipelines
    GET /pipelines/:name/statistics    Rates, counts, latency aggregates
"#
    );
}
