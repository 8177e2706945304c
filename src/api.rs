//! Statistics HTTP endpoint
//!
//! Exposes the per-pipeline statistics as JSON for dashboards and
//! operators:
//!
//! ```text
//! GET /pipelines                        list of registered pipelines
//! GET /pipelines/:name/statistics      rates, counts, latency aggregates
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::stats::{PipelineStatistics, StatisticsKind};

/// Registry of live pipeline statistics served by the API.
#[derive(Clone, Default)]
pub struct StatsCollector {
    pipelines: Arc<RwLock<HashMap<String, Arc<PipelineStatistics>>>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, stats: Arc<PipelineStatistics>) {
        self.pipelines
            .write()
            .insert(stats.pipeline_name().to_string(), stats);
    }

    pub fn deregister(&self, name: &str) {
        self.pipelines.write().remove(name);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn get(&self, name: &str) -> Option<Arc<PipelineStatistics>> {
        self.pipelines.read().get(name).cloned()
    }
}

#[derive(Serialize)]
struct LatencySummary {
    min_ns: Option<i64>,
    max_ns: Option<i64>,
    mean_ns: Option<f64>,
    std_dev_ns: Option<f64>,
    p50_ns: Option<f64>,
    p90_ns: Option<f64>,
    p99_ns: Option<f64>,
}

#[derive(Serialize)]
struct MeterSummary {
    count: u64,
    rate1: f64,
    rate5: f64,
    rate15: f64,
    latency: LatencySummary,
}

#[derive(Serialize)]
struct PluginSummary {
    success: MeterSummary,
    failure: MeterSummary,
    all: MeterSummary,
}

#[derive(Serialize)]
struct TaskSummary {
    success: u64,
    failure: u64,
    all: u64,
}

#[derive(Serialize)]
struct PipelineSummary {
    pipeline: MeterSummary,
    plugins: HashMap<String, PluginSummary>,
    tasks: TaskSummary,
}

fn pipeline_meter_summary(stats: &PipelineStatistics) -> MeterSummary {
    MeterSummary {
        count: stats.pipeline_execution_count(),
        rate1: stats.pipeline_throughput_rate1(),
        rate5: stats.pipeline_throughput_rate5(),
        rate15: stats.pipeline_throughput_rate15(),
        latency: LatencySummary {
            min_ns: stats.pipeline_execution_time_min().ok(),
            max_ns: stats.pipeline_execution_time_max().ok(),
            mean_ns: stats.pipeline_execution_time_mean().ok(),
            std_dev_ns: stats.pipeline_execution_time_std_dev().ok(),
            p50_ns: stats.pipeline_execution_time_percentile(0.5).ok(),
            p90_ns: stats.pipeline_execution_time_percentile(0.9).ok(),
            p99_ns: stats.pipeline_execution_time_percentile(0.99).ok(),
        },
    }
}

fn plugin_meter_summary(
    stats: &PipelineStatistics,
    plugin: &str,
    kind: StatisticsKind,
) -> MeterSummary {
    MeterSummary {
        count: stats.plugin_execution_count(plugin, kind).unwrap_or(0),
        rate1: stats.plugin_throughput_rate1(plugin, kind).unwrap_or(0.0),
        rate5: stats.plugin_throughput_rate5(plugin, kind).unwrap_or(0.0),
        rate15: stats.plugin_throughput_rate15(plugin, kind).unwrap_or(0.0),
        latency: LatencySummary {
            min_ns: stats.plugin_execution_time_min(plugin, kind).ok(),
            max_ns: stats.plugin_execution_time_max(plugin, kind).ok(),
            mean_ns: stats.plugin_execution_time_mean(plugin, kind).ok(),
            std_dev_ns: stats.plugin_execution_time_std_dev(plugin, kind).ok(),
            p50_ns: stats.plugin_execution_time_percentile(plugin, kind, 0.5).ok(),
            p90_ns: stats.plugin_execution_time_percentile(plugin, kind, 0.9).ok(),
            p99_ns: stats.plugin_execution_time_percentile(plugin, kind, 0.99).ok(),
        },
    }
}

fn summarize(stats: &PipelineStatistics) -> PipelineSummary {
    let mut plugins = HashMap::new();
    for plugin in stats.plugin_names() {
        plugins.insert(
            plugin.clone(),
            PluginSummary {
                success: plugin_meter_summary(stats, &plugin, StatisticsKind::Success),
                failure: plugin_meter_summary(stats, &plugin, StatisticsKind::Failure),
                all: plugin_meter_summary(stats, &plugin, StatisticsKind::All),
            },
        );
    }

    PipelineSummary {
        pipeline: pipeline_meter_summary(stats),
        plugins,
        tasks: TaskSummary {
            success: stats.task_execution_count(StatisticsKind::Success),
            failure: stats.task_execution_count(StatisticsKind::Failure),
            all: stats.task_execution_count(StatisticsKind::All),
        },
    }
}

async fn get_pipelines(State(collector): State<StatsCollector>) -> Json<Vec<String>> {
    Json(collector.names())
}

async fn get_pipeline_statistics(
    State(collector): State<StatsCollector>,
    Path(name): Path<String>,
) -> Result<Json<PipelineSummary>, StatusCode> {
    let stats = collector.get(&name).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(summarize(&stats)))
}

/// Build the API router.
pub fn build_api_router(collector: StatsCollector) -> Router {
    Router::new()
        .route("/pipelines", get(get_pipelines))
        .route("/pipelines/:name/statistics", get(get_pipeline_statistics))
        .with_state(collector)
}

/// Serve the statistics API until the shutdown signal fires.
pub async fn start_api_server(
    addr: SocketAddr,
    collector: StatsCollector,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let app = build_api_router(collector);

    info!("statistics API listening on http://{}/pipelines", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("failed to bind statistics API to {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("statistics API shutting down");
        })
        .await
    {
        warn!("statistics API error: {}", e);
    }
}
