//! LinearPipeline - the ordered-chain pipeline strategy
//!
//! `run()` launches exactly `parallelism` workers. Each worker pulls tasks
//! from the source and walks the plugin chain in declared order, timing
//! every invocation and reporting it to the statistics engine. A plugin
//! error aborts the current task only; a preparation failure terminates the
//! whole run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::plugin::{Flow, PluginProvider};
use crate::stats::PipelineStatistics;
use crate::task::{Task, TaskSource};

use super::context::PipelineContext;
use super::{Pipeline, PipelineState};

pub struct LinearPipeline {
    config: PipelineConfig,
    plugins: Arc<Vec<String>>,
    provider: Arc<dyn PluginProvider>,
    source: Arc<dyn TaskSource>,
    context: Arc<PipelineContext>,
    statistics: Arc<PipelineStatistics>,

    state: Mutex<PipelineState>,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    drained_tx: watch::Sender<bool>,
    drained_rx: watch::Receiver<bool>,
}

impl LinearPipeline {
    /// Build a pipeline from a validated configuration.
    ///
    /// Configuration errors surface here, never at runtime.
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn PluginProvider>,
        source: Arc<dyn TaskSource>,
    ) -> Result<Self> {
        config.validate()?;

        let statistics = Arc::new(PipelineStatistics::new(config.name.as_str()));
        let context = Arc::new(PipelineContext::new(
            config.name.clone(),
            config.plugins.clone(),
            config.parallelism,
            statistics.clone(),
        ));
        let (stop_tx, _) = watch::channel(false);
        let (drained_tx, drained_rx) = watch::channel(false);

        Ok(Self {
            plugins: Arc::new(config.plugins.clone()),
            config,
            provider,
            source,
            context,
            statistics,
            state: Mutex::new(PipelineState::Created),
            started: AtomicBool::new(false),
            stop_tx,
            drained_tx,
            drained_rx,
        })
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn statistics(&self) -> &Arc<PipelineStatistics> {
        &self.statistics
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }
}

#[async_trait]
impl Pipeline for LinearPipeline {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn run(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                PipelineState::Created => *state = PipelineState::Running,
                PipelineState::Closed => return Err(Error::Closed("pipeline")),
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "pipeline {} already started",
                        self.config.name
                    )))
                }
            }
        }

        // Resolve every referenced plugin before any worker starts.
        for name in self.plugins.iter() {
            if self.provider.instance(name).is_none() {
                *self.state.lock() = PipelineState::Stopping;
                return Err(Error::NotFound(format!("plugin {}", name)));
            }
        }

        info!(
            "[{}] starting {} workers over {} plugins",
            self.config.name,
            self.config.parallelism,
            self.plugins.len()
        );
        self.started.store(true, Ordering::Release);

        let mut workers = JoinSet::new();
        for idx in 0..self.config.parallelism {
            workers.spawn(worker_loop(
                idx,
                Arc::clone(&self.context),
                Arc::clone(&self.provider),
                Arc::clone(&self.source),
                Arc::clone(&self.plugins),
                self.stop_tx.clone(),
                self.stop_tx.subscribe(),
            ));
        }

        let mut fatal: Option<Error> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("[{}] worker failed: {}", self.config.name, e);
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
                Err(e) => error!("[{}] worker panicked: {}", self.config.name, e),
            }
        }

        {
            let mut state = self.state.lock();
            if *state == PipelineState::Running {
                *state = PipelineState::Stopping;
            }
        }
        let _ = self.drained_tx.send(true);
        info!("[{}] all workers exited", self.config.name);

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        if *state == PipelineState::Running {
            *state = PipelineState::Stopping;
            info!("[{}] stop requested", self.config.name);
            let _ = self.stop_tx.send(true);
        }
    }

    async fn close(&self) -> Result<()> {
        {
            let state = self.state.lock();
            match *state {
                PipelineState::Closed => return Err(Error::Closed("pipeline")),
                PipelineState::Running => {
                    return Err(Error::InvalidArgument(format!(
                        "pipeline {} must be stopped before close",
                        self.config.name
                    )))
                }
                _ => {}
            }
        }

        // Wait until every worker has exited.
        if self.started.load(Ordering::Acquire) {
            let mut drained_rx = self.drained_rx.clone();
            while !*drained_rx.borrow() {
                if drained_rx.changed().await.is_err() {
                    break;
                }
            }
        }

        self.context.close();
        *self.state.lock() = PipelineState::Closed;
        info!("[{}] closed", self.config.name);
        Ok(())
    }
}

async fn worker_loop(
    idx: u16,
    ctx: Arc<PipelineContext>,
    provider: Arc<dyn PluginProvider>,
    source: Arc<dyn TaskSource>,
    plugins: Arc<Vec<String>>,
    stop_tx: watch::Sender<bool>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<()> {
    debug!("[{}] worker #{} started", ctx.pipeline_name(), idx);

    loop {
        if *stop_rx.borrow() {
            break;
        }

        // The stop flag is observed between tasks, never mid-plugin.
        let mut task = tokio::select! {
            _ = stop_rx.changed() => break,
            task = source.next_task() => match task {
                Some(task) => task,
                None => {
                    debug!("[{}] worker #{}: task source drained", ctx.pipeline_name(), idx);
                    break;
                }
            },
        };

        if let Err(e) = execute_task(&ctx, &provider, &plugins, &mut task).await {
            // Preparation failures are fatal to the whole run; pull the
            // other workers down with us.
            let _ = stop_tx.send(true);
            return Err(e);
        }
    }

    debug!("[{}] worker #{} exited", ctx.pipeline_name(), idx);
    Ok(())
}

/// Walk the plugin chain for one task.
///
/// Per-task errors are absorbed into statistics; only preparation failures
/// propagate.
async fn execute_task(
    ctx: &Arc<PipelineContext>,
    provider: &Arc<dyn PluginProvider>,
    plugins: &[String],
    task: &mut Task,
) -> Result<()> {
    let stats = Arc::clone(ctx.statistics());
    let mut total_ns: i64 = 0;
    let mut success = true;

    for name in plugins {
        // Re-resolved per task so a live replacement (update) takes effect
        // without a pipeline restart.
        let Some(instance) = provider.instance(name) else {
            warn!("[{}] plugin {} is gone, aborting task", ctx.pipeline_name(), name);
            success = false;
            break;
        };

        let prep_instance = Arc::clone(&instance);
        let prep_ctx = Arc::clone(ctx);
        ctx.prepare_plugin(name, move || async move {
            prep_instance.prepare(&prep_ctx).await
        })
        .await
        .map_err(|e| match e {
            prep @ Error::Preparation { .. } => prep,
            other => Error::preparation(name.clone(), other),
        })?;

        let start = Instant::now();
        let result = instance.run(ctx, task).await;
        let elapsed_ns = start.elapsed().as_nanos() as i64;
        total_ns += elapsed_ns;

        match result {
            Ok(Flow::Continue) => {
                stats.record_plugin_execution(name, elapsed_ns, true);
            }
            Ok(Flow::Stop) => {
                stats.record_plugin_execution(name, elapsed_ns, true);
                break;
            }
            Err(e) => {
                debug!("[{}] plugin {} failed: {}", ctx.pipeline_name(), name, e);
                stats.record_plugin_execution(name, elapsed_ns, false);
                success = false;
                break;
            }
        }
    }

    // Pipeline-level execution time is the sum of per-plugin deltas.
    stats.record_pipeline_execution(total_ns, success);
    Ok(())
}
