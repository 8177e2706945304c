//! PipelineContext - shared state for one pipeline
//!
//! The context aggregates what plugins see: the pipeline identity, the
//! statistics engine, scoped data buckets, and the preparation barrier.
//! Exactly one context exists per running pipeline; closing it releases all
//! buckets and drops every callback registered against the statistics
//! engine.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{Error, Result};
use crate::plugin::InstanceScope;
use crate::stats::PipelineStatistics;

use super::bucket::DataBucket;

pub struct PipelineContext {
    pipeline_name: String,
    plugin_names: Vec<String>,
    parallelism: u16,
    statistics: Arc<PipelineStatistics>,

    // plugin name -> instance scope -> bucket
    buckets: Mutex<HashMap<String, HashMap<InstanceScope, Arc<DataBucket>>>>,
    // preparation barrier, keyed by plugin name, per context
    prepared: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
    closed: AtomicBool,
}

impl PipelineContext {
    pub fn new(
        pipeline_name: impl Into<String>,
        plugin_names: Vec<String>,
        parallelism: u16,
        statistics: Arc<PipelineStatistics>,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            plugin_names,
            parallelism,
            statistics,
            buckets: Mutex::new(HashMap::new()),
            prepared: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    /// Snapshot of the plugin names the pipeline was configured with.
    pub fn plugin_names(&self) -> &[String] {
        &self.plugin_names
    }

    pub fn parallelism(&self) -> u16 {
        self.parallelism
    }

    pub fn statistics(&self) -> &Arc<PipelineStatistics> {
        &self.statistics
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed("pipeline context"))
        } else {
            Ok(())
        }
    }

    /// The bucket for `(plugin, instance)`, created on first access.
    ///
    /// `InstanceScope::All` addresses the slot shared across all instances
    /// of the plugin.
    pub fn data_bucket(
        &self,
        plugin: &str,
        instance: InstanceScope,
    ) -> Result<Arc<DataBucket>> {
        self.check_open()?;
        let mut buckets = self.buckets.lock();
        Ok(buckets
            .entry(plugin.to_string())
            .or_default()
            .entry(instance)
            .or_insert_with(|| Arc::new(DataBucket::new()))
            .clone())
    }

    /// Detach exactly one `(plugin, instance)` slot, returning its bucket.
    ///
    /// The context stays live; a later `data_bucket` for the same slot
    /// creates a fresh empty bucket.
    pub fn delete_bucket(
        &self,
        plugin: &str,
        instance: &InstanceScope,
    ) -> Result<Option<Arc<DataBucket>>> {
        self.check_open()?;
        let mut buckets = self.buckets.lock();
        let removed = buckets
            .get_mut(plugin)
            .and_then(|by_instance| by_instance.remove(instance));
        if let Some(by_instance) = buckets.get(plugin) {
            if by_instance.is_empty() {
                buckets.remove(plugin);
            }
        }
        Ok(removed)
    }

    /// Preparation barrier: the first caller for `plugin` runs `prepare` to
    /// completion while concurrent callers for the same plugin name block;
    /// later callers return immediately. Per-context, so a new pipeline run
    /// re-prepares.
    pub async fn prepare_plugin<F, Fut>(&self, plugin: &str, prepare: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.check_open()?;
        let cell = {
            let mut prepared = self.prepared.lock();
            prepared
                .entry(plugin.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        cell.get_or_try_init(|| prepare()).await?;
        Ok(())
    }

    /// Release all buckets and drop all statistics callbacks. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("[{}] closing pipeline context", self.pipeline_name);

        let buckets = std::mem::take(&mut *self.buckets.lock());
        for by_instance in buckets.values() {
            for bucket in by_instance.values() {
                bucket.close();
            }
        }

        self.statistics.clear_callbacks();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bucket::BucketValue;
    use std::sync::atomic::AtomicUsize;

    fn context() -> Arc<PipelineContext> {
        Arc::new(PipelineContext::new(
            "test",
            vec!["demo".to_string()],
            2,
            Arc::new(PipelineStatistics::new("test")),
        ))
    }

    #[test]
    fn test_bucket_created_on_first_access() {
        let ctx = context();
        let bucket = ctx.data_bucket("demo", InstanceScope::All).unwrap();
        bucket.bind_data("k", Arc::new(1u8)).unwrap();

        // Same slot, same bucket.
        let again = ctx.data_bucket("demo", InstanceScope::All).unwrap();
        assert!(again.query_data("k").unwrap().is_some());

        // Different instance, different bucket.
        let other = ctx
            .data_bucket("demo", InstanceScope::Specific("i-1".to_string()))
            .unwrap();
        assert!(other.query_data("k").unwrap().is_none());
    }

    #[test]
    fn test_delete_bucket_detaches_one_slot() {
        let ctx = context();
        let scope = InstanceScope::Specific("i-1".to_string());
        let bucket = ctx.data_bucket("demo", scope.clone()).unwrap();
        bucket.bind_data("k", Arc::new(1u8)).unwrap();

        let removed = ctx.delete_bucket("demo", &scope).unwrap();
        assert!(removed.is_some());
        assert!(ctx.delete_bucket("demo", &scope).unwrap().is_none());

        // A later access creates a fresh empty bucket.
        let fresh = ctx.data_bucket("demo", scope).unwrap();
        assert!(fresh.query_data("k").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prepare_runs_exactly_once() {
        let ctx = context();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ctx = ctx.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                ctx.prepare_plugin("demo", || async {
                    runs.fetch_add(1, Ordering::Relaxed);
                    tokio::task::yield_now().await;
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_prepare_failure_allows_retry() {
        let ctx = context();

        let err = ctx
            .prepare_plugin("demo", || async {
                Err(Error::preparation("demo", "boom"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Preparation { .. }));

        // The cell was never initialized, so a later caller may retry.
        ctx.prepare_plugin("demo", || async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_context_rejects_everything() {
        let ctx = context();
        let held = ctx.data_bucket("demo", InstanceScope::All).unwrap();
        ctx.close();
        ctx.close(); // idempotent

        assert!(matches!(
            ctx.data_bucket("demo", InstanceScope::All),
            Err(Error::Closed(_))
        ));
        assert!(matches!(
            ctx.delete_bucket("demo", &InstanceScope::All),
            Err(Error::Closed(_))
        ));
        assert!(matches!(
            ctx.prepare_plugin("demo", || async { Ok(()) }).await,
            Err(Error::Closed(_))
        ));

        // Buckets handed out earlier are released too.
        assert!(matches!(
            held.bind_data("k", Arc::new(0u8) as BucketValue),
            Err(Error::Closed(_))
        ));
    }

    #[test]
    fn test_close_drops_statistics_callbacks() {
        let stats = Arc::new(PipelineStatistics::new("test"));
        let ctx = PipelineContext::new("test", vec![], 1, stats.clone());

        stats.add_pipeline_throughput_rate_updated_callback(
            "sub",
            crate::stats::CallbackBinding::Unbound,
            Arc::new(|_, _| panic!("must have been dropped")),
            false,
        );
        ctx.close();

        // Fan-out after close reaches nobody.
        stats.record_pipeline_execution(1, true);
    }
}
