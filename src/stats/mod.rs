//! Statistics engine
//!
//! Windowed throughput rates, latency reservoirs and an indicator registry
//! for one pipeline, with synchronous callback fan-out on every recorded
//! event.
//!
//! Scopes:
//!
//! ```text
//! pipeline   one meter (all executions)
//! plugin     three meters per plugin: Success / Failure / All
//! task       execution counters by kind (counts only)
//! ```
//!
//! Callbacks and indicators carry a lifecycle binding chosen at
//! registration, so plugin deletion and plugin update (reinstantiation
//! without removal) can drop exactly the records whose semantics died with
//! the plugin, in a single registry per family.

mod ewma;
mod meter;
mod sample;

pub use meter::Meter;
pub use sample::{UniformSample, DEFAULT_RESERVOIR_SIZE};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::plugin::InstanceScope;

// ============================================================================
// Kinds and callback types
// ============================================================================

/// Which side of a plugin execution a statistic refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatisticsKind {
    Success,
    Failure,
    All,
}

impl fmt::Display for StatisticsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatisticsKind::Success => f.write_str("Success"),
            StatisticsKind::Failure => f.write_str("Failure"),
            StatisticsKind::All => f.write_str("All"),
        }
    }
}

/// Lifecycle binding of a callback or indicator record.
///
/// Decides what happens to the record when the named plugin is deleted from
/// the pipeline configuration, or updated (reinstantiated without removal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackBinding {
    /// Survives both plugin deletion and update.
    Unbound,
    /// Dropped when the plugin is deleted; survives an update.
    Plugin(String),
    /// Depends on instance identity: dropped on deletion and on update.
    PluginInstance(String),
}

impl CallbackBinding {
    fn dropped_by(&self, plugin: &str, deleted: bool) -> bool {
        match self {
            CallbackBinding::Unbound => false,
            CallbackBinding::Plugin(p) => deleted && p == plugin,
            CallbackBinding::PluginInstance(p) => p == plugin,
        }
    }
}

pub type PipelineThroughputRateUpdated =
    Arc<dyn Fn(&str, &PipelineStatistics) + Send + Sync>;
pub type PipelineExecutionSampleUpdated =
    Arc<dyn Fn(&str, &PipelineStatistics) + Send + Sync>;
pub type PluginThroughputRateUpdated =
    Arc<dyn Fn(&str, &PipelineStatistics, StatisticsKind) + Send + Sync>;
pub type PluginExecutionSampleUpdated =
    Arc<dyn Fn(&str, &PipelineStatistics, StatisticsKind) + Send + Sync>;

// ============================================================================
// Callback registry
// ============================================================================

struct CallbackEntry<F: ?Sized> {
    callback: Arc<F>,
    binding: CallbackBinding,
}

/// One callback family, keyed by subscription name.
///
/// Registration and fan-out share the category lock, so a subscription sees
/// events in record order and never observes a half-registered state.
/// Callbacks must be non-blocking and must not touch their own category.
struct CallbackRegistry<F: ?Sized> {
    entries: Mutex<HashMap<String, CallbackEntry<F>>>,
}

impl<F: ?Sized> CallbackRegistry<F> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn add(
        &self,
        name: &str,
        binding: CallbackBinding,
        callback: Arc<F>,
        overwrite: bool,
    ) -> (Option<Arc<F>>, bool) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(name) {
            if !overwrite {
                return (Some(existing.callback.clone()), false);
            }
        }
        let prev = entries.insert(name.to_string(), CallbackEntry { callback, binding });
        (prev.map(|e| e.callback), true)
    }

    fn delete(&self, name: &str) {
        self.entries.lock().remove(name);
    }

    fn drop_for_plugin(&self, plugin: &str, deleted: bool) {
        self.entries
            .lock()
            .retain(|_, entry| !entry.binding.dropped_by(plugin, deleted));
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }

    fn fire(&self, invoke: impl Fn(&F)) {
        let entries = self.entries.lock();
        for entry in entries.values() {
            invoke(&entry.callback);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

// ============================================================================
// Indicators
// ============================================================================

/// An evaluated-on-demand value exposed by a plugin instance.
#[derive(Debug, Clone, PartialEq)]
pub enum IndicatorValue {
    Int(i64),
    Float(f64),
    Text(String),
}

/// Evaluator invoked with `(plugin_name, indicator_name)`.
pub type IndicatorEvaluator =
    Arc<dyn Fn(&str, &str) -> Result<IndicatorValue> + Send + Sync>;

struct IndicatorEntry {
    instance: InstanceScope,
    #[allow(dead_code)]
    description: String,
    evaluator: IndicatorEvaluator,
}

// ============================================================================
// Plugin meters
// ============================================================================

struct PluginMeters {
    success: Meter,
    failure: Meter,
    all: Meter,
}

impl PluginMeters {
    fn new() -> Self {
        Self {
            success: Meter::new(),
            failure: Meter::new(),
            all: Meter::new(),
        }
    }

    fn kind(&self, kind: StatisticsKind) -> &Meter {
        match kind {
            StatisticsKind::Success => &self.success,
            StatisticsKind::Failure => &self.failure,
            StatisticsKind::All => &self.all,
        }
    }
}

// ============================================================================
// The engine
// ============================================================================

/// Statistics for one pipeline.
///
/// Recording methods are called by pipeline workers; query methods are safe
/// from any thread, including from inside callbacks.
pub struct PipelineStatistics {
    pipeline_name: String,

    pipeline_meter: Meter,
    plugin_meters: RwLock<HashMap<String, Arc<PluginMeters>>>,
    task_success: AtomicU64,
    task_failure: AtomicU64,

    pipeline_rate_callbacks: CallbackRegistry<dyn Fn(&str, &PipelineStatistics) + Send + Sync>,
    pipeline_sample_callbacks: CallbackRegistry<dyn Fn(&str, &PipelineStatistics) + Send + Sync>,
    plugin_rate_callbacks:
        CallbackRegistry<dyn Fn(&str, &PipelineStatistics, StatisticsKind) + Send + Sync>,
    plugin_sample_callbacks:
        CallbackRegistry<dyn Fn(&str, &PipelineStatistics, StatisticsKind) + Send + Sync>,

    // plugin name -> indicator name -> one entry per registered scope
    plugin_indicators: Mutex<HashMap<String, HashMap<String, Vec<IndicatorEntry>>>>,
}

impl PipelineStatistics {
    pub fn new(pipeline_name: impl Into<String>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            pipeline_meter: Meter::new(),
            plugin_meters: RwLock::new(HashMap::new()),
            task_success: AtomicU64::new(0),
            task_failure: AtomicU64::new(0),
            pipeline_rate_callbacks: CallbackRegistry::new(),
            pipeline_sample_callbacks: CallbackRegistry::new(),
            plugin_rate_callbacks: CallbackRegistry::new(),
            plugin_sample_callbacks: CallbackRegistry::new(),
            plugin_indicators: Mutex::new(HashMap::new()),
        }
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Record one plugin execution: updates the kind meter and `All`, then
    /// notifies plugin-scope subscribers synchronously.
    pub fn record_plugin_execution(&self, plugin: &str, elapsed_ns: i64, success: bool) {
        let meters = self.meters_or_create(plugin);
        let kind = if success {
            StatisticsKind::Success
        } else {
            StatisticsKind::Failure
        };
        meters.kind(kind).update(elapsed_ns);
        meters.all.update(elapsed_ns);

        self.plugin_rate_callbacks
            .fire(|cb| cb(&self.pipeline_name, self, kind));
        self.plugin_sample_callbacks
            .fire(|cb| cb(&self.pipeline_name, self, kind));
    }

    /// Record one completed task: updates the pipeline meter (execution time
    /// is the sum of per-plugin deltas), the task-stream counters, and
    /// notifies pipeline-scope subscribers.
    pub fn record_pipeline_execution(&self, elapsed_ns: i64, success: bool) {
        self.pipeline_meter.update(elapsed_ns);
        if success {
            self.task_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.task_failure.fetch_add(1, Ordering::Relaxed);
        }

        self.pipeline_rate_callbacks
            .fire(|cb| cb(&self.pipeline_name, self));
        self.pipeline_sample_callbacks
            .fire(|cb| cb(&self.pipeline_name, self));
    }

    fn meters_or_create(&self, plugin: &str) -> Arc<PluginMeters> {
        if let Some(meters) = self.plugin_meters.read().get(plugin) {
            return meters.clone();
        }
        self.plugin_meters
            .write()
            .entry(plugin.to_string())
            .or_insert_with(|| Arc::new(PluginMeters::new()))
            .clone()
    }

    fn meters(&self, plugin: &str) -> Result<Arc<PluginMeters>> {
        self.plugin_meters
            .read()
            .get(plugin)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("statistics for plugin {}", plugin)))
    }

    // ------------------------------------------------------------------
    // Pipeline-level queries
    // ------------------------------------------------------------------

    pub fn pipeline_throughput_rate1(&self) -> f64 {
        self.pipeline_meter.rate1()
    }

    pub fn pipeline_throughput_rate5(&self) -> f64 {
        self.pipeline_meter.rate5()
    }

    pub fn pipeline_throughput_rate15(&self) -> f64 {
        self.pipeline_meter.rate15()
    }

    pub fn pipeline_execution_count(&self) -> u64 {
        self.pipeline_meter.count()
    }

    pub fn pipeline_execution_time_max(&self) -> Result<i64> {
        self.pipeline_meter.sample().max()
    }

    pub fn pipeline_execution_time_min(&self) -> Result<i64> {
        self.pipeline_meter.sample().min()
    }

    pub fn pipeline_execution_time_sum(&self) -> Result<i64> {
        self.pipeline_meter.sample().sum()
    }

    pub fn pipeline_execution_time_mean(&self) -> Result<f64> {
        self.pipeline_meter.sample().mean()
    }

    pub fn pipeline_execution_time_variance(&self) -> Result<f64> {
        self.pipeline_meter.sample().variance()
    }

    pub fn pipeline_execution_time_std_dev(&self) -> Result<f64> {
        self.pipeline_meter.sample().std_dev()
    }

    pub fn pipeline_execution_time_percentile(&self, p: f64) -> Result<f64> {
        self.pipeline_meter.sample().percentile(p)
    }

    // ------------------------------------------------------------------
    // Plugin-level queries
    // ------------------------------------------------------------------

    pub fn plugin_throughput_rate1(&self, plugin: &str, kind: StatisticsKind) -> Result<f64> {
        Ok(self.meters(plugin)?.kind(kind).rate1())
    }

    pub fn plugin_throughput_rate5(&self, plugin: &str, kind: StatisticsKind) -> Result<f64> {
        Ok(self.meters(plugin)?.kind(kind).rate5())
    }

    pub fn plugin_throughput_rate15(&self, plugin: &str, kind: StatisticsKind) -> Result<f64> {
        Ok(self.meters(plugin)?.kind(kind).rate15())
    }

    pub fn plugin_execution_count(&self, plugin: &str, kind: StatisticsKind) -> Result<u64> {
        Ok(self.meters(plugin)?.kind(kind).count())
    }

    pub fn plugin_execution_time_max(&self, plugin: &str, kind: StatisticsKind) -> Result<i64> {
        self.meters(plugin)?.kind(kind).sample().max()
    }

    pub fn plugin_execution_time_min(&self, plugin: &str, kind: StatisticsKind) -> Result<i64> {
        self.meters(plugin)?.kind(kind).sample().min()
    }

    pub fn plugin_execution_time_sum(&self, plugin: &str, kind: StatisticsKind) -> Result<i64> {
        self.meters(plugin)?.kind(kind).sample().sum()
    }

    pub fn plugin_execution_time_mean(&self, plugin: &str, kind: StatisticsKind) -> Result<f64> {
        self.meters(plugin)?.kind(kind).sample().mean()
    }

    pub fn plugin_execution_time_variance(
        &self,
        plugin: &str,
        kind: StatisticsKind,
    ) -> Result<f64> {
        self.meters(plugin)?.kind(kind).sample().variance()
    }

    pub fn plugin_execution_time_std_dev(
        &self,
        plugin: &str,
        kind: StatisticsKind,
    ) -> Result<f64> {
        self.meters(plugin)?.kind(kind).sample().std_dev()
    }

    pub fn plugin_execution_time_percentile(
        &self,
        plugin: &str,
        kind: StatisticsKind,
        p: f64,
    ) -> Result<f64> {
        self.meters(plugin)?.kind(kind).sample().percentile(p)
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugin_meters.read().keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Task-level queries (counts only)
    // ------------------------------------------------------------------

    pub fn task_execution_count(&self, kind: StatisticsKind) -> u64 {
        match kind {
            StatisticsKind::Success => self.task_success.load(Ordering::Relaxed),
            StatisticsKind::Failure => self.task_failure.load(Ordering::Relaxed),
            StatisticsKind::All => {
                self.task_success.load(Ordering::Relaxed)
                    + self.task_failure.load(Ordering::Relaxed)
            }
        }
    }

    // ------------------------------------------------------------------
    // Callback registration
    // ------------------------------------------------------------------

    pub fn add_pipeline_throughput_rate_updated_callback(
        &self,
        name: &str,
        binding: CallbackBinding,
        callback: PipelineThroughputRateUpdated,
        overwrite: bool,
    ) -> (Option<PipelineThroughputRateUpdated>, bool) {
        self.pipeline_rate_callbacks.add(name, binding, callback, overwrite)
    }

    pub fn delete_pipeline_throughput_rate_updated_callback(&self, name: &str) {
        self.pipeline_rate_callbacks.delete(name);
    }

    pub fn add_pipeline_execution_sample_updated_callback(
        &self,
        name: &str,
        binding: CallbackBinding,
        callback: PipelineExecutionSampleUpdated,
        overwrite: bool,
    ) -> (Option<PipelineExecutionSampleUpdated>, bool) {
        self.pipeline_sample_callbacks.add(name, binding, callback, overwrite)
    }

    pub fn delete_pipeline_execution_sample_updated_callback(&self, name: &str) {
        self.pipeline_sample_callbacks.delete(name);
    }

    pub fn add_plugin_throughput_rate_updated_callback(
        &self,
        name: &str,
        binding: CallbackBinding,
        callback: PluginThroughputRateUpdated,
        overwrite: bool,
    ) -> (Option<PluginThroughputRateUpdated>, bool) {
        self.plugin_rate_callbacks.add(name, binding, callback, overwrite)
    }

    pub fn delete_plugin_throughput_rate_updated_callback(&self, name: &str) {
        self.plugin_rate_callbacks.delete(name);
    }

    pub fn add_plugin_execution_sample_updated_callback(
        &self,
        name: &str,
        binding: CallbackBinding,
        callback: PluginExecutionSampleUpdated,
        overwrite: bool,
    ) -> (Option<PluginExecutionSampleUpdated>, bool) {
        self.plugin_sample_callbacks.add(name, binding, callback, overwrite)
    }

    pub fn delete_plugin_execution_sample_updated_callback(&self, name: &str) {
        self.plugin_sample_callbacks.delete(name);
    }

    /// Drop every registered callback. Called when the owning context closes.
    pub fn clear_callbacks(&self) {
        self.pipeline_rate_callbacks.clear();
        self.pipeline_sample_callbacks.clear();
        self.plugin_rate_callbacks.clear();
        self.plugin_sample_callbacks.clear();
    }

    // ------------------------------------------------------------------
    // Plugin lifecycle
    // ------------------------------------------------------------------

    /// The plugin was deleted from the pipeline configuration: drop the
    /// callbacks bound to it, its meters, and its indicators. Idempotent.
    pub fn plugin_deleted(&self, plugin: &str) {
        self.pipeline_rate_callbacks.drop_for_plugin(plugin, true);
        self.pipeline_sample_callbacks.drop_for_plugin(plugin, true);
        self.plugin_rate_callbacks.drop_for_plugin(plugin, true);
        self.plugin_sample_callbacks.drop_for_plugin(plugin, true);

        self.plugin_meters.write().remove(plugin);
        self.plugin_indicators.lock().remove(plugin);
    }

    /// The plugin was reinstantiated without removal: drop only the records
    /// whose semantics depend on instance identity. Meters survive so
    /// historical rates stay continuous. Idempotent.
    pub fn plugin_updated(&self, plugin: &str) {
        self.pipeline_rate_callbacks.drop_for_plugin(plugin, false);
        self.pipeline_sample_callbacks.drop_for_plugin(plugin, false);
        self.plugin_rate_callbacks.drop_for_plugin(plugin, false);
        self.plugin_sample_callbacks.drop_for_plugin(plugin, false);

        let mut indicators = self.plugin_indicators.lock();
        if let Some(by_name) = indicators.get_mut(plugin) {
            for entries in by_name.values_mut() {
                entries.retain(|e| e.instance.is_all());
            }
            by_name.retain(|_, entries| !entries.is_empty());
        }
    }

    // ------------------------------------------------------------------
    // Plugin indicators
    // ------------------------------------------------------------------

    /// Register an indicator under `(plugin, instance, name)`.
    ///
    /// `InstanceScope::All` exposes an aggregate across all instances of the
    /// plugin. Fails with `AlreadyRegistered` if the exact key is taken.
    pub fn register_plugin_indicator(
        &self,
        plugin: &str,
        instance: InstanceScope,
        name: &str,
        description: &str,
        evaluator: IndicatorEvaluator,
    ) -> Result<()> {
        let mut indicators = self.plugin_indicators.lock();
        let entries = indicators
            .entry(plugin.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default();

        if entries.iter().any(|e| e.instance == instance) {
            return Err(Error::AlreadyRegistered(format!(
                "indicator {} of plugin {} (instance {})",
                name, plugin, instance
            )));
        }

        entries.push(IndicatorEntry {
            instance,
            description: description.to_string(),
            evaluator,
        });
        Ok(())
    }

    /// Unregister the indicator under the exact `(plugin, instance, name)`
    /// key. A no-op if absent.
    pub fn unregister_plugin_indicator(
        &self,
        plugin: &str,
        instance: &InstanceScope,
        name: &str,
    ) {
        let mut indicators = self.plugin_indicators.lock();
        if let Some(by_name) = indicators.get_mut(plugin) {
            if let Some(entries) = by_name.get_mut(name) {
                entries.retain(|e| &e.instance != instance);
                if entries.is_empty() {
                    by_name.remove(name);
                }
            }
            if by_name.is_empty() {
                indicators.remove(plugin);
            }
        }
    }

    pub fn plugin_indicator_names(&self, plugin: &str) -> Vec<String> {
        self.plugin_indicators
            .lock()
            .get(plugin)
            .map(|by_name| by_name.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Evaluate the indicator, preferring the all-instances registration.
    pub fn plugin_indicator_value(&self, plugin: &str, name: &str) -> Result<IndicatorValue> {
        let evaluator = {
            let indicators = self.plugin_indicators.lock();
            let entries = indicators
                .get(plugin)
                .and_then(|by_name| by_name.get(name))
                .ok_or_else(|| {
                    Error::NotFound(format!("indicator {} of plugin {}", name, plugin))
                })?;
            entries
                .iter()
                .find(|e| e.instance.is_all())
                .or_else(|| entries.first())
                .map(|e| e.evaluator.clone())
                .ok_or_else(|| {
                    Error::NotFound(format!("indicator {} of plugin {}", name, plugin))
                })?
        };

        // Evaluate outside the registry lock; evaluators may query back in.
        evaluator.as_ref()(plugin, name)
    }

    // ------------------------------------------------------------------
    // Built-in pipeline and task indicators
    // ------------------------------------------------------------------

    pub fn pipeline_indicator_names(&self) -> Vec<&'static str> {
        vec![
            "THROUGHPUT_RATE_LAST_1MIN_ALL",
            "THROUGHPUT_RATE_LAST_5MIN_ALL",
            "THROUGHPUT_RATE_LAST_15MIN_ALL",
            "EXECUTION_COUNT_ALL",
            "EXECUTION_TIME_MAX_ALL",
            "EXECUTION_TIME_MIN_ALL",
            "EXECUTION_TIME_50TH_PERCENT_ALL",
            "EXECUTION_TIME_90TH_PERCENT_ALL",
            "EXECUTION_TIME_99TH_PERCENT_ALL",
        ]
    }

    pub fn pipeline_indicator_value(&self, name: &str) -> Result<IndicatorValue> {
        match name {
            "THROUGHPUT_RATE_LAST_1MIN_ALL" => {
                Ok(IndicatorValue::Float(self.pipeline_throughput_rate1()))
            }
            "THROUGHPUT_RATE_LAST_5MIN_ALL" => {
                Ok(IndicatorValue::Float(self.pipeline_throughput_rate5()))
            }
            "THROUGHPUT_RATE_LAST_15MIN_ALL" => {
                Ok(IndicatorValue::Float(self.pipeline_throughput_rate15()))
            }
            "EXECUTION_COUNT_ALL" => {
                Ok(IndicatorValue::Int(self.pipeline_execution_count() as i64))
            }
            "EXECUTION_TIME_MAX_ALL" => {
                Ok(IndicatorValue::Int(self.pipeline_execution_time_max()?))
            }
            "EXECUTION_TIME_MIN_ALL" => {
                Ok(IndicatorValue::Int(self.pipeline_execution_time_min()?))
            }
            "EXECUTION_TIME_50TH_PERCENT_ALL" => Ok(IndicatorValue::Float(
                self.pipeline_execution_time_percentile(0.5)?,
            )),
            "EXECUTION_TIME_90TH_PERCENT_ALL" => Ok(IndicatorValue::Float(
                self.pipeline_execution_time_percentile(0.9)?,
            )),
            "EXECUTION_TIME_99TH_PERCENT_ALL" => Ok(IndicatorValue::Float(
                self.pipeline_execution_time_percentile(0.99)?,
            )),
            _ => Err(Error::NotFound(format!("pipeline indicator {}", name))),
        }
    }

    pub fn task_indicator_names(&self) -> Vec<&'static str> {
        vec![
            "EXECUTION_COUNT_ALL",
            "EXECUTION_COUNT_SUCCESS",
            "EXECUTION_COUNT_FAILURE",
        ]
    }

    pub fn task_indicator_value(&self, name: &str) -> Result<IndicatorValue> {
        let kind = match name {
            "EXECUTION_COUNT_ALL" => StatisticsKind::All,
            "EXECUTION_COUNT_SUCCESS" => StatisticsKind::Success,
            "EXECUTION_COUNT_FAILURE" => StatisticsKind::Failure,
            _ => return Err(Error::NotFound(format!("task indicator {}", name))),
        };
        Ok(IndicatorValue::Int(self.task_execution_count(kind) as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop_plugin_rate() -> PluginThroughputRateUpdated {
        Arc::new(|_, _, _| {})
    }

    #[test]
    fn test_all_is_success_plus_failure() {
        let stats = PipelineStatistics::new("p");
        for i in 0..10 {
            stats.record_plugin_execution("demo", 100, i % 3 != 0);
        }

        let success = stats
            .plugin_execution_count("demo", StatisticsKind::Success)
            .unwrap();
        let failure = stats
            .plugin_execution_count("demo", StatisticsKind::Failure)
            .unwrap();
        let all = stats
            .plugin_execution_count("demo", StatisticsKind::All)
            .unwrap();
        assert_eq!(success + failure, all);
        assert_eq!(all, 10);
    }

    #[test]
    fn test_unknown_plugin_is_not_found() {
        let stats = PipelineStatistics::new("p");
        assert!(matches!(
            stats.plugin_execution_count("ghost", StatisticsKind::All),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_callback_overwrite_false_keeps_incumbent() {
        let stats = PipelineStatistics::new("p");
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_a = hits.clone();
        let (prev, added) = stats.add_plugin_throughput_rate_updated_callback(
            "sub",
            CallbackBinding::Unbound,
            Arc::new(move |_, _, _| {
                hits_a.fetch_add(1, Ordering::Relaxed);
            }),
            false,
        );
        assert!(prev.is_none());
        assert!(added);

        let (prev, added) = stats.add_plugin_throughput_rate_updated_callback(
            "sub",
            CallbackBinding::Unbound,
            noop_plugin_rate(),
            false,
        );
        assert!(prev.is_some());
        assert!(!added);

        // The incumbent still fires.
        stats.record_plugin_execution("demo", 1, true);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_callback_overwrite_true_replaces() {
        let stats = PipelineStatistics::new("p");
        stats.add_plugin_throughput_rate_updated_callback(
            "sub",
            CallbackBinding::Unbound,
            noop_plugin_rate(),
            false,
        );
        let (prev, added) = stats.add_plugin_throughput_rate_updated_callback(
            "sub",
            CallbackBinding::Unbound,
            noop_plugin_rate(),
            true,
        );
        assert!(prev.is_some());
        assert!(added);
    }

    #[test]
    fn test_plugin_deleted_drops_callbacks_and_meters() {
        let stats = PipelineStatistics::new("p");
        stats.record_plugin_execution("demo", 1, true);

        stats.add_plugin_throughput_rate_updated_callback(
            "bound",
            CallbackBinding::Plugin("demo".to_string()),
            noop_plugin_rate(),
            false,
        );
        stats.add_plugin_throughput_rate_updated_callback(
            "instance-bound",
            CallbackBinding::PluginInstance("demo".to_string()),
            noop_plugin_rate(),
            false,
        );
        stats.add_plugin_throughput_rate_updated_callback(
            "free",
            CallbackBinding::Unbound,
            noop_plugin_rate(),
            false,
        );
        stats
            .register_plugin_indicator(
                "demo",
                InstanceScope::All,
                "qps",
                "",
                Arc::new(|_, _| Ok(IndicatorValue::Int(0))),
            )
            .unwrap();

        stats.plugin_deleted("demo");
        stats.plugin_deleted("demo"); // idempotent

        assert_eq!(stats.plugin_rate_callbacks.len(), 1);
        assert!(matches!(
            stats.plugin_execution_count("demo", StatisticsKind::All),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            stats.plugin_indicator_value("demo", "qps"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_plugin_updated_keeps_meters() {
        let stats = PipelineStatistics::new("p");
        stats.record_plugin_execution("demo", 1, true);

        stats.add_plugin_throughput_rate_updated_callback(
            "bound",
            CallbackBinding::Plugin("demo".to_string()),
            noop_plugin_rate(),
            false,
        );
        stats.add_plugin_throughput_rate_updated_callback(
            "instance-bound",
            CallbackBinding::PluginInstance("demo".to_string()),
            noop_plugin_rate(),
            false,
        );
        stats
            .register_plugin_indicator(
                "demo",
                InstanceScope::Specific("i-1".to_string()),
                "queue_len",
                "",
                Arc::new(|_, _| Ok(IndicatorValue::Int(0))),
            )
            .unwrap();
        stats
            .register_plugin_indicator(
                "demo",
                InstanceScope::All,
                "qps",
                "",
                Arc::new(|_, _| Ok(IndicatorValue::Int(0))),
            )
            .unwrap();

        stats.plugin_updated("demo");
        stats.plugin_updated("demo"); // idempotent

        // Aggregate meters and plugin-bound callbacks survive an update.
        assert_eq!(stats.plugin_rate_callbacks.len(), 1);
        assert_eq!(
            stats
                .plugin_execution_count("demo", StatisticsKind::All)
                .unwrap(),
            1
        );
        assert!(stats.plugin_indicator_value("demo", "qps").is_ok());
        assert!(matches!(
            stats.plugin_indicator_value("demo", "queue_len"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_indicator_double_registration_fails() {
        let stats = PipelineStatistics::new("p");
        let eval: IndicatorEvaluator = Arc::new(|_, _| Ok(IndicatorValue::Int(1)));

        stats
            .register_plugin_indicator("http", InstanceScope::All, "qps", "", eval.clone())
            .unwrap();
        assert!(matches!(
            stats.register_plugin_indicator("http", InstanceScope::All, "qps", "", eval.clone()),
            Err(Error::AlreadyRegistered(_))
        ));

        // A different instance id is a different key.
        stats
            .register_plugin_indicator(
                "http",
                InstanceScope::Specific("i-1".to_string()),
                "qps",
                "",
                eval.clone(),
            )
            .unwrap();

        // Unregistering frees the key for re-registration.
        stats.unregister_plugin_indicator("http", &InstanceScope::All, "qps");
        stats
            .register_plugin_indicator("http", InstanceScope::All, "qps", "", eval)
            .unwrap();
    }

    #[test]
    fn test_indicator_star_scope_aggregates() {
        let stats = PipelineStatistics::new("p");
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_eval = calls.clone();
        stats
            .register_plugin_indicator(
                "http",
                InstanceScope::All,
                "qps",
                "requests per second across instances",
                Arc::new(move |plugin, indicator| {
                    calls_eval.fetch_add(1, Ordering::Relaxed);
                    assert_eq!(plugin, "http");
                    assert_eq!(indicator, "qps");
                    Ok(IndicatorValue::Float(42.0))
                }),
            )
            .unwrap();

        let value = stats.plugin_indicator_value("http", "qps").unwrap();
        assert_eq!(value, IndicatorValue::Float(42.0));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(stats.plugin_indicator_names("http"), vec!["qps"]);
    }

    #[test]
    fn test_task_counters() {
        let stats = PipelineStatistics::new("p");
        stats.record_pipeline_execution(10, true);
        stats.record_pipeline_execution(20, true);
        stats.record_pipeline_execution(30, false);

        assert_eq!(stats.task_execution_count(StatisticsKind::Success), 2);
        assert_eq!(stats.task_execution_count(StatisticsKind::Failure), 1);
        assert_eq!(stats.task_execution_count(StatisticsKind::All), 3);
        assert_eq!(
            stats.task_indicator_value("EXECUTION_COUNT_SUCCESS").unwrap(),
            IndicatorValue::Int(2)
        );
    }

    #[test]
    fn test_pipeline_builtin_indicators() {
        let stats = PipelineStatistics::new("p");
        assert!(matches!(
            stats.pipeline_indicator_value("EXECUTION_TIME_MAX_ALL"),
            Err(Error::NoDataAvailable)
        ));

        stats.record_pipeline_execution(100, true);
        stats.record_pipeline_execution(200, true);

        assert_eq!(
            stats.pipeline_indicator_value("EXECUTION_COUNT_ALL").unwrap(),
            IndicatorValue::Int(2)
        );
        assert_eq!(
            stats.pipeline_indicator_value("EXECUTION_TIME_MAX_ALL").unwrap(),
            IndicatorValue::Int(200)
        );
        assert!(matches!(
            stats.pipeline_indicator_value("NOPE"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_clear_callbacks_drops_everything() {
        let stats = PipelineStatistics::new("p");
        stats.add_pipeline_throughput_rate_updated_callback(
            "a",
            CallbackBinding::Unbound,
            Arc::new(|_, _| {}),
            false,
        );
        stats.add_plugin_execution_sample_updated_callback(
            "b",
            CallbackBinding::Unbound,
            Arc::new(|_, _, _| {}),
            false,
        );

        stats.clear_callbacks();
        assert_eq!(stats.pipeline_rate_callbacks.len(), 0);
        assert_eq!(stats.plugin_sample_callbacks.len(), 0);
    }
}
