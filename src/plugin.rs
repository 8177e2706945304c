//! Plugin abstractions
//!
//! A plugin is the unit of per-task work inside a pipeline. The runtime
//! treats instances as opaque beyond `run` and the one-shot `prepare` hook;
//! concrete plugins live with the host. Instances are addressed by
//! `(plugin name, instance id)`, with the reserved id `"*"` meaning "all
//! instances of this plugin", modeled internally as [`InstanceScope`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::pipeline::PipelineContext;
use crate::task::Task;

/// Reserved instance id meaning "shared across all instances of a plugin".
///
/// Only appears at the serialized surface; internal APIs use
/// [`InstanceScope`].
pub const ALL_INSTANCES: &str = "*";

/// Outcome of a successful plugin run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Hand the task to the next plugin in the chain.
    Continue,
    /// End the task cleanly; remaining plugins do not run.
    Stop,
}

/// Instance addressing: one specific instance, or all instances of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstanceScope {
    All,
    Specific(String),
}

impl InstanceScope {
    /// Parse the serialized form, where `"*"` selects all instances.
    pub fn parse(id: &str) -> Self {
        if id == ALL_INSTANCES {
            InstanceScope::All
        } else {
            InstanceScope::Specific(id.to_string())
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, InstanceScope::All)
    }
}

impl fmt::Display for InstanceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceScope::All => f.write_str(ALL_INSTANCES),
            InstanceScope::Specific(id) => f.write_str(id),
        }
    }
}

/// A plugin instance.
///
/// `prepare` runs at most once per pipeline lifetime, serialized by the
/// context's preparation barrier. `run` is invoked once per task reaching
/// this plugin; an `Err` aborts the task and is recorded as a failure.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn instance_id(&self) -> &str;

    /// One-shot preparation hook. Failures are fatal to the pipeline run.
    async fn prepare(&self, _ctx: &PipelineContext) -> Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &PipelineContext, task: &mut Task) -> Result<Flow>;
}

/// Resolves plugin names to live instances.
///
/// This is the seam to the host's object scheduler: the pipeline re-resolves
/// on every task, so returning a new instance replaces a plugin without a
/// pipeline restart (an *update*, distinct from deletion).
pub trait PluginProvider: Send + Sync {
    fn instance(&self, plugin_name: &str) -> Option<Arc<dyn Plugin>>;
}

/// Fixed map-backed provider for hosts with a static plugin set.
#[derive(Default)]
pub struct StaticPlugins {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl StaticPlugins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance under its plugin name (builder style).
    pub fn with(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.insert(plugin.name().to_string(), plugin);
        self
    }
}

impl PluginProvider for StaticPlugins {
    fn instance(&self, plugin_name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(plugin_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_scope_round_trip() {
        assert_eq!(InstanceScope::parse("*"), InstanceScope::All);
        assert_eq!(
            InstanceScope::parse("i-1"),
            InstanceScope::Specific("i-1".to_string())
        );
        assert_eq!(InstanceScope::All.to_string(), "*");
        assert_eq!(
            InstanceScope::Specific("i-1".to_string()).to_string(),
            "i-1"
        );
    }

    #[test]
    fn test_instance_scope_is_all() {
        assert!(InstanceScope::parse("*").is_all());
        assert!(!InstanceScope::parse("x").is_all());
    }
}
