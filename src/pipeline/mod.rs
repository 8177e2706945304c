//! Pipeline runtime
//!
//! A pipeline owns an ordered chain of plugin instances, a fixed worker
//! count and exactly one [`PipelineContext`]. Workers pull tasks from the
//! host-supplied source and walk the chain in declared order; every plugin
//! invocation is timed and recorded by the statistics engine.
//!
//! ```text
//! TaskSource → worker₁..worker_N → [plugin]* → statistics
//!                    ↑ shared PipelineContext (buckets, prepare barrier)
//! ```

mod bucket;
mod context;
mod linear;

pub use bucket::{BucketValue, DataBucket};
pub use context::PipelineContext;
pub use linear::LinearPipeline;

use async_trait::async_trait;

use crate::error::Result;

/// Lifecycle of a pipeline.
///
/// `Created → Running` on start, `Running → Stopping` on stop request, and
/// `Closed` only after all workers have drained and the context is
/// released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Running,
    Stopping,
    Closed,
}

/// A named, parallel pipeline.
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &str;

    /// Run until stopped or a fatal preparation failure; returns the
    /// aggregated reason.
    async fn run(&self) -> Result<()>;

    /// Request shutdown. Idempotent, safe from any thread; observed by
    /// workers between tasks.
    fn stop(&self);

    /// Wait for all workers to exit and release the context. Only valid
    /// after `stop()` (or before the pipeline ever ran).
    async fn close(&self) -> Result<()>;
}

// Pipeline type register authority.

/// The one pipeline strategy currently implemented.
pub const LINEAR_PIPELINE: &str = "LinearPipeline";

const PIPELINE_TYPES: &[&str] = &[LINEAR_PIPELINE];

/// Whether `t` names a known pipeline type.
pub fn valid_type(t: &str) -> bool {
    PIPELINE_TYPES.contains(&t)
}

/// All known pipeline types.
pub fn all_types() -> Vec<&'static str> {
    PIPELINE_TYPES.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_registry() {
        assert!(valid_type("LinearPipeline"));
        assert!(!valid_type("DagPipeline"));
        assert_eq!(all_types(), vec!["LinearPipeline"]);
    }
}
