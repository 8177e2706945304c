//! Error types for Flowgate

use thiserror::Error;

/// Main error type for Flowgate
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("plugin {plugin} failed: {reason}")]
    PluginRun { plugin: String, reason: String },

    #[error("plugin {plugin} preparation failed: {reason}")]
    Preparation { plugin: String, reason: String },

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("{0} already registered")]
    AlreadyRegistered(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("no data available")]
    NoDataAvailable,

    #[error("upstream fetch failed: {0}")]
    TransientUpstream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap an arbitrary plugin failure.
    pub fn plugin_run(plugin: impl Into<String>, reason: impl ToString) -> Self {
        Error::PluginRun {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    /// Wrap a preparation-hook failure. These are fatal to the pipeline run.
    pub fn preparation(plugin: impl Into<String>, reason: impl ToString) -> Self {
        Error::Preparation {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for Flowgate
pub type Result<T> = std::result::Result<T, Error>;
