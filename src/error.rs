//! Crate error type
//!
//! Construction and explicit caller operations surface errors; background
//! loop failures are logged and retried instead (see the sink module).

use thiserror::Error;

/// Errors returned by streams, sinks and replicated maps.
#[derive(Debug, Error)]
pub enum Error {
    /// A Redis command failed.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    /// Sink construction failed. The source is the step that failed.
    #[error("failed to create sink {name}: {source}")]
    Construct {
        name: String,
        #[source]
        source: Box<Error>,
    },

    /// Both an exact topic and a topic pattern were configured.
    #[error("topic and topic pattern filters are mutually exclusive")]
    ConflictingTopicFilters,

    /// The configured topic pattern is not a valid regular expression.
    #[error("invalid topic pattern: {0}")]
    InvalidTopicPattern(#[from] regex::Error),

    /// The operation requires a running sink.
    #[error("sink is stopped")]
    SinkStopped,
}

pub type Result<T> = std::result::Result<T, Error>;
