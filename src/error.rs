//! Error taxonomy.
//!
//! Only [`ConfigError`] is fatal: it is raised while options are loaded and
//! validated, before any virtual user exists. Everything that can go wrong once
//! the run is under way is an [`IterationError`], which is recorded as a metric
//! and never stops the scenario.

use std::time::Duration;

use thiserror::Error;

/// Invalid options or scenario parameters, detected at startup.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("scenario name cannot be empty")]
    EmptyScenarioName,

    #[error("invalid scenario name {0:?}: only ASCII letters, digits, '_' and '-' are allowed")]
    InvalidScenarioName(String),

    #[error("scenario {0:?}: vus must be at least 1")]
    ZeroVus(String),

    #[error("scenario {0:?}: duration must be greater than 0")]
    ZeroDuration(String),

    #[error("scenario {0:?}: rate must be at least 1")]
    ZeroRate(String),

    #[error("scenario {0:?}: timeUnit must be greater than 0")]
    ZeroTimeUnit(String),

    #[error("scenario {0:?}: one of preAllocatedVUs or maxVUs is required")]
    MissingVuPool(String),

    #[error("scenario {name:?}: preAllocatedVUs ({pre_allocated}) cannot exceed maxVUs ({max})")]
    PreAllocatedAboveMax {
        name: String,
        pre_allocated: u64,
        max: u64,
    },

    #[error("scenario {0:?}: maxVUs must be at least 1")]
    ZeroMaxVus(String),

    #[error("scenario {0:?}: stages cannot be empty")]
    EmptyStages(String),

    #[error("scenario {0:?}: total stage duration must be greater than 0")]
    ZeroStageDuration(String),

    #[error("no scenarios defined: set `scenarios`, `vus` + `duration`, or `stages`")]
    NoScenarios,

    #[error("scenario {0:?} is defined more than once")]
    DuplicateScenario(String),

    #[error("`{0}` cannot be combined with `scenarios`")]
    ShorthandWithScenarios(&'static str),

    #[error("`vus` requires `duration` (or `stages`)")]
    VusWithoutDuration,

    #[error("unknown summary trend stat {0:?}")]
    UnknownTrendStat(String),

    #[error("invalid threshold {expression:?} on {metric:?}: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("invalid metric selector {0:?}")]
    InvalidMetricSelector(String),

    #[error("no workload defined: add a `workload` section")]
    MissingWorkload,

    #[error("invalid workload: {0}")]
    InvalidWorkload(String),
}

/// Why a single iteration (or one request inside it) failed.
///
/// These are captured as metrics; the virtual user that hit them keeps running.
#[derive(Debug, Error)]
pub enum IterationError {
    /// The driver could not reach the target.
    #[error("connection error: {0}")]
    Connection(String),

    /// A per-call timeout elapsed.
    #[error("request timed out after {after:?}")]
    Timeout { after: Duration },

    /// The target answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The scenario was stopped while the iteration was in flight.
    #[error("iteration interrupted")]
    Cancelled,

    /// The driver was used incorrectly, e.g. invoking before connecting.
    #[error("usage error: {0}")]
    Usage(String),

    /// Anything raised by user workload code.
    #[error("{0}")]
    Workload(String),
}

impl IterationError {
    /// Short, stable label used as the `error` tag on failure metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            IterationError::Connection(_) => "connection",
            IterationError::Timeout { .. } => "timeout",
            IterationError::Protocol(_) => "protocol",
            IterationError::Cancelled => "cancelled",
            IterationError::Usage(_) => "usage",
            IterationError::Workload(_) => "workload",
        }
    }
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("metrics aggregator was already finalized")]
    AlreadyFinalized,

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse options: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("failed to build {protocol} client: {reason}")]
    Client {
        protocol: &'static str,
        reason: String,
    },

    #[error("scenario task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_error_kinds_are_distinct() {
        let kinds = [
            IterationError::Connection("refused".into()).kind(),
            IterationError::Timeout {
                after: Duration::from_secs(1),
            }
            .kind(),
            IterationError::Protocol("bad".into()).kind(),
            IterationError::Cancelled.kind(),
            IterationError::Usage("x".into()).kind(),
            IterationError::Workload("y".into()).kind(),
        ];
        let mut sorted = kinds.to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), kinds.len());
    }

    #[test]
    fn config_error_messages_name_the_scenario() {
        let err = ConfigError::PreAllocatedAboveMax {
            name: "orders".into(),
            pre_allocated: 10,
            max: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(msg.contains("10"));
    }
}
