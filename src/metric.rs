use std::{collections::BTreeMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::IterationError;

/// Tag set attached to a sample. Ordered so that equal sets hash and print the same.
pub type Tags = BTreeMap<String, String>;

/// How samples of a metric are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic sum (`http_reqs`, `iterations`).
    Counter,
    /// Last/min/max observed value (`vus`).
    Gauge,
    /// Ratio of non-zero samples (`http_req_failed`, `checks`).
    Rate,
    /// Distribution of values, with percentiles (`http_req_duration`).
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        };
        f.write_str(s)
    }
}

/// The smallest unit produced by the engine: one value for one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub metric: &'static str,
    pub kind: MetricKind,
    pub value: f64,
    pub tags: Tags,
}

/// Identity of a time series: metric name plus the exact tag set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub metric: &'static str,
    pub tags: Tags,
}

/// Names of the metrics emitted by the engine and its drivers.
pub mod names {
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATION_ERRORS: &str = "iteration_errors";
    pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
    pub const INTERRUPTED_ITERATIONS: &str = "interrupted_iterations";
    pub const VUS: &str = "vus";
    pub const VUS_MAX: &str = "vus_max";
    pub const CHECKS: &str = "checks";

    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";

    pub const GRPC_REQS: &str = "grpc_reqs";
    pub const GRPC_REQ_DURATION: &str = "grpc_req_duration";
    pub const GRPC_REQ_FAILED: &str = "grpc_req_failed";

    pub const WS_SESSIONS: &str = "ws_sessions";
    pub const WS_CONNECTING: &str = "ws_connecting";
    pub const WS_SESSION_DURATION: &str = "ws_session_duration";
    pub const WS_MSGS_SENT: &str = "ws_msgs_sent";
    pub const WS_MSGS_RECEIVED: &str = "ws_msgs_received";
    pub const WS_SESSION_FAILED: &str = "ws_session_failed";
    pub const WS_ERRORS: &str = "ws_errors";
}

/// Protocol a [`RequestOutcome`] was produced by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Grpc,
    Ws,
}

impl Protocol {
    fn metric_names(self) -> (&'static str, &'static str, &'static str) {
        use names::*;
        match self {
            Protocol::Http => (HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED),
            Protocol::Grpc => (GRPC_REQS, GRPC_REQ_DURATION, GRPC_REQ_FAILED),
            Protocol::Ws => (WS_SESSIONS, WS_CONNECTING, WS_SESSION_FAILED),
        }
    }
}

/// Result of one request issued by a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub protocol: Protocol,
    /// Protocol status: HTTP status code, gRPC code, or 101 for an upgraded socket.
    /// `None` when no response was received at all.
    pub status: Option<u16>,
    pub latency: Duration,
    /// [`IterationError::kind`] of the failure, if any.
    pub error: Option<&'static str>,
    pub success: bool,
    pub tags: Tags,
}

impl RequestOutcome {
    pub fn succeeded(protocol: Protocol, status: u16, latency: Duration, success: bool) -> Self {
        Self {
            protocol,
            status: Some(status),
            latency,
            error: None,
            success,
            tags: Tags::new(),
        }
    }

    pub fn failed(protocol: Protocol, latency: Duration, error: &IterationError) -> Self {
        Self {
            protocol,
            status: None,
            latency,
            error: Some(error.kind()),
            success: false,
            tags: Tags::new(),
        }
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Expand the outcome into the three samples every protocol records:
    /// a request counter, a latency trend and a failure rate.
    pub fn into_samples(self) -> [Sample; 3] {
        let (count, duration, failed) = self.protocol.metric_names();
        let mut tags = self.tags;
        if let Some(status) = self.status {
            tags.insert("status".into(), status.to_string());
        }
        if let Some(error) = self.error {
            tags.insert("error".into(), error.to_string());
        }
        [
            Sample {
                metric: count,
                kind: MetricKind::Counter,
                value: 1.0,
                tags: tags.clone(),
            },
            Sample {
                metric: duration,
                kind: MetricKind::Trend,
                value: duration_ms(self.latency),
                tags: tags.clone(),
            },
            Sample {
                metric: failed,
                kind: MetricKind::Rate,
                value: if self.success { 0.0 } else { 1.0 },
                tags,
            },
        ]
    }
}

/// Milliseconds as a float, the unit every time trend is stored in.
pub fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}
