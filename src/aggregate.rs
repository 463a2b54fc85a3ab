use std::{fmt, str::FromStr, time::Instant};

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, metric::MetricKind};

/// The `Aggregate` trait defines how raw sample values are collected and combined
/// into an intermediate, mergeable representation that preserves the information
/// necessary for later analysis.
///
/// Aggregates do not compute final statistics on their own; the [`Stat`] lookups
/// are evaluated once, after the run, from the merged aggregate.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**: shard-local aggregates are
///   merged in arbitrary order at finalization.
/// - `consume` sits on the hot path of every virtual user, keep it allocation free.
pub trait Aggregate
where
    Self: Send + Sync + fmt::Debug + Clone,
{
    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple values into the current instance.
    ///
    /// This default implementation calls [`Aggregate::consume`] for each value.
    fn aggregate(&mut self, values: &[f64]) {
        values.iter().for_each(|v| self.consume(*v));
    }

    /// Incorporate a single value.
    fn consume(&mut self, value: f64);

    /// Combine two different aggregates into one.
    fn merge(&mut self, other: Self);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterAggregate {
    pub sum: f64,
    pub count: u64,
}

impl Aggregate for CounterAggregate {
    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn merge(&mut self, other: Self) {
        self.sum += other.sum;
        self.count += other.count;
    }
}

/// Last written value plus the observed extremes.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeAggregate {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    updated: Option<Instant>,
}

impl Aggregate for GaugeAggregate {
    fn new() -> Self {
        Self {
            value: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            updated: None,
        }
    }

    fn consume(&mut self, value: f64) {
        self.value = value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.updated = Some(Instant::now());
    }

    fn merge(&mut self, other: Self) {
        // the most recent write wins, whichever shard it landed in
        if other.updated > self.updated {
            self.value = other.value;
            self.updated = other.updated;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

/// Fraction of non-zero samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateAggregate {
    pub passes: u64,
    pub total: u64,
}

impl RateAggregate {
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passes as f64 / self.total as f64
        }
    }
}

impl Aggregate for RateAggregate {
    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, value: f64) {
        if value != 0.0 {
            self.passes += 1;
        }
        self.total += 1;
    }

    fn merge(&mut self, other: Self) {
        self.passes += other.passes;
        self.total += other.total;
    }
}

/// Values are kept in the histogram as thousandths of the recorded unit, so a
/// millisecond trend resolves to the microsecond.
const HISTOGRAM_SCALE: f64 = 1_000.0;
const HISTOGRAM_SIGFIG: u8 = 3;

/// Streaming distribution: exact count/min/max/mean and an HDR histogram for
/// percentile estimates.
#[derive(Debug, Clone)]
pub struct TrendAggregate {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub sum: f64,
    histogram: Histogram<u64>,
}

impl TrendAggregate {
    pub fn avg(&self) -> f64 {
        self.mean
    }

    /// Estimated value at percentile `p` (0..=100).
    ///
    /// The estimate is clamped into `[min, max]`: histogram buckets report the upper
    /// edge of their range, which may lie past the largest recorded value.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let q = (p / 100.0).clamp(0.0, 1.0);
        let raw = self.histogram.value_at_quantile(q) as f64 / HISTOGRAM_SCALE;
        raw.clamp(self.min, self.max)
    }

    pub fn med(&self) -> f64 {
        self.percentile(50.0)
    }
}

impl PartialEq for TrendAggregate {
    fn eq(&self, other: &Self) -> bool {
        self.count == other.count
            && self.min == other.min
            && self.max == other.max
            && self.sum == other.sum
            && self.histogram == other.histogram
    }
}

impl Aggregate for TrendAggregate {
    fn new() -> Self {
        Self {
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            sum: 0.0,
            histogram: Histogram::new(HISTOGRAM_SIGFIG)
                .expect("3 significant figures is a valid histogram precision"),
        }
    }

    fn consume(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.mean += (value - self.mean) / self.count as f64;
        let scaled = (value.max(0.0) * HISTOGRAM_SCALE).round() as u64;
        self.histogram.saturating_record(scaled);
    }

    fn merge(&mut self, other: Self) {
        if other.count == 0 {
            return;
        }
        let total = self.count + other.count;
        self.mean = (self.mean * self.count as f64 + other.mean * other.count as f64) / total as f64;
        self.count = total;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        if let Err(e) = self.histogram.add(&other.histogram) {
            tracing::warn!("Dropping histogram shard while merging trend: {e}");
        }
    }
}

/// Aggregate for one series, picked by the metric's kind.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesAggregate {
    Counter(CounterAggregate),
    Gauge(GaugeAggregate),
    Rate(RateAggregate),
    Trend(TrendAggregate),
}

impl SeriesAggregate {
    pub fn for_kind(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(CounterAggregate::new()),
            MetricKind::Gauge => Self::Gauge(GaugeAggregate::new()),
            MetricKind::Rate => Self::Rate(RateAggregate::new()),
            MetricKind::Trend => Self::Trend(TrendAggregate::new()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Rate(_) => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }

    pub fn consume(&mut self, value: f64) {
        match self {
            Self::Counter(a) => a.consume(value),
            Self::Gauge(a) => a.consume(value),
            Self::Rate(a) => a.consume(value),
            Self::Trend(a) => a.consume(value),
        }
    }

    /// Merge another series of the same kind. Mismatched kinds are ignored and
    /// reported, since one metric name should never be recorded under two kinds.
    pub fn merge(&mut self, other: Self) {
        match (self, other) {
            (Self::Counter(a), Self::Counter(b)) => a.merge(b),
            (Self::Gauge(a), Self::Gauge(b)) => a.merge(b),
            (Self::Rate(a), Self::Rate(b)) => a.merge(b),
            (Self::Trend(a), Self::Trend(b)) => a.merge(b),
            (a, b) => tracing::warn!(
                "Metric recorded as both {} and {}, ignoring the latter",
                a.kind(),
                b.kind()
            ),
        }
    }

    /// Evaluate `stat` against this series. `elapsed_secs` turns counters into
    /// per-second rates. Returns `None` when the stat does not apply to the kind.
    pub fn stat(&self, stat: &Stat, elapsed_secs: f64) -> Option<f64> {
        match (self, stat) {
            (Self::Counter(a), Stat::Count) => Some(a.sum),
            (Self::Counter(a), Stat::Rate) => Some(if elapsed_secs > 0.0 {
                a.sum / elapsed_secs
            } else {
                0.0
            }),
            (Self::Gauge(a), Stat::Value) => Some(a.value),
            (Self::Gauge(a), Stat::Min) => Some(a.min),
            (Self::Gauge(a), Stat::Max) => Some(a.max),
            (Self::Rate(a), Stat::Rate) => Some(a.rate()),
            (Self::Rate(a), Stat::Count) => Some(a.total as f64),
            (Self::Trend(a), Stat::Avg) => Some(a.avg()),
            (Self::Trend(a), Stat::Min) => Some(if a.count == 0 { 0.0 } else { a.min }),
            (Self::Trend(a), Stat::Max) => Some(if a.count == 0 { 0.0 } else { a.max }),
            (Self::Trend(a), Stat::Med) => Some(a.med()),
            (Self::Trend(a), Stat::Percentile(p)) => Some(a.percentile(*p)),
            (Self::Trend(a), Stat::Count) => Some(a.count as f64),
            _ => None,
        }
    }
}

/// A statistic that can be read from a finalized series: `avg`, `min`, `med`,
/// `max`, `count`, `rate`, `value` or `p(N)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Stat {
    Avg,
    Min,
    Med,
    Max,
    Count,
    Rate,
    Value,
    Percentile(f64),
}

impl FromStr for Stat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let stat = match s {
            "avg" => Stat::Avg,
            "min" => Stat::Min,
            "med" => Stat::Med,
            "max" => Stat::Max,
            "count" => Stat::Count,
            "rate" => Stat::Rate,
            "value" => Stat::Value,
            _ => {
                let p = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .and_then(|n| n.trim().parse::<f64>().ok())
                    .filter(|p| (0.0..=100.0).contains(p))
                    .ok_or_else(|| ConfigError::UnknownTrendStat(s.to_string()))?;
                Stat::Percentile(p)
            }
        };
        Ok(stat)
    }
}

impl TryFrom<String> for Stat {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Stat> for String {
    fn from(value: Stat) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stat::Avg => f.write_str("avg"),
            Stat::Min => f.write_str("min"),
            Stat::Med => f.write_str("med"),
            Stat::Max => f.write_str("max"),
            Stat::Count => f.write_str("count"),
            Stat::Rate => f.write_str("rate"),
            Stat::Value => f.write_str("value"),
            Stat::Percentile(p) => write!(f, "p({p})"),
        }
    }
}
