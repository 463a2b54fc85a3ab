use std::{collections::BTreeMap, fmt::Write as _, time::Duration};

use async_trait::async_trait;
use serde::{Serialize, Serializer, ser::SerializeMap};

use crate::{
    aggregate::{SeriesAggregate, Stat},
    aggregator::Snapshot,
    error::Result,
    executor::ExecutionStats,
    metric::{MetricKind, Tags, duration_ms},
    threshold::{Threshold, ThresholdResult},
};

/// Named statistics of one metric or series, in display order.
pub type Values = Vec<(String, f64)>;

/// The processed form of a finalized [`Snapshot`].
///
/// A summary is pure data: it can be printed, serialized or inspected by tests,
/// and carries no reference back to the aggregator that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub duration_ms: f64,
    pub scenarios: BTreeMap<String, ExecutionStats>,
    /// Every metric with all of its tag sets merged.
    pub metrics: BTreeMap<String, MetricSummary>,
    /// Each metric + tag set on its own.
    pub series: Vec<SeriesSummary>,
    pub thresholds: Vec<ThresholdResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub kind: MetricKind,
    #[serde(serialize_with = "ordered_map")]
    pub values: Values,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesSummary {
    pub metric: String,
    pub tags: Tags,
    pub kind: MetricKind,
    #[serde(serialize_with = "ordered_map")]
    pub values: Values,
}

fn ordered_map<S: Serializer>(values: &Values, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(values.len()))?;
    for (k, v) in values {
        map.serialize_entry(k, v)?;
    }
    map.end()
}

fn summarize(agg: &SeriesAggregate, trend_stats: &[Stat], elapsed_secs: f64) -> Values {
    let stat = |s: Stat| agg.stat(&s, elapsed_secs).unwrap_or(0.0);
    match agg {
        SeriesAggregate::Counter(_) => vec![
            ("count".into(), stat(Stat::Count)),
            ("rate".into(), stat(Stat::Rate)),
        ],
        SeriesAggregate::Gauge(_) => vec![
            ("value".into(), stat(Stat::Value)),
            ("min".into(), stat(Stat::Min)),
            ("max".into(), stat(Stat::Max)),
        ],
        SeriesAggregate::Rate(r) => vec![
            ("rate".into(), r.rate()),
            ("passes".into(), r.passes as f64),
            ("fails".into(), (r.total - r.passes) as f64),
        ],
        SeriesAggregate::Trend(_) => trend_stats
            .iter()
            .map(|s| (s.to_string(), stat(s.clone())))
            .collect(),
    }
}

impl RunSummary {
    pub fn build(
        snapshot: &Snapshot,
        trend_stats: &[Stat],
        thresholds: &[Threshold],
        scenarios: BTreeMap<String, ExecutionStats>,
        duration: Duration,
    ) -> Self {
        let elapsed = snapshot.elapsed().as_secs_f64();

        let metrics = snapshot
            .metric_names()
            .into_iter()
            .filter_map(|name| {
                let agg = snapshot.metric(name)?;
                Some((
                    name.to_string(),
                    MetricSummary {
                        kind: agg.kind(),
                        values: summarize(&agg, trend_stats, elapsed),
                    },
                ))
            })
            .collect();

        let series = snapshot
            .series()
            .map(|(key, agg)| SeriesSummary {
                metric: key.metric.to_string(),
                tags: key.tags.clone(),
                kind: agg.kind(),
                values: summarize(agg, trend_stats, elapsed),
            })
            .collect();

        let thresholds = thresholds.iter().map(|t| t.evaluate(snapshot)).collect();

        Self {
            duration_ms: duration_ms(duration),
            scenarios,
            metrics,
            series,
            thresholds,
        }
    }

    pub fn thresholds_passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    pub fn metric(&self, name: &str) -> Option<&MetricSummary> {
        self.metrics.get(name)
    }

    /// Value of `stat` (as displayed, e.g. `"p(95)"`) for a metric.
    pub fn value(&self, metric: &str, stat: &str) -> Option<f64> {
        self.metric(metric)?
            .values
            .iter()
            .find(|(k, _)| k == stat)
            .map(|(_, v)| *v)
    }

    /// k6-style plain text rendering.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let duration = Duration::from_secs_f64(self.duration_ms / 1_000.0);
        let _ = writeln!(
            out,
            "\n  scenarios: {} scenario(s), ran for {}\n",
            self.scenarios.len(),
            humantime::format_duration(Duration::from_millis(duration.as_millis() as u64))
        );
        for (name, s) in &self.scenarios {
            let _ = writeln!(
                out,
                "     * {name}: {} complete, {} failed, {} interrupted, {} dropped iterations, {} max VUs",
                s.completed, s.failed, s.interrupted, s.dropped, s.peak_vus
            );
        }
        out.push('\n');

        if !self.thresholds.is_empty() {
            for t in &self.thresholds {
                let mark = if t.passed { '✓' } else { '✗' };
                let actual = t
                    .actual
                    .map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}"));
                let _ = writeln!(out, "   {mark} {} {} (actual {actual})", t.metric, t.expression);
            }
            out.push('\n');
        }

        for (name, metric) in &self.metrics {
            let dots = ".".repeat(32usize.saturating_sub(name.len()).max(3));
            let _ = writeln!(out, "     {name}{dots}: {}", render_values(metric));
        }
        out
    }
}

fn render_values(metric: &MetricSummary) -> String {
    let get = |k: &str| {
        metric
            .values
            .iter()
            .find(|(name, _)| name == k)
            .map_or(0.0, |(_, v)| *v)
    };
    match metric.kind {
        MetricKind::Counter => format!("{:<10} {:.2}/s", trim_float(get("count")), get("rate")),
        MetricKind::Gauge => format!(
            "{:<10} min={} max={}",
            trim_float(get("value")),
            trim_float(get("min")),
            trim_float(get("max"))
        ),
        MetricKind::Rate => {
            let passes = get("passes");
            let fails = get("fails");
            format!(
                "{:.2}% {} out of {}",
                get("rate") * 100.0,
                trim_float(passes),
                trim_float(passes + fails)
            )
        }
        MetricKind::Trend => metric
            .values
            .iter()
            .map(|(k, v)| format!("{k}={}", format_ms(*v)))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn trim_float(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{v:.0}")
    } else {
        format!("{v:.2}")
    }
}

/// Trend values are milliseconds.
fn format_ms(ms: f64) -> String {
    if ms >= 1_000.0 {
        format!("{:.2}s", ms / 1_000.0)
    } else if ms >= 1.0 {
        format!("{ms:.2}ms")
    } else {
        format!("{:.2}µs", ms * 1_000.0)
    }
}

/// A [`Reporter`] consumes a [`RunSummary`] and performs side effects: printing it,
/// writing it to a file, sending it somewhere.
///
/// # Example
/// ```rust
/// use async_trait::async_trait;
/// use volley::{Reporter, RunSummary};
///
/// struct CountReporter;
///
/// #[async_trait]
/// impl Reporter for CountReporter {
///     async fn report(&self, summary: &RunSummary) -> volley::Result<()> {
///         println!("{} metrics", summary.metrics.len());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, summary: &RunSummary) -> Result<()>;
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::path::PathBuf;

    use async_trait::async_trait;

    use super::{Reporter, RunSummary};
    use crate::error::{Error, Result};

    /// Prints the text summary to stdout.
    pub struct StdoutReporter;

    #[async_trait]
    impl Reporter for StdoutReporter {
        async fn report(&self, summary: &RunSummary) -> Result<()> {
            println!("{}", summary.to_text());
            Ok(())
        }
    }

    /// Pretty JSON, to a file or to stdout when no path is set.
    pub struct JsonReporter {
        pub path: Option<PathBuf>,
    }

    #[async_trait]
    impl Reporter for JsonReporter {
        async fn report(&self, summary: &RunSummary) -> Result<()> {
            let json = serde_json::to_string_pretty(summary)?;
            match &self.path {
                Some(path) => {
                    tokio::fs::write(path, json)
                        .await
                        .map_err(|source| Error::Io {
                            path: path.display().to_string(),
                            source,
                        })?;
                    tracing::info!(path = %path.display(), "Summary exported");
                }
                None => println!("{json}"),
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        aggregator::{MetricsAggregator, Recorder},
        config::default_trend_stats,
        metric::names,
    };

    fn summary() -> RunSummary {
        let agg = Arc::new(MetricsAggregator::with_shards(2));
        let rec = Recorder::new(Arc::clone(&agg)).with_tags([("scenario", "default")]);
        for ms in [5.0, 10.0, 15.0, 20.0] {
            rec.count(names::HTTP_REQS, 1.0);
            rec.trend(names::HTTP_REQ_DURATION, ms);
            rec.rate(names::HTTP_REQ_FAILED, ms > 15.0);
        }
        rec.gauge(names::VUS, 4.0);
        let snap = agg
            .finalize()
            .unwrap()
            .with_elapsed(Duration::from_secs(2));
        let thresholds = vec![
            Threshold::parse("http_req_duration", "p(95) < 100").unwrap(),
            Threshold::parse("http_req_failed", "rate < 0.1").unwrap(),
        ];
        let mut scenarios = BTreeMap::new();
        scenarios.insert("default".to_string(), ExecutionStats::default());
        RunSummary::build(
            &snap,
            &default_trend_stats(),
            &thresholds,
            scenarios,
            Duration::from_secs(2),
        )
    }

    #[test]
    fn values_by_kind() {
        let s = summary();
        assert_eq!(s.value(names::HTTP_REQS, "count"), Some(4.0));
        assert_eq!(s.value(names::HTTP_REQS, "rate"), Some(2.0));
        assert_eq!(s.value(names::HTTP_REQ_FAILED, "rate"), Some(0.25));
        assert_eq!(s.value(names::VUS, "value"), Some(4.0));
        assert_eq!(s.value(names::HTTP_REQ_DURATION, "avg"), Some(12.5));

        let trend: Vec<&str> = s.metrics[names::HTTP_REQ_DURATION]
            .values
            .iter()
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(trend, ["avg", "min", "med", "max", "p(90)", "p(95)"]);
    }

    #[test]
    fn thresholds_are_evaluated() {
        let s = summary();
        assert_eq!(s.thresholds.len(), 2);
        assert!(s.thresholds[0].passed);
        assert!(!s.thresholds[1].passed);
        assert!(!s.thresholds_passed());
    }

    #[test]
    fn json_keeps_trend_stat_order() {
        let json = serde_json::to_string(&summary()).unwrap();
        let avg = json.find("\"avg\"").unwrap();
        let p95 = json.find("\"p(95)\"").unwrap();
        assert!(avg < p95);
        assert!(json.contains("\"series\""));
    }

    #[test]
    fn text_rendering() {
        let text = summary().to_text();
        assert!(text.contains("http_req_duration"));
        assert!(text.contains("p(95)="));
        assert!(text.contains("25.00% 1 out of 4"));
        assert!(text.contains("✗ http_req_failed rate < 0.1"));
    }

    #[test]
    fn time_formatting() {
        assert_eq!(format_ms(1_500.0), "1.50s");
        assert_eq!(format_ms(12.5), "12.50ms");
        assert_eq!(format_ms(0.5), "500.00µs");
    }
}
