//! The process-wide metrics sink shared by every virtual user.
//!
//! Writes land in one of several shards, each a mutex-guarded map from series key
//! to [`SeriesAggregate`]. A writer always uses the shard assigned to its thread, so
//! workers running on different threads never contend on the same lock. Shards are
//! only merged once, by [`MetricsAggregator::finalize`].

use std::{
    cell::Cell,
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    aggregate::{SeriesAggregate, Stat},
    error::{ConfigError, Error, Result},
    metric::{MetricKind, RequestOutcome, Sample, SeriesKey, Tags, duration_ms, names},
};

type Shard = HashMap<SeriesKey, SeriesAggregate>;

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_HINT: Cell<Option<usize>> = const { Cell::new(None) };
}

fn shard_hint() -> usize {
    SHARD_HINT.with(|hint| match hint.get() {
        Some(h) => h,
        None => {
            let h = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
            hint.set(Some(h));
            h
        }
    })
}

pub struct MetricsAggregator {
    shards: Box<[Mutex<Shard>]>,
    sealed: AtomicBool,
    rejected: AtomicU64,
    started: Instant,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("shards", &self.shards.len())
            .field("sealed", &self.sealed.load(Ordering::Relaxed))
            .finish()
    }
}

impl MetricsAggregator {
    /// Four shards per CPU keeps collisions rare even with many worker threads.
    pub fn new() -> Self {
        Self::with_shards(num_cpus::get() * 4)
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(Shard::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            sealed: AtomicBool::new(false),
            rejected: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Record one sample. Returns `false` if the aggregator is already finalized.
    pub fn push(&self, sample: Sample) -> bool {
        let idx = shard_hint() % self.shards.len();
        let mut shard = self.shards[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // checked under the shard lock so nothing slips in after the shard was drained
        if self.sealed.load(Ordering::Acquire) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let key = SeriesKey {
            metric: sample.metric,
            tags: sample.tags,
        };
        shard
            .entry(key)
            .or_insert_with(|| SeriesAggregate::for_kind(sample.kind))
            .consume(sample.value);
        true
    }

    pub fn is_finalized(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Number of writes refused because they arrived after finalization.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Seal the aggregator and merge every shard into a [`Snapshot`].
    ///
    /// Can only happen once; later calls fail with [`Error::AlreadyFinalized`].
    pub fn finalize(&self) -> Result<Snapshot> {
        if self.sealed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyFinalized);
        }
        let elapsed = self.started.elapsed();

        let mut series: BTreeMap<SeriesKey, SeriesAggregate> = BTreeMap::new();
        for shard in self.shards.iter() {
            let drained = std::mem::take(&mut *shard.lock().unwrap_or_else(PoisonError::into_inner));
            for (key, agg) in drained {
                match series.get_mut(&key) {
                    Some(existing) => existing.merge(agg),
                    None => {
                        series.insert(key, agg);
                    }
                }
            }
        }
        tracing::debug!(series = series.len(), ?elapsed, "Metrics finalized");
        Ok(Snapshot { series, elapsed })
    }
}

/// Cheap, clonable handle used by executors and drivers to record samples.
/// Every sample carries the recorder's base tags (scenario name, user tags).
#[derive(Clone, Debug)]
pub struct Recorder {
    aggregator: Arc<MetricsAggregator>,
    tags: Arc<Tags>,
}

impl Recorder {
    pub fn new(aggregator: Arc<MetricsAggregator>) -> Self {
        Self {
            aggregator,
            tags: Arc::new(Tags::new()),
        }
    }

    /// A recorder whose samples also carry `extra` tags.
    pub fn with_tags<K, V>(&self, extra: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut tags = (*self.tags).clone();
        tags.extend(extra.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self {
            aggregator: Arc::clone(&self.aggregator),
            tags: Arc::new(tags),
        }
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn aggregator(&self) -> &Arc<MetricsAggregator> {
        &self.aggregator
    }

    pub fn count(&self, metric: &'static str, value: f64) {
        self.push(metric, MetricKind::Counter, value, None);
    }

    pub fn gauge(&self, metric: &'static str, value: f64) {
        self.push(metric, MetricKind::Gauge, value, None);
    }

    pub fn rate(&self, metric: &'static str, hit: bool) {
        self.push(metric, MetricKind::Rate, if hit { 1.0 } else { 0.0 }, None);
    }

    pub fn trend(&self, metric: &'static str, value: f64) {
        self.push(metric, MetricKind::Trend, value, None);
    }

    pub fn trend_duration(&self, metric: &'static str, value: Duration) {
        self.trend(metric, duration_ms(value));
    }

    /// Record a counter sample with tags beyond the base set.
    pub fn count_tagged(&self, metric: &'static str, value: f64, tags: Tags) {
        self.push(metric, MetricKind::Counter, value, Some(tags));
    }

    pub fn outcome(&self, outcome: RequestOutcome) {
        for mut sample in outcome.into_samples() {
            for (k, v) in self.tags.iter() {
                sample.tags.entry(k.clone()).or_insert_with(|| v.clone());
            }
            self.aggregator.push(sample);
        }
    }

    /// Record a named pass/fail check into the `checks` rate, tagged `check=<name>`.
    /// Returns `passed` so it can be used inline.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        let mut tags = Tags::new();
        tags.insert("check".into(), name.to_string());
        self.push(names::CHECKS, MetricKind::Rate, if passed { 1.0 } else { 0.0 }, Some(tags));
        passed
    }

    fn push(&self, metric: &'static str, kind: MetricKind, value: f64, extra: Option<Tags>) {
        let tags = match extra {
            Some(mut extra) => {
                for (k, v) in self.tags.iter() {
                    extra.entry(k.clone()).or_insert_with(|| v.clone());
                }
                extra
            }
            None => (*self.tags).clone(),
        };
        self.aggregator.push(Sample {
            metric,
            kind,
            value,
            tags,
        });
    }
}

/// A metric name with an optional tag filter, `http_req_duration{status:200}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricSelector {
    pub metric: String,
    pub tags: Tags,
}

impl MetricSelector {
    pub fn metric(name: impl Into<String>) -> Self {
        Self {
            metric: name.into(),
            tags: Tags::new(),
        }
    }

    fn matches(&self, key: &SeriesKey) -> bool {
        key.metric == self.metric
            && self
                .tags
                .iter()
                .all(|(k, v)| key.tags.get(k).is_some_and(|tv| tv == v))
    }
}

impl FromStr for MetricSelector {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidMetricSelector(s.to_string());
        let s = s.trim();
        let Some(open) = s.find('{') else {
            if s.is_empty() || s.contains('}') {
                return Err(invalid());
            }
            return Ok(Self::metric(s));
        };
        let name = s[..open].trim();
        let filter = s[open + 1..].strip_suffix('}').ok_or_else(invalid)?;
        if name.is_empty() {
            return Err(invalid());
        }
        let mut tags = Tags::new();
        for pair in filter.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once(':').ok_or_else(invalid)?;
            let (k, v) = (k.trim(), v.trim());
            if k.is_empty() {
                return Err(invalid());
            }
            tags.insert(k.to_string(), v.to_string());
        }
        Ok(Self {
            metric: name.to_string(),
            tags,
        })
    }
}

impl fmt::Display for MetricSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metric)?;
        if !self.tags.is_empty() {
            let pairs: Vec<String> = self.tags.iter().map(|(k, v)| format!("{k}:{v}")).collect();
            write!(f, "{{{}}}", pairs.join(","))?;
        }
        Ok(())
    }
}

/// Merged, read-only view of every series, produced once at the end of the run.
#[derive(Debug, Clone)]
pub struct Snapshot {
    series: BTreeMap<SeriesKey, SeriesAggregate>,
    elapsed: Duration,
}

impl Snapshot {
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Override the wall-clock span counter rates are computed over.
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn series(&self) -> impl Iterator<Item = (&SeriesKey, &SeriesAggregate)> {
        self.series.iter()
    }

    /// Distinct metric names, sorted.
    pub fn metric_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.series.keys().map(|k| k.metric).collect();
        names.dedup();
        names
    }

    /// All series matching `selector`, merged into one aggregate.
    pub fn select(&self, selector: &MetricSelector) -> Option<SeriesAggregate> {
        self.series
            .iter()
            .filter(|(key, _)| selector.matches(key))
            .map(|(_, agg)| agg.clone())
            .reduce(|mut acc, agg| {
                acc.merge(agg);
                acc
            })
    }

    /// Every tag set of `metric`, merged.
    pub fn metric(&self, metric: &str) -> Option<SeriesAggregate> {
        self.select(&MetricSelector::metric(metric))
    }

    pub fn stat(&self, selector: &MetricSelector, stat: &Stat) -> Option<f64> {
        self.select(selector)?
            .stat(stat, self.elapsed.as_secs_f64())
    }

    /// Sum of a counter across all tag sets, 0 when never recorded.
    pub fn counter(&self, metric: &str) -> f64 {
        self.stat(&MetricSelector::metric(metric), &Stat::Count)
            .unwrap_or(0.0)
    }
}
