//! Runs every scenario of a test in parallel and turns the result into a
//! [`RunSummary`].
//!
//! Each scenario gets its own task. The task waits for the scenario's start
//! time, starts the executor, and once the executor's VUs are initialized lets it
//! run for its duration. It then asks the executor to stop and waits up to the
//! scenario's graceful-stop window before interrupting whatever is still running.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, atomic::AtomicU64},
};

use futures::future::join_all;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::{
    aggregate::Stat,
    aggregator::{MetricsAggregator, Recorder},
    config::{Options, default_trend_stats},
    error::{ConfigError, Result},
    executor::{ExecutionContext, ExecutionStats, Executor, ScenarioRun},
    report::RunSummary,
    scenario::Scenario,
    threshold::Threshold,
    workload::Workload,
};

/// # Examples
/// ```rust,no_run
/// use std::time::Duration;
/// use volley::{Scenario, Scheduler, executor::ConstantVus, workload::from_fn};
///
/// #[tokio::main]
/// async fn main() -> volley::Result<()> {
///     let scenario = Scenario::builder()
///         .name("smoke".to_string())
///         .executor(
///             ConstantVus::builder()
///                 .vus(10)
///                 .duration(Duration::from_secs(30))
///                 .build()
///                 .into(),
///         )
///         .build();
///
///     let summary = Scheduler::builder()
///         .scenarios(vec![scenario])
///         .build()
///         .run(from_fn(|| async {
///             tokio::time::sleep(Duration::from_millis(10)).await;
///         }))
///         .await?;
///     println!("{}", summary.to_text());
///     Ok(())
/// }
/// ```
#[derive(TypedBuilder)]
pub struct Scheduler {
    scenarios: Vec<Scenario>,
    #[builder(default)]
    insecure_skip_tls_verify: bool,
    #[builder(default = default_trend_stats())]
    summary_trend_stats: Vec<Stat>,
    #[builder(default)]
    thresholds: Vec<Threshold>,
    #[builder(default = Arc::new(MetricsAggregator::new()))]
    aggregator: Arc<MetricsAggregator>,
}

impl Scheduler {
    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        Ok(Self::builder()
            .scenarios(options.scenarios()?)
            .insecure_skip_tls_verify(options.insecure_skip_tls_verify)
            .summary_trend_stats(options.summary_trend_stats.clone())
            .thresholds(options.thresholds()?)
            .build())
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn aggregator(&self) -> &Arc<MetricsAggregator> {
        &self.aggregator
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scenarios.is_empty() {
            return Err(ConfigError::NoScenarios);
        }
        let mut seen = BTreeSet::new();
        for scenario in &self.scenarios {
            scenario.validate()?;
            if !seen.insert(scenario.name.as_str()) {
                return Err(ConfigError::DuplicateScenario(scenario.name.clone()));
            }
        }
        Ok(())
    }

    /// Run every scenario to completion and finalize the metrics.
    ///
    /// Configuration errors are reported before any VU is created.
    pub async fn run<W: Workload>(self, workload: W) -> Result<RunSummary> {
        self.validate()?;

        let workload = Arc::new(workload);
        let vu_ids = Arc::new(AtomicU64::new(0));
        let base = Recorder::new(Arc::clone(&self.aggregator));
        let start = Instant::now();

        tracing::info!(scenarios = self.scenarios.len(), "Starting run");
        let tasks = self
            .scenarios
            .iter()
            .cloned()
            .map(|scenario| {
                let tags = scenario
                    .tags
                    .clone()
                    .into_iter()
                    .chain([("scenario".to_string(), scenario.name.clone())]);
                let run = Arc::new(ScenarioRun::new(
                    &scenario.name,
                    Arc::clone(&workload),
                    base.with_tags(tags),
                    Arc::clone(&vu_ids),
                    self.insecure_skip_tls_verify,
                ));
                tokio::spawn(run_scenario(scenario, run))
            })
            .collect::<Vec<_>>();

        let mut stats = BTreeMap::new();
        for res in join_all(tasks).await {
            let (name, s) = res??;
            stats.insert(name, s);
        }

        let elapsed = start.elapsed();
        let snapshot = self.aggregator.finalize()?.with_elapsed(elapsed);
        tracing::info!(?elapsed, "Run finished");
        Ok(RunSummary::build(
            &snapshot,
            &self.summary_trend_stats,
            &self.thresholds,
            stats,
            elapsed,
        ))
    }
}

async fn run_scenario<W: Workload>(
    scenario: Scenario,
    run: Arc<ScenarioRun<W>>,
) -> Result<(String, ExecutionStats)> {
    let name = scenario.name.clone();
    if !scenario.start_time.is_zero() {
        tracing::info!(scenario = %name, start_time = ?scenario.start_time, "Waiting for start time");
        tokio::time::sleep(scenario.start_time).await;
    }

    let (ctx, control) = ExecutionContext::new();
    let executor = scenario.executor.clone();
    let mut handle = tokio::spawn(async move { executor.exec(run, ctx).await });

    tokio::select! {
        _ = control.wait_ready() => {}
        res = &mut handle => return Ok((name, res??)),
    }

    let duration = scenario.executor.duration();
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        res = &mut handle => return Ok((name, res??)),
    }

    tracing::info!(scenario = %name, "Duration reached, stopping");
    control.stop();

    let stats = match tokio::time::timeout(scenario.graceful_stop, &mut handle).await {
        Ok(res) => res??,
        Err(_) => {
            tracing::warn!(
                scenario = %name,
                graceful_stop = ?scenario.graceful_stop,
                "Graceful stop elapsed, interrupting in-flight iterations"
            );
            control.interrupt();
            handle.await??
        }
    };
    Ok((name, stats))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{executor::ConstantVus, metric::names, workload::from_fn};

    fn constant(name: &str, vus: u64, secs: u64) -> Scenario {
        Scenario::builder()
            .name(name.to_string())
            .executor(
                ConstantVus::builder()
                    .vus(vus)
                    .duration(Duration::from_secs(secs))
                    .build()
                    .into(),
            )
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn scenarios_run_in_parallel_with_distinct_vu_ids() {
        let seen = Arc::new(std::sync::Mutex::new(BTreeSet::new()));
        struct Ids(Arc<std::sync::Mutex<BTreeSet<u64>>>);
        impl Workload for Ids {
            type Vu = ();
            async fn init_vu(&self, ctx: &crate::VuContext) {
                self.0.lock().unwrap().insert(ctx.vu_id());
            }
            async fn iteration(
                &self,
                _: &mut (),
                _: &crate::VuContext,
            ) -> Result<(), crate::IterationError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            }
        }

        let start = Instant::now();
        let summary = Scheduler::builder()
            .scenarios(vec![constant("a", 2, 1), constant("b", 3, 1)])
            .aggregator(Arc::new(MetricsAggregator::with_shards(2)))
            .build()
            .run(Ids(Arc::clone(&seen)))
            .await
            .unwrap();

        // both one-second scenarios share the same wall clock
        assert!(start.elapsed() < Duration::from_millis(1_500));
        assert_eq!(
            *seen.lock().unwrap(),
            (1..=5).collect::<BTreeSet<u64>>()
        );
        assert_eq!(summary.scenarios["a"].peak_vus, 2);
        assert_eq!(summary.scenarios["b"].peak_vus, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn iterations_past_graceful_stop_are_interrupted() {
        let mut scenario = constant("slow", 2, 1);
        scenario.graceful_stop = Duration::ZERO;
        let summary = Scheduler::builder()
            .scenarios(vec![scenario])
            .aggregator(Arc::new(MetricsAggregator::with_shards(1)))
            .build()
            .run(from_fn(|| async {
                tokio::time::sleep(Duration::from_millis(700)).await;
            }))
            .await
            .unwrap();

        let stats = summary.scenarios["slow"];
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.interrupted, 2);
        assert_eq!(summary.value(names::INTERRUPTED_ITERATIONS, "count"), Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_lets_iterations_finish() {
        let summary = Scheduler::builder()
            .scenarios(vec![constant("slow", 2, 1)])
            .aggregator(Arc::new(MetricsAggregator::with_shards(1)))
            .build()
            .run(from_fn(|| async {
                tokio::time::sleep(Duration::from_millis(700)).await;
            }))
            .await
            .unwrap();

        let stats = summary.scenarios["slow"];
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.interrupted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_time_delays_a_scenario() {
        let mut late = constant("late", 1, 1);
        late.start_time = Duration::from_secs(2);
        let start = Instant::now();
        Scheduler::builder()
            .scenarios(vec![constant("early", 1, 1), late])
            .aggregator(Arc::new(MetricsAggregator::with_shards(1)))
            .build()
            .run(from_fn(|| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn invalid_scenarios_fail_before_running() {
        let res = Scheduler::builder()
            .scenarios(vec![constant("a", 1, 1), constant("a", 1, 1)])
            .build()
            .run(from_fn(|| async {}))
            .await;
        assert!(matches!(
            res,
            Err(crate::Error::Config(ConfigError::DuplicateScenario(_)))
        ));

        let res = Scheduler::builder()
            .scenarios(vec![constant("a", 0, 1)])
            .build()
            .run(from_fn(|| async {}))
            .await;
        assert!(matches!(
            res,
            Err(crate::Error::Config(ConfigError::ZeroVus(_)))
        ));
    }
}
