use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinSet, time::Instant};
use typed_builder::TypedBuilder;

use super::{ExecutionContext, ExecutionStats, Executor, ScenarioRun, pacing};
use crate::{
    error::{ConfigError, Result},
    metric::names,
    vu::VirtualUser,
    workload::Workload,
};

fn default_time_unit() -> Duration {
    Duration::from_secs(1)
}

fn default_tick() -> Duration {
    Duration::from_millis(10)
}

/// `rate` iterations per `time_unit`, started regardless of how long they take.
///
/// VUs come from a pool that starts with `pre_allocated_vus` and grows up to
/// `max_vus`. An iteration that is due while every VU is busy is dropped and
/// counted in `dropped_iterations`; there is no queue. If the pool is below
/// `max_vus` at that point, a new VU is initialized in the background and
/// serves later iterations, so slow VU setup never holds back dispatch.
#[derive(Debug, Clone, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstantArrivalRate {
    pub rate: u64,
    #[builder(default = default_time_unit())]
    #[serde(with = "crate::config::duration", default = "default_time_unit")]
    pub time_unit: Duration,
    #[serde(with = "crate::config::duration")]
    pub duration: Duration,
    #[builder(default, setter(strip_option))]
    #[serde(
        rename = "preAllocatedVUs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub pre_allocated_vus: Option<u64>,
    #[builder(default, setter(strip_option))]
    #[serde(rename = "maxVUs", default, skip_serializing_if = "Option::is_none")]
    pub max_vus: Option<u64>,
    /// Dispatch granularity. Smaller ticks spread starts more evenly but wake more often.
    #[builder(default = default_tick())]
    #[serde(skip, default = "default_tick")]
    pub tick: Duration,
}

impl ConstantArrivalRate {
    /// `(pre_allocated, max)`; a missing bound defaults to the other one.
    pub fn pool_bounds(&self) -> (u64, u64) {
        match (self.pre_allocated_vus, self.max_vus) {
            (Some(pre), Some(max)) => (pre, max),
            (Some(pre), None) => (pre, pre),
            (None, Some(max)) => (max, max),
            (None, None) => (0, 0),
        }
    }

    /// Target rate in iterations per second.
    pub fn rate_per_sec(&self) -> f64 {
        self.rate as f64 / self.time_unit.as_secs_f64()
    }
}

impl Executor for ConstantArrivalRate {
    fn duration(&self) -> Duration {
        self.duration
    }

    fn max_vus(&self) -> u64 {
        self.pool_bounds().1
    }

    fn validate(&self, scenario: &str) -> Result<(), ConfigError> {
        let name = || scenario.to_string();
        if self.rate == 0 {
            return Err(ConfigError::ZeroRate(name()));
        }
        if self.time_unit.is_zero() {
            return Err(ConfigError::ZeroTimeUnit(name()));
        }
        if self.duration.is_zero() {
            return Err(ConfigError::ZeroDuration(name()));
        }
        if self.pre_allocated_vus.is_none() && self.max_vus.is_none() {
            return Err(ConfigError::MissingVuPool(name()));
        }
        let (pre, max) = self.pool_bounds();
        if max == 0 {
            return Err(ConfigError::ZeroMaxVus(name()));
        }
        if pre > max {
            return Err(ConfigError::PreAllocatedAboveMax {
                name: name(),
                pre_allocated: pre,
                max,
            });
        }
        Ok(())
    }

    async fn exec<W: Workload>(
        &self,
        run: Arc<ScenarioRun<W>>,
        mut ctx: ExecutionContext,
    ) -> Result<ExecutionStats> {
        let (pre_allocated, max_vus) = self.pool_bounds();
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel::<VirtualUser<W::Vu>>();

        tracing::info!(
            scenario = run.name(),
            pre_allocated,
            max_vus,
            "Initializing VUs..."
        );
        for _ in 0..pre_allocated {
            // the receiver lives in this scope, sending cannot fail
            let _ = idle_tx.send(run.new_vu().await);
        }
        let mut allocated = pre_allocated;
        run.recorder.gauge(names::VUS_MAX, allocated as f64);

        let rate = self.rate_per_sec();
        let mut in_flight = JoinSet::new();
        let busy = Arc::new(AtomicU64::new(0));
        let mut fractional = 0.0;
        let mut next_tick = Instant::now();

        tracing::info!(scenario = run.name(), rate, "Running now!");
        ctx.ready();
        loop {
            tokio::select! {
                biased;
                _ = ctx.stopped() => break,
                Some(res) = in_flight.join_next() => {
                    if let Err(e) = res {
                        tracing::error!(scenario = run.name(), "VU task panicked: {e}");
                    }
                    continue;
                }
                _ = tokio::time::sleep_until(next_tick) => {}
            }
            next_tick += self.tick;

            let (due, f) = pacing::iterations_for_tick(rate, self.tick, fractional);
            fractional = f;

            for _ in 0..due {
                let Ok(mut vu) = idle_rx.try_recv() else {
                    // dropped; growing the pool happens off the dispatch loop
                    if allocated < max_vus {
                        allocated += 1;
                        tracing::debug!(scenario = run.name(), allocated, "Growing VU pool");
                        run.recorder.gauge(names::VUS_MAX, allocated as f64);
                        let run = Arc::clone(&run);
                        let idle_tx = idle_tx.clone();
                        let interrupt = ctx.interrupt.clone();
                        in_flight.spawn(async move {
                            tokio::select! {
                                vu = run.new_vu() => {
                                    let _ = idle_tx.send(vu);
                                }
                                _ = interrupt.cancelled() => {}
                            }
                        });
                    }
                    run.counters().dropped();
                    run.recorder.count(names::DROPPED_ITERATIONS, 1.0);
                    continue;
                };

                let now = busy.fetch_add(1, Ordering::AcqRel) + 1;
                run.recorder.gauge(names::VUS, now as f64);
                let run = Arc::clone(&run);
                let idle_tx = idle_tx.clone();
                let busy = Arc::clone(&busy);
                let interrupt = ctx.interrupt.clone();
                in_flight.spawn(async move {
                    vu.run_iteration(run.workload.as_ref(), interrupt.cancelled())
                        .await;
                    let now = busy.fetch_sub(1, Ordering::AcqRel) - 1;
                    run.recorder.gauge(names::VUS, now as f64);
                    let _ = idle_tx.send(vu);
                });
            }
        }

        tracing::info!(
            scenario = run.name(),
            in_flight = in_flight.len(),
            "Stopped dispatching, waiting for in-flight iterations..."
        );
        while let Some(res) = in_flight.join_next().await {
            if let Err(e) = res {
                tracing::error!(scenario = run.name(), "VU task panicked: {e}");
            }
        }
        run.recorder.gauge(names::VUS, 0.0);

        let stats = run.counters().snapshot();
        if stats.dropped > 0 {
            tracing::warn!(
                scenario = run.name(),
                dropped = stats.dropped,
                max_vus,
                "Iterations dropped: the VU pool could not sustain the target rate"
            );
        }
        tracing::info!(scenario = run.name(), "Done running scenario");
        Ok(stats)
    }
}
