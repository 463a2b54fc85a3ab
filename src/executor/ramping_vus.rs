use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{sync::watch, time::Instant};
use typed_builder::TypedBuilder;

use super::{ExecutionContext, ExecutionStats, Executor, ScenarioRun, join_vus, pacing};
use crate::{
    error::{ConfigError, Result},
    metric::names,
    workload::Workload,
};

/// A stage moves the live VU count linearly to `target` over `duration`.
///
/// `Stage::new(Duration::from_secs(10), 100)` ramps to 100 VUs over 10s. A stage
/// with `Duration::ZERO` jumps to its target immediately.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "crate::config::duration")]
    pub duration: Duration,
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

fn default_start_vus() -> u64 {
    1
}

fn default_graceful_ramp_down() -> Duration {
    Duration::from_secs(30)
}

fn default_tick() -> Duration {
    Duration::from_millis(100)
}

/// Executor that follows a list of [`Stage`]s.
///
/// Every VU the stages will ever need is initialized up front. VU `i` runs
/// iterations while the current target is above `i` and is parked otherwise, so
/// scaling down reuses the same VUs when the target rises again. A VU parked in the
/// middle of an iteration gets `graceful_ramp_down` to finish it before the
/// iteration is interrupted.
#[derive(Debug, Clone, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RampingVus {
    #[builder(default = default_start_vus())]
    #[serde(rename = "startVUs", default = "default_start_vus")]
    pub start_vus: u64,
    pub stages: Vec<Stage>,
    #[builder(default = default_graceful_ramp_down())]
    #[serde(
        with = "crate::config::duration",
        default = "default_graceful_ramp_down"
    )]
    pub graceful_ramp_down: Duration,
    /// How often the live VU target is recomputed.
    #[builder(default = default_tick())]
    #[serde(skip, default = "default_tick")]
    pub tick: Duration,
}

impl RampingVus {
    /// Live VU target `elapsed` after the start.
    pub fn target_at(&self, elapsed: Duration) -> u64 {
        let mut from = self.start_vus as f64;
        let mut stage_start = Duration::ZERO;
        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let v = pacing::interpolate(
                    from,
                    stage.target as f64,
                    elapsed - stage_start,
                    stage.duration,
                );
                return v.round().max(0.0) as u64;
            }
            from = stage.target as f64;
            stage_start = stage_end;
        }
        from as u64
    }
}

impl Executor for RampingVus {
    fn duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    fn max_vus(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .max()
            .unwrap_or(0)
            .max(self.start_vus)
    }

    fn validate(&self, scenario: &str) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::EmptyStages(scenario.to_string()));
        }
        if self.duration().is_zero() {
            return Err(ConfigError::ZeroStageDuration(scenario.to_string()));
        }
        if self.max_vus() == 0 {
            return Err(ConfigError::ZeroVus(scenario.to_string()));
        }
        Ok(())
    }

    async fn exec<W: Workload>(
        &self,
        run: Arc<ScenarioRun<W>>,
        mut ctx: ExecutionContext,
    ) -> Result<ExecutionStats> {
        let max_vus = self.max_vus();
        tracing::info!(scenario = run.name(), max_vus, "Initializing VUs...");
        let mut vus = Vec::with_capacity(max_vus as usize);
        for _ in 0..max_vus {
            vus.push(run.new_vu().await);
        }
        run.recorder.gauge(names::VUS_MAX, max_vus as f64);

        let (target_tx, target_rx) = watch::channel(self.start_vus);
        run.recorder.gauge(names::VUS, self.start_vus as f64);

        let handles = vus
            .into_iter()
            .enumerate()
            .map(|(i, mut vu)| {
                let index = i as u64;
                let run = Arc::clone(&run);
                let mut ctx = ctx.clone();
                let mut target = target_rx.clone();
                let grace = self.graceful_ramp_down;
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = ctx.stopped() => break,
                            active = async { target.wait_for(|t| *t > index).await.is_ok() } => {
                                if !active {
                                    break;
                                }
                            }
                        }
                        if ctx.is_stopping() {
                            break;
                        }
                        let ramp_down = ramp_down_deadline(target.clone(), index, grace);
                        let interrupt = ctx.interrupt.clone();
                        vu.run_iteration(run.workload.as_ref(), async move {
                            tokio::select! {
                                _ = interrupt.cancelled() => {}
                                _ = ramp_down => {}
                            }
                        })
                        .await;
                        tokio::task::yield_now().await;
                    }
                    tracing::debug!(vu = vu.ctx.vu_id(), "VU stopped");
                })
            })
            .collect::<Vec<_>>();

        tracing::info!(scenario = run.name(), "Running now!");
        ctx.ready();

        let start = Instant::now();
        let mut next_tick = start;
        let mut current = self.start_vus;
        loop {
            tokio::select! {
                biased;
                _ = ctx.stopped() => break,
                _ = tokio::time::sleep_until(next_tick) => {}
            }
            next_tick += self.tick;

            let target = self.target_at(start.elapsed());
            if target != current {
                tracing::debug!(scenario = run.name(), from = current, to = target, "Ramping VUs");
                current = target;
                target_tx.send_replace(target);
                run.recorder.gauge(names::VUS, target as f64);
            }
        }

        join_vus(run.name(), handles).await;
        run.recorder.gauge(names::VUS, 0.0);
        tracing::info!(scenario = run.name(), "Done running scenario");
        Ok(run.counters().snapshot())
    }
}

/// Resolves once VU `index` has been parked for `grace` without being reactivated.
async fn ramp_down_deadline(mut target: watch::Receiver<u64>, index: u64, grace: Duration) {
    loop {
        if target.wait_for(|t| *t <= index).await.is_err() {
            return std::future::pending().await;
        }
        tokio::select! {
            _ = tokio::time::sleep(grace) => return,
            reactivated = async { target.wait_for(|t| *t > index).await.is_ok() } => {
                if !reactivated {
                    return std::future::pending().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregator::{MetricsAggregator, Recorder},
        workload::from_fn,
    };
    use std::sync::atomic::{AtomicU64, Ordering};

    fn ramp() -> RampingVus {
        RampingVus::builder()
            .start_vus(0)
            .stages(vec![
                Stage::new(Duration::from_secs(10), 10),
                Stage::new(Duration::from_secs(5), 10),
                Stage::new(Duration::from_secs(10), 0),
            ])
            .build()
    }

    #[test]
    fn target_follows_stages() {
        let r = ramp();
        assert_eq!(r.target_at(Duration::ZERO), 0);
        assert_eq!(r.target_at(Duration::from_secs(5)), 5);
        assert_eq!(r.target_at(Duration::from_secs(12)), 10);
        assert_eq!(r.target_at(Duration::from_secs(20)), 5);
        assert_eq!(r.target_at(Duration::from_secs(60)), 0);
        assert_eq!(r.duration(), Duration::from_secs(25));
        assert_eq!(r.max_vus(), 10);
    }

    #[test]
    fn zero_duration_stage_jumps() {
        let r = RampingVus::builder()
            .stages(vec![
                Stage::new(Duration::ZERO, 50),
                Stage::new(Duration::from_secs(10), 50),
            ])
            .build();
        assert_eq!(r.target_at(Duration::ZERO), 50);
        assert_eq!(r.target_at(Duration::from_secs(3)), 50);
    }

    #[test]
    fn validation() {
        let empty = RampingVus::builder().stages(vec![]).build();
        assert_eq!(
            empty.validate("s"),
            Err(ConfigError::EmptyStages("s".into()))
        );
        let instant = RampingVus::builder()
            .stages(vec![Stage::new(Duration::ZERO, 5)])
            .build();
        assert_eq!(
            instant.validate("s"),
            Err(ConfigError::ZeroStageDuration("s".into()))
        );
        let idle = RampingVus::builder()
            .start_vus(0)
            .stages(vec![
                Stage::new(Duration::from_secs(5), 0),
                Stage::new(Duration::from_secs(5), 0),
            ])
            .build();
        assert_eq!(idle.validate("s"), Err(ConfigError::ZeroVus("s".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn live_vus_never_exceed_the_target() {
        let agg = Arc::new(MetricsAggregator::with_shards(1));
        let running = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));
        let workload = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            Arc::new(from_fn(move || {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            }))
        };
        let run = Arc::new(ScenarioRun::new(
            "ramp",
            workload,
            Recorder::new(Arc::clone(&agg)),
            Arc::new(AtomicU64::new(0)),
            false,
        ));
        let executor = RampingVus::builder()
            .start_vus(0)
            .stages(vec![
                Stage::new(Duration::from_secs(1), 4),
                Stage::new(Duration::from_secs(1), 1),
            ])
            .build();

        let (ctx, control) = ExecutionContext::new();
        let duration = executor.duration();
        let handle = tokio::spawn(async move { executor.exec(run, ctx).await });
        control.wait_ready().await;
        tokio::time::sleep(duration).await;
        control.stop();
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(stats.peak_vus, 4);
        assert_eq!(peak.load(Ordering::SeqCst), 4);
        assert!(stats.completed > 0);
        assert_eq!(stats.interrupted, 0);
    }
}
