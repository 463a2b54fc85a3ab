//! Executor: orchestration of virtual users and iteration pacing.
//!
//! An [`Executor`] runs one scenario's concurrency profile. The scheduler owns the
//! clock: it starts the executor, waits until the executor reports that its VUs are
//! initialized, lets it run for [`Executor::duration`], then signals shutdown through
//! the [`ExecutionContext`]. Executors stop starting iterations on shutdown and wait
//! for in-flight ones; those still running when the graceful-stop window closes are
//! interrupted through the context's cancellation token.
//!
//! Built-in executors:
//! - [`ConstantVus`]: a fixed number of VUs looping for the whole duration.
//! - [`ConstantArrivalRate`]: a fixed iteration start rate over an elastic VU pool.
//!   Iterations that find no free VU at `maxVUs` are dropped, never queued.
//! - [`RampingVus`]: a VU count interpolated linearly across stages.
//!
//! # Pacing
//! Rate-driven dispatch follows a tick loop: every `tick` the number of iterations
//! to start is `rate * tick + fractional`, floored, and the remainder is carried to
//! the next tick. Small fractions (e.g. 0.3 iterations per tick) are thus not lost
//! and the long-term average matches the target rate.
//!
//! ```text
//! add_f = rate * tick_seconds
//! add_total = floor(add_f + fractional)
//! fractional = (add_f + fractional) - add_total
//! ```
//!
//! # Common pitfalls
//! - **Do not perform blocking I/O inside the workload.** Blocking stalls the runtime
//!   worker and distorts both pacing and latency.
//! - **Avoid heavy allocations per iteration.** Keep clients in the per-VU state.
pub mod arrival_rate;
pub mod constant_vus;
pub mod ramping_vus;

pub use arrival_rate::ConstantArrivalRate;
pub use constant_vus::ConstantVus;
pub use ramping_vus::{RampingVus, Stage};

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregator::Recorder,
    error::{ConfigError, Result},
    vu::{VirtualUser, VuContext},
    workload::Workload,
};

/// The runtime hook that executes one scenario's concurrency profile.
pub trait Executor: Send + Sync {
    /// How long the scenario accepts new iterations.
    fn duration(&self) -> Duration;

    /// Upper bound of concurrently allocated VUs.
    fn max_vus(&self) -> u64;

    fn validate(&self, scenario: &str) -> Result<(), ConfigError>;

    /// Run until `ctx` signals shutdown, then wait for in-flight iterations.
    fn exec<W: Workload>(
        &self,
        run: Arc<ScenarioRun<W>>,
        ctx: ExecutionContext,
    ) -> impl Future<Output = Result<ExecutionStats>> + Send;
}

/// Signals shared by the scheduler and one executor.
#[derive(Clone)]
pub struct ExecutionContext {
    ready: Arc<Notify>,
    /// Flips to `true` when the scenario stops accepting new iterations.
    pub shutdown: watch::Receiver<bool>,
    /// Cancelled when the graceful-stop window closes.
    pub interrupt: CancellationToken,
}

/// Scheduler side of an [`ExecutionContext`].
pub struct ExecutionControl {
    ready: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    interrupt: CancellationToken,
}

impl ExecutionContext {
    pub fn new() -> (Self, ExecutionControl) {
        let (tx, rx) = watch::channel(false);
        let ready = Arc::new(Notify::new());
        let interrupt = CancellationToken::new();
        (
            Self {
                ready: Arc::clone(&ready),
                shutdown: rx,
                interrupt: interrupt.clone(),
            },
            ExecutionControl {
                ready,
                shutdown: tx,
                interrupt,
            },
        )
    }

    /// Tell the scheduler that all pre-allocated VUs exist and the clock may start.
    pub fn ready(&self) {
        self.ready.notify_one();
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown is signalled (or the scheduler went away).
    pub async fn stopped(&mut self) {
        let _ = self.shutdown.wait_for(|stop| *stop).await;
    }
}

impl ExecutionControl {
    pub async fn wait_ready(&self) {
        self.ready.notified().await;
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }
}

/// Iteration accounting for one scenario, updated by its VUs.
#[derive(Debug, Default)]
pub struct IterationCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    interrupted: AtomicU64,
    dropped: AtomicU64,
    allocated: AtomicU64,
    peak_allocated: AtomicU64,
    active: AtomicU64,
    peak_active: AtomicU64,
}

/// Marks one VU as busy for as long as it lives.
pub(crate) struct ActiveGuard<'a>(&'a IterationCounters);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl IterationCounters {
    pub(crate) fn enter(&self) -> ActiveGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_active.fetch_max(now, Ordering::AcqRel);
        ActiveGuard(self)
    }

    pub(crate) fn completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn interrupted(&self) {
        self.interrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn allocate(&self) -> u64 {
        let now = self.allocated.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_allocated.fetch_max(now, Ordering::AcqRel);
        now
    }

    pub fn snapshot(&self) -> ExecutionStats {
        ExecutionStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            peak_vus: self.peak_allocated.load(Ordering::Relaxed),
            peak_active_vus: self.peak_active.load(Ordering::Relaxed),
        }
    }
}

/// What an executor did, as counted by the engine itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Iterations that returned `Ok`.
    pub completed: u64,
    /// Iterations that returned an error.
    pub failed: u64,
    /// Iterations abandoned when the scenario or ramp-down grace expired.
    pub interrupted: u64,
    /// Arrival-rate iterations that found no free VU.
    pub dropped: u64,
    /// Most VUs allocated at once.
    pub peak_vus: u64,
    /// Most VUs running an iteration at once.
    pub peak_active_vus: u64,
}

/// Everything an executor needs to create and drive VUs for one scenario.
pub struct ScenarioRun<W: Workload> {
    name: Arc<str>,
    pub workload: Arc<W>,
    pub recorder: Recorder,
    counters: Arc<IterationCounters>,
    vu_ids: Arc<AtomicU64>,
    insecure_skip_tls_verify: bool,
}

impl<W: Workload> ScenarioRun<W> {
    pub fn new(
        name: &str,
        workload: Arc<W>,
        recorder: Recorder,
        vu_ids: Arc<AtomicU64>,
        insecure_skip_tls_verify: bool,
    ) -> Self {
        Self {
            name: Arc::from(name),
            workload,
            recorder,
            counters: Arc::new(IterationCounters::default()),
            vu_ids,
            insecure_skip_tls_verify,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counters(&self) -> &Arc<IterationCounters> {
        &self.counters
    }

    /// Allocate and initialize a new VU.
    pub async fn new_vu(&self) -> VirtualUser<W::Vu> {
        let id = self.vu_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let allocated = self.counters.allocate();
        let ctx = VuContext::new(
            id,
            Arc::clone(&self.name),
            self.recorder.clone(),
            self.insecure_skip_tls_verify,
        );
        let state = self.workload.init_vu(&ctx).await;
        tracing::debug!(scenario = %self.name, vu = id, allocated, "VU initialized");
        VirtualUser::new(ctx, state, Arc::clone(&self.counters))
    }
}

/// Wait for VU tasks, logging (not propagating) any that panicked.
pub(crate) async fn join_vus(scenario: &str, handles: Vec<JoinHandle<()>>) {
    for res in join_all(handles).await {
        if let Err(e) = res {
            tracing::error!(scenario, "VU task panicked: {e}");
        }
    }
}

#[cfg(feature = "internals")]
pub use pacing::*;

/// Pure pacing math shared by the rate-driven executors.
pub(crate) mod pacing {
    use std::time::Duration;

    /// Hard ceiling on iterations started in one tick.
    pub const MAX_PER_TICK: u64 = u64::MAX >> 3;

    /// Number of iterations to start this tick at `rate` iterations per second,
    /// carrying the fractional remainder across ticks.
    ///
    /// Returns `(iterations, next_fractional)`.
    pub fn iterations_for_tick(rate: f64, tick: Duration, fractional: f64) -> (u64, f64) {
        let add_f = rate * tick.as_secs_f64();
        let total_f = (add_f + fractional).floor();
        let fractional = (add_f + fractional) - total_f;

        let total = if total_f >= MAX_PER_TICK as f64 {
            MAX_PER_TICK
        } else if total_f < 0.0 {
            0
        } else {
            total_f as u64
        };
        (total, fractional.max(0.0))
    }

    /// Linear interpolation from `start` to `end` over `duration`, at `elapsed`.
    /// Past the end of the stage the value stays at `end`.
    pub fn interpolate(start: f64, end: f64, elapsed: Duration, duration: Duration) -> f64 {
        if duration.is_zero() {
            return end;
        }
        let t = (elapsed.as_secs_f64() / duration.as_secs_f64()).min(1.0);
        start + (end - start) * t
    }
}

#[cfg(test)]
mod tests {
    use super::pacing::*;
    use super::*;

    mod iterations_for_tick {
        use super::*;

        #[test]
        fn whole_rates_start_the_same_count_every_tick() {
            let tick = Duration::from_millis(10);
            for (rate, per_tick) in [(100., 1), (2_000., 20), (50_000., 500)] {
                let mut carry = 0.;
                for _ in 0..50 {
                    let (n, next) = iterations_for_tick(rate, tick, carry);
                    assert_eq!(n, per_tick, "rate {rate}");
                    carry = next;
                }
                assert!(carry < 1e-6, "rate {rate} left {carry}");
            }
        }

        #[test]
        fn carry_spreads_a_slow_rate_over_ticks() {
            // 25/s at 10ms ticks is a quarter of an iteration per tick
            let starts: Vec<u64> = (0..8)
                .scan(0., |carry, _| {
                    let (n, next) = iterations_for_tick(25., Duration::from_millis(10), *carry);
                    *carry = next;
                    Some(n)
                })
                .collect();
            assert_eq!(starts, [0, 0, 0, 1, 0, 0, 0, 1]);
        }

        #[test]
        fn long_term_average_matches_rate() {
            let tick = Duration::from_millis(10);
            let mut facc = 0.;
            let mut total = 0;
            // 7 iterations per second over 100 seconds
            for _ in 0..10_000 {
                let (n, f) = iterations_for_tick(7.0, tick, facc);
                facc = f;
                total += n;
            }
            assert!((699..=700).contains(&total), "{total}");
        }

        #[test]
        fn rates_below_zero_start_nothing() {
            let (n, carry) = iterations_for_tick(-100., Duration::from_millis(10), 0.);
            assert_eq!((n, carry), (0, 0.));
        }

        #[test]
        fn runaway_rates_are_capped_per_tick() {
            let (n, _) = iterations_for_tick(f64::MAX, Duration::from_millis(10), 0.);
            assert_eq!(n, MAX_PER_TICK);
        }
    }

    mod interpolate {
        use super::*;

        #[test]
        fn ramp_up_and_down() {
            let d = Duration::from_secs(10);
            for i in 0..=10 {
                let up = interpolate(0., 100., Duration::from_secs(i), d);
                let down = interpolate(100., 0., Duration::from_secs(i), d);
                assert_eq!(up, (i * 10) as f64);
                assert_eq!(down, (100 - i * 10) as f64);
            }
        }

        #[test]
        fn elapsed_over_duration_caps_at_end() {
            let v = interpolate(0., 50., Duration::from_secs(30), Duration::from_secs(10));
            assert_eq!(v, 50.);
        }

        #[test]
        fn zero_duration_jumps_to_end() {
            assert_eq!(interpolate(3., 9., Duration::ZERO, Duration::ZERO), 9.);
        }
    }

    #[test]
    fn counters_track_peaks() {
        let c = IterationCounters::default();
        {
            let _a = c.enter();
            let _b = c.enter();
        }
        let _c = c.enter();
        c.allocate();
        c.allocate();
        let s = c.snapshot();
        assert_eq!(s.peak_active_vus, 2);
        assert_eq!(s.peak_vus, 2);
    }

    #[tokio::test]
    async fn ready_signal_is_not_lost_when_sent_first() {
        let (ctx, control) = ExecutionContext::new();
        ctx.ready();
        tokio::time::timeout(Duration::from_secs(1), control.wait_ready())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stop_wakes_waiters() {
        let (mut ctx, control) = ExecutionContext::new();
        assert!(!ctx.is_stopping());
        control.stop();
        ctx.stopped().await;
        assert!(ctx.is_stopping());
    }
}
