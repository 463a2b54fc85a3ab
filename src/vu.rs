use std::sync::Arc;

use tokio::time::Instant;

use crate::{
    aggregator::Recorder,
    error::IterationError,
    executor::IterationCounters,
    metric::{Tags, names},
    workload::Workload,
};

/// What a virtual user knows about itself while running an iteration.
#[derive(Debug, Clone)]
pub struct VuContext {
    vu_id: u64,
    scenario: Arc<str>,
    iteration: u64,
    recorder: Recorder,
    insecure_skip_tls_verify: bool,
}

impl VuContext {
    pub(crate) fn new(
        vu_id: u64,
        scenario: Arc<str>,
        recorder: Recorder,
        insecure_skip_tls_verify: bool,
    ) -> Self {
        Self {
            vu_id,
            scenario,
            iteration: 0,
            recorder,
            insecure_skip_tls_verify,
        }
    }

    /// Process-wide VU id, starting at 1.
    pub fn vu_id(&self) -> u64 {
        self.vu_id
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// Zero-based index of the current iteration of this VU within its scenario.
    pub fn iteration_in_scenario(&self) -> u64 {
        self.iteration
    }

    /// Recorder tagged with the scenario (and its user tags).
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn insecure_skip_tls_verify(&self) -> bool {
        self.insecure_skip_tls_verify
    }

    /// Record a named check into the `checks` rate. Returns `passed`.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        self.recorder.check(name, passed)
    }
}

/// How an iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed,
    Failed,
    Interrupted,
}

/// An execution context reused across iterations within a scenario.
pub struct VirtualUser<S> {
    pub ctx: VuContext,
    pub state: S,
    counters: Arc<IterationCounters>,
}

impl<S> VirtualUser<S> {
    pub(crate) fn new(ctx: VuContext, state: S, counters: Arc<IterationCounters>) -> Self {
        Self {
            ctx,
            state,
            counters,
        }
    }

    /// Run one iteration of `workload`, abandoning it when `interrupt` resolves first.
    ///
    /// Iterations of one VU are strictly sequential: this takes `&mut self`.
    pub async fn run_iteration<W>(
        &mut self,
        workload: &W,
        interrupt: impl Future<Output = ()> + Send,
    ) -> IterationOutcome
    where
        W: Workload<Vu = S>,
    {
        let _active = self.counters.enter();
        let start = Instant::now();
        let result = tokio::select! {
            r = workload.iteration(&mut self.state, &self.ctx) => r,
            _ = interrupt => Err(IterationError::Cancelled),
        };
        let elapsed = start.elapsed();
        self.ctx.iteration += 1;

        let recorder = &self.ctx.recorder;
        match result {
            Ok(()) => {
                recorder.count(names::ITERATIONS, 1.0);
                recorder.trend_duration(names::ITERATION_DURATION, elapsed);
                self.counters.completed();
                IterationOutcome::Completed
            }
            Err(IterationError::Cancelled) => {
                tracing::debug!(vu = self.ctx.vu_id, "Iteration interrupted");
                recorder.count(names::INTERRUPTED_ITERATIONS, 1.0);
                self.counters.interrupted();
                IterationOutcome::Interrupted
            }
            Err(e) => {
                tracing::debug!(vu = self.ctx.vu_id, error = %e, "Iteration failed");
                let mut tags = Tags::new();
                tags.insert("error".into(), e.kind().into());
                recorder.count(names::ITERATIONS, 1.0);
                recorder.trend_duration(names::ITERATION_DURATION, elapsed);
                recorder.count_tagged(names::ITERATION_ERRORS, 1.0, tags);
                self.counters.failed();
                IterationOutcome::Failed
            }
        }
    }
}
