use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::{ExecutionContext, ExecutionStats, Executor, ScenarioRun, join_vus};
use crate::{
    error::{ConfigError, Result},
    metric::names,
    workload::Workload,
};

/// A fixed number of VUs, each looping on the workload for the whole duration.
#[derive(Debug, Clone, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstantVus {
    pub vus: u64,
    #[serde(with = "crate::config::duration")]
    pub duration: Duration,
}

impl Executor for ConstantVus {
    fn duration(&self) -> Duration {
        self.duration
    }

    fn max_vus(&self) -> u64 {
        self.vus
    }

    fn validate(&self, scenario: &str) -> Result<(), ConfigError> {
        if self.vus == 0 {
            return Err(ConfigError::ZeroVus(scenario.to_string()));
        }
        if self.duration.is_zero() {
            return Err(ConfigError::ZeroDuration(scenario.to_string()));
        }
        Ok(())
    }

    async fn exec<W: Workload>(
        &self,
        run: Arc<ScenarioRun<W>>,
        ctx: ExecutionContext,
    ) -> Result<ExecutionStats> {
        tracing::info!(scenario = run.name(), vus = self.vus, "Initializing VUs...");
        let mut vus = Vec::with_capacity(self.vus as usize);
        for _ in 0..self.vus {
            vus.push(run.new_vu().await);
        }
        run.recorder.gauge(names::VUS_MAX, self.vus as f64);
        run.recorder.gauge(names::VUS, self.vus as f64);

        let handles = vus
            .into_iter()
            .map(|mut vu| {
                let run = Arc::clone(&run);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    while !ctx.is_stopping() {
                        vu.run_iteration(run.workload.as_ref(), ctx.interrupt.cancelled())
                            .await;
                        // an always-ready workload would otherwise starve the scheduler
                        tokio::task::yield_now().await;
                    }
                    tracing::debug!(vu = vu.ctx.vu_id(), "VU stopped");
                })
            })
            .collect();

        tracing::info!(scenario = run.name(), "Running now!");
        ctx.ready();
        join_vus(run.name(), handles).await;
        run.recorder.gauge(names::VUS, 0.0);

        tracing::info!(scenario = run.name(), "Done running scenario");
        Ok(run.counters().snapshot())
    }
}
