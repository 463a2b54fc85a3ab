use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::{ConfigError, Result},
    executor::{
        ConstantArrivalRate, ConstantVus, ExecutionContext, ExecutionStats, Executor, RampingVus,
        ScenarioRun,
    },
    metric::Tags,
    workload::Workload,
};

/// Executor settings of a scenario, keyed by `executor` in options files:
///
/// ```yaml
/// executor: constant-arrival-rate
/// rate: 100
/// timeUnit: 1s
/// duration: 30s
/// preAllocatedVUs: 10
/// maxVUs: 50
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum ExecutorConfig {
    ConstantVus(ConstantVus),
    ConstantArrivalRate(ConstantArrivalRate),
    RampingVus(RampingVus),
}

impl ExecutorConfig {
    /// The `executor` key this variant is written as.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorConfig::ConstantVus(_) => "constant-vus",
            ExecutorConfig::ConstantArrivalRate(_) => "constant-arrival-rate",
            ExecutorConfig::RampingVus(_) => "ramping-vus",
        }
    }
}

impl From<ConstantVus> for ExecutorConfig {
    fn from(value: ConstantVus) -> Self {
        Self::ConstantVus(value)
    }
}

impl From<ConstantArrivalRate> for ExecutorConfig {
    fn from(value: ConstantArrivalRate) -> Self {
        Self::ConstantArrivalRate(value)
    }
}

impl From<RampingVus> for ExecutorConfig {
    fn from(value: RampingVus) -> Self {
        Self::RampingVus(value)
    }
}

impl Executor for ExecutorConfig {
    fn duration(&self) -> Duration {
        match self {
            ExecutorConfig::ConstantVus(e) => e.duration(),
            ExecutorConfig::ConstantArrivalRate(e) => e.duration(),
            ExecutorConfig::RampingVus(e) => e.duration(),
        }
    }

    fn max_vus(&self) -> u64 {
        match self {
            ExecutorConfig::ConstantVus(e) => e.max_vus(),
            ExecutorConfig::ConstantArrivalRate(e) => e.max_vus(),
            ExecutorConfig::RampingVus(e) => e.max_vus(),
        }
    }

    fn validate(&self, scenario: &str) -> Result<(), ConfigError> {
        match self {
            ExecutorConfig::ConstantVus(e) => e.validate(scenario),
            ExecutorConfig::ConstantArrivalRate(e) => e.validate(scenario),
            ExecutorConfig::RampingVus(e) => e.validate(scenario),
        }
    }

    async fn exec<W: Workload>(
        &self,
        run: Arc<ScenarioRun<W>>,
        ctx: ExecutionContext,
    ) -> Result<ExecutionStats> {
        match self {
            ExecutorConfig::ConstantVus(e) => e.exec(run, ctx).await,
            ExecutorConfig::ConstantArrivalRate(e) => e.exec(run, ctx).await,
            ExecutorConfig::RampingVus(e) => e.exec(run, ctx).await,
        }
    }
}

pub(crate) fn default_graceful_stop() -> Duration {
    Duration::from_secs(5)
}

/// One named workload profile. Immutable once the run starts.
///
/// # Examples
/// ```rust
/// use std::time::Duration;
/// use volley::{Scenario, executor::ConstantVus};
///
/// let scenario = Scenario::builder()
///     .name("smoke".to_string())
///     .executor(
///         ConstantVus::builder()
///             .vus(10)
///             .duration(Duration::from_secs(30))
///             .build()
///             .into(),
///     )
///     .build();
/// assert!(scenario.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct Scenario {
    pub name: String,
    pub executor: ExecutorConfig,
    /// How long in-flight iterations may keep running once the executor stops.
    #[builder(default = default_graceful_stop())]
    pub graceful_stop: Duration,
    /// Delay between the start of the run and the start of this scenario.
    #[builder(default)]
    pub start_time: Duration,
    /// Added to every sample the scenario produces.
    #[builder(default)]
    pub tags: Tags,
}

impl Scenario {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name(&self.name)?;
        self.executor.validate(&self.name)
    }
}

/// Scenario names end up in tags and log lines, so they are kept to `[A-Za-z0-9_-]`.
pub fn validate_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::EmptyScenarioName);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ConfigError::InvalidScenarioName(name.to_string()));
    }
    Ok(())
}
