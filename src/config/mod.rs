//! Run options, loaded from a YAML (or JSON) file with k6-style field names.
//!
//! ```yaml
//! insecureSkipTLSVerify: true
//! summaryTrendStats: [avg, min, med, max, p(90), p(95), p(99)]
//! scenarios:
//!   place_order:
//!     executor: constant-arrival-rate
//!     rate: 200
//!     timeUnit: 1s
//!     duration: 1m
//!     preAllocatedVUs: 50
//!     maxVUs: 100
//! thresholds:
//!   http_req_duration: ["p(95) < 500"]
//! ```
//!
//! Instead of `scenarios`, the shorthand `vus` + `duration` or `stages` describes
//! a single scenario named `default`.

pub mod duration;

use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::Deserialize;

use crate::{
    aggregate::Stat,
    error::{ConfigError, Error, Result},
    executor::{ConstantVus, RampingVus, Stage},
    metric::Tags,
    scenario::{ExecutorConfig, Scenario, default_graceful_stop},
    threshold::Threshold,
};

pub const DEFAULT_SCENARIO: &str = "default";

pub fn default_trend_stats() -> Vec<Stat> {
    vec![
        Stat::Avg,
        Stat::Min,
        Stat::Med,
        Stat::Max,
        Stat::Percentile(90.0),
        Stat::Percentile(95.0),
    ]
}

/// A scenario entry under `scenarios`.
///
/// Keys are checked against the chosen executor, so a misspelled option is an
/// error rather than silently falling back to its default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "serde_yaml::Mapping")]
pub struct ScenarioOptions {
    pub executor: ExecutorConfig,
    pub graceful_stop: Duration,
    pub start_time: Duration,
    pub tags: Tags,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawScenario {
    #[serde(flatten)]
    executor: ExecutorConfig,
    #[serde(with = "duration", default = "default_graceful_stop")]
    graceful_stop: Duration,
    #[serde(with = "duration", default)]
    start_time: Duration,
    #[serde(default)]
    tags: Tags,
}

const SCENARIO_KEYS: [&str; 4] = ["executor", "gracefulStop", "startTime", "tags"];

fn executor_keys(executor: &str) -> Option<&'static [&'static str]> {
    match executor {
        "constant-vus" => Some(&["vus", "duration"]),
        "constant-arrival-rate" => Some(&[
            "rate",
            "timeUnit",
            "duration",
            "preAllocatedVUs",
            "maxVUs",
        ]),
        "ramping-vus" => Some(&["startVUs", "stages", "gracefulRampDown"]),
        _ => None,
    }
}

impl TryFrom<serde_yaml::Mapping> for ScenarioOptions {
    type Error = String;

    fn try_from(map: serde_yaml::Mapping) -> Result<Self, Self::Error> {
        let executor = map
            .get("executor")
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or_default()
            .to_string();
        // an unknown executor is reported by the executor deserializer below
        if let Some(allowed) = executor_keys(&executor) {
            for key in map.keys() {
                let key = key.as_str().unwrap_or_default();
                if !SCENARIO_KEYS.contains(&key) && !allowed.contains(&key) {
                    return Err(format!("unknown field `{key}` for executor {executor}"));
                }
            }
        }
        let raw: RawScenario = serde_yaml::from_value(serde_yaml::Value::Mapping(map))
            .map_err(|e| e.to_string())?;
        Ok(Self {
            executor: raw.executor,
            graceful_stop: raw.graceful_stop,
            start_time: raw.start_time,
            tags: raw.tags,
        })
    }
}

impl ScenarioOptions {
    fn into_scenario(self, name: String) -> Scenario {
        Scenario {
            name,
            executor: self.executor,
            graceful_stop: self.graceful_stop,
            start_time: self.start_time,
            tags: self.tags,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Options {
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioOptions>,
    #[serde(default)]
    pub vus: Option<u64>,
    #[serde(with = "duration::option", default)]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(rename = "insecureSkipTLSVerify", default)]
    pub insecure_skip_tls_verify: bool,
    #[serde(default = "default_trend_stats")]
    pub summary_trend_stats: Vec<Stat>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
    /// Request definition for the config-driven CLI workload.
    #[cfg(feature = "builtins")]
    #[serde(default)]
    pub workload: Option<crate::workloads::WorkloadConfig>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            scenarios: BTreeMap::new(),
            vus: None,
            duration: None,
            stages: Vec::new(),
            insecure_skip_tls_verify: false,
            summary_trend_stats: default_trend_stats(),
            thresholds: BTreeMap::new(),
            #[cfg(feature = "builtins")]
            workload: None,
        }
    }
}

impl Options {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "Loaded options file");
        Self::from_yaml_str(&raw)
    }

    /// JSON documents are accepted too, being valid YAML.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Command-line `--vus`/`--duration` take precedence over the file, and
    /// replace whatever scenarios it declares with the shorthand one.
    pub fn apply_overrides(&mut self, vus: Option<u64>, duration: Option<Duration>) {
        if vus.is_none() && duration.is_none() {
            return;
        }
        if !self.scenarios.is_empty() {
            tracing::info!("Command-line vus/duration override the scenarios in the options file");
            self.scenarios.clear();
        }
        if vus.is_some() {
            self.vus = vus;
        }
        if duration.is_some() {
            self.duration = duration;
            self.stages.clear();
        }
    }

    /// Resolve and validate the scenarios this run will execute.
    pub fn scenarios(&self) -> Result<Vec<Scenario>, ConfigError> {
        let scenarios = if !self.scenarios.is_empty() {
            if self.vus.is_some() {
                return Err(ConfigError::ShorthandWithScenarios("vus"));
            }
            if self.duration.is_some() {
                return Err(ConfigError::ShorthandWithScenarios("duration"));
            }
            if !self.stages.is_empty() {
                return Err(ConfigError::ShorthandWithScenarios("stages"));
            }
            self.scenarios
                .iter()
                .map(|(name, opts)| opts.clone().into_scenario(name.clone()))
                .collect()
        } else {
            vec![self.shorthand_scenario()?]
        };

        for scenario in &scenarios {
            scenario.validate()?;
        }
        Ok(scenarios)
    }

    fn shorthand_scenario(&self) -> Result<Scenario, ConfigError> {
        let executor: ExecutorConfig = match (self.vus, self.duration, self.stages.is_empty()) {
            (vus, _, false) => RampingVus::builder()
                .start_vus(vus.unwrap_or(1))
                .stages(self.stages.clone())
                .build()
                .into(),
            (vus, Some(duration), true) => ConstantVus::builder()
                .vus(vus.unwrap_or(1))
                .duration(duration)
                .build()
                .into(),
            (Some(_), None, true) => return Err(ConfigError::VusWithoutDuration),
            (None, None, true) => return Err(ConfigError::NoScenarios),
        };
        Ok(Scenario::builder()
            .name(DEFAULT_SCENARIO.to_string())
            .executor(executor)
            .build())
    }

    pub fn thresholds(&self) -> Result<Vec<Threshold>, ConfigError> {
        Threshold::parse_all(&self.thresholds)
    }

    /// Everything that can be checked without running anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scenarios()?;
        self.thresholds()?;
        #[cfg(feature = "builtins")]
        match &self.workload {
            Some(workload) => workload.validate()?,
            None => return Err(ConfigError::MissingWorkload),
        }
        Ok(())
    }
}
