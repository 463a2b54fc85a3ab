//! Volley: a load-testing engine built around virtual users.
//!
//! A test is a set of scenarios that run in parallel. Each scenario is driven by an
//! executor that decides how many virtual users (VUs) run at any instant and how
//! often they start an iteration of your workload. Workloads talk to the system
//! under test through protocol drivers (HTTP, gRPC, WebSocket), and everything they
//! measure lands in one sharded metrics aggregator that is finalized into a
//! [`RunSummary`] at the end of the run.
//!
//! # Architecture
//!
//! - [`Scheduler`]: starts every [`Scenario`] at its start time, stops it after its
//!   duration and enforces the graceful-stop window.
//! - [`Executor`]: the concurrency profile of a scenario. Built-ins are
//!   `constant-vus`, `constant-arrival-rate` and `ramping-vus`, selected through
//!   [`ExecutorConfig`].
//! - [`Workload`]: what a VU runs, with per-VU state reused across iterations.
//! - [`driver`]: HTTP, gRPC and WebSocket clients that record their own metrics.
//! - [`MetricsAggregator`]: the process-wide sink. Writers hit thread-local shards;
//!   shards are merged once, at finalization.
//! - [`Reporter`]: sends a [`RunSummary`] somewhere (stdout, a JSON file).
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use volley::{
//!     Scenario, Scheduler,
//!     driver::{HttpDriver, HttpOptions, http},
//!     executor::ConstantArrivalRate,
//!     IterationError, VuContext, Workload,
//! };
//!
//! struct PlaceOrder {
//!     client: reqwest::Client,
//! }
//!
//! impl Workload for PlaceOrder {
//!     type Vu = HttpDriver;
//!
//!     async fn init_vu(&self, ctx: &VuContext) -> HttpDriver {
//!         HttpDriver::new(self.client.clone(), ctx.recorder().clone())
//!     }
//!
//!     async fn iteration(&self, http: &mut HttpDriver, _: &VuContext) -> Result<(), IterationError> {
//!         let options = HttpOptions::builder()
//!             .headers(vec![("Content-Type".into(), "application/json".into())])
//!             .timeout(Duration::from_secs(1))
//!             .build();
//!         http.post("http://localhost:8001/spot/orders", r#"{"side":"sell"}"#, &options)
//!             .await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> volley::Result<()> {
//!     let scenario = Scenario::builder()
//!         .name("place_order".to_string())
//!         .executor(
//!             ConstantArrivalRate::builder()
//!                 .rate(200)
//!                 .duration(Duration::from_secs(60))
//!                 .pre_allocated_vus(50)
//!                 .max_vus(100)
//!                 .build()
//!                 .into(),
//!         )
//!         .build();
//!
//!     let summary = Scheduler::builder()
//!         .scenarios(vec![scenario])
//!         .build()
//!         .run(PlaceOrder { client: http::client(false)? })
//!         .await?;
//!     println!("{}", summary.to_text());
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! - `builtins`: config-driven workloads and the stdout/JSON reporters used by the
//!   `volley` binary. (Enabled by default)
//! - `internals`: expose the executors' pacing math.

/// Metric aggregates and statistics
pub mod aggregate;
/// The sharded metrics sink
pub mod aggregator;
/// Options files
pub mod config;
/// Protocol drivers
pub mod driver;
pub mod error;
/// Orchestrators that define how VUs run
pub mod executor;
pub mod logging;
/// Samples and metric names
pub mod metric;
/// Run summaries and reporters
pub mod report;
pub mod scenario;
pub mod scheduler;
pub mod threshold;
pub mod vu;
pub mod workload;
#[cfg(feature = "builtins")]
pub mod workloads;

pub use aggregate::{Aggregate, Stat};
pub use aggregator::{MetricsAggregator, Recorder, Snapshot};
pub use config::Options;
pub use error::{ConfigError, Error, IterationError, Result};
pub use executor::{ExecutionStats, Executor};
pub use report::{Reporter, RunSummary};
pub use scenario::{ExecutorConfig, Scenario};
pub use scheduler::Scheduler;
pub use threshold::Threshold;
pub use vu::VuContext;
pub use workload::{Workload, from_fn};
