//! What a virtual user runs.
//!
//! A [`Workload`] is invoked once per iteration. Each virtual user owns a piece of
//! state created by [`Workload::init_vu`] before its first iteration and reused for
//! the rest of its lifetime: the place to keep a persistent gRPC client or any other
//! per-user connection state.
//!
//! ```rust
//! use volley::{IterationError, VuContext, Workload};
//!
//! struct Orders {
//!     client: reqwest::Client,
//! }
//!
//! impl Workload for Orders {
//!     type Vu = u64;
//!
//!     async fn init_vu(&self, ctx: &VuContext) -> u64 {
//!         ctx.vu_id()
//!     }
//!
//!     async fn iteration(&self, vu: &mut u64, _ctx: &VuContext) -> Result<(), IterationError> {
//!         let url = format!("http://localhost:8001/spot/orders?user={vu}");
//!         self.client
//!             .get(url)
//!             .send()
//!             .await
//!             .map_err(|e| IterationError::Connection(e.to_string()))?;
//!         Ok(())
//!     }
//! }
//! ```
//!
//! Stateless workloads can be written as plain closures with [`from_fn`].

use crate::{error::IterationError, vu::VuContext};

pub trait Workload: Send + Sync + 'static {
    /// Per virtual user state.
    type Vu: Send + 'static;

    /// Build the state of a new virtual user. Runs once per VU, before the VU takes
    /// part in the scenario; keep it cheap and do fallible setup (connecting) inside
    /// the first iteration so failures are recorded and retried.
    fn init_vu(&self, ctx: &VuContext) -> impl Future<Output = Self::Vu> + Send;

    /// Run one iteration.
    fn iteration(
        &self,
        vu: &mut Self::Vu,
        ctx: &VuContext,
    ) -> impl Future<Output = Result<(), IterationError>> + Send;
}

/// Return types accepted from closure workloads: `()` or `Result<(), IterationError>`.
pub trait IterationResult {
    fn into_result(self) -> Result<(), IterationError>;
}

impl IterationResult for () {
    fn into_result(self) -> Result<(), IterationError> {
        Ok(())
    }
}

impl IterationResult for Result<(), IterationError> {
    fn into_result(self) -> Result<(), IterationError> {
        self
    }
}

/// A stateless workload backed by a closure. See [`from_fn`].
#[derive(Clone)]
pub struct FnWorkload<F> {
    action: F,
}

/// Wrap a closure taking no arguments into a [`Workload`].
///
/// NEVER instantiate heavy objects like clients inside the closure; create them
/// outside and clone the handle in.
pub fn from_fn<F, Fut>(action: F) -> FnWorkload<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future + Send,
    Fut::Output: IterationResult,
{
    FnWorkload { action }
}

impl<F, Fut> Workload for FnWorkload<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future + Send,
    Fut::Output: IterationResult,
{
    type Vu = ();

    async fn init_vu(&self, _ctx: &VuContext) {}

    fn iteration(
        &self,
        _vu: &mut (),
        _ctx: &VuContext,
    ) -> impl Future<Output = Result<(), IterationError>> + Send {
        let fut = (self.action)();
        async move { fut.await.into_result() }
    }
}
