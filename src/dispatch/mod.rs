//! Message dispatch: the worker extension point and the per-message pipeline
//!
//! - [`worker`] - the [`Worker`] trait and [`HandlerError`]
//! - [`context`] - [`DispatchContext`], the per-message bundle handed to a worker
//! - [`dispatcher`] - [`MessageDispatcher`], which decodes deliveries, runs the
//!   worker and reports failures

pub mod context;
pub mod dispatcher;
pub mod worker;

pub use context::{DispatchContext, Settlement};
pub use dispatcher::{DispatchOutcome, MessageDispatcher};
pub use worker::{HandlerError, Worker};
