//! The extension point implemented by concrete workers

use super::context::DispatchContext;
use crate::error::WorkerError;
use async_trait::async_trait;
use std::error::Error;
use thiserror::Error;

/// Failures a handler reports back to the dispatcher
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A required dynamic input was absent from the payload
    #[error("missing key: '{0}'")]
    MissingField(String),

    /// A broker operation issued by the handler failed
    #[error(transparent)]
    Runtime(#[from] WorkerError),

    /// Anything else the handler could not recover from
    #[error(transparent)]
    Failed(Box<dyn Error + Send + Sync>),
}

impl HandlerError {
    pub fn missing_field<S: Into<String>>(key: S) -> Self {
        Self::MissingField(key.into())
    }

    pub fn failed<E: Into<Box<dyn Error + Send + Sync>>>(error: E) -> Self {
        Self::Failed(error.into())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(error: std::io::Error) -> Self {
        Self::Failed(Box::new(error))
    }
}

/// A worker type consuming from `worker.<name>`
///
/// `process` receives each decoded message and is responsible for settling
/// it with [`DispatchContext::ack`] or [`DispatchContext::reject`]; the
/// dispatcher never acks on its behalf.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Type name. Lowercased, it is the default queue suffix and the
    /// `app_id` on every publish.
    fn name(&self) -> &str;

    /// Keys expected under the payload's `dynamic` document, listed in
    /// missing-field failure reports
    fn dynamic_fields(&self) -> &[&'static str] {
        &[]
    }

    async fn process(&self, ctx: &mut DispatchContext<'_>) -> Result<(), HandlerError>;
}
