//! Collaborator traits consumed by the engine

use crate::correlation::CorrelationProperty;
use crate::errors::{HandlerError, SagaError};
use crate::{DispatchOutcome, IncomingMessage, SagaInvoker};
use async_trait::async_trait;

/// The downstream handler pipeline, opaque to the engine.
///
/// Invoked exactly once per dispatch after materialization. Handlers mutate
/// the mounted instances through the invokers and report per-instance
/// dispositions in the returned [`DispatchOutcome`]. An error aborts the
/// dispatch before anything is persisted.
#[async_trait]
pub trait HandlerPipeline: Send + Sync {
    /// Run the handlers for `message` against the materialized invokers.
    async fn run(
        &self,
        message: &IncomingMessage,
        invokers: &mut [SagaInvoker],
    ) -> Result<DispatchOutcome, HandlerError>;
}

/// Called when a message correlates to no instance and the saga type cannot
/// be initiated by it. The handler decides whether that is an error.
#[async_trait]
pub trait CorrelationErrorHandler: Send + Sync {
    /// React to an uncorrelatable message. Returning an error fails the
    /// dispatch; returning `Ok` drops the message for this saga.
    async fn handle(
        &self,
        properties: &[&CorrelationProperty],
        invoker: &SagaInvoker,
        message: &IncomingMessage,
    ) -> Result<(), SagaError>;
}

/// Default correlation-error handler: log a warning and drop.
pub struct LogAndDrop;

#[async_trait]
impl CorrelationErrorHandler for LogAndDrop {
    async fn handle(
        &self,
        properties: &[&CorrelationProperty],
        invoker: &SagaInvoker,
        message: &IncomingMessage,
    ) -> Result<(), SagaError> {
        let names: Vec<&str> = properties.iter().map(|p| p.name()).collect();
        tracing::warn!(
            saga_type = invoker.descriptor().saga_type(),
            message_type = message.type_name(),
            properties = ?names,
            "message correlates to no saga instance and cannot initiate one; dropping"
        );
        Ok(())
    }
}
