//! Error types for correlation, persistence and conflict resolution

use crate::SagaId;

/// Opaque error raised by user-supplied code (handlers, resolvers).
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Opaque failure raised by a fallible correlation extractor.
pub type ExtractionFault = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure classes reported by a [`SagaStorage`](crate::SagaStorage) backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Optimistic-concurrency violation: the revision check failed, or an
    /// identity / unique correlation value already exists.
    #[error("optimistic concurrency conflict on saga {id}")]
    Conflict {
        /// The instance the conflicting operation targeted.
        id: SagaId,
    },
    /// Transport or backend failure, distinct from a logical conflict.
    /// Never retried by this engine.
    #[error("saga storage unavailable: {0}")]
    Unavailable(Box<str>),
}

/// Errors surfaced by the saga engine to the dispatch caller.
///
/// Only [`SagaError::Conflict`] on the update path is ever recovered, and only
/// when the saga type supplies a conflict resolver and the retry budget is not
/// exhausted. Everything else propagates so the surrounding redelivery
/// mechanism can take over.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    /// A correlation extractor failed while reading a value from a message.
    /// Programming error in the saga definition; never retried.
    #[error("correlation extractor for `{property}` failed on {message_type}: {cause}")]
    CorrelationExtraction {
        /// The saga-data property the failing rule correlates on.
        property: Box<str>,
        /// Concrete type of the message being read.
        message_type: &'static str,
        /// The extractor's failure.
        cause: ExtractionFault,
    },
    /// Storage-layer optimistic-concurrency violation that could not be
    /// (or was not allowed to be) resolved.
    #[error("optimistic concurrency conflict on saga {id}")]
    Conflict {
        /// The instance that could not be persisted.
        id: SagaId,
    },
    /// The instance being conflict-resolved no longer exists in storage;
    /// it was deleted concurrently and there is nothing to merge against.
    #[error("saga {id} was deleted concurrently during conflict resolution")]
    ResolutionTargetMissing {
        /// The vanished instance.
        id: SagaId,
    },
    /// Storage transport/backend failure, propagated unchanged.
    #[error("saga storage unavailable: {0}")]
    StorageUnavailable(Box<str>),
    /// The downstream handler pipeline failed; nothing was persisted.
    #[error("handler pipeline failed: {0}")]
    Handler(HandlerError),
}

impl From<StorageError> for SagaError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Conflict { id } => Self::Conflict { id },
            StorageError::Unavailable(reason) => Self::StorageUnavailable(reason),
        }
    }
}
