//! Saga Correlation & Persistence Engine
//!
//! The stateful-workflow (saga) step of an incoming-message pipeline: given
//! a message, find which long-lived workflow instances it belongs to, load or
//! create them, let the handler pipeline mutate them, then persist the result
//! with optimistic-concurrency safety across concurrently consuming workers.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // 1. Define your saga data and implement SagaData (boilerplate)
//! #[derive(Clone, Debug, Default)]
//! struct OrderSaga { id: SagaId, revision: u64, order_id: String, /* ... */ }
//! impl SagaData for OrderSaga { /* ... */ }
//!
//! // 2. Register correlation rules and capabilities once
//! let descriptor = SagaDescriptor::builder::<OrderSaga>("order_saga")
//!     .initiated_by::<OrderPlaced>()
//!     .correlate_seeded::<OrderPlaced, _, _>(
//!         "order_id",
//!         |m| m.order_id.as_str().into(),
//!         |data, value| data.order_id = value.to_string(),
//!     )
//!     .on_conflict(|current: &mut OrderSaga, fresh: &OrderSaga| { /* merge */ })
//!     .build();
//!
//! // 3. Run the step for each incoming message
//! let step = SagaDataStep::new(storage);
//! let invokers = vec![SagaInvoker::new(descriptor.clone())];
//! let invokers = step.process(&message, invokers, &pipeline).await?;
//! ```

#![warn(missing_docs)]

// === Core Types ===
mod correlation;
mod data;
mod errors;
mod message;
mod outcome;

// === Registration ===
mod descriptor;
mod invoker;

// === Collaborator Traits ===
mod pipeline;
mod resolution;
mod storage;

// === Storage ===
mod memory;

// === Observability ===
mod stats;

// === Engine ===
mod step;

// === Re-exports ===

// Types
pub use correlation::{
    relevant_properties, CorrelationProperty, CorrelationPropertyValue, CorrelationValue,
};
pub use data::{SagaData, SagaId};
pub use message::IncomingMessage;
pub use outcome::DispatchOutcome;

// Registration
pub use descriptor::{SagaDescriptor, SagaDescriptorBuilder};
pub use invoker::{MountOrigin, SagaInvoker};

// Errors
pub use errors::{ExtractionFault, HandlerError, SagaError, StorageError};

// Traits
pub use pipeline::{CorrelationErrorHandler, HandlerPipeline, LogAndDrop};
pub use resolution::ConflictResolver;
pub use storage::{SagaStorage, ID_PROPERTY};

// Storage
pub use memory::InMemorySagaStorage;

// Observability
pub use stats::{SagaStats, SagaStatsSnapshot};

// Engine
pub use step::{SagaDataStep, DEFAULT_MAX_CONFLICT_ATTEMPTS};
