//! Saga identity and the persisted-instance contract

use serde::{Deserialize, Serialize};
use std::any::Any;
use uuid::Uuid;

/// Unique identifier for a persisted saga instance.
///
/// Assigned once when the instance is created and immutable afterwards.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SagaId(pub Uuid);

impl SagaId {
    /// Generate a fresh, globally unique identity.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the raw UUID value.
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Debug for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SagaId({})", self.0)
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contract implemented by every persisted workflow instance.
///
/// The `revision` counter belongs to the storage layer's optimistic-concurrency
/// mechanism. Application code must never hand-increment it; the engine only
/// replaces it wholesale when re-synchronizing after conflict resolution.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Clone, Debug, Default)]
/// pub struct OrderSaga {
///     id: SagaId,
///     revision: u64,
///     pub order_id: String,
///     pub items: Vec<String>,
/// }
///
/// impl SagaData for OrderSaga {
///     fn id(&self) -> SagaId { self.id }
///     fn set_id(&mut self, id: SagaId) { self.id = id; }
///     fn revision(&self) -> u64 { self.revision }
///     fn set_revision(&mut self, revision: u64) { self.revision = revision; }
///     fn boxed_clone(&self) -> Box<dyn SagaData> { Box::new(self.clone()) }
///     fn as_any(&self) -> &dyn Any { self }
///     fn as_any_mut(&mut self) -> &mut dyn Any { self }
/// }
/// ```
pub trait SagaData: Any + Send + Sync {
    /// The instance identity.
    fn id(&self) -> SagaId;

    /// Assign the identity. Called once by the engine at creation.
    fn set_id(&mut self, id: SagaId);

    /// Current optimistic-concurrency revision.
    fn revision(&self) -> u64;

    /// Replace the revision from an authoritative persisted copy.
    fn set_revision(&mut self, revision: u64);

    /// Clone into a new boxed instance.
    fn boxed_clone(&self) -> Box<dyn SagaData>;

    /// Upcast for typed read access.
    fn as_any(&self) -> &dyn Any;

    /// Upcast for typed mutable access.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
