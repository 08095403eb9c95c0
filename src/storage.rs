//! Durable saga storage contract

use crate::correlation::{CorrelationPropertyValue, CorrelationValue};
use crate::errors::StorageError;
use crate::SagaData;
use async_trait::async_trait;
use std::any::TypeId;

/// Pseudo-property naming the instance identity, used to re-fetch the
/// authoritative copy during conflict resolution.
pub const ID_PROPERTY: &str = "id";

/// Contract a durable store must satisfy.
///
/// Implementations enforce optimistic concurrency by comparing and
/// atomically incrementing the revision counter on update, and by rejecting
/// inserts whose identity or unique correlation value already exists. Every
/// call is a suspension point; callers must not assume synchronous
/// completion. This engine never retries [`StorageError::Unavailable`].
#[async_trait]
pub trait SagaStorage: Send + Sync {
    /// Look up an instance of `data_type` whose `property_name` holds
    /// `value`. [`ID_PROPERTY`] addresses the identity itself.
    async fn find(
        &self,
        data_type: TypeId,
        property_name: &str,
        value: &CorrelationValue,
    ) -> Result<Option<Box<dyn SagaData>>, StorageError>;

    /// Persist a new instance together with its correlation index values.
    async fn insert(
        &self,
        data: &dyn SagaData,
        correlation: &[CorrelationPropertyValue],
    ) -> Result<(), StorageError>;

    /// Persist changes to an existing instance. Fails with
    /// [`StorageError::Conflict`] when the revision check fails.
    async fn update(
        &self,
        data: &dyn SagaData,
        correlation: &[CorrelationPropertyValue],
    ) -> Result<(), StorageError>;

    /// Remove an instance.
    async fn delete(&self, data: &dyn SagaData) -> Result<(), StorageError>;
}
