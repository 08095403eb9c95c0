//! Workflow-supplied conflict resolution

use crate::errors::HandlerError;
use crate::SagaData;
use async_trait::async_trait;
use std::marker::PhantomData;

/// Merge routine invoked when an update hits an optimistic-concurrency
/// conflict.
///
/// `current` is the dispatch's in-memory instance carrying the unsaved
/// changes; `fresh` is the authoritative copy just re-fetched from storage.
/// The routine merges the in-memory changes onto the fresh state; the engine
/// then adopts the fresh revision and retries the update.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Merge `current`'s changes against the freshly fetched `fresh` copy.
    async fn resolve(
        &self,
        current: &mut dyn SagaData,
        fresh: &dyn SagaData,
    ) -> Result<(), HandlerError>;
}

/// Adapter turning a typed merge closure into a [`ConflictResolver`].
///
/// Built through
/// [`SagaDescriptorBuilder::on_conflict`](crate::SagaDescriptorBuilder::on_conflict).
pub(crate) struct FnConflictResolver<D, F> {
    merge: F,
    _marker: PhantomData<fn(&mut D)>,
}

impl<D, F> FnConflictResolver<D, F> {
    pub(crate) fn new(merge: F) -> Self {
        Self {
            merge,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<D, F> ConflictResolver for FnConflictResolver<D, F>
where
    D: SagaData,
    F: Fn(&mut D, &D) + Send + Sync,
{
    async fn resolve(
        &self,
        current: &mut dyn SagaData,
        fresh: &dyn SagaData,
    ) -> Result<(), HandlerError> {
        let fresh = fresh
            .as_any()
            .downcast_ref::<D>()
            .ok_or_else(|| HandlerError::from("fresh saga data has an unexpected type"))?;
        let current = current
            .as_any_mut()
            .downcast_mut::<D>()
            .ok_or_else(|| HandlerError::from("current saga data has an unexpected type"))?;
        (self.merge)(current, fresh);
        Ok(())
    }
}
