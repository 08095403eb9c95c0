//! Saga-capable handler invoker, scoped to one dispatch

use crate::{SagaData, SagaDescriptor, SagaId};
use std::any::TypeId;
use std::sync::Arc;

/// How a mounted instance came to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountOrigin {
    /// Found in storage via a correlation property.
    Loaded,
    /// Freshly created for an initiating message.
    Created,
}

/// One saga-capable handler attached to the current message dispatch.
///
/// The engine mounts the materialized instance here before the handler
/// pipeline runs; handlers mutate it through [`data_as_mut`](Self::data_as_mut).
/// Invokers are discarded when the dispatch ends.
pub struct SagaInvoker {
    descriptor: Arc<SagaDescriptor>,
    data: Option<Box<dyn SagaData>>,
    origin: Option<MountOrigin>,
}

impl SagaInvoker {
    /// Attach a handler for the given saga type to the current dispatch.
    pub fn new(descriptor: Arc<SagaDescriptor>) -> Self {
        Self {
            descriptor,
            data: None,
            origin: None,
        }
    }

    /// The saga type this invoker handles.
    pub fn descriptor(&self) -> &Arc<SagaDescriptor> {
        &self.descriptor
    }

    /// Can this saga be initiated by a message of the given concrete type?
    pub fn can_be_initiated_by(&self, message_type: TypeId) -> bool {
        self.descriptor.can_be_initiated_by(message_type)
    }

    /// Mount a materialized instance.
    pub fn mount(&mut self, data: Box<dyn SagaData>, origin: MountOrigin) {
        self.data = Some(data);
        self.origin = Some(origin);
    }

    /// Is an instance mounted?
    pub fn is_mounted(&self) -> bool {
        self.data.is_some()
    }

    /// Was the mounted instance created for this dispatch (rather than
    /// loaded from storage)?
    pub fn is_new(&self) -> bool {
        self.origin == Some(MountOrigin::Created)
    }

    /// How the mounted instance was materialized, if any.
    pub fn origin(&self) -> Option<MountOrigin> {
        self.origin
    }

    /// Identity of the mounted instance, if any.
    pub fn saga_id(&self) -> Option<SagaId> {
        self.data.as_deref().map(|data| data.id())
    }

    /// The mounted instance.
    pub fn data(&self) -> Option<&dyn SagaData> {
        self.data.as_deref()
    }

    /// Typed read access to the mounted instance.
    pub fn data_as<D: SagaData>(&self) -> Option<&D> {
        self.data.as_deref()?.as_any().downcast_ref::<D>()
    }

    /// Typed mutable access to the mounted instance.
    pub fn data_as_mut<D: SagaData>(&mut self) -> Option<&mut D> {
        self.data.as_deref_mut()?.as_any_mut().downcast_mut::<D>()
    }

    /// Remove and return the mounted instance, leaving the invoker
    /// unmounted. Lets the dispatch caller keep the post-handler saga data
    /// after the step has persisted it.
    pub fn take_data(&mut self) -> Option<Box<dyn SagaData>> {
        self.origin = None;
        self.data.take()
    }

    pub(crate) fn data_boxed_mut(&mut self) -> Option<&mut Box<dyn SagaData>> {
        self.data.as_mut()
    }
}

impl std::fmt::Debug for SagaInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaInvoker")
            .field("saga_type", &self.descriptor.saga_type())
            .field("mounted", &self.is_mounted())
            .field("origin", &self.origin)
            .finish()
    }
}
