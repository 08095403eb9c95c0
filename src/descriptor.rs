//! Per-saga-type capability descriptor
//!
//! Everything the engine needs to know about a saga type is computed once at
//! registration and cached here: correlation rules, which message types may
//! initiate an instance, how to create a fresh instance, and whether the
//! workflow customizes conflict resolution. Dispatch never inspects runtime
//! types beyond a `TypeId` comparison.

use crate::correlation::{relevant_properties, CorrelationProperty, CorrelationValue};
use crate::errors::ExtractionFault;
use crate::resolution::{ConflictResolver, FnConflictResolver};
use crate::{IncomingMessage, SagaData};
use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

type FactoryFn = dyn Fn() -> Box<dyn SagaData> + Send + Sync;

/// Registration-time description of one saga type.
pub struct SagaDescriptor {
    saga_type: Box<str>,
    data_type: TypeId,
    correlation: Vec<CorrelationProperty>,
    initiated_by: HashSet<TypeId>,
    factory: Arc<FactoryFn>,
    resolver: Option<Arc<dyn ConflictResolver>>,
}

impl SagaDescriptor {
    /// Start building a descriptor for saga data type `D`.
    pub fn builder<D: SagaData + Default>(saga_type: &str) -> SagaDescriptorBuilder<D> {
        SagaDescriptorBuilder {
            saga_type: saga_type.into(),
            correlation: Vec::new(),
            initiated_by: HashSet::new(),
            resolver: None,
            _marker: PhantomData,
        }
    }

    /// Human-readable saga type name, used in logs.
    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    /// `TypeId` of the saga data type, used to scope storage lookups.
    pub fn data_type(&self) -> TypeId {
        self.data_type
    }

    /// All declared correlation rules, in declaration order.
    pub fn correlation_properties(&self) -> &[CorrelationProperty] {
        &self.correlation
    }

    /// Rules relevant to the concrete type of `message`, first-declared wins
    /// on duplicate property names.
    pub fn relevant_properties(&self, message: &IncomingMessage) -> Vec<&CorrelationProperty> {
        relevant_properties(&self.correlation, message)
    }

    /// Can a message of this concrete type create a new instance?
    pub fn can_be_initiated_by(&self, message_type: TypeId) -> bool {
        self.initiated_by.contains(&message_type)
    }

    /// Does this saga type customize conflict resolution?
    pub fn resolves_conflicts(&self) -> bool {
        self.resolver.is_some()
    }

    pub(crate) fn resolver(&self) -> Option<&Arc<dyn ConflictResolver>> {
        self.resolver.as_ref()
    }

    /// Allocate a blank instance. The engine assigns identity and revision.
    pub(crate) fn new_instance(&self) -> Box<dyn SagaData> {
        (self.factory)()
    }
}

impl std::fmt::Debug for SagaDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDescriptor")
            .field("saga_type", &self.saga_type)
            .field("correlation", &self.correlation)
            .field("resolves_conflicts", &self.resolver.is_some())
            .finish()
    }
}

/// Typed builder for [`SagaDescriptor`].
pub struct SagaDescriptorBuilder<D> {
    saga_type: Box<str>,
    correlation: Vec<CorrelationProperty>,
    initiated_by: HashSet<TypeId>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    _marker: PhantomData<fn() -> D>,
}

impl<D: SagaData + Default> SagaDescriptorBuilder<D> {
    /// Declare that a message of type `M` may initiate a new instance.
    pub fn initiated_by<M: Any + Send + Sync>(mut self) -> Self {
        self.initiated_by.insert(TypeId::of::<M>());
        self
    }

    /// Correlate messages of type `M` on `property`, extracting the lookup
    /// value with `extract`.
    pub fn correlate<M, F>(mut self, property: &str, extract: F) -> Self
    where
        M: Any + Send + Sync,
        F: Fn(&M) -> CorrelationValue + Send + Sync + 'static,
    {
        self.correlation
            .push(CorrelationProperty::new::<M, _>(property, extract));
        self
    }

    /// Like [`correlate`](Self::correlate) with a fallible extractor.
    pub fn try_correlate<M, F>(mut self, property: &str, extract: F) -> Self
    where
        M: Any + Send + Sync,
        F: Fn(&M) -> Result<CorrelationValue, ExtractionFault> + Send + Sync + 'static,
    {
        self.correlation
            .push(CorrelationProperty::try_new::<M, _>(property, extract));
        self
    }

    /// Correlate and additionally register a seeder writing the extracted
    /// value onto a newly created instance's correlating field.
    pub fn correlate_seeded<M, FE, FS>(mut self, property: &str, extract: FE, assign: FS) -> Self
    where
        M: Any + Send + Sync,
        FE: Fn(&M) -> CorrelationValue + Send + Sync + 'static,
        FS: Fn(&mut D, &CorrelationValue) + Send + Sync + 'static,
    {
        self.correlation.push(
            CorrelationProperty::new::<M, _>(property, extract).with_seed::<D, _>(assign),
        );
        self
    }

    /// Register the workflow's conflict-resolution merge routine.
    ///
    /// Without one, an update conflict surfaces immediately: blindly retrying
    /// would discard the concurrent writer's changes.
    pub fn on_conflict<F>(mut self, merge: F) -> Self
    where
        F: Fn(&mut D, &D) + Send + Sync + 'static,
    {
        self.resolver = Some(Arc::new(FnConflictResolver::<D, F>::new(merge)));
        self
    }

    /// Finish the descriptor.
    pub fn build(self) -> Arc<SagaDescriptor> {
        Arc::new(SagaDescriptor {
            saga_type: self.saga_type,
            data_type: TypeId::of::<D>(),
            correlation: self.correlation,
            initiated_by: self.initiated_by,
            factory: Arc::new(|| Box::new(D::default())),
            resolver: self.resolver,
        })
    }
}
