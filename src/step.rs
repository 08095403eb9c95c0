//! The saga pipeline step: materialization, classification, persistence
//!
//! One [`SagaDataStep::process`] call covers a full dispatch: correlate the
//! incoming message to instances (loading or creating them), run the opaque
//! handler pipeline, classify each mounted instance from the pipeline's
//! outcome, then persist in a fixed order with the conflict-resolution retry
//! loop on the update path.

use crate::correlation::{CorrelationPropertyValue, CorrelationValue};
use crate::errors::{SagaError, StorageError};
use crate::invoker::MountOrigin;
use crate::pipeline::{CorrelationErrorHandler, HandlerPipeline, LogAndDrop};
use crate::stats::SagaStats;
use crate::storage::{SagaStorage, ID_PROPERTY};
use crate::{DispatchOutcome, IncomingMessage, SagaData, SagaDescriptor, SagaId, SagaInvoker};
use std::sync::Arc;

/// Default bound on extra update attempts after a conflict.
pub const DEFAULT_MAX_CONFLICT_ATTEMPTS: u32 = 3;

/// Dispatch-scoped association between a mounted instance and the
/// correlation values extracted for it.
struct RelevantSaga {
    invoker: usize,
    origin: MountOrigin,
    correlation: Vec<CorrelationPropertyValue>,
}

struct PersistencePlan {
    inserts: Vec<RelevantSaga>,
    updates: Vec<RelevantSaga>,
    deletes: Vec<RelevantSaga>,
}

/// The saga-data lifecycle step of an incoming-message pipeline.
pub struct SagaDataStep {
    storage: Arc<dyn SagaStorage>,
    correlation_errors: Arc<dyn CorrelationErrorHandler>,
    max_conflict_attempts: u32,
    stats: SagaStats,
}

impl SagaDataStep {
    /// Create a step over the given storage, with the [`LogAndDrop`]
    /// correlation-error handler and the default conflict budget.
    pub fn new(storage: Arc<dyn SagaStorage>) -> Self {
        Self {
            storage,
            correlation_errors: Arc::new(LogAndDrop),
            max_conflict_attempts: DEFAULT_MAX_CONFLICT_ATTEMPTS,
            stats: SagaStats::new(),
        }
    }

    /// Replace the correlation-error handler.
    pub fn with_correlation_error_handler(
        mut self,
        handler: Arc<dyn CorrelationErrorHandler>,
    ) -> Self {
        self.correlation_errors = handler;
        self
    }

    /// Bound the number of extra update attempts after a conflict.
    /// Total attempts per update are at most `attempts + 1`.
    pub fn with_max_conflict_attempts(mut self, attempts: u32) -> Self {
        self.max_conflict_attempts = attempts;
        self
    }

    /// The configured conflict budget.
    pub fn max_conflict_attempts(&self) -> u32 {
        self.max_conflict_attempts
    }

    /// Engine counters.
    pub fn stats(&self) -> &SagaStats {
        &self.stats
    }

    /// Process one dispatch end to end.
    ///
    /// Exactly one outcome per saga-capable invoker: loaded, newly created,
    /// or handed to the correlation-error handler. If the handler pipeline
    /// fails, nothing is persisted. The invokers come back to the caller,
    /// still carrying the post-handler instances; take them with
    /// [`SagaInvoker::take_data`].
    pub async fn process(
        &self,
        message: &IncomingMessage,
        mut invokers: Vec<SagaInvoker>,
        pipeline: &dyn HandlerPipeline,
    ) -> Result<Vec<SagaInvoker>, SagaError> {
        let mut relevant = Vec::new();
        for index in 0..invokers.len() {
            if let Some(info) = self.materialize(message, &mut invokers[index], index).await? {
                relevant.push(info);
            }
        }

        let outcome = pipeline
            .run(message, &mut invokers)
            .await
            .map_err(SagaError::Handler)?;

        let plan = classify(relevant, &invokers, &outcome);
        self.persist(plan, &mut invokers).await?;
        Ok(invokers)
    }

    /// Mount the instance this message correlates to, creating one when the
    /// saga type declares the message initiating.
    async fn materialize(
        &self,
        message: &IncomingMessage,
        invoker: &mut SagaInvoker,
        index: usize,
    ) -> Result<Option<RelevantSaga>, SagaError> {
        let descriptor = Arc::clone(invoker.descriptor());
        let properties = descriptor.relevant_properties(message);

        // Extraction is interleaved with lookups: a later rule's extractor
        // never runs once an earlier rule matched an instance.
        let mut extracted: Vec<CorrelationPropertyValue> = Vec::with_capacity(properties.len());
        for property in &properties {
            let value = property.extract(message)?;
            extracted.push(CorrelationPropertyValue {
                name: property.name().into(),
                value: value.clone(),
            });

            if let Some(found) = self
                .storage
                .find(descriptor.data_type(), property.name(), &value)
                .await?
            {
                tracing::debug!(
                    saga_type = descriptor.saga_type(),
                    saga_id = %found.id(),
                    property = property.name(),
                    "loaded saga instance"
                );
                invoker.mount(found, MountOrigin::Loaded);
                SagaStats::bump(&self.stats.instances_loaded);
                return Ok(Some(RelevantSaga {
                    invoker: index,
                    origin: MountOrigin::Loaded,
                    correlation: extracted,
                }));
            }
        }

        if descriptor.can_be_initiated_by(message.type_id()) {
            let mut data = descriptor.new_instance();
            data.set_id(SagaId::fresh());
            data.set_revision(0);
            // Seed the correlating field only when it is unambiguous.
            if properties.len() == 1 {
                if let Some(pair) = extracted.first() {
                    properties[0].seed_into(data.as_any_mut(), &pair.value);
                }
            }
            tracing::debug!(
                saga_type = descriptor.saga_type(),
                saga_id = %data.id(),
                "created new saga instance"
            );
            invoker.mount(data, MountOrigin::Created);
            SagaStats::bump(&self.stats.instances_created);
            return Ok(Some(RelevantSaga {
                invoker: index,
                origin: MountOrigin::Created,
                correlation: extracted,
            }));
        }

        self.correlation_errors
            .handle(&properties, invoker, message)
            .await?;
        SagaStats::bump(&self.stats.uncorrelated_messages);
        Ok(None)
    }

    /// Persist the classified buckets: inserts, then updates, then deletes,
    /// so a dispatch that creates one instance and completes another never
    /// races with itself.
    async fn persist(
        &self,
        plan: PersistencePlan,
        invokers: &mut [SagaInvoker],
    ) -> Result<(), SagaError> {
        for info in &plan.inserts {
            let Some(data) = invokers[info.invoker].data() else {
                continue;
            };
            match self.storage.insert(data, &info.correlation).await {
                Ok(()) => SagaStats::bump(&self.stats.inserts),
                Err(StorageError::Conflict { id }) => {
                    // Re-correlating after the fact could reorder instances;
                    // insert conflicts are never retried.
                    SagaStats::bump(&self.stats.conflicts_surfaced);
                    return Err(SagaError::Conflict { id });
                }
                Err(error) => return Err(error.into()),
            }
        }

        for info in &plan.updates {
            let invoker = &mut invokers[info.invoker];
            let descriptor = Arc::clone(invoker.descriptor());
            let Some(data) = invoker.data_boxed_mut() else {
                continue;
            };
            self.update_with_resolution(&descriptor, data, &info.correlation)
                .await?;
        }

        for info in &plan.deletes {
            let Some(data) = invokers[info.invoker].data() else {
                continue;
            };
            let id = data.id();
            self.storage.delete(data).await?;
            SagaStats::bump(&self.stats.deletes);
            tracing::debug!(saga_id = %id, "deleted completed saga instance");
        }

        Ok(())
    }

    /// The update path of the conflict-resolution loop:
    /// `ATTEMPT -> SUCCESS | ATTEMPT -> CONFLICT -> {RESOLVE -> ATTEMPT} | FAILURE`.
    async fn update_with_resolution(
        &self,
        descriptor: &SagaDescriptor,
        data: &mut Box<dyn SagaData>,
        correlation: &[CorrelationPropertyValue],
    ) -> Result<(), SagaError> {
        let mut extra_attempts = 0u32;
        loop {
            match self.storage.update(data.as_ref(), correlation).await {
                Ok(()) => {
                    SagaStats::bump(&self.stats.updates);
                    return Ok(());
                }
                Err(StorageError::Conflict { id }) => {
                    let Some(resolver) = descriptor.resolver() else {
                        // A blind retry would discard the concurrent
                        // writer's changes.
                        SagaStats::bump(&self.stats.conflicts_surfaced);
                        return Err(SagaError::Conflict { id });
                    };
                    if extra_attempts >= self.max_conflict_attempts {
                        SagaStats::bump(&self.stats.conflicts_surfaced);
                        return Err(SagaError::Conflict { id });
                    }
                    extra_attempts += 1;

                    let fresh = self
                        .storage
                        .find(descriptor.data_type(), ID_PROPERTY, &CorrelationValue::from(id))
                        .await?
                        .ok_or(SagaError::ResolutionTargetMissing { id })?;
                    tracing::debug!(
                        saga_type = descriptor.saga_type(),
                        saga_id = %id,
                        attempt = extra_attempts + 1,
                        "resolving update conflict against fresh copy"
                    );
                    resolver
                        .resolve(data.as_mut(), fresh.as_ref())
                        .await
                        .map_err(SagaError::Handler)?;
                    data.set_revision(fresh.revision());
                    SagaStats::bump(&self.stats.conflicts_resolved);
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

/// Bucket each mounted instance by origin and the pipeline's flags.
/// Completeness wins when an instance is marked both complete and unchanged;
/// a created-and-completed instance was never persisted, so nothing happens.
fn classify(
    relevant: Vec<RelevantSaga>,
    invokers: &[SagaInvoker],
    outcome: &DispatchOutcome,
) -> PersistencePlan {
    let mut plan = PersistencePlan {
        inserts: Vec::new(),
        updates: Vec::new(),
        deletes: Vec::new(),
    };
    for info in relevant {
        let Some(id) = invokers[info.invoker].saga_id() else {
            continue;
        };
        let complete = outcome.is_marked_complete(id);
        let unchanged = outcome.is_marked_unchanged(id);
        match info.origin {
            MountOrigin::Created if complete || unchanged => {}
            MountOrigin::Created => plan.inserts.push(info),
            MountOrigin::Loaded if complete => plan.deletes.push(info),
            MountOrigin::Loaded if unchanged => {}
            MountOrigin::Loaded => plan.updates.push(info),
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HandlerError;
    use crate::memory::InMemorySagaStorage;
    use std::any::{Any, TypeId};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Debug, Default)]
    struct Tally {
        id: SagaId,
        revision: u64,
        key: String,
        seen: Vec<String>,
    }

    impl SagaData for Tally {
        fn id(&self) -> SagaId {
            self.id
        }
        fn set_id(&mut self, id: SagaId) {
            self.id = id;
        }
        fn revision(&self) -> u64 {
            self.revision
        }
        fn set_revision(&mut self, revision: u64) {
            self.revision = revision;
        }
        fn boxed_clone(&self) -> Box<dyn SagaData> {
            Box::new(self.clone())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Line {
        text: String,
    }

    fn line_key(text: &str) -> &str {
        text.split('/').next().unwrap_or("")
    }

    fn descriptor() -> Arc<SagaDescriptor> {
        SagaDescriptor::builder::<Tally>("tally")
            .initiated_by::<Line>()
            .correlate_seeded::<Line, _, _>(
                "key",
                |m: &Line| line_key(&m.text).into(),
                |data, value| {
                    if let Some(key) = value.0.as_str() {
                        data.key = key.to_owned();
                    }
                },
            )
            .build()
    }

    fn non_initiating_descriptor() -> Arc<SagaDescriptor> {
        SagaDescriptor::builder::<Tally>("tally")
            .correlate::<Line, _>("key", |m: &Line| line_key(&m.text).into())
            .build()
    }

    fn resolving_descriptor() -> Arc<SagaDescriptor> {
        SagaDescriptor::builder::<Tally>("tally")
            .initiated_by::<Line>()
            .correlate::<Line, _>("key", |m: &Line| line_key(&m.text).into())
            .on_conflict(|current: &mut Tally, fresh: &Tally| {
                for entry in &fresh.seen {
                    if !current.seen.contains(entry) {
                        current.seen.push(entry.clone());
                    }
                }
            })
            .build()
    }

    /// Appends the message text to every mounted tally.
    struct RecordingPipeline;

    #[async_trait::async_trait]
    impl HandlerPipeline for RecordingPipeline {
        async fn run(
            &self,
            message: &IncomingMessage,
            invokers: &mut [SagaInvoker],
        ) -> Result<DispatchOutcome, HandlerError> {
            let line = message.body::<Line>().ok_or("unexpected message type")?;
            for invoker in invokers.iter_mut() {
                if let Some(tally) = invoker.data_as_mut::<Tally>() {
                    tally.seen.push(line.text.clone());
                }
            }
            Ok(DispatchOutcome::new())
        }
    }

    enum Verdict {
        Complete,
        Unchanged,
        Both,
    }

    /// Flags every mounted instance with the configured verdict.
    struct FlaggingPipeline(Verdict);

    #[async_trait::async_trait]
    impl HandlerPipeline for FlaggingPipeline {
        async fn run(
            &self,
            _message: &IncomingMessage,
            invokers: &mut [SagaInvoker],
        ) -> Result<DispatchOutcome, HandlerError> {
            let mut outcome = DispatchOutcome::new();
            for invoker in invokers.iter() {
                if let Some(id) = invoker.saga_id() {
                    match self.0 {
                        Verdict::Complete => outcome.mark_complete(id),
                        Verdict::Unchanged => outcome.mark_unchanged(id),
                        Verdict::Both => {
                            outcome.mark_complete(id);
                            outcome.mark_unchanged(id);
                        }
                    }
                }
            }
            Ok(outcome)
        }
    }

    struct FailingPipeline;

    #[async_trait::async_trait]
    impl HandlerPipeline for FailingPipeline {
        async fn run(
            &self,
            _message: &IncomingMessage,
            _invokers: &mut [SagaInvoker],
        ) -> Result<DispatchOutcome, HandlerError> {
            Err("handler blew up".into())
        }
    }

    /// Delegates to an in-memory store while counting write calls.
    #[derive(Default)]
    struct CountingStorage {
        inner: InMemorySagaStorage,
        inserts: AtomicU64,
        updates: AtomicU64,
        deletes: AtomicU64,
    }

    #[async_trait::async_trait]
    impl SagaStorage for CountingStorage {
        async fn find(
            &self,
            data_type: TypeId,
            property_name: &str,
            value: &CorrelationValue,
        ) -> Result<Option<Box<dyn SagaData>>, StorageError> {
            self.inner.find(data_type, property_name, value).await
        }

        async fn insert(
            &self,
            data: &dyn SagaData,
            correlation: &[CorrelationPropertyValue],
        ) -> Result<(), StorageError> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            self.inner.insert(data, correlation).await
        }

        async fn update(
            &self,
            data: &dyn SagaData,
            correlation: &[CorrelationPropertyValue],
        ) -> Result<(), StorageError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.inner.update(data, correlation).await
        }

        async fn delete(&self, data: &dyn SagaData) -> Result<(), StorageError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(data).await
        }
    }

    /// Always conflicts on update; `find` serves the template instance both
    /// for materialization and for the resolution re-fetch.
    struct ConflictingStorage {
        template: Mutex<Tally>,
        update_attempts: AtomicU64,
        vanish_on_refetch: bool,
    }

    impl ConflictingStorage {
        fn new(template: Tally) -> Self {
            Self {
                template: Mutex::new(template),
                update_attempts: AtomicU64::new(0),
                vanish_on_refetch: false,
            }
        }

        fn vanishing(template: Tally) -> Self {
            Self {
                vanish_on_refetch: true,
                ..Self::new(template)
            }
        }
    }

    #[async_trait::async_trait]
    impl SagaStorage for ConflictingStorage {
        async fn find(
            &self,
            _data_type: TypeId,
            property_name: &str,
            _value: &CorrelationValue,
        ) -> Result<Option<Box<dyn SagaData>>, StorageError> {
            if property_name == ID_PROPERTY && self.vanish_on_refetch {
                return Ok(None);
            }
            let template = self.template.lock().unwrap().clone();
            Ok(Some(Box::new(template)))
        }

        async fn insert(
            &self,
            _data: &dyn SagaData,
            _correlation: &[CorrelationPropertyValue],
        ) -> Result<(), StorageError> {
            Ok(())
        }

        async fn update(
            &self,
            data: &dyn SagaData,
            _correlation: &[CorrelationPropertyValue],
        ) -> Result<(), StorageError> {
            self.update_attempts.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Conflict { id: data.id() })
        }

        async fn delete(&self, _data: &dyn SagaData) -> Result<(), StorageError> {
            Ok(())
        }
    }

    /// Rejects every insert with a conflict.
    #[derive(Default)]
    struct InsertConflictStorage {
        insert_attempts: AtomicU64,
    }

    #[async_trait::async_trait]
    impl SagaStorage for InsertConflictStorage {
        async fn find(
            &self,
            _data_type: TypeId,
            _property_name: &str,
            _value: &CorrelationValue,
        ) -> Result<Option<Box<dyn SagaData>>, StorageError> {
            Ok(None)
        }

        async fn insert(
            &self,
            data: &dyn SagaData,
            _correlation: &[CorrelationPropertyValue],
        ) -> Result<(), StorageError> {
            self.insert_attempts.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Conflict { id: data.id() })
        }

        async fn update(
            &self,
            _data: &dyn SagaData,
            _correlation: &[CorrelationPropertyValue],
        ) -> Result<(), StorageError> {
            Ok(())
        }

        async fn delete(&self, _data: &dyn SagaData) -> Result<(), StorageError> {
            Ok(())
        }
    }

    struct CountingCorrelationErrors(AtomicU64);

    #[async_trait::async_trait]
    impl CorrelationErrorHandler for CountingCorrelationErrors {
        async fn handle(
            &self,
            _properties: &[&crate::CorrelationProperty],
            _invoker: &SagaInvoker,
            _message: &IncomingMessage,
        ) -> Result<(), SagaError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn init_tracing() {
        use std::sync::Once;
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }

    async fn dispatch(
        step: &SagaDataStep,
        descriptor: &Arc<SagaDescriptor>,
        text: &str,
        pipeline: &dyn HandlerPipeline,
    ) -> Result<Vec<SagaInvoker>, SagaError> {
        init_tracing();
        let message = IncomingMessage::new(Line { text: text.into() });
        let invokers = vec![SagaInvoker::new(Arc::clone(descriptor))];
        step.process(&message, invokers, pipeline).await
    }

    async fn tally_by_key(storage: &InMemorySagaStorage, key: &str) -> Option<Tally> {
        let found = storage
            .find(TypeId::of::<Tally>(), "key", &key.into())
            .await
            .unwrap()?;
        Some(found.as_any().downcast_ref::<Tally>().unwrap().clone())
    }

    #[tokio::test]
    async fn matching_message_loads_instead_of_creating() {
        let storage = Arc::new(InMemorySagaStorage::new());
        let step = SagaDataStep::new(storage.clone());
        let descriptor = descriptor();

        dispatch(&step, &descriptor, "a/1", &RecordingPipeline)
            .await
            .unwrap();
        dispatch(&step, &descriptor, "a/2", &RecordingPipeline)
            .await
            .unwrap();

        assert_eq!(storage.len().await, 1);
        let snapshot = step.stats().snapshot();
        assert_eq!(snapshot.instances_created, 1);
        assert_eq!(snapshot.instances_loaded, 1);
    }

    #[tokio::test]
    async fn initiating_message_creates_with_revision_zero_and_unique_identity() {
        let storage = Arc::new(InMemorySagaStorage::new());
        let step = SagaDataStep::new(storage.clone());
        let descriptor = descriptor();

        dispatch(&step, &descriptor, "a/1", &RecordingPipeline)
            .await
            .unwrap();
        dispatch(&step, &descriptor, "b/1", &RecordingPipeline)
            .await
            .unwrap();

        let a = tally_by_key(&storage, "a").await.unwrap();
        let b = tally_by_key(&storage, "b").await.unwrap();
        assert_eq!(a.revision, 0);
        assert_eq!(b.revision, 0);
        assert_ne!(a.id, b.id);
        // Seeded from the single relevant correlation property.
        assert_eq!(a.key, "a");
        assert_eq!(b.key, "b");
    }

    #[tokio::test]
    async fn dispatch_hands_back_invokers_with_the_post_handler_data() {
        let storage = Arc::new(InMemorySagaStorage::new());
        let step = SagaDataStep::new(storage.clone());

        let mut invokers = dispatch(&step, &descriptor(), "a/1", &RecordingPipeline)
            .await
            .unwrap();

        assert_eq!(invokers.len(), 1);
        assert!(invokers[0].is_new());
        let data = invokers[0].take_data().expect("instance stays mounted");
        assert!(!invokers[0].is_mounted());
        assert!(invokers[0].take_data().is_none());

        let tally = data.as_any().downcast_ref::<Tally>().unwrap();
        assert_eq!(tally.seen, vec!["a/1".to_string()]);
        assert_eq!(tally.key, "a");
    }

    #[tokio::test]
    async fn uncorrelated_message_goes_to_the_error_handler_once() {
        let storage = Arc::new(InMemorySagaStorage::new());
        let handler = Arc::new(CountingCorrelationErrors(AtomicU64::new(0)));
        let step = SagaDataStep::new(storage.clone())
            .with_correlation_error_handler(handler.clone());

        dispatch(
            &step,
            &non_initiating_descriptor(),
            "a/1",
            &RecordingPipeline,
        )
        .await
        .unwrap();

        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
        assert!(storage.is_empty().await);
        assert_eq!(step.stats().snapshot().uncorrelated_messages, 1);
    }

    #[tokio::test]
    async fn unchanged_instance_is_never_written() {
        let storage = Arc::new(CountingStorage::default());
        let step = SagaDataStep::new(storage.clone());
        let descriptor = descriptor();

        dispatch(&step, &descriptor, "a/1", &RecordingPipeline)
            .await
            .unwrap();
        dispatch(
            &step,
            &descriptor,
            "a/2",
            &FlaggingPipeline(Verdict::Unchanged),
        )
        .await
        .unwrap();

        assert_eq!(storage.inserts.load(Ordering::SeqCst), 1);
        assert_eq!(storage.updates.load(Ordering::SeqCst), 0);
        assert_eq!(storage.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn completed_loaded_instance_is_deleted_not_updated() {
        let storage = Arc::new(CountingStorage::default());
        let step = SagaDataStep::new(storage.clone());
        let descriptor = descriptor();

        dispatch(&step, &descriptor, "a/1", &RecordingPipeline)
            .await
            .unwrap();
        dispatch(
            &step,
            &descriptor,
            "a/2",
            &FlaggingPipeline(Verdict::Complete),
        )
        .await
        .unwrap();

        assert_eq!(storage.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(storage.updates.load(Ordering::SeqCst), 0);
        assert!(storage.inner.is_empty().await);
    }

    #[tokio::test]
    async fn created_and_completed_instance_is_never_persisted() {
        let storage = Arc::new(CountingStorage::default());
        let step = SagaDataStep::new(storage.clone());

        dispatch(
            &step,
            &descriptor(),
            "a/1",
            &FlaggingPipeline(Verdict::Complete),
        )
        .await
        .unwrap();

        assert_eq!(storage.inserts.load(Ordering::SeqCst), 0);
        assert_eq!(storage.deletes.load(Ordering::SeqCst), 0);
        assert!(storage.inner.is_empty().await);
    }

    #[tokio::test]
    async fn completeness_wins_over_unchanged() {
        let storage = Arc::new(CountingStorage::default());
        let step = SagaDataStep::new(storage.clone());
        let descriptor = descriptor();

        dispatch(&step, &descriptor, "a/1", &RecordingPipeline)
            .await
            .unwrap();
        dispatch(&step, &descriptor, "a/2", &FlaggingPipeline(Verdict::Both))
            .await
            .unwrap();

        assert_eq!(storage.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(storage.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn update_conflicts_retry_exactly_max_plus_one_times() {
        let template = Tally {
            id: SagaId::fresh(),
            revision: 0,
            key: "a".into(),
            seen: Vec::new(),
        };
        let storage = Arc::new(ConflictingStorage::new(template));
        let step = SagaDataStep::new(storage.clone()).with_max_conflict_attempts(3);

        let error = dispatch(&step, &resolving_descriptor(), "a/9", &RecordingPipeline)
            .await
            .unwrap_err();

        assert!(matches!(error, SagaError::Conflict { .. }));
        assert_eq!(storage.update_attempts.load(Ordering::SeqCst), 4);
        let snapshot = step.stats().snapshot();
        assert_eq!(snapshot.conflicts_resolved, 3);
        assert_eq!(snapshot.conflicts_surfaced, 1);
    }

    #[tokio::test]
    async fn conflict_without_resolver_surfaces_immediately() {
        let template = Tally {
            id: SagaId::fresh(),
            revision: 0,
            key: "a".into(),
            seen: Vec::new(),
        };
        let storage = Arc::new(ConflictingStorage::new(template));
        let step = SagaDataStep::new(storage.clone());

        let error = dispatch(&step, &descriptor(), "a/9", &RecordingPipeline)
            .await
            .unwrap_err();

        assert!(matches!(error, SagaError::Conflict { .. }));
        assert_eq!(storage.update_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrently_deleted_resolution_target_is_fatal() {
        let template = Tally {
            id: SagaId::fresh(),
            revision: 0,
            key: "a".into(),
            seen: Vec::new(),
        };
        let storage = Arc::new(ConflictingStorage::vanishing(template));
        let step = SagaDataStep::new(storage.clone());

        let error = dispatch(&step, &resolving_descriptor(), "a/9", &RecordingPipeline)
            .await
            .unwrap_err();

        assert!(matches!(error, SagaError::ResolutionTargetMissing { .. }));
        assert_eq!(storage.update_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn insert_conflict_is_never_retried() {
        let storage = Arc::new(InsertConflictStorage::default());
        let step = SagaDataStep::new(storage.clone());

        let error = dispatch(&step, &resolving_descriptor(), "a/1", &RecordingPipeline)
            .await
            .unwrap_err();

        assert!(matches!(error, SagaError::Conflict { .. }));
        assert_eq!(storage.insert_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_failure_aborts_all_persistence() {
        let storage = Arc::new(InMemorySagaStorage::new());
        let step = SagaDataStep::new(storage.clone());

        let error = dispatch(&step, &descriptor(), "a/1", &FailingPipeline)
            .await
            .unwrap_err();

        assert!(matches!(error, SagaError::Handler(_)));
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn slash_scenario_groups_messages_by_prefix() {
        let storage = Arc::new(InMemorySagaStorage::new());
        let step = SagaDataStep::new(storage.clone());
        let descriptor = descriptor();

        for text in ["a/1", "a/2", "b/1"] {
            dispatch(&step, &descriptor, text, &RecordingPipeline)
                .await
                .unwrap();
        }

        assert_eq!(storage.len().await, 2);
        let a = tally_by_key(&storage, "a").await.unwrap();
        let b = tally_by_key(&storage, "b").await.unwrap();
        assert_eq!(a.seen, vec!["a/1".to_string(), "a/2".to_string()]);
        assert_eq!(b.seen, vec!["b/1".to_string()]);
        // "a" took one update on top of its insert; "b" was only inserted.
        assert_eq!(a.revision, 1);
        assert_eq!(b.revision, 0);
    }

    #[tokio::test]
    async fn update_strictly_increases_the_persisted_revision() {
        let storage = Arc::new(InMemorySagaStorage::new());
        let step = SagaDataStep::new(storage.clone());
        let descriptor = descriptor();

        dispatch(&step, &descriptor, "a/1", &RecordingPipeline)
            .await
            .unwrap();
        let before = tally_by_key(&storage, "a").await.unwrap().revision;

        dispatch(&step, &descriptor, "a/2", &RecordingPipeline)
            .await
            .unwrap();
        let after = tally_by_key(&storage, "a").await.unwrap().revision;

        assert!(after > before);
    }
}
