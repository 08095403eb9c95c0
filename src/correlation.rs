//! Correlation rules and the pure matching index
//!
//! A correlation property is a declared rule mapping a field of one message
//! type onto a named property of the saga data, used as the lookup key when
//! materializing instances. The index functions here are pure: they never
//! touch storage.

use crate::errors::{ExtractionFault, SagaError};
use crate::{IncomingMessage, SagaData, SagaId};
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::sync::Arc;

/// A correlation lookup value, extracted from a message at dispatch time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationValue(pub serde_json::Value);

impl std::fmt::Display for CorrelationValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<serde_json::Value> for CorrelationValue {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationValue {
    fn from(value: &str) -> Self {
        Self(serde_json::Value::String(value.to_owned()))
    }
}

impl From<String> for CorrelationValue {
    fn from(value: String) -> Self {
        Self(serde_json::Value::String(value))
    }
}

impl From<u64> for CorrelationValue {
    fn from(value: u64) -> Self {
        Self(serde_json::Value::from(value))
    }
}

impl From<i64> for CorrelationValue {
    fn from(value: i64) -> Self {
        Self(serde_json::Value::from(value))
    }
}

impl From<uuid::Uuid> for CorrelationValue {
    fn from(value: uuid::Uuid) -> Self {
        Self(serde_json::Value::String(value.to_string()))
    }
}

impl From<SagaId> for CorrelationValue {
    fn from(value: SagaId) -> Self {
        Self::from(value.get())
    }
}

/// A `(property name, value)` pair extracted from a concrete message,
/// handed to storage as index payload on insert and update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationPropertyValue {
    /// The saga-data property name.
    pub name: Box<str>,
    /// The extracted value.
    pub value: CorrelationValue,
}

type ExtractFn =
    dyn Fn(&IncomingMessage) -> Result<CorrelationValue, ExtractionFault> + Send + Sync;
type SeedFn = dyn Fn(&mut dyn Any, &CorrelationValue) + Send + Sync;

/// A declared correlation rule: one message type, one extractor, one
/// saga-data property name.
///
/// The optional seeder is an explicit, compile-time-checked assignment of the
/// extracted value onto a freshly created instance's correlating field. It is
/// best-effort: a missing seeder means the workflow author populates the field
/// themselves.
#[derive(Clone)]
pub struct CorrelationProperty {
    name: Box<str>,
    message_type: TypeId,
    message_type_name: &'static str,
    extract: Arc<ExtractFn>,
    seed: Option<Arc<SeedFn>>,
}

impl CorrelationProperty {
    /// Declare a rule with an infallible extractor over message type `M`.
    pub fn new<M, F>(name: &str, extract: F) -> Self
    where
        M: Any + Send + Sync,
        F: Fn(&M) -> CorrelationValue + Send + Sync + 'static,
    {
        Self::try_new::<M, _>(name, move |message| Ok(extract(message)))
    }

    /// Declare a rule with a fallible extractor; failures propagate as
    /// [`SagaError::CorrelationExtraction`] and are never retried.
    pub fn try_new<M, F>(name: &str, extract: F) -> Self
    where
        M: Any + Send + Sync,
        F: Fn(&M) -> Result<CorrelationValue, ExtractionFault> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            message_type: TypeId::of::<M>(),
            message_type_name: std::any::type_name::<M>(),
            extract: Arc::new(move |message: &IncomingMessage| match message.body::<M>() {
                Some(body) => extract(body),
                None => Err(format!(
                    "message body is not a {}",
                    std::any::type_name::<M>()
                )
                .into()),
            }),
            seed: None,
        }
    }

    /// Attach a seeder that writes the extracted value onto a newly created
    /// instance of `D`. A type mismatch at seed time is silently ignored.
    pub fn with_seed<D, F>(mut self, assign: F) -> Self
    where
        D: SagaData,
        F: Fn(&mut D, &CorrelationValue) + Send + Sync + 'static,
    {
        self.seed = Some(Arc::new(move |any: &mut dyn Any, value| {
            if let Some(data) = any.downcast_mut::<D>() {
                assign(data, value);
            }
        }));
        self
    }

    /// The saga-data property this rule correlates on.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The message type this rule applies to.
    pub fn message_type(&self) -> TypeId {
        self.message_type
    }

    /// Human-readable name of the message type.
    pub fn message_type_name(&self) -> &'static str {
        self.message_type_name
    }

    /// Does this rule apply to the concrete type of `message`?
    pub fn matches(&self, message: &IncomingMessage) -> bool {
        self.message_type == message.type_id()
    }

    /// Run the extractor against the message body.
    pub fn extract(&self, message: &IncomingMessage) -> Result<CorrelationValue, SagaError> {
        (self.extract)(message).map_err(|cause| SagaError::CorrelationExtraction {
            property: self.name.clone(),
            message_type: message.type_name(),
            cause,
        })
    }

    pub(crate) fn seed_into(&self, data: &mut dyn Any, value: &CorrelationValue) {
        if let Some(seed) = &self.seed {
            seed(data, value);
        }
    }
}

impl std::fmt::Debug for CorrelationProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationProperty")
            .field("name", &self.name)
            .field("message_type", &self.message_type_name)
            .field("seeded", &self.seed.is_some())
            .finish()
    }
}

/// Select the rules relevant to the concrete type of `message`, in declared
/// order, de-duplicated by property name keeping the first occurrence.
pub fn relevant_properties<'a>(
    properties: &'a [CorrelationProperty],
    message: &IncomingMessage,
) -> Vec<&'a CorrelationProperty> {
    let mut relevant: Vec<&CorrelationProperty> = Vec::new();
    for property in properties.iter().filter(|p| p.matches(message)) {
        if !relevant.iter().any(|seen| seen.name() == property.name()) {
            relevant.push(property);
        }
    }
    relevant
}
