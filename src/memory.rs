//! In-memory saga storage for testing and embedding

use crate::correlation::{CorrelationPropertyValue, CorrelationValue};
use crate::errors::StorageError;
use crate::storage::{SagaStorage, ID_PROPERTY};
use crate::{SagaData, SagaId};
use async_trait::async_trait;
use std::any::TypeId;
use std::collections::HashMap;
use tokio::sync::RwLock;

struct StoredSaga {
    data: Box<dyn SagaData>,
    correlation: Vec<CorrelationPropertyValue>,
}

impl StoredSaga {
    fn data_type(&self) -> TypeId {
        self.data.as_any().type_id()
    }

    fn correlates(&self, property_name: &str, value: &CorrelationValue) -> bool {
        if property_name == ID_PROPERTY {
            return CorrelationValue::from(self.data.id()) == *value;
        }
        self.correlation
            .iter()
            .any(|pair| &*pair.name == property_name && pair.value == *value)
    }
}

/// Reference [`SagaStorage`] backed by a `tokio` lock.
///
/// Update performs the revision compare-and-increment atomically under the
/// write lock; insert rejects duplicate identities and duplicate correlation
/// values within the same saga data type.
#[derive(Default)]
pub struct InMemorySagaStorage {
    sagas: RwLock<HashMap<SagaId, StoredSaga>>,
}

impl InMemorySagaStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances, across all saga types.
    pub async fn len(&self) -> usize {
        self.sagas.read().await.len()
    }

    /// Is the store empty?
    pub async fn is_empty(&self) -> bool {
        self.sagas.read().await.is_empty()
    }
}

#[async_trait]
impl SagaStorage for InMemorySagaStorage {
    async fn find(
        &self,
        data_type: TypeId,
        property_name: &str,
        value: &CorrelationValue,
    ) -> Result<Option<Box<dyn SagaData>>, StorageError> {
        let sagas = self.sagas.read().await;
        Ok(sagas
            .values()
            .find(|entry| entry.data_type() == data_type && entry.correlates(property_name, value))
            .map(|entry| entry.data.boxed_clone()))
    }

    async fn insert(
        &self,
        data: &dyn SagaData,
        correlation: &[CorrelationPropertyValue],
    ) -> Result<(), StorageError> {
        let id = data.id();
        let mut sagas = self.sagas.write().await;

        if sagas.contains_key(&id) {
            return Err(StorageError::Conflict { id });
        }
        let data_type = data.as_any().type_id();
        let taken = sagas.values().any(|entry| {
            entry.data_type() == data_type
                && correlation
                    .iter()
                    .any(|pair| entry.correlates(&pair.name, &pair.value))
        });
        if taken {
            return Err(StorageError::Conflict { id });
        }

        sagas.insert(
            id,
            StoredSaga {
                data: data.boxed_clone(),
                correlation: correlation.to_vec(),
            },
        );
        Ok(())
    }

    async fn update(
        &self,
        data: &dyn SagaData,
        correlation: &[CorrelationPropertyValue],
    ) -> Result<(), StorageError> {
        let id = data.id();
        let mut sagas = self.sagas.write().await;

        let Some(entry) = sagas.get_mut(&id) else {
            return Err(StorageError::Conflict { id });
        };
        if entry.data.revision() != data.revision() {
            return Err(StorageError::Conflict { id });
        }

        let mut updated = data.boxed_clone();
        updated.set_revision(data.revision() + 1);
        entry.data = updated;
        // Merge index values by name; pairs absent from this dispatch stay.
        for pair in correlation {
            match entry.correlation.iter_mut().find(|p| p.name == pair.name) {
                Some(existing) => existing.value = pair.value.clone(),
                None => entry.correlation.push(pair.clone()),
            }
        }
        Ok(())
    }

    async fn delete(&self, data: &dyn SagaData) -> Result<(), StorageError> {
        self.sagas.write().await.remove(&data.id());
        Ok(())
    }
}
