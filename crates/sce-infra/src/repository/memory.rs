//! In-memory implementation of `ServiceDefinitionRepository`.
//!
//! Rows live in a shared `DashMap`, so clones of the repository see the same
//! data. Suitable for local runs and tests.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use sce_core::repository::SortOrder;
use sce_core::repository::service::{ServiceDefinitionRepository, ServiceFilter};
use sce_core::service::definition::ServiceDefinition;
use sce_types::error::RepositoryError;
use sce_types::ids::ServiceId;

#[derive(Debug, Clone, Default)]
pub struct InMemoryServiceRepository {
    rows: Arc<DashMap<ServiceId, ServiceDefinition>>,
}

impl InMemoryServiceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl ServiceDefinitionRepository for InMemoryServiceRepository {
    async fn create(&self, definition: &ServiceDefinition) -> Result<(), RepositoryError> {
        match self.rows.entry(definition.id()) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "service {} already exists",
                definition.id()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(definition.clone());
                Ok(())
            }
        }
    }

    async fn get_by_id(&self, id: &ServiceId) -> Result<Option<ServiceDefinition>, RepositoryError> {
        Ok(self.rows.get(id).map(|row| row.value().clone()))
    }

    async fn list(&self, filter: Option<ServiceFilter>) -> Result<Vec<ServiceDefinition>, RepositoryError> {
        let filter = filter.unwrap_or_default();
        let mut rows: Vec<ServiceDefinition> = self
            .rows
            .iter()
            .filter(|row| filter.matches(row.value()))
            .map(|row| row.value().clone())
            .collect();

        // Ties on created_at fall back to the time-sortable id.
        rows.sort_by_key(|d| (d.created_at(), d.id()));
        if filter.sort_order.unwrap_or_default() == SortOrder::Desc {
            rows.reverse();
        }

        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn update(&self, definition: &ServiceDefinition) -> Result<(), RepositoryError> {
        match self.rows.get_mut(&definition.id()) {
            Some(mut row) => {
                *row = definition.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn delete(&self, id: &ServiceId) -> Result<(), RepositoryError> {
        self.rows
            .remove(id)
            .map(|_| ())
            .ok_or(RepositoryError::NotFound)
    }
}
