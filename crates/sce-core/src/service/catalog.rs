//! Service authoring catalog.
//!
//! Maps the authoring interface 1:1 onto aggregate operations. Every call
//! loads the definition, mutates it, saves it, and returns the domain events
//! the mutation emitted so the caller can forward them to an event store.

use sce_types::error::{DefinitionError, RepositoryError};
use sce_types::event::ServiceEvent;
use sce_types::ids::{ServiceId, UserId};
use sce_types::service::{CreateServiceRequest, ErrorHandlingPolicy};
use sce_types::workflow::{WorkflowEdge, WorkflowNode};

use crate::repository::service::{ServiceDefinitionRepository, ServiceFilter};
use crate::service::definition::ServiceDefinition;

/// Errors from authoring operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("service not found: {0}")]
    NotFound(ServiceId),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
}

/// Authoring service over a definition repository.
///
/// Generic over the repository trait so sce-core never depends on sce-infra.
pub struct ServiceCatalog<R: ServiceDefinitionRepository> {
    repo: R,
}

impl<R: ServiceDefinitionRepository> ServiceCatalog<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Create a draft definition and persist it.
    pub async fn create_service(
        &self,
        request: CreateServiceRequest,
    ) -> Result<(ServiceDefinition, Vec<ServiceEvent>), CatalogError> {
        let mut definition = ServiceDefinition::new(
            request.tenant_id,
            request.name,
            request.category,
            request.created_by,
        )?;
        if let Some(description) = request.description {
            definition = definition.with_description(description);
        }

        self.repo.create(&definition).await?;
        tracing::info!(
            service_id = %definition.id(),
            tenant_id = %definition.tenant_id(),
            name = %definition.name(),
            "service created"
        );
        let events = definition.take_events();
        Ok((definition, events))
    }

    pub async fn add_node(&self, id: ServiceId, node: WorkflowNode) -> Result<Vec<ServiceEvent>, CatalogError> {
        self.mutate(id, |def| def.add_workflow_node(node).map(|_| ()))
            .await
    }

    pub async fn add_edge(&self, id: ServiceId, edge: WorkflowEdge) -> Result<Vec<ServiceEvent>, CatalogError> {
        self.mutate(id, |def| def.add_workflow_edge(edge).map(|_| ()))
            .await
    }

    pub async fn set_error_policy(
        &self,
        id: ServiceId,
        policy: ErrorHandlingPolicy,
    ) -> Result<Vec<ServiceEvent>, CatalogError> {
        self.mutate(id, |def| def.set_error_policy(policy)).await
    }

    pub async fn publish(
        &self,
        id: ServiceId,
        change_note: impl Into<String>,
        author: UserId,
    ) -> Result<Vec<ServiceEvent>, CatalogError> {
        let change_note = change_note.into();
        self.mutate(id, |def| def.publish(change_note, author).map(|_| ()))
            .await
    }

    pub async fn deprecate(
        &self,
        id: ServiceId,
        reason: impl Into<String>,
        superseded_by: Option<ServiceId>,
    ) -> Result<Vec<ServiceEvent>, CatalogError> {
        let reason = reason.into();
        self.mutate(id, |def| def.deprecate(reason, superseded_by).map(|_| ()))
            .await
    }

    /// Archive a definition. `active_instance_count` comes from the runtime.
    pub async fn archive(
        &self,
        id: ServiceId,
        active_instance_count: usize,
    ) -> Result<Vec<ServiceEvent>, CatalogError> {
        self.mutate(id, |def| def.archive(active_instance_count).map(|_| ()))
            .await
    }

    pub async fn get(&self, id: ServiceId) -> Result<ServiceDefinition, CatalogError> {
        self.repo
            .get_by_id(&id)
            .await?
            .ok_or(CatalogError::NotFound(id))
    }

    pub async fn list(&self, filter: ServiceFilter) -> Result<Vec<ServiceDefinition>, CatalogError> {
        Ok(self.repo.list(Some(filter)).await?)
    }

    /// Load, apply `op`, save, and return the events `op` emitted.
    ///
    /// Nothing is saved when `op` fails.
    async fn mutate<F>(&self, id: ServiceId, op: F) -> Result<Vec<ServiceEvent>, CatalogError>
    where
        F: FnOnce(&mut ServiceDefinition) -> Result<(), DefinitionError>,
    {
        let mut definition = self.get(id).await?;
        if let Err(e) = op(&mut definition) {
            tracing::debug!(service_id = %id, error = %e, "authoring operation rejected");
            return Err(e.into());
        }
        self.repo.update(&definition).await?;
        Ok(definition.take_events())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use sce_types::ids::TenantId;
    use sce_types::service::{ServiceCategory, ServiceStatus};
    use sce_types::workflow::NodeType;

    #[derive(Default)]
    struct MapRepo {
        rows: Mutex<HashMap<ServiceId, ServiceDefinition>>,
    }

    impl ServiceDefinitionRepository for MapRepo {
        async fn create(&self, definition: &ServiceDefinition) -> Result<(), RepositoryError> {
            let mut rows = self.rows.lock().unwrap();
            if rows.contains_key(&definition.id()) {
                return Err(RepositoryError::Conflict(definition.id().to_string()));
            }
            rows.insert(definition.id(), definition.clone());
            Ok(())
        }

        async fn get_by_id(&self, id: &ServiceId) -> Result<Option<ServiceDefinition>, RepositoryError> {
            Ok(self.rows.lock().unwrap().get(id).cloned())
        }

        async fn list(&self, filter: Option<ServiceFilter>) -> Result<Vec<ServiceDefinition>, RepositoryError> {
            let filter = filter.unwrap_or_default();
            Ok(self
                .rows
                .lock()
                .unwrap()
                .values()
                .filter(|d| filter.matches(d))
                .cloned()
                .collect())
        }

        async fn update(&self, definition: &ServiceDefinition) -> Result<(), RepositoryError> {
            let mut rows = self.rows.lock().unwrap();
            match rows.get_mut(&definition.id()) {
                Some(row) => {
                    *row = definition.clone();
                    Ok(())
                }
                None => Err(RepositoryError::NotFound),
            }
        }

        async fn delete(&self, id: &ServiceId) -> Result<(), RepositoryError> {
            self.rows.lock().unwrap().remove(id);
            Ok(())
        }
    }

    fn request(tenant_id: TenantId) -> CreateServiceRequest {
        CreateServiceRequest {
            tenant_id,
            name: "Invoice approval".to_string(),
            category: ServiceCategory::Finance,
            description: Some("Routes large invoices to a reviewer".to_string()),
            created_by: UserId::new(),
        }
    }

    #[tokio::test]
    async fn test_create_persists_draft_and_returns_event() {
        let catalog = ServiceCatalog::new(MapRepo::default());
        let (def, events) = catalog.create_service(request(TenantId::new())).await.unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "service.created");
        let stored = catalog.get(def.id()).await.unwrap();
        assert_eq!(stored.status(), ServiceStatus::Draft);
        assert_eq!(stored.description(), "Routes large invoices to a reviewer");
    }

    #[tokio::test]
    async fn test_full_authoring_lifecycle() {
        let catalog = ServiceCatalog::new(MapRepo::default());
        let (def, _) = catalog.create_service(request(TenantId::new())).await.unwrap();
        let id = def.id();

        catalog
            .add_node(id, WorkflowNode::new("start", NodeType::Start, "Start"))
            .await
            .unwrap();
        catalog
            .add_node(id, WorkflowNode::new("end", NodeType::End, "End"))
            .await
            .unwrap();
        let events = catalog.add_edge(id, WorkflowEdge::new("start", "end")).await.unwrap();
        assert_eq!(events[0].event_type(), "service.workflow_edge_added");

        let events = catalog.publish(id, "v1", UserId::new()).await.unwrap();
        assert_eq!(events[0].event_type(), "service.published");
        assert!(catalog.get(id).await.unwrap().is_selectable());

        catalog.deprecate(id, "replaced", None).await.unwrap();
        let err = catalog.archive(id, 3).await.unwrap_err();
        assert!(matches!(err, CatalogError::Definition(DefinitionError::State(_))));
        catalog.archive(id, 0).await.unwrap();
        assert_eq!(catalog.get(id).await.unwrap().status(), ServiceStatus::Archived);
    }

    #[tokio::test]
    async fn test_rejected_operation_is_not_saved() {
        let catalog = ServiceCatalog::new(MapRepo::default());
        let (def, _) = catalog.create_service(request(TenantId::new())).await.unwrap();

        let err = catalog.publish(def.id(), "v1", UserId::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "validation error: workflow has no nodes");
        assert_eq!(catalog.get(def.id()).await.unwrap().status(), ServiceStatus::Draft);
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_found() {
        let catalog = ServiceCatalog::new(MapRepo::default());
        let missing = ServiceId::new();
        let err = catalog
            .add_node(missing, WorkflowNode::new("start", NodeType::Start, "Start"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_list_by_tenant() {
        let catalog = ServiceCatalog::new(MapRepo::default());
        let tenant = TenantId::new();
        catalog.create_service(request(tenant)).await.unwrap();
        catalog.create_service(request(tenant)).await.unwrap();
        catalog.create_service(request(TenantId::new())).await.unwrap();

        let listed = catalog.list(ServiceFilter::for_tenant(tenant)).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|d| d.tenant_id() == tenant));
    }
}
