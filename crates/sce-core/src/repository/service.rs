//! Service definition repository trait definition.

use sce_types::error::RepositoryError;
use sce_types::ids::{ServiceId, TenantId};
use sce_types::service::{ServiceCategory, ServiceStatus};

use crate::service::definition::ServiceDefinition;

use super::SortOrder;

/// Filter criteria for listing service definitions.
#[derive(Debug, Clone, Default)]
pub struct ServiceFilter {
    /// Only definitions owned by this tenant.
    pub tenant_id: Option<TenantId>,
    /// Filter by lifecycle status.
    pub status: Option<ServiceStatus>,
    /// Filter by category.
    pub category: Option<ServiceCategory>,
    /// Sort direction on `created_at`.
    pub sort_order: Option<SortOrder>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Number of results to skip (offset pagination).
    pub offset: Option<usize>,
}

impl ServiceFilter {
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Self::default()
        }
    }

    /// Whether a definition passes the tenant, status and category criteria.
    pub fn matches(&self, definition: &ServiceDefinition) -> bool {
        self.tenant_id.is_none_or(|t| t == definition.tenant_id())
            && self.status.is_none_or(|s| s == definition.status())
            && self.category.is_none_or(|c| c == definition.category())
    }
}

/// Repository trait for service definition persistence.
///
/// Implementations live in sce-infra (e.g., InMemoryServiceRepository).
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
/// Pending domain events are not part of the persisted state.
pub trait ServiceDefinitionRepository: Send + Sync {
    /// Store a new definition. Fails with `Conflict` if the ID is taken.
    fn create(
        &self,
        definition: &ServiceDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a definition by its unique ID.
    fn get_by_id(
        &self,
        id: &ServiceId,
    ) -> impl std::future::Future<Output = Result<Option<ServiceDefinition>, RepositoryError>> + Send;

    /// List definitions with optional filtering and pagination.
    fn list(
        &self,
        filter: Option<ServiceFilter>,
    ) -> impl std::future::Future<Output = Result<Vec<ServiceDefinition>, RepositoryError>> + Send;

    /// Replace an existing definition. Fails with `NotFound` if absent.
    fn update(
        &self,
        definition: &ServiceDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Permanently delete a definition by ID.
    fn delete(
        &self,
        id: &ServiceId,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
