//! Adapter registry for resolving a tenant's integration to an adapter.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use intsync_common::{Error, IntegrationId, Result, TenantId};

use crate::adapter::IntegrationAdapter;

/// Resolves `(tenant, integration)` to a ready-to-use adapter.
#[async_trait]
pub trait AdapterRegistry: Send + Sync {
    /// Get the adapter for a tenant's integration.
    ///
    /// # Errors
    /// - `NotFound` if the integration has no adapter
    async fn resolve(
        &self,
        tenant_id: TenantId,
        integration_id: IntegrationId,
    ) -> Result<Arc<dyn IntegrationAdapter>>;
}

/// Registry backed by adapters registered up front.
pub struct StaticAdapterRegistry {
    adapters: RwLock<HashMap<(TenantId, IntegrationId), Arc<dyn IntegrationAdapter>>>,
}

impl StaticAdapterRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Register an adapter for a tenant's integration.
    ///
    /// # Errors
    /// - `InvalidInput` if the integration already has an adapter
    pub fn register(
        &self,
        tenant_id: TenantId,
        integration_id: IntegrationId,
        adapter: Arc<dyn IntegrationAdapter>,
    ) -> Result<()> {
        let mut adapters = self.adapters.write().unwrap_or_else(PoisonError::into_inner);
        let key = (tenant_id, integration_id);
        if adapters.contains_key(&key) {
            return Err(Error::InvalidInput(format!(
                "integration {} already has an adapter",
                integration_id
            )));
        }
        adapters.insert(key, adapter);
        Ok(())
    }

    /// Check if an integration has an adapter.
    pub fn has_adapter(&self, tenant_id: TenantId, integration_id: IntegrationId) -> bool {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(tenant_id, integration_id))
    }
}

impl Default for StaticAdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AdapterRegistry for StaticAdapterRegistry {
    async fn resolve(
        &self,
        tenant_id: TenantId,
        integration_id: IntegrationId,
    ) -> Result<Arc<dyn IntegrationAdapter>> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(tenant_id, integration_id))
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no adapter registered for integration {}",
                    integration_id
                ))
            })
    }
}
