//! In-memory [`CatalogStore`], used for dry runs and as the reference store in tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::contract::{CatalogResource, CatalogStore, PolicyBinding, StoreError};
use crate::reference::StableId;

#[derive(Debug, Default)]
struct Tables {
    resources: BTreeMap<StableId, CatalogResource>,
    bindings: BTreeMap<String, PolicyBinding>,
}

/// A catalog that lives only as long as the process. Rejects the same
/// inconsistencies a real connector would (duplicate create, update of a missing id).
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tables: Mutex<Tables>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn resources(&self) -> Vec<CatalogResource> {
        self.lock().resources.values().cloned().collect()
    }

    pub fn resource(&self, id: &StableId) -> Option<CatalogResource> {
        self.lock().resources.get(id).cloned()
    }

    pub fn bindings(&self) -> Vec<PolicyBinding> {
        self.lock().bindings.values().cloned().collect()
    }

    pub fn binding(&self, id: &str) -> Option<PolicyBinding> {
        self.lock().bindings.get(id).cloned()
    }

    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn create_resource(&self, resource: &CatalogResource) -> Result<(), StoreError> {
        let mut tables = self.lock();
        if tables.resources.contains_key(&resource.id) {
            return Err(format!("resource {} already exists", resource.id).into());
        }
        debug!(id = %resource.id, name = %resource.name, "[CATALOG] create resource");
        tables.resources.insert(resource.id.clone(), resource.clone());
        Ok(())
    }

    async fn update_resource(&self, resource: &CatalogResource) -> Result<(), StoreError> {
        let mut tables = self.lock();
        match tables.resources.get_mut(&resource.id) {
            Some(existing) => {
                debug!(id = %resource.id, "[CATALOG] update resource");
                *existing = resource.clone();
                Ok(())
            }
            None => Err(format!("resource {} does not exist", resource.id).into()),
        }
    }

    async fn delete_resource(&self, id: &StableId) -> Result<(), StoreError> {
        let mut tables = self.lock();
        match tables.resources.remove(id) {
            Some(_) => {
                debug!(id = %id, "[CATALOG] delete resource");
                Ok(())
            }
            None => Err(format!("resource {id} does not exist").into()),
        }
    }

    async fn upsert_binding(&self, binding: &PolicyBinding) -> Result<(), StoreError> {
        debug!(
            id = %binding.id,
            resources = binding.resource_ids.len(),
            "[CATALOG] upsert binding"
        );
        self.lock()
            .bindings
            .insert(binding.id.clone(), binding.clone());
        Ok(())
    }

    async fn delete_binding(&self, binding_id: &str) -> Result<(), StoreError> {
        match self.lock().bindings.remove(binding_id) {
            Some(_) => {
                debug!(id = %binding_id, "[CATALOG] delete binding");
                Ok(())
            }
            None => Err(format!("binding {binding_id} does not exist").into()),
        }
    }
}
