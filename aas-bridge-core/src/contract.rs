//! # contract: collaborator interfaces of the bridge
//!
//! This module defines the traits the synchroniser and the prober talk through, plus the
//! plain data they exchange with the connector's catalog:
//!
//! - [`CatalogStore`]: create/update/delete catalog resources and upsert/delete policy bindings
//!   keyed by [`StableId`]-derived identifiers.
//! - [`TreeWalker`]: produce the complete live element tree of one repository, or fail.
//! - [`Probe`]: one lightweight reachability check against the repository.
//!
//! ## Error Handling
//! Collaborators live outside this crate (HTTP adapters, in-memory stores, mocks), so they
//! report failures as a boxed [`StoreError`]. Typed errors are used for everything owned
//! by the core (see [`crate::error`]).
//!
//! ## Mocking & Testing
//! Every trait is annotated for `mockall`; the mocks are exported behind the
//! `test-export-mocks` feature so the CLI crate's tests can use them too.

use async_trait::async_trait;
use serde::Serialize;

use mockall::{automock, predicate::*};

use crate::error::WalkError;
use crate::model::{DataAddress, InventoryEntry, LiveTree, PolicyPair};
use crate::reference::{KeyKind, Reference, StableId};

/// Boxed error returned by every external collaborator.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// One shareable resource as the catalog sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogResource {
    pub id: StableId,
    /// Human-readable name (idShort, or the id for shells and submodels).
    pub name: String,
    pub kind: KeyKind,
    pub reference: Reference,
    pub semantic_id: Option<String>,
    pub content_type: Option<String>,
    pub parent_id: Option<StableId>,
    pub data_address: DataAddress,
}

impl CatalogResource {
    pub fn from_entry(entry: &InventoryEntry) -> Self {
        let name = entry
            .metadata
            .id_short
            .clone()
            .unwrap_or_else(|| entry.reference.last().value.clone());
        Self {
            id: entry.id.clone(),
            name,
            kind: entry.reference.kind(),
            reference: entry.reference.clone(),
            semantic_id: entry.metadata.semantic_id.clone(),
            content_type: entry.metadata.content_type.clone(),
            parent_id: entry.parent_id.clone(),
            data_address: entry.data_address.clone(),
        }
    }
}

/// One (access policy, contract policy) pair offered over a set of resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyBinding {
    pub id: String,
    pub access_policy_id: String,
    pub contract_policy_id: String,
    /// Sorted, without duplicates.
    pub resource_ids: Vec<StableId>,
}

impl PolicyBinding {
    pub fn pair(&self) -> PolicyPair {
        PolicyPair::new(&self.access_policy_id, &self.contract_policy_id)
    }
}

/// Catalog and policy-binding store of the connector. Mutated only by the synchroniser.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Register a new resource. Fails if the id already exists.
    async fn create_resource(&self, resource: &CatalogResource) -> Result<(), StoreError>;

    /// Replace the attributes of an existing resource, keeping its id.
    async fn update_resource(&self, resource: &CatalogResource) -> Result<(), StoreError>;

    async fn delete_resource(&self, id: &StableId) -> Result<(), StoreError>;

    /// Create the binding or replace its resource set.
    async fn upsert_binding(&self, binding: &PolicyBinding) -> Result<(), StoreError>;

    async fn delete_binding(&self, binding_id: &str) -> Result<(), StoreError>;
}

/// Produces the complete current element tree of one repository.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait TreeWalker: Send + Sync {
    /// Either every observable node, or an error. Never a partial tree.
    async fn walk(&self) -> Result<LiveTree, WalkError>;
}

/// A single reachability check against the backing repository.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self) -> Result<(), StoreError>;
}
