#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use aas_bridge_core::config::{EnvironmentConfig, PolicyConfig};
use aas_bridge_core::contract::{CatalogStore, TreeWalker};
use aas_bridge_core::error::WalkError;
use aas_bridge_core::inventory::Inventory;
use aas_bridge_core::model::{ElementMetadata, LiveElement, LiveTree, PolicyPair};
use aas_bridge_core::prober::Availability;
use aas_bridge_core::reference::{KeyKind, Reference};
use aas_bridge_core::synchronise::{SyncSettings, Synchroniser};
use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

pub const BASE_URL: &str = "http://repository.test/api/v3.0";

pub fn shell() -> Reference {
    Reference::shell("S1")
}

pub fn submodel() -> Reference {
    shell().child(KeyKind::Submodel, "M1").unwrap()
}

pub fn property(id_short: &str) -> Reference {
    submodel().child(KeyKind::Property, id_short).unwrap()
}

pub fn element(reference: Reference, semantic_id: Option<&str>) -> LiveElement {
    let mut metadata = ElementMetadata::new(reference.kind());
    if !reference.kind().is_identifiable() {
        metadata.id_short = Some(reference.last().value.clone());
    }
    if reference.kind() == KeyKind::Property {
        metadata.value_type = Some("xs:int".to_string());
    }
    metadata.semantic_id = semantic_id.map(str::to_string);
    LiveElement::new(reference, metadata)
}

/// S1 -> M1 -> {P1, P2}, minus whatever `without` names.
pub fn sample_tree(without: &[&str]) -> LiveTree {
    let mut elements = vec![element(shell(), None), element(submodel(), None)];
    for (id_short, semantic) in [("P1", "urn:test:temperature"), ("P2", "urn:test:pressure")] {
        if !without.contains(&id_short) {
            elements.push(element(property(id_short), Some(semantic)));
        }
    }
    LiveTree::new(elements)
}

pub fn default_pair() -> PolicyPair {
    PolicyPair::new("access-default", "contract-default")
}

pub fn environment() -> EnvironmentConfig {
    let mut env = EnvironmentConfig::new("test", BASE_URL);
    env.policies = PolicyConfig {
        default: Some(default_pair()),
        rules: Vec::new(),
    };
    env
}

pub fn settings(env: &EnvironmentConfig) -> SyncSettings {
    SyncSettings::from_config(env).unwrap()
}

/// Walker that returns whatever tree (or failure) the test sets.
pub struct FakeWalker {
    tree: Mutex<Result<LiveTree, String>>,
    calls: AtomicUsize,
}

impl FakeWalker {
    pub fn new(tree: LiveTree) -> Arc<Self> {
        Arc::new(Self {
            tree: Mutex::new(Ok(tree)),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_tree(&self, tree: LiveTree) {
        *self.tree.lock().unwrap() = Ok(tree);
    }

    pub fn fail_with(&self, reason: &str) {
        *self.tree.lock().unwrap() = Err(reason.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TreeWalker for FakeWalker {
    async fn walk(&self) -> Result<LiveTree, WalkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &*self.tree.lock().unwrap() {
            Ok(tree) => Ok(tree.clone()),
            Err(reason) => Err(WalkError::Malformed {
                location: "submodel M1".to_string(),
                reason: reason.clone(),
            }),
        }
    }
}

/// Walker that blocks until released, for single-flight and cancellation tests.
pub struct GatedWalker {
    pub gate: Notify,
    pub entered: Notify,
    tree: LiveTree,
}

impl GatedWalker {
    pub fn new(tree: LiveTree) -> Arc<Self> {
        Arc::new(Self {
            gate: Notify::new(),
            entered: Notify::new(),
            tree,
        })
    }
}

#[async_trait]
impl TreeWalker for GatedWalker {
    async fn walk(&self) -> Result<LiveTree, WalkError> {
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(self.tree.clone())
    }
}

pub struct Harness {
    pub synchroniser: Arc<Synchroniser>,
    pub inventory: Arc<Inventory>,
    pub availability: watch::Sender<Availability>,
    pub cancel: CancellationToken,
}

pub fn harness(
    env: &EnvironmentConfig,
    walker: Arc<dyn TreeWalker>,
    catalog: Arc<dyn CatalogStore>,
    inventory: Arc<Inventory>,
) -> Harness {
    let (availability, rx) = watch::channel(Availability::Up);
    let cancel = CancellationToken::new();
    let synchroniser = Arc::new(Synchroniser::new(
        &env.name,
        settings(env),
        walker,
        catalog,
        Arc::clone(&inventory),
        rx,
        cancel.clone(),
    ));
    Harness {
        synchroniser,
        inventory,
        availability,
        cancel,
    }
}
