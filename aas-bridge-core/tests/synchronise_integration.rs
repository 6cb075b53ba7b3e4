mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aas_bridge_core::catalog::MemoryCatalog;
use aas_bridge_core::config::PolicyRuleConfig;
use aas_bridge_core::contract::{
    CatalogResource, CatalogStore, MockCatalogStore, PolicyBinding, StoreError,
};
use aas_bridge_core::inventory::Inventory;
use aas_bridge_core::model::{EntryState, PolicyPair};
use aas_bridge_core::policy::binding_id;
use aas_bridge_core::prober::Availability;
use aas_bridge_core::reference::{KeyKind, StableId};
use aas_bridge_core::synchronise::{CycleOutcome, TriggerAck};
use async_trait::async_trait;
use common::*;
use tokio_util::sync::CancellationToken;

fn id_of(reference: &aas_bridge_core::reference::Reference) -> StableId {
    StableId::derive(BASE_URL, reference)
}

#[tokio::test]
async fn test_scenario_creates_three_resources_and_deletes_p2_after_two_cycles() {
    let env = environment();
    let walker = FakeWalker::new(sample_tree(&[]));
    let catalog = Arc::new(MemoryCatalog::new());
    let h = harness(&env, walker.clone(), catalog.clone(), Arc::new(Inventory::in_memory()));

    let first = h.synchroniser.run_cycle().await;
    assert_eq!(first.outcome, CycleOutcome::Completed);
    assert_eq!(first.created, 3, "M1, P1 and P2 are cataloged; shells are not");
    assert_eq!(catalog.resource_count(), 3);
    assert!(catalog.resource(&id_of(&shell())).is_none());
    let p1_before = catalog.resource(&id_of(&property("P1"))).unwrap();

    walker.set_tree(sample_tree(&["P2"]));
    let second = h.synchroniser.run_cycle().await;
    assert_eq!(second.outcome, CycleOutcome::Completed);
    assert_eq!(second.deleted, 0);
    assert_eq!(second.marked_stale, 1);
    assert_eq!(catalog.resource_count(), 3, "single absence is debounced");
    let p2 = h.inventory.get(&id_of(&property("P2"))).unwrap();
    assert_eq!(p2.state, EntryState::Stale);

    let third = h.synchroniser.run_cycle().await;
    assert_eq!(third.outcome, CycleOutcome::Completed);
    assert_eq!(third.deleted, 1);
    assert_eq!(catalog.resource_count(), 2);
    assert!(h.inventory.get(&id_of(&property("P2"))).is_none());

    let p1_after = catalog.resource(&id_of(&property("P1"))).unwrap();
    assert_eq!(p1_before, p1_after);
    assert_eq!(
        p1_after.data_address.request_url(),
        format!("{BASE_URL}/shells/UzE/submodels/TTE/submodel-elements/P1/$value")
    );

    let binding = catalog
        .binding(&binding_id(BASE_URL, &default_pair()))
        .unwrap();
    assert_eq!(binding.resource_ids.len(), 2);
    assert!(!binding.resource_ids.contains(&id_of(&property("P2"))));
}

#[tokio::test]
async fn test_second_cycle_against_unchanged_tree_makes_no_catalog_calls() {
    let env = environment();
    let walker = FakeWalker::new(sample_tree(&[]));

    let mut catalog = MockCatalogStore::new();
    catalog.expect_create_resource().times(3).returning(|_| Ok(()));
    catalog.expect_upsert_binding().times(1).returning(|_| Ok(()));
    catalog.expect_update_resource().never();
    catalog.expect_delete_resource().never();
    catalog.expect_delete_binding().never();

    let h = harness(&env, walker, Arc::new(catalog), Arc::new(Inventory::in_memory()));

    let first = h.synchroniser.run_cycle().await;
    assert_eq!(first.mutations(), 4);

    let second = h.synchroniser.run_cycle().await;
    assert_eq!(second.outcome, CycleOutcome::Completed);
    assert_eq!(second.mutations(), 0);
    assert_eq!(second.unchanged, 3);
}

#[tokio::test]
async fn test_walk_failure_leaves_inventory_file_and_catalog_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inventory.json");
    let env = environment();
    let walker = FakeWalker::new(sample_tree(&[]));
    let catalog = Arc::new(MemoryCatalog::new());
    let inventory = Arc::new(Inventory::open(&path).unwrap());
    let h = harness(&env, walker.clone(), catalog.clone(), inventory);

    assert!(h.synchroniser.run_cycle().await.is_success());
    let file_before = std::fs::read(&path).unwrap();
    let resources_before = catalog.resources();
    let bindings_before = catalog.bindings();

    walker.fail_with("unexpected end of element list");
    let report = h.synchroniser.run_cycle().await;

    assert!(matches!(report.outcome, CycleOutcome::Failed { .. }));
    assert_eq!(report.mutations(), 0);
    assert_eq!(std::fs::read(&path).unwrap(), file_before);
    assert_eq!(catalog.resources(), resources_before);
    assert_eq!(catalog.bindings(), bindings_before);
    assert!(h
        .inventory
        .list()
        .iter()
        .all(|e| e.state == EntryState::Active && e.missed_cycles == 0));
}

#[tokio::test]
async fn test_delete_debounce_follows_configured_threshold() {
    for threshold in 1..=3u32 {
        let mut env = environment();
        env.sync.delete_after_missed = threshold;
        let walker = FakeWalker::new(sample_tree(&[]));
        let catalog = Arc::new(MemoryCatalog::new());
        let h = harness(&env, walker.clone(), catalog.clone(), Arc::new(Inventory::in_memory()));
        h.synchroniser.run_cycle().await;

        walker.set_tree(sample_tree(&["P2"]));
        for cycle in 1..=threshold {
            let report = h.synchroniser.run_cycle().await;
            if cycle < threshold {
                assert_eq!(report.deleted, 0, "threshold {threshold}, cycle {cycle}");
                assert_eq!(catalog.resource_count(), 3);
            } else {
                assert_eq!(report.deleted, 1, "threshold {threshold}, cycle {cycle}");
                assert_eq!(catalog.resource_count(), 2);
            }
        }
    }
}

#[tokio::test]
async fn test_element_returning_before_deletion_is_revived_without_catalog_calls() {
    let env = environment();
    let walker = FakeWalker::new(sample_tree(&[]));
    let catalog = Arc::new(MemoryCatalog::new());
    let h = harness(&env, walker.clone(), catalog.clone(), Arc::new(Inventory::in_memory()));
    h.synchroniser.run_cycle().await;

    walker.set_tree(sample_tree(&["P2"]));
    h.synchroniser.run_cycle().await;

    walker.set_tree(sample_tree(&[]));
    let report = h.synchroniser.run_cycle().await;
    assert_eq!(report.revived, 1);
    assert_eq!(report.mutations(), 0);
    let p2 = h.inventory.get(&id_of(&property("P2"))).unwrap();
    assert_eq!(p2.state, EntryState::Active);
    assert_eq!(p2.missed_cycles, 0);

    // The debounce counter restarted: one more absence does not delete.
    walker.set_tree(sample_tree(&["P2"]));
    assert_eq!(h.synchroniser.run_cycle().await.deleted, 0);
}

#[tokio::test]
async fn test_changed_metadata_updates_resource_in_place() {
    let env = environment();
    let walker = FakeWalker::new(sample_tree(&[]));
    let catalog = Arc::new(MemoryCatalog::new());
    let h = harness(&env, walker.clone(), catalog.clone(), Arc::new(Inventory::in_memory()));
    h.synchroniser.run_cycle().await;

    let mut tree = sample_tree(&[]);
    for element in &mut tree.elements {
        if element.reference == property("P1") {
            element.metadata.semantic_id = Some("urn:test:temperature:v2".to_string());
        }
    }
    walker.set_tree(tree);
    let report = h.synchroniser.run_cycle().await;

    assert_eq!(report.updated, 1);
    assert_eq!(report.created + report.deleted, 0);
    let resource = catalog.resource(&id_of(&property("P1"))).unwrap();
    assert_eq!(resource.semantic_id.as_deref(), Some("urn:test:temperature:v2"));
}

#[tokio::test]
async fn test_cycle_is_skipped_while_repository_is_down() {
    let env = environment();
    let walker = FakeWalker::new(sample_tree(&[]));
    let catalog = Arc::new(MemoryCatalog::new());
    let h = harness(&env, walker.clone(), catalog.clone(), Arc::new(Inventory::in_memory()));

    h.availability.send(Availability::Down).unwrap();
    let report = h.synchroniser.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::SkippedUnavailable);
    assert_eq!(walker.calls(), 0);

    h.availability.send(Availability::Degraded).unwrap();
    let report = h.synchroniser.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(walker.calls(), 1);
    assert_eq!(catalog.resource_count(), 3);
}

#[tokio::test]
async fn test_stable_id_collision_with_inventory_is_fatal_and_changes_nothing() {
    let env = environment();
    let walker = FakeWalker::new(sample_tree(&[]));
    let catalog = Arc::new(MemoryCatalog::new());
    let inventory = Arc::new(Inventory::in_memory());

    // Seed an entry through a normal cycle, then forge its id onto another reference.
    let seed = harness(&env, FakeWalker::new(sample_tree(&[])), Arc::new(MemoryCatalog::new()), Arc::new(Inventory::in_memory()));
    seed.synchroniser.run_cycle().await;
    let mut forged = seed.inventory.get(&id_of(&property("P2"))).unwrap();
    forged.id = id_of(&property("P1"));
    inventory.upsert(forged).unwrap();

    let h = harness(&env, walker, catalog.clone(), inventory);
    let report = h.synchroniser.run_cycle().await;

    assert!(matches!(report.outcome, CycleOutcome::Fatal { .. }));
    assert_eq!(catalog.resource_count(), 0);
    assert_eq!(h.inventory.len(), 1);
}

#[tokio::test]
async fn test_partial_batch_failure_is_rolled_back() {
    let env = environment();
    let walker = FakeWalker::new(sample_tree(&[]));

    let created = Arc::new(AtomicUsize::new(0));
    let mut catalog = MockCatalogStore::new();
    let counter = created.clone();
    catalog
        .expect_create_resource()
        .times(3)
        .returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                Err("connector rejected asset".into())
            } else {
                Ok(())
            }
        });
    catalog.expect_delete_resource().times(2).returning(|_| Ok(()));
    catalog.expect_upsert_binding().never();

    let h = harness(&env, walker, Arc::new(catalog), Arc::new(Inventory::in_memory()));
    let report = h.synchroniser.run_cycle().await;

    match &report.outcome {
        CycleOutcome::Failed { reason } => assert!(reason.contains("connector rejected asset")),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(report.created, 0);
    assert!(h.inventory.is_empty(), "inventory must not run ahead of the catalog");
}

#[tokio::test]
async fn test_failed_rollback_is_fatal_and_inventory_records_what_remains() {
    let env = environment();
    let walker = FakeWalker::new(sample_tree(&[]));

    let created = Arc::new(AtomicUsize::new(0));
    let mut catalog = MockCatalogStore::new();
    let counter = created.clone();
    catalog
        .expect_create_resource()
        .times(3)
        .returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                Err("connector rejected asset".into())
            } else {
                Ok(())
            }
        });
    catalog
        .expect_delete_resource()
        .times(2)
        .returning(|_| Err("connector unreachable".into()));

    let h = harness(&env, walker, Arc::new(catalog), Arc::new(Inventory::in_memory()));
    let report = h.synchroniser.run_cycle().await;

    assert!(matches!(report.outcome, CycleOutcome::Fatal { .. }));
    assert_eq!(h.inventory.len(), 2);
    assert!(
        h.inventory.list().iter().all(|e| e.policies.is_empty()),
        "bindings were never applied, so no membership is recorded"
    );
}

#[tokio::test]
async fn test_trigger_while_running_is_coalesced() {
    let env = environment();
    let walker = GatedWalker::new(sample_tree(&[]));
    let catalog = Arc::new(MemoryCatalog::new());
    let h = harness(&env, walker.clone(), catalog.clone(), Arc::new(Inventory::in_memory()));
    let mut reports = h.synchroniser.subscribe();

    assert_eq!(h.synchroniser.trigger(), TriggerAck::Started);
    walker.entered.notified().await;
    assert!(h.synchroniser.is_running());
    assert_eq!(h.synchroniser.trigger(), TriggerAck::AlreadyRunning);
    assert_eq!(
        h.synchroniser.run_cycle().await.outcome,
        CycleOutcome::Coalesced
    );

    walker.gate.notify_one();
    tokio::time::timeout(Duration::from_secs(5), reports.changed())
        .await
        .expect("cycle should finish")
        .unwrap();
    let report = reports.borrow().clone().unwrap();
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(catalog.resource_count(), 3);
    assert!(!h.synchroniser.is_running());
}

#[tokio::test]
async fn test_cancel_during_walk_releases_lock_and_commits_nothing() {
    let env = environment();
    let walker = GatedWalker::new(sample_tree(&[]));
    let catalog = Arc::new(MemoryCatalog::new());
    let h = harness(&env, walker.clone(), catalog.clone(), Arc::new(Inventory::in_memory()));

    let sync = h.synchroniser.clone();
    let cycle = tokio::spawn(async move { sync.run_cycle().await });
    walker.entered.notified().await;
    h.cancel.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), cycle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, CycleOutcome::Cancelled);
    assert!(!h.synchroniser.is_running());
    assert_eq!(catalog.resource_count(), 0);
    assert!(h.inventory.is_empty());
}

/// Cancels the cycle's token as soon as the first resource is created.
struct CancellingCatalog {
    inner: MemoryCatalog,
    token: CancellationToken,
}

#[async_trait]
impl CatalogStore for CancellingCatalog {
    async fn create_resource(&self, resource: &CatalogResource) -> Result<(), StoreError> {
        self.inner.create_resource(resource).await?;
        self.token.cancel();
        Ok(())
    }

    async fn update_resource(&self, resource: &CatalogResource) -> Result<(), StoreError> {
        self.inner.update_resource(resource).await
    }

    async fn delete_resource(&self, id: &StableId) -> Result<(), StoreError> {
        self.inner.delete_resource(id).await
    }

    async fn upsert_binding(&self, binding: &PolicyBinding) -> Result<(), StoreError> {
        self.inner.upsert_binding(binding).await
    }

    async fn delete_binding(&self, binding_id: &str) -> Result<(), StoreError> {
        self.inner.delete_binding(binding_id).await
    }
}

#[tokio::test]
async fn test_cancel_mid_batch_rolls_back_applied_mutations() {
    let env = environment();
    let walker = FakeWalker::new(sample_tree(&[]));
    let token = CancellationToken::new();
    let catalog = Arc::new(CancellingCatalog {
        inner: MemoryCatalog::new(),
        token: token.clone(),
    });
    let inventory = Arc::new(Inventory::in_memory());
    let (_availability, rx) = tokio::sync::watch::channel(Availability::Up);
    let synchroniser = aas_bridge_core::synchronise::Synchroniser::new(
        &env.name,
        settings(&env),
        walker,
        catalog.clone(),
        inventory.clone(),
        rx,
        token,
    );

    let report = synchroniser.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::Cancelled);
    assert_eq!(catalog.inner.resource_count(), 0);
    assert!(inventory.is_empty());
}

#[tokio::test]
async fn test_policy_rules_bind_matching_elements_and_children_inherit() {
    let mut env = environment();
    let special = PolicyPair::new("access-temperature", "contract-temperature");
    env.policies.rules.push(PolicyRuleConfig {
        semantic_id: Some("^urn:test:temp".to_string()),
        path: None,
        kinds: vec![KeyKind::Property],
        access_policy_id: special.access_policy_id.clone(),
        contract_policy_id: special.contract_policy_id.clone(),
    });
    let walker = FakeWalker::new(sample_tree(&[]));
    let catalog = Arc::new(MemoryCatalog::new());
    let h = harness(&env, walker.clone(), catalog.clone(), Arc::new(Inventory::in_memory()));

    let report = h.synchroniser.run_cycle().await;
    assert_eq!(report.bindings_upserted, 2);

    let special_binding = catalog.binding(&binding_id(BASE_URL, &special)).unwrap();
    assert_eq!(special_binding.resource_ids, vec![id_of(&property("P1"))]);
    let default_binding = catalog.binding(&binding_id(BASE_URL, &default_pair())).unwrap();
    let mut expected = vec![id_of(&submodel()), id_of(&property("P2"))];
    expected.sort();
    assert_eq!(default_binding.resource_ids, expected);

    // Removing the only member deletes the binding it exclusively owned.
    walker.set_tree(sample_tree(&["P1"]));
    h.synchroniser.run_cycle().await;
    let report = h.synchroniser.run_cycle().await;
    assert_eq!(report.deleted, 1);
    assert_eq!(report.bindings_deleted, 1);
    assert!(catalog.binding(&binding_id(BASE_URL, &special)).is_none());
    assert_eq!(
        catalog
            .binding(&binding_id(BASE_URL, &default_pair()))
            .unwrap()
            .resource_ids
            .len(),
        2
    );
}

#[tokio::test]
async fn test_element_with_invalid_id_short_is_skipped_not_fatal() {
    let env = environment();
    let mut tree = sample_tree(&[]);
    tree.elements
        .push(element(submodel().child(KeyKind::Property, "1st-value").unwrap(), None));
    let walker = FakeWalker::new(tree);
    let catalog = Arc::new(MemoryCatalog::new());
    let h = harness(&env, walker, catalog.clone(), Arc::new(Inventory::in_memory()));

    let report = h.synchroniser.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.created, 3);
    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].reference.contains("1st-value"));
    assert_eq!(catalog.resource_count(), 3);
}

#[tokio::test]
async fn test_cataloging_shells_adds_shell_as_parent_resource() {
    let mut env = environment();
    env.catalog_shells = true;
    let walker = FakeWalker::new(sample_tree(&[]));
    let catalog = Arc::new(MemoryCatalog::new());
    let h = harness(&env, walker, catalog.clone(), Arc::new(Inventory::in_memory()));

    let report = h.synchroniser.run_cycle().await;
    assert_eq!(report.created, 4);
    let m1 = catalog.resource(&id_of(&submodel())).unwrap();
    assert_eq!(m1.parent_id, Some(id_of(&shell())));
    assert_eq!(h.inventory.children_of(&id_of(&shell())), vec![id_of(&submodel())]);
}

#[tokio::test]
async fn test_teardown_removes_every_resource_and_binding() {
    let env = environment();
    let catalog = Arc::new(MemoryCatalog::new());
    let h = harness(
        &env,
        FakeWalker::new(sample_tree(&[])),
        catalog.clone(),
        Arc::new(Inventory::in_memory()),
    );
    h.synchroniser.run_cycle().await;
    assert_eq!(catalog.resource_count(), 3);
    assert_eq!(catalog.bindings().len(), 1);

    let report = h.synchroniser.teardown().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.deleted, 3);
    assert_eq!(report.bindings_deleted, 1);
    assert_eq!(catalog.resource_count(), 0);
    assert!(catalog.bindings().is_empty());
    assert!(h.inventory.is_empty());
}

#[tokio::test]
async fn test_failed_teardown_is_rolled_back_and_keeps_inventory() {
    let env = environment();
    let inventory = Arc::new(Inventory::in_memory());
    let seed = harness(
        &env,
        FakeWalker::new(sample_tree(&[])),
        Arc::new(MemoryCatalog::new()),
        inventory.clone(),
    );
    seed.synchroniser.run_cycle().await;
    assert_eq!(inventory.len(), 3);

    let deletes = Arc::new(AtomicUsize::new(0));
    let counter = deletes.clone();
    let mut catalog = MockCatalogStore::new();
    catalog.expect_delete_binding().times(1).returning(|_| Ok(()));
    catalog
        .expect_delete_resource()
        .times(2)
        .returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                Err("connector unreachable".into())
            } else {
                Ok(())
            }
        });
    catalog.expect_create_resource().times(1).returning(|_| Ok(()));
    catalog.expect_upsert_binding().times(1).returning(|_| Ok(()));

    let h = harness(&env, FakeWalker::new(sample_tree(&[])), Arc::new(catalog), inventory);
    let report = h.synchroniser.teardown().await;

    assert!(matches!(report.outcome, CycleOutcome::Failed { .. }));
    assert_eq!(report.deleted, 0);
    assert_eq!(h.inventory.len(), 3);
}
