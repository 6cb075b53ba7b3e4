//! Reconciler: mirrors one repository's element tree into the connector catalog.
//!
//! A cycle:
//!   - is single-flight per environment (a trigger while a cycle runs is dropped, not queued)
//!   - is skipped while the availability prober reports the repository as down
//!   - walks the complete live tree; a failed walk leaves every store untouched
//!   - diffs the live set against the inventory by [`StableId`] and plans creates, updates,
//!     debounced deletes and policy-binding changes
//!   - applies the catalog mutations as one batch, compensating in reverse on failure
//!   - commits the inventory only for mutations that remain applied
//!   - publishes a [`SynchroniseReport`] on a watch channel and in the log
//!
//! [`Synchroniser::teardown`] runs the same batch machinery with a plan that removes every
//! cataloged resource and binding of the environment, for unregistering a repository.
//!
//! # Major Types
//! - [`Synchroniser`]: owns the collaborators of one environment and runs cycles
//! - [`SyncSettings`]: the per-environment knobs a cycle needs
//! - [`SynchroniseReport`] / [`CycleOutcome`]: the cycle summary
//!
//! # Error Handling
//! Walk failures and recoverable batch failures end the cycle as `Failed` and are retried on
//! the next interval. Id collisions and batch failures that cannot be rolled back end it as
//! `Fatal`. Invalid data addresses never fail a cycle; the element is reported as skipped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EnvironmentConfig;
use crate::contract::{CatalogResource, CatalogStore, PolicyBinding, TreeWalker};
use crate::error::{ConfigError, SyncError};
use crate::inventory::{Inventory, InventoryChange};
use crate::model::{DataAddress, EntryState, InventoryEntry, LiveTree, PolicyPair};
use crate::policy::{binding_id, PolicyRules};
use crate::prober::Availability;
use crate::reference::{KeyKind, StableId};

/// Per-environment settings of the reconciler.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Stable-id namespace; the repository base URL without trailing slash.
    pub namespace: String,
    pub headers: BTreeMap<String, String>,
    pub catalog_shells: bool,
    /// Consecutive absent observations before an entry is deleted (at least 1).
    pub delete_after_missed: u32,
    pub policies: PolicyRules,
}

impl SyncSettings {
    pub fn from_config(env: &EnvironmentConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            namespace: env.namespace().to_string(),
            headers: env.headers.clone(),
            catalog_shells: env.catalog_shells,
            delete_after_missed: env.sync.delete_after_missed.max(1),
            policies: PolicyRules::compile(&env.policies)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    /// The prober reports the repository as down; nothing was attempted.
    SkippedUnavailable,
    /// Another cycle holds the single-flight lock.
    Coalesced,
    /// Nothing changed; retried on the next interval.
    Failed { reason: String },
    Cancelled,
    /// Needs attention: state may not match the catalog, or ids collide.
    Fatal { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedElement {
    pub reference: String,
    pub violations: Vec<String>,
}

/// Summary of one cycle.
#[derive(Debug, Clone)]
pub struct SynchroniseReport {
    pub cycle_id: Uuid,
    pub environment: String,
    pub outcome: CycleOutcome,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub marked_stale: usize,
    pub revived: usize,
    pub unchanged: usize,
    pub bindings_upserted: usize,
    pub bindings_deleted: usize,
    pub skipped: Vec<SkippedElement>,
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl SynchroniseReport {
    fn new(environment: &str, outcome: CycleOutcome) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            environment: environment.to_string(),
            outcome,
            created: 0,
            updated: 0,
            deleted: 0,
            marked_stale: 0,
            revived: 0,
            unchanged: 0,
            bindings_upserted: 0,
            bindings_deleted: 0,
            skipped: Vec::new(),
            errors: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Catalog mutations applied by this cycle.
    pub fn mutations(&self) -> usize {
        self.created + self.updated + self.deleted + self.bindings_upserted + self.bindings_deleted
    }

    pub fn is_success(&self) -> bool {
        self.outcome == CycleOutcome::Completed
    }
}

/// Answer to a manual trigger; the cycle result arrives on the report channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAck {
    Started,
    AlreadyRunning,
}

/// One catalog mutation of a batch, with what is needed to undo it.
#[derive(Debug, Clone)]
enum Mutation {
    CreateResource(CatalogResource),
    UpdateResource {
        before: CatalogResource,
        after: CatalogResource,
    },
    UpsertBinding {
        before: Option<PolicyBinding>,
        after: PolicyBinding,
    },
    DeleteBinding(PolicyBinding),
    DeleteResource(CatalogResource),
}

impl Mutation {
    fn operation(&self) -> &'static str {
        match self {
            Mutation::CreateResource(_) => "create_resource",
            Mutation::UpdateResource { .. } => "update_resource",
            Mutation::UpsertBinding { .. } => "upsert_binding",
            Mutation::DeleteBinding(_) => "delete_binding",
            Mutation::DeleteResource(_) => "delete_resource",
        }
    }

    fn target(&self) -> String {
        match self {
            Mutation::CreateResource(r) | Mutation::DeleteResource(r) => r.id.to_string(),
            Mutation::UpdateResource { after, .. } => after.id.to_string(),
            Mutation::UpsertBinding { after, .. } => after.id.clone(),
            Mutation::DeleteBinding(b) => b.id.clone(),
        }
    }

    fn is_binding(&self) -> bool {
        matches!(
            self,
            Mutation::UpsertBinding { .. } | Mutation::DeleteBinding(_)
        )
    }

    async fn apply(&self, catalog: &dyn CatalogStore) -> Result<(), SyncError> {
        let result = match self {
            Mutation::CreateResource(r) => catalog.create_resource(r).await,
            Mutation::UpdateResource { after, .. } => catalog.update_resource(after).await,
            Mutation::UpsertBinding { after, .. } => catalog.upsert_binding(after).await,
            Mutation::DeleteBinding(b) => catalog.delete_binding(&b.id).await,
            Mutation::DeleteResource(r) => catalog.delete_resource(&r.id).await,
        };
        result.map_err(|source| SyncError::Store {
            operation: self.operation(),
            target: self.target(),
            source,
        })
    }

    async fn compensate(&self, catalog: &dyn CatalogStore) -> Result<(), SyncError> {
        let (operation, result) = match self {
            Mutation::CreateResource(r) => ("delete_resource", catalog.delete_resource(&r.id).await),
            Mutation::UpdateResource { before, .. } => {
                ("update_resource", catalog.update_resource(before).await)
            }
            Mutation::UpsertBinding {
                before: Some(before),
                ..
            } => ("upsert_binding", catalog.upsert_binding(before).await),
            Mutation::UpsertBinding {
                before: None,
                after,
            } => ("delete_binding", catalog.delete_binding(&after.id).await),
            Mutation::DeleteBinding(b) => ("upsert_binding", catalog.upsert_binding(b).await),
            Mutation::DeleteResource(r) => ("create_resource", catalog.create_resource(r).await),
        };
        result.map_err(|source| SyncError::Store {
            operation,
            target: self.target(),
            source,
        })
    }
}

/// A mutation plus the inventory change it implies once applied.
#[derive(Debug, Clone)]
struct Step {
    mutation: Mutation,
    inventory: Option<InventoryChange>,
    /// Entry as it was before the cycle, for updates and deletes.
    previous: Option<InventoryEntry>,
}

/// The outcome of diffing one live tree against the inventory.
#[derive(Debug, Default)]
struct Plan {
    steps: Vec<Step>,
    /// Inventory-only changes (stale marks, revivals), committed on success.
    bookkeeping: Vec<InventoryChange>,
    skipped: Vec<SkippedElement>,
    created: usize,
    updated: usize,
    deleted: usize,
    marked_stale: usize,
    revived: usize,
    unchanged: usize,
    bindings_upserted: usize,
    bindings_deleted: usize,
}

/// Diffs `tree` against `existing`. Pure: no I/O, no clock.
fn plan_cycle(
    settings: &SyncSettings,
    tree: &LiveTree,
    existing: &[InventoryEntry],
) -> Result<Plan, SyncError> {
    let mut plan = Plan::default();
    let by_id: HashMap<&StableId, &InventoryEntry> = existing.iter().map(|e| (&e.id, e)).collect();

    // Policy selection needs parents first.
    let mut ordered: Vec<_> = tree.elements.iter().collect();
    ordered.sort_by(|a, b| {
        a.reference
            .depth()
            .cmp(&b.reference.depth())
            .then_with(|| a.reference.cmp(&b.reference))
    });

    let mut live_refs: HashMap<StableId, String> = HashMap::new();
    let mut selected: HashMap<StableId, Vec<PolicyPair>> = HashMap::new();
    let mut desired: BTreeMap<StableId, InventoryEntry> = BTreeMap::new();

    for element in ordered {
        let id = StableId::derive(&settings.namespace, &element.reference);
        let rendered = element.reference.to_string();
        if let Some(first) = live_refs.insert(id.clone(), rendered.clone()) {
            return Err(SyncError::IdCollision {
                id,
                first,
                second: rendered,
            });
        }
        if let Some(entry) = by_id.get(&id) {
            if entry.reference != element.reference {
                return Err(SyncError::IdCollision {
                    id,
                    first: entry.reference.to_string(),
                    second: rendered,
                });
            }
        }

        let parent = element
            .reference
            .parent()
            .map(|p| StableId::derive(&settings.namespace, &p));
        let inherited = parent.as_ref().and_then(|p| selected.get(p)).map(Vec::as_slice);
        let policies = settings
            .policies
            .select(&element.reference, &element.metadata, inherited);
        selected.insert(id.clone(), policies.clone());

        if element.reference.kind() == KeyKind::AssetAdministrationShell && !settings.catalog_shells
        {
            continue;
        }

        let data_address = match DataAddress::new(
            settings.namespace.clone(),
            element.reference.clone(),
            element.content_kind,
            settings.headers.clone(),
        ) {
            Ok(address) => address,
            Err(e) => {
                warn!(reference = %rendered, error = %e, "[SYNC] skipping element with invalid data address");
                plan.skipped.push(SkippedElement {
                    reference: rendered,
                    violations: e.violations.iter().map(ToString::to_string).collect(),
                });
                continue;
            }
        };

        let parent_id = match element.reference.parent() {
            Some(p) if p.kind() == KeyKind::AssetAdministrationShell && !settings.catalog_shells => {
                None
            }
            Some(_) => parent,
            None => None,
        };

        desired.insert(
            id.clone(),
            InventoryEntry {
                id,
                reference: element.reference.clone(),
                parent_id,
                fingerprint: element.metadata.fingerprint(),
                metadata: element.metadata.clone(),
                data_address,
                state: EntryState::Active,
                missed_cycles: 0,
                policies,
            },
        );
    }

    // Creates, updates and revivals.
    let mut binding_updates: Vec<Step> = Vec::new();
    for (id, entry) in &desired {
        match by_id.get(id) {
            None => {
                plan.created += 1;
                plan.steps.push(Step {
                    mutation: Mutation::CreateResource(CatalogResource::from_entry(entry)),
                    inventory: Some(InventoryChange::Upsert(entry.clone())),
                    previous: None,
                });
            }
            Some(current) => {
                let changed = current.fingerprint != entry.fingerprint
                    || current.data_address != entry.data_address
                    || current.parent_id != entry.parent_id
                    || current.policies != entry.policies;
                if current.state == EntryState::Stale {
                    plan.revived += 1;
                }
                if changed {
                    plan.updated += 1;
                    plan.steps.push(Step {
                        mutation: Mutation::UpdateResource {
                            before: CatalogResource::from_entry(current),
                            after: CatalogResource::from_entry(entry),
                        },
                        inventory: Some(InventoryChange::Upsert(entry.clone())),
                        previous: Some((*current).clone()),
                    });
                } else if current.state == EntryState::Stale || current.missed_cycles != 0 {
                    plan.bookkeeping.push(InventoryChange::Upsert(entry.clone()));
                } else {
                    plan.unchanged += 1;
                }
            }
        }
    }

    // Absent entries: debounce, then delete with every absent descendant.
    let children = children_index(existing);
    let mut doomed: BTreeSet<StableId> = BTreeSet::new();
    let mut surviving: Vec<&InventoryEntry> = Vec::new();
    for entry in existing.iter().filter(|e| !desired.contains_key(&e.id)) {
        let missed = entry.missed_cycles.saturating_add(1);
        if missed >= settings.delete_after_missed {
            doomed.insert(entry.id.clone());
            let mut worklist = vec![&entry.id];
            while let Some(current) = worklist.pop() {
                for child in children.get(current).into_iter().flatten() {
                    if !desired.contains_key(*child) && doomed.insert((*child).clone()) {
                        worklist.push(*child);
                    }
                }
            }
        } else {
            surviving.push(entry);
        }
    }
    for entry in surviving {
        if doomed.contains(&entry.id) {
            continue;
        }
        let mut stale = entry.clone();
        stale.state = EntryState::Stale;
        stale.missed_cycles = entry.missed_cycles.saturating_add(1);
        plan.marked_stale += 1;
        plan.bookkeeping.push(InventoryChange::Upsert(stale));
    }

    // Policy bindings: membership before the cycle versus after it.
    let before = memberships(existing.iter());
    let after_entries = existing
        .iter()
        .filter(|e| !doomed.contains(&e.id) && !desired.contains_key(&e.id))
        .chain(desired.values());
    let after = memberships(after_entries);
    for (pair, ids) in &after {
        let previous = before.get(pair);
        if previous == Some(ids) {
            continue;
        }
        let id = binding_id(&settings.namespace, pair);
        plan.bindings_upserted += 1;
        binding_updates.push(Step {
            mutation: Mutation::UpsertBinding {
                before: previous.map(|ids| binding(&id, pair, ids)),
                after: binding(&id, pair, ids),
            },
            inventory: None,
            previous: None,
        });
    }
    let mut binding_deletes = Vec::new();
    for (pair, ids) in &before {
        if after.contains_key(pair) {
            continue;
        }
        let id = binding_id(&settings.namespace, pair);
        plan.bindings_deleted += 1;
        binding_deletes.push(Step {
            mutation: Mutation::DeleteBinding(binding(&id, pair, ids)),
            inventory: None,
            previous: None,
        });
    }
    plan.steps.extend(binding_updates);
    plan.steps.extend(binding_deletes);

    // Resource deletes, children before parents.
    let doomed_entries: Vec<&InventoryEntry> = doomed
        .iter()
        .filter_map(|id| by_id.get(id).copied())
        .collect();
    push_deletes(&mut plan, doomed_entries);

    Ok(plan)
}

/// Removes every binding, then every resource, of the environment.
fn plan_teardown(settings: &SyncSettings, existing: &[InventoryEntry]) -> Plan {
    let mut plan = Plan::default();
    for (pair, ids) in &memberships(existing.iter()) {
        let id = binding_id(&settings.namespace, pair);
        plan.bindings_deleted += 1;
        plan.steps.push(Step {
            mutation: Mutation::DeleteBinding(binding(&id, pair, ids)),
            inventory: None,
            previous: None,
        });
    }
    push_deletes(&mut plan, existing.iter().collect());
    plan
}

fn push_deletes(plan: &mut Plan, mut entries: Vec<&InventoryEntry>) {
    entries.sort_by(|a, b| {
        b.reference
            .depth()
            .cmp(&a.reference.depth())
            .then_with(|| a.reference.cmp(&b.reference))
    });
    for entry in entries {
        plan.deleted += 1;
        plan.steps.push(Step {
            mutation: Mutation::DeleteResource(CatalogResource::from_entry(entry)),
            inventory: Some(InventoryChange::Remove(entry.id.clone())),
            previous: Some(entry.clone()),
        });
    }
}

fn children_index(entries: &[InventoryEntry]) -> HashMap<&StableId, Vec<&StableId>> {
    let mut index: HashMap<&StableId, Vec<&StableId>> = HashMap::new();
    for entry in entries {
        if let Some(parent) = &entry.parent_id {
            index.entry(parent).or_default().push(&entry.id);
        }
    }
    index
}

fn memberships<'a>(
    entries: impl Iterator<Item = &'a InventoryEntry>,
) -> BTreeMap<PolicyPair, BTreeSet<StableId>> {
    let mut map: BTreeMap<PolicyPair, BTreeSet<StableId>> = BTreeMap::new();
    for entry in entries {
        for pair in &entry.policies {
            map.entry(pair.clone()).or_default().insert(entry.id.clone());
        }
    }
    map
}

fn binding(id: &str, pair: &PolicyPair, ids: &BTreeSet<StableId>) -> PolicyBinding {
    PolicyBinding {
        id: id.to_string(),
        access_policy_id: pair.access_policy_id.clone(),
        contract_policy_id: pair.contract_policy_id.clone(),
        resource_ids: ids.iter().cloned().collect(),
    }
}

/// Reconciler of one environment.
pub struct Synchroniser {
    environment: String,
    settings: SyncSettings,
    walker: Arc<dyn TreeWalker>,
    catalog: Arc<dyn CatalogStore>,
    inventory: Arc<Inventory>,
    availability: watch::Receiver<Availability>,
    lock: Arc<Mutex<()>>,
    reports: watch::Sender<Option<SynchroniseReport>>,
    cancel: CancellationToken,
    /// The cycle started by the latest manual trigger.
    triggered: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Synchroniser {
    pub fn new(
        environment: impl Into<String>,
        settings: SyncSettings,
        walker: Arc<dyn TreeWalker>,
        catalog: Arc<dyn CatalogStore>,
        inventory: Arc<Inventory>,
        availability: watch::Receiver<Availability>,
        cancel: CancellationToken,
    ) -> Self {
        let (reports, _rx) = watch::channel(None);
        Self {
            environment: environment.into(),
            settings,
            walker,
            catalog,
            inventory,
            availability,
            lock: Arc::new(Mutex::new(())),
            reports,
            cancel,
            triggered: std::sync::Mutex::new(None),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    /// Latest report of any finished cycle.
    pub fn subscribe(&self) -> watch::Receiver<Option<SynchroniseReport>> {
        self.reports.subscribe()
    }

    pub fn latest_report(&self) -> Option<SynchroniseReport> {
        self.reports.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Runs a cycle now and waits for it. Returns a `Coalesced` report if one is running.
    pub async fn run_cycle(&self) -> SynchroniseReport {
        match self.lock.clone().try_lock_owned() {
            Ok(_guard) => self.run_locked().await,
            Err(_) => {
                debug!(environment = %self.environment, "[SYNC] cycle already running, trigger coalesced");
                SynchroniseReport::new(&self.environment, CycleOutcome::Coalesced)
            }
        }
    }

    /// Starts a cycle in the background unless one is already running.
    pub fn trigger(self: &Arc<Self>) -> TriggerAck {
        match self.lock.clone().try_lock_owned() {
            Ok(guard) => {
                let this = Arc::clone(self);
                let handle = tokio::spawn(async move {
                    let _guard = guard;
                    this.run_locked().await;
                });
                // The lock was free, so any earlier triggered cycle has already finished.
                *self.triggered.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                info!(environment = %self.environment, "[SYNC] manual trigger accepted");
                TriggerAck::Started
            }
            Err(_) => {
                info!(environment = %self.environment, "[SYNC] manual trigger coalesced into running cycle");
                TriggerAck::AlreadyRunning
            }
        }
    }

    /// Waits for the cycle of the latest manual trigger, if any, to finish.
    pub async fn wait_triggered(&self) {
        let handle = self
            .triggered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(environment = %self.environment, error = %e, "[SYNC] triggered cycle ended abnormally");
            }
        }
    }

    /// Deletes every resource and binding this environment has cataloged, after waiting
    /// for a running cycle. Skips the availability gate; compensates like any batch.
    pub async fn teardown(&self) -> SynchroniseReport {
        let _guard = self.lock.lock().await;
        let started = Instant::now();
        let existing = self.inventory.list();
        info!(environment = %self.environment, entries = existing.len(), "[SYNC] tearing down environment");
        let mut report = self.apply(plan_teardown(&self.settings, &existing)).await;
        report.duration = started.elapsed();
        self.log_report(&report);
        self.reports.send_replace(Some(report.clone()));
        report
    }

    async fn run_locked(&self) -> SynchroniseReport {
        let started = Instant::now();
        let mut report = self.cycle().await;
        report.duration = started.elapsed();
        self.log_report(&report);
        self.reports.send_replace(Some(report.clone()));
        report
    }

    async fn cycle(&self) -> SynchroniseReport {
        let availability = *self.availability.borrow();
        if !availability.allows_sync() {
            info!(environment = %self.environment, "[SYNC] repository down, skipping cycle");
            return SynchroniseReport::new(&self.environment, CycleOutcome::SkippedUnavailable);
        }
        if self.cancel.is_cancelled() {
            return SynchroniseReport::new(&self.environment, CycleOutcome::Cancelled);
        }

        info!(environment = %self.environment, ?availability, "[SYNC] starting cycle");
        let walked = tokio::select! {
            _ = self.cancel.cancelled() => {
                return SynchroniseReport::new(&self.environment, CycleOutcome::Cancelled);
            }
            walked = self.walker.walk() => walked,
        };
        let tree = match walked {
            Ok(tree) => tree,
            Err(e) => {
                let error = SyncError::from(e);
                error!(environment = %self.environment, error = %error, "[SYNC][ERROR] walk failed, state left untouched");
                let mut report = SynchroniseReport::new(
                    &self.environment,
                    CycleOutcome::Failed {
                        reason: error.to_string(),
                    },
                );
                report.errors.push(error.to_string());
                return report;
            }
        };

        let existing = self.inventory.list();
        let plan = match plan_cycle(&self.settings, &tree, &existing) {
            Ok(plan) => plan,
            Err(e) => {
                error!(environment = %self.environment, error = %e, "[SYNC][FATAL] cannot plan cycle");
                let mut report = SynchroniseReport::new(
                    &self.environment,
                    CycleOutcome::Fatal {
                        reason: e.to_string(),
                    },
                );
                report.errors.push(e.to_string());
                return report;
            }
        };
        debug!(
            environment = %self.environment,
            steps = plan.steps.len(),
            bookkeeping = plan.bookkeeping.len(),
            "[SYNC] planned cycle"
        );
        self.apply(plan).await
    }

    async fn apply(&self, plan: Plan) -> SynchroniseReport {
        let mut report = SynchroniseReport::new(&self.environment, CycleOutcome::Completed);
        report.skipped = plan.skipped;

        let mut applied: Vec<&Step> = Vec::new();
        let mut failure: Option<SyncError> = None;
        for step in &plan.steps {
            if self.cancel.is_cancelled() {
                failure = Some(SyncError::Cancelled);
                break;
            }
            match step.mutation.apply(self.catalog.as_ref()).await {
                Ok(()) => applied.push(step),
                Err(e) => {
                    error!(environment = %self.environment, error = %e, "[SYNC][ERROR] catalog mutation failed");
                    failure = Some(e);
                    break;
                }
            }
        }

        let Some(failure) = failure else {
            let changes: Vec<InventoryChange> = plan
                .steps
                .iter()
                .filter_map(|s| s.inventory.clone())
                .chain(plan.bookkeeping)
                .collect();
            if let Err(e) = self.inventory.commit(changes) {
                // The catalog already holds the batch; the inventory is now behind it.
                let error = SyncError::from(e);
                report.outcome = CycleOutcome::Fatal {
                    reason: error.to_string(),
                };
                report.errors.push(error.to_string());
                return report;
            }
            report.created = plan.created;
            report.updated = plan.updated;
            report.deleted = plan.deleted;
            report.marked_stale = plan.marked_stale;
            report.revived = plan.revived;
            report.unchanged = plan.unchanged;
            report.bindings_upserted = plan.bindings_upserted;
            report.bindings_deleted = plan.bindings_deleted;
            return report;
        };

        report.errors.push(failure.to_string());
        let cancelled = matches!(failure, SyncError::Cancelled);

        // Roll back in reverse; whatever cannot be undone stays applied.
        let mut retained: Vec<&Step> = Vec::new();
        for step in applied.iter().rev() {
            if let Err(e) = step.mutation.compensate(self.catalog.as_ref()).await {
                error!(environment = %self.environment, error = %e, "[SYNC][FATAL] compensation failed");
                report.errors.push(format!("compensation: {e}"));
                retained.push(*step);
            }
        }

        if retained.is_empty() {
            report.outcome = if cancelled {
                CycleOutcome::Cancelled
            } else {
                CycleOutcome::Failed {
                    reason: failure.to_string(),
                }
            };
            return report;
        }

        let reason = SyncError::Unrecoverable(format!(
            "{} of {} applied mutations could not be rolled back after: {failure}",
            retained.len(),
            applied.len()
        ));
        report.outcome = CycleOutcome::Fatal {
            reason: reason.to_string(),
        };
        let bindings_intact = plan
            .steps
            .iter()
            .filter(|s| s.mutation.is_binding())
            .all(|s| retained.iter().any(|r| std::ptr::eq(*r, s)));
        let changes: Vec<InventoryChange> = retained
            .iter()
            .filter_map(|step| record_retained(step, bindings_intact))
            .collect();
        if let Err(e) = self.inventory.commit(changes) {
            report.errors.push(SyncError::from(e).to_string());
        }
        report
    }

    fn log_report(&self, report: &SynchroniseReport) {
        match &report.outcome {
            CycleOutcome::Completed => info!(
                environment = %report.environment,
                cycle_id = %report.cycle_id,
                created = report.created,
                updated = report.updated,
                deleted = report.deleted,
                marked_stale = report.marked_stale,
                revived = report.revived,
                unchanged = report.unchanged,
                bindings_upserted = report.bindings_upserted,
                bindings_deleted = report.bindings_deleted,
                skipped = report.skipped.len(),
                duration_ms = report.duration.as_millis() as u64,
                "[SYNC] cycle completed"
            ),
            CycleOutcome::Fatal { reason } => error!(
                environment = %report.environment,
                cycle_id = %report.cycle_id,
                reason = %reason,
                errors = ?report.errors,
                "[SYNC][FATAL] cycle aborted"
            ),
            outcome => warn!(
                environment = %report.environment,
                cycle_id = %report.cycle_id,
                ?outcome,
                errors = ?report.errors,
                duration_ms = report.duration.as_millis() as u64,
                "[SYNC] cycle did not complete"
            ),
        }
    }
}

/// Inventory change for a mutation that stayed applied after a failed rollback. Policy
/// membership is only recorded if the binding steps are known to be in place; otherwise
/// the old (or no) policies are kept so the next cycle re-evaluates the bindings.
fn record_retained(step: &Step, bindings_intact: bool) -> Option<InventoryChange> {
    match step.inventory.clone()? {
        InventoryChange::Upsert(mut entry) => {
            if !bindings_intact {
                entry.policies = step
                    .previous
                    .as_ref()
                    .map(|p| p.policies.clone())
                    .unwrap_or_default();
            }
            Some(InventoryChange::Upsert(entry))
        }
        remove => Some(remove),
    }
}
