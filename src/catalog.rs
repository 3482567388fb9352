//! In-memory record store for projects, results and subscriptions.
//!
//! Every save or delete of a watched record calls into the [`EventTrigger`]
//! explicitly once the write lock has been released, so any mutation path
//! notifies subscribers.
//!
//! With a `data_dir`, the registry (projects, subscriptions and the id
//! sequence) is written to `catalog.json` next to the delivery log, so ids
//! are never handed out twice across restarts.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::config::WebhookConfig;
use crate::entities::{
    Project, ReferenceSet, ResultEntry, Submission, TestReference, TestResult, TestStatus,
    WatchedEntity,
};
use crate::error::{CatalogError, LogStoreError, TransportError};
use crate::executor::DeliveryExecutor;
use crate::log_store::DeliveryLog;
use crate::pool::DispatchPool;
use crate::resolver::SubscriptionSource;
use crate::transport::{HttpTransport, Transport};
use crate::trigger::{EventTrigger, ProcessingSwitch};
use crate::types::{DeliveryLogEntry, EntityKind, InterestFlags, Subscription};

#[derive(Default)]
struct Tables {
    next_id: u64,
    projects: HashMap<u64, Project>,
    submissions: HashMap<u64, Submission>,
    test_results: HashMap<u64, TestResult>,
    reference_sets: HashMap<u64, ReferenceSet>,
    test_references: HashMap<u64, TestReference>,
    subscriptions: HashMap<u64, Subscription>,
}

impl Tables {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn registry(&self) -> Registry {
        let mut projects: Vec<Project> = self.projects.values().cloned().collect();
        projects.sort_by_key(|p| p.id);
        let mut subscriptions: Vec<Subscription> = self.subscriptions.values().cloned().collect();
        subscriptions.sort_by_key(|s| s.id);
        Registry {
            next_id: self.next_id,
            projects,
            subscriptions,
        }
    }
}

/// Persisted form of the registry, `<data_dir>/catalog.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    next_id: u64,
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default)]
    subscriptions: Vec<Subscription>,
}

/// The raw tables, shared with the resolver as a [`SubscriptionSource`].
#[derive(Default)]
pub struct Records {
    tables: RwLock<Tables>,
}

impl Records {
    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SubscriptionSource for Records {
    fn project(&self, id: u64) -> Option<Project> {
        self.read().projects.get(&id).cloned()
    }

    fn submission(&self, id: u64) -> Option<Submission> {
        self.read().submissions.get(&id).cloned()
    }

    fn reference_set(&self, id: u64) -> Option<ReferenceSet> {
        self.read().reference_sets.get(&id).cloned()
    }

    fn subscriptions_for(&self, project_id: u64) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .read()
            .subscriptions
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.id);
        subs
    }
}

// ─── Inputs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct NewSubscription {
    pub project_id: u64,
    pub name: String,
    pub target_url: String,
    pub shared_secret: String,
    #[serde(flatten)]
    pub interests: InterestFlags,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionUpdate {
    pub name: Option<String>,
    pub target_url: Option<String>,
    pub shared_secret: Option<String>,
    pub on_submission: Option<bool>,
    pub on_test_result: Option<bool>,
    pub on_reference_set: Option<bool>,
    pub on_test_reference: Option<bool>,
}

/// Create when `id` is absent, otherwise edit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmissionInput {
    pub id: Option<u64>,
    pub project_id: Option<u64>,
    #[serde(default)]
    pub info: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestResultInput {
    pub id: Option<u64>,
    pub name: String,
    pub submission_id: Option<u64>,
    #[serde(default)]
    pub results: Vec<ResultEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReferenceSetInput {
    pub id: Option<u64>,
    pub project_id: Option<u64>,
    #[serde(default)]
    pub property_values: Map<String, Value>,
}

/// Looked up by (`reference_set_id`, `test_name`) when `id` is absent.
#[derive(Debug, Clone, Deserialize)]
pub struct TestReferenceInput {
    pub id: Option<u64>,
    pub reference_set_id: Option<u64>,
    pub test_name: String,
    #[serde(default)]
    pub references: Map<String, Value>,
    /// Test result the new reference values were taken from.
    pub test_id: Option<u64>,
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

pub struct Catalog {
    records: Arc<Records>,
    trigger: Arc<EventTrigger>,
    log: Arc<DeliveryLog>,
    data_dir: Option<PathBuf>,
}

impl Catalog {
    /// Wire the record store to a trigger delivering through `transport`.
    pub fn with_transport(config: &WebhookConfig, transport: Arc<dyn Transport>) -> Self {
        let records = Arc::new(Records::default());
        let log = Arc::new(DeliveryLog::new(config.data_dir.clone()));
        let executor = Arc::new(DeliveryExecutor::new(transport, log.clone(), config.sign_payloads));
        let trigger = Arc::new(EventTrigger::new(
            records.clone(),
            executor,
            DispatchPool::new(config.mode),
            ProcessingSwitch::new(config.enabled),
        ));
        Self {
            records,
            trigger,
            log,
            data_dir: config.data_dir.clone(),
        }
    }

    /// Same as [`Catalog::with_transport`] with a reqwest transport.
    pub fn from_config(config: &WebhookConfig) -> Result<Self, TransportError> {
        let transport = HttpTransport::new(config.request_timeout())?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn trigger(&self) -> &Arc<EventTrigger> {
        &self.trigger
    }

    pub fn switch(&self) -> &ProcessingSwitch {
        self.trigger.switch()
    }

    pub fn delivery_log(&self) -> &Arc<DeliveryLog> {
        &self.log
    }

    pub async fn drain(&self, timeout: Duration) -> bool {
        self.trigger.drain(timeout).await
    }

    // ─── Persistence ───

    /// Restore the registry and the delivery log from `data_dir`. Only
    /// histories of known subscriptions are kept. Returns the number of
    /// subscriptions restored.
    pub fn load(&self) -> Result<usize, CatalogError> {
        let Some(path) = self.registry_path() else {
            return Ok(0);
        };
        let known: HashSet<u64> = {
            let mut t = self.records.write();
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|source| LogStoreError::Io {
                    action: "read",
                    path: path.display().to_string(),
                    source,
                })?;
                let registry: Registry =
                    serde_json::from_str(&content).map_err(|source| LogStoreError::Json {
                        path: path.display().to_string(),
                        source,
                    })?;

                let highest = registry
                    .projects
                    .iter()
                    .map(|p| p.id)
                    .chain(registry.subscriptions.iter().map(|s| s.id))
                    .fold(registry.next_id, u64::max);
                t.next_id = t.next_id.max(highest);
                for project in registry.projects {
                    t.projects.insert(project.id, project);
                }
                for sub in registry.subscriptions {
                    t.subscriptions.insert(sub.id, sub);
                }
            }
            t.subscriptions.keys().copied().collect()
        };

        self.log.load(|id| known.contains(&id))?;
        tracing::info!(subscriptions = known.len(), "catalog loaded");
        Ok(known.len())
    }

    fn registry_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("catalog.json"))
    }

    /// Called with the write lock held so snapshots land in order.
    fn save_registry(&self, t: &Tables) {
        let Some(path) = self.registry_path() else {
            return;
        };
        if let Err(e) = write_registry(&path, &t.registry()) {
            tracing::error!(error = %e, "failed to persist catalog");
        }
    }

    // ─── Projects ───

    pub fn create_project(&self, name: impl Into<String>, slug: impl Into<String>) -> Project {
        let mut t = self.records.write();
        let project = Project {
            id: t.allocate(),
            name: name.into(),
            slug: slug.into(),
        };
        t.projects.insert(project.id, project.clone());
        self.save_registry(&t);
        project
    }

    pub fn projects(&self) -> Vec<Project> {
        let mut items: Vec<Project> = self.records.read().projects.values().cloned().collect();
        items.sort_by_key(|p| p.id);
        items
    }

    /// Removes the project and its subscriptions. Owned records keep
    /// existing with their project link cleared.
    pub fn delete_project(&self, id: u64) -> Result<Project, CatalogError> {
        let (project, removed_subs) = {
            let mut t = self.records.write();
            let project = t
                .projects
                .remove(&id)
                .ok_or(CatalogError::NotFound { kind: "project", id })?;
            for s in t.submissions.values_mut().filter(|s| s.project_id == Some(id)) {
                s.project_id = None;
            }
            for r in t.reference_sets.values_mut().filter(|r| r.project_id == Some(id)) {
                r.project_id = None;
            }
            let removed: Vec<u64> = t
                .subscriptions
                .values()
                .filter(|s| s.project_id == id)
                .map(|s| s.id)
                .collect();
            for sub_id in &removed {
                t.subscriptions.remove(sub_id);
            }
            self.save_registry(&t);
            (project, removed)
        };
        for sub_id in removed_subs {
            self.drop_log(sub_id);
        }
        Ok(project)
    }

    // ─── Subscriptions ───

    pub fn create_subscription(&self, input: NewSubscription) -> Result<Subscription, CatalogError> {
        let mut t = self.records.write();
        if !t.projects.contains_key(&input.project_id) {
            return Err(CatalogError::NotFound {
                kind: "project",
                id: input.project_id,
            });
        }
        let id = t.allocate();
        let sub = Subscription::new(
            id,
            input.project_id,
            input.name,
            input.target_url,
            input.shared_secret,
            input.interests,
        )?;
        t.subscriptions.insert(id, sub.clone());
        self.save_registry(&t);
        tracing::info!(subscription_id = id, project_id = sub.project_id, "subscription created");
        Ok(sub)
    }

    pub fn update_subscription(
        &self,
        id: u64,
        update: SubscriptionUpdate,
    ) -> Result<Subscription, CatalogError> {
        let mut t = self.records.write();
        let current = t
            .subscriptions
            .get(&id)
            .ok_or(CatalogError::NotFound { kind: "subscription", id })?;

        let mut next = current.clone();
        if let Some(v) = update.name {
            next.name = v;
        }
        if let Some(v) = update.target_url {
            next.target_url = v;
        }
        if let Some(v) = update.shared_secret {
            next.shared_secret = v;
        }
        let flags = [
            (EntityKind::Submission, update.on_submission),
            (EntityKind::TestResult, update.on_test_result),
            (EntityKind::ReferenceSet, update.on_reference_set),
            (EntityKind::TestReference, update.on_test_reference),
        ];
        for (kind, value) in flags {
            if let Some(enabled) = value {
                next.interests = next.interests.with(kind, enabled);
            }
        }
        next.validate()?;

        t.subscriptions.insert(id, next.clone());
        self.save_registry(&t);
        Ok(next)
    }

    pub fn delete_subscription(&self, id: u64) -> Result<Subscription, CatalogError> {
        let removed = {
            let mut t = self.records.write();
            let removed = t
                .subscriptions
                .remove(&id)
                .ok_or(CatalogError::NotFound { kind: "subscription", id })?;
            self.save_registry(&t);
            removed
        };
        self.drop_log(id);
        Ok(removed)
    }

    pub fn subscription(&self, id: u64) -> Option<Subscription> {
        self.records.read().subscriptions.get(&id).cloned()
    }

    pub fn subscriptions(&self, project_id: u64) -> Vec<Subscription> {
        self.records.subscriptions_for(project_id)
    }

    fn drop_log(&self, subscription_id: u64) {
        if let Err(e) = self.log.remove_subscription(subscription_id) {
            tracing::error!(subscription_id, error = %e, "failed to remove delivery log");
        }
    }

    // ─── Delivery log (read side) ───

    /// Newest first.
    pub fn deliveries(&self, subscription_id: u64) -> Vec<DeliveryLogEntry> {
        self.log.entries(subscription_id)
    }

    pub fn last_delivery_status(&self, subscription_id: u64) -> Option<u16> {
        self.log.last_status(subscription_id)
    }

    // ─── Watched records ───

    pub async fn save_submission(&self, input: SubmissionInput) -> Result<Submission, CatalogError> {
        let now = Utc::now();
        let (submission, created) = {
            let mut t = self.records.write();
            match input.id {
                Some(id) => {
                    let s = t
                        .submissions
                        .get_mut(&id)
                        .ok_or(CatalogError::NotFound { kind: "submission", id })?;
                    if input.project_id.is_some() {
                        s.project_id = input.project_id;
                    }
                    if let Some(info) = input.info {
                        s.info = info;
                    }
                    s.updated = now;
                    (s.clone(), false)
                }
                None => {
                    let id = t.allocate();
                    let s = Submission {
                        id,
                        project_id: input.project_id,
                        created: now,
                        updated: now,
                        info: input.info.unwrap_or_default(),
                    };
                    t.submissions.insert(id, s.clone());
                    (s, true)
                }
            }
        };
        self.trigger
            .on_mutation(&WatchedEntity::Submission(submission.clone()), created)
            .await;
        Ok(submission)
    }

    pub async fn save_test_result(&self, input: TestResultInput) -> Result<TestResult, CatalogError> {
        let now = Utc::now();
        let status = TestStatus::aggregate(&input.results);
        let (result, created) = {
            let mut t = self.records.write();
            match input.id {
                Some(id) => {
                    let r = t
                        .test_results
                        .get_mut(&id)
                        .ok_or(CatalogError::NotFound { kind: "test result", id })?;
                    r.name = input.name;
                    if input.submission_id.is_some() {
                        r.submission_id = input.submission_id;
                    }
                    r.results = input.results;
                    r.status = status;
                    r.last_updated = now;
                    (r.clone(), false)
                }
                None => {
                    let id = t.allocate();
                    let r = TestResult {
                        id,
                        name: input.name,
                        submission_id: input.submission_id,
                        first_submitted: now,
                        last_updated: now,
                        results: input.results,
                        status,
                    };
                    t.test_results.insert(id, r.clone());
                    (r, true)
                }
            }
        };
        self.trigger
            .on_mutation(&WatchedEntity::TestResult(result.clone()), created)
            .await;
        Ok(result)
    }

    pub async fn save_reference_set(
        &self,
        input: ReferenceSetInput,
    ) -> Result<ReferenceSet, CatalogError> {
        let (set, created) = {
            let mut t = self.records.write();
            match input.id {
                Some(id) => {
                    let r = t
                        .reference_sets
                        .get_mut(&id)
                        .ok_or(CatalogError::NotFound { kind: "reference set", id })?;
                    if input.project_id.is_some() {
                        r.project_id = input.project_id;
                    }
                    r.property_values = input.property_values;
                    (r.clone(), false)
                }
                None => {
                    let id = t.allocate();
                    let r = ReferenceSet {
                        id,
                        project_id: input.project_id,
                        property_values: input.property_values,
                    };
                    t.reference_sets.insert(id, r.clone());
                    (r, true)
                }
            }
        };
        self.trigger
            .on_mutation(&WatchedEntity::ReferenceSet(set.clone()), created)
            .await;
        Ok(set)
    }

    pub async fn save_test_reference(
        &self,
        input: TestReferenceInput,
    ) -> Result<TestReference, CatalogError> {
        let (reference, created) = {
            let mut t = self.records.write();
            let existing = match input.id {
                Some(id) => Some(
                    t.test_references
                        .contains_key(&id)
                        .then_some(id)
                        .ok_or(CatalogError::NotFound { kind: "test reference", id })?,
                ),
                None => t
                    .test_references
                    .values()
                    .find(|r| {
                        r.reference_set_id == input.reference_set_id
                            && input.reference_set_id.is_some()
                            && r.test_name == input.test_name
                    })
                    .map(|r| r.id),
            };

            let (id, created) = match existing {
                Some(id) => (id, false),
                None => {
                    let id = t.allocate();
                    t.test_references.insert(
                        id,
                        TestReference {
                            id,
                            reference_set_id: input.reference_set_id,
                            test_name: input.test_name.clone(),
                            references: Map::new(),
                        },
                    );
                    (id, true)
                }
            };

            let r = t
                .test_references
                .get_mut(&id)
                .ok_or(CatalogError::NotFound { kind: "test reference", id })?;
            r.test_name = input.test_name;
            if input.reference_set_id.is_some() {
                r.reference_set_id = input.reference_set_id;
            }
            match input.test_id {
                Some(test_id) => r.update_references(input.references, test_id),
                None => r.references.extend(input.references),
            }
            (r.clone(), created)
        };
        self.trigger
            .on_mutation(&WatchedEntity::TestReference(reference.clone()), created)
            .await;
        Ok(reference)
    }

    /// Remove a watched record. Dependent records keep existing with their
    /// link cleared.
    pub fn delete_entity(&self, kind: EntityKind, id: u64) -> Result<WatchedEntity, CatalogError> {
        let removed = {
            let mut t = self.records.write();
            let not_found = CatalogError::NotFound {
                kind: kind_label(kind),
                id,
            };
            match kind {
                EntityKind::Submission => {
                    let s = t.submissions.remove(&id).ok_or(not_found)?;
                    for r in t.test_results.values_mut().filter(|r| r.submission_id == Some(id)) {
                        r.submission_id = None;
                    }
                    WatchedEntity::Submission(s)
                }
                EntityKind::TestResult => {
                    WatchedEntity::TestResult(t.test_results.remove(&id).ok_or(not_found)?)
                }
                EntityKind::ReferenceSet => {
                    let s = t.reference_sets.remove(&id).ok_or(not_found)?;
                    for r in t
                        .test_references
                        .values_mut()
                        .filter(|r| r.reference_set_id == Some(id))
                    {
                        r.reference_set_id = None;
                    }
                    WatchedEntity::ReferenceSet(s)
                }
                EntityKind::TestReference => {
                    WatchedEntity::TestReference(t.test_references.remove(&id).ok_or(not_found)?)
                }
            }
        };
        self.trigger.on_delete(&removed);
        Ok(removed)
    }

    pub fn entity(&self, kind: EntityKind, id: u64) -> Option<WatchedEntity> {
        let t = self.records.read();
        match kind {
            EntityKind::Submission => t.submissions.get(&id).cloned().map(WatchedEntity::Submission),
            EntityKind::TestResult => t.test_results.get(&id).cloned().map(WatchedEntity::TestResult),
            EntityKind::ReferenceSet => {
                t.reference_sets.get(&id).cloned().map(WatchedEntity::ReferenceSet)
            }
            EntityKind::TestReference => {
                t.test_references.get(&id).cloned().map(WatchedEntity::TestReference)
            }
        }
    }
}

fn write_registry(path: &std::path::Path, registry: &Registry) -> Result<(), LogStoreError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| LogStoreError::Io {
            action: "create",
            path: dir.display().to_string(),
            source,
        })?;
    }
    let content = serde_json::to_string_pretty(registry).map_err(|source| LogStoreError::Json {
        path: path.display().to_string(),
        source,
    })?;
    std::fs::write(path, content).map_err(|source| LogStoreError::Io {
        action: "write",
        path: path.display().to_string(),
        source,
    })
}

fn kind_label(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Submission => "submission",
        EntityKind::TestResult => "test result",
        EntityKind::ReferenceSet => "reference set",
        EntityKind::TestReference => "test reference",
    }
}
