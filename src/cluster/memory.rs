//! # In-Memory Cluster
//!
//! An in-process object store implementing [`ClusterClient`] and
//! [`SecretMaterialProvider`].
//!
//! It follows the API server contract the reconciler relies on:
//!
//! - every write bumps a single cluster-wide, monotonically increasing `resourceVersion`
//! - `update` is rejected with `Conflict` when the caller's version is stale
//! - objects carrying finalizers are only marked terminating on delete
//! - watches replay current objects as `Added` and then stream later changes
//!
//! Test helpers mutate objects "from outside" (as a user or another controller
//! would), inject faults, and count the writes issued through the client.

use super::{
    ChangeType, ClusterClient, ClusterError, ClusterObject, ObjectKey, SecretError,
    SecretMaterial, SecretMaterialProvider, SyncKey, WatchEvent, WatchedKind,
};
use crate::controller::dependent::{DependentKind, DependentObject};
use crate::crd::{RootSync, RootSyncStatus};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const WATCH_BUFFER: usize = 1024;
const TEST_FINALIZER: &str = "reconciler-manager.test/hold";

/// Client operations that can be counted or made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetSync,
    PatchStatus,
    Get,
    Create,
    Update,
    Delete,
}

/// Error to inject into the next matching client call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Conflict,
    AlreadyExists,
    NotFound,
    Unavailable,
}

impl Fault {
    fn into_error(self, what: String) -> ClusterError {
        match self {
            Fault::Conflict => ClusterError::Conflict(what),
            Fault::AlreadyExists => ClusterError::AlreadyExists(what),
            Fault::NotFound => ClusterError::NotFound(what),
            Fault::Unavailable => ClusterError::Unavailable(what),
        }
    }
}

#[derive(Debug)]
struct InjectedFault {
    operation: Operation,
    kind: Option<DependentKind>,
    fault: Fault,
    remaining: u32,
}

#[derive(Debug, Default)]
struct State {
    last_resource_version: u64,
    syncs: BTreeMap<SyncKey, RootSync>,
    objects: BTreeMap<(DependentKind, ObjectKey), DependentObject>,
    secrets: BTreeMap<(String, String), SecretMaterial>,
    faults: VecDeque<InjectedFault>,
    calls: HashMap<(Operation, Option<DependentKind>), u64>,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.last_resource_version += 1;
        self.last_resource_version.to_string()
    }

    fn record(&mut self, operation: Operation, kind: Option<DependentKind>) {
        *self.calls.entry((operation, kind)).or_insert(0) += 1;
    }

    /// Pop the first fault armed for this call, if any
    fn take_fault(&mut self, operation: Operation, kind: Option<DependentKind>) -> Option<Fault> {
        let idx = self
            .faults
            .iter()
            .position(|f| f.operation == operation && (f.kind.is_none() || f.kind == kind))?;
        let entry = &mut self.faults[idx];
        let fault = entry.fault;
        entry.remaining = entry.remaining.saturating_sub(1);
        if entry.remaining == 0 {
            self.faults.remove(idx);
        }
        Some(fault)
    }
}

/// In-process cluster
#[derive(Debug)]
pub struct InMemoryCluster {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> Option<Time> {
    let stamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::Value::String(stamp)).ok()
}

fn has_finalizers(meta: &ObjectMeta) -> bool {
    meta.finalizers.as_ref().is_some_and(|f| !f.is_empty())
}

impl InMemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep serving it
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn publish(&self, change: ChangeType, object: ClusterObject) {
        // No receivers is not an error
        let _ = self.events.send(WatchEvent { change, object });
    }

    // ---- external actors -------------------------------------------------

    /// Create or replace a RootSync as a user would
    ///
    /// The generation is bumped whenever the spec changes. Status is preserved
    /// across updates, as the API server does for the main resource.
    pub fn apply_sync(&self, mut rs: RootSync) -> RootSync {
        let key = SyncKey::from(&rs);
        let mut state = self.lock();
        let rv = state.next_resource_version();
        let change = match state.syncs.get(&key) {
            Some(existing) => {
                let generation = existing.metadata.generation.unwrap_or(1);
                rs.metadata.generation = Some(if existing.spec == rs.spec {
                    generation
                } else {
                    generation + 1
                });
                rs.metadata.uid.clone_from(&existing.metadata.uid);
                rs.metadata
                    .deletion_timestamp
                    .clone_from(&existing.metadata.deletion_timestamp);
                rs.status.clone_from(&existing.status);
                ChangeType::Modified
            }
            None => {
                rs.metadata.generation = Some(1);
                rs.metadata.uid = Some(format!("uid-{rv}"));
                ChangeType::Added
            }
        };
        rs.metadata.resource_version = Some(rv);
        state.syncs.insert(key, rs.clone());
        self.publish(change, ClusterObject::Sync(Box::new(rs.clone())));
        rs
    }

    /// Delete a RootSync; returns false if it did not exist
    ///
    /// A RootSync carrying finalizers is only marked terminating.
    pub fn delete_sync(&self, key: &SyncKey) -> bool {
        let mut state = self.lock();
        let rv = state.next_resource_version();
        let Some(mut rs) = state.syncs.remove(key) else {
            return false;
        };
        rs.metadata.resource_version = Some(rv);
        if has_finalizers(&rs.metadata) {
            if rs.metadata.deletion_timestamp.is_none() {
                rs.metadata.deletion_timestamp = now();
            }
            state.syncs.insert(key.clone(), rs.clone());
            self.publish(ChangeType::Modified, ClusterObject::Sync(Box::new(rs)));
        } else {
            self.publish(ChangeType::Deleted, ClusterObject::Sync(Box::new(rs)));
        }
        true
    }

    /// Add a finalizer to a RootSync and request its deletion
    pub fn mark_sync_terminating(&self, key: &SyncKey) -> bool {
        {
            let mut state = self.lock();
            let Some(rs) = state.syncs.get_mut(key) else {
                return false;
            };
            rs.metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(TEST_FINALIZER.to_string());
        }
        self.delete_sync(key)
    }

    /// Current stored RootSync, without counting a client call
    #[must_use]
    pub fn sync(&self, key: &SyncKey) -> Option<RootSync> {
        self.lock().syncs.get(key).cloned()
    }

    #[must_use]
    pub fn sync_status(&self, key: &SyncKey) -> Option<RootSyncStatus> {
        self.lock().syncs.get(key).and_then(|rs| rs.status.clone())
    }

    /// Store a Secret as seen by the secret provider
    pub fn put_secret(&self, namespace: &str, secret: SecretMaterial) {
        self.lock()
            .secrets
            .insert((namespace.to_string(), secret.name.clone()), secret);
    }

    /// Current stored dependent object, without counting a client call
    #[must_use]
    pub fn object(&self, kind: DependentKind, key: &ObjectKey) -> Option<DependentObject> {
        self.lock().objects.get(&(kind, key.clone())).cloned()
    }

    /// Number of stored objects of a kind
    #[must_use]
    pub fn count(&self, kind: DependentKind) -> usize {
        self.lock().objects.keys().filter(|(k, _)| *k == kind).count()
    }

    /// Modify a stored object as an outside writer would
    ///
    /// Returns the new resourceVersion, or `None` if the object does not exist.
    pub fn mutate<F>(&self, kind: DependentKind, key: &ObjectKey, f: F) -> Option<String>
    where
        F: FnOnce(&mut DependentObject),
    {
        let mut state = self.lock();
        let rv = state.next_resource_version();
        let obj = state.objects.get_mut(&(kind, key.clone()))?;
        f(obj);
        obj.metadata_mut().resource_version = Some(rv.clone());
        let snapshot = obj.clone();
        self.publish(ChangeType::Modified, ClusterObject::Dependent(snapshot));
        Some(rv)
    }

    /// Delete a stored object as an outside writer would
    pub fn remove(&self, kind: DependentKind, key: &ObjectKey) -> bool {
        let mut state = self.lock();
        let rv = state.next_resource_version();
        match state.objects.remove(&(kind, key.clone())) {
            Some(mut obj) => {
                obj.metadata_mut().resource_version = Some(rv);
                self.publish(ChangeType::Deleted, ClusterObject::Dependent(obj));
                true
            }
            None => false,
        }
    }

    /// Put a finalizer on a stored object and request its deletion
    pub fn mark_terminating(&self, kind: DependentKind, key: &ObjectKey) -> bool {
        self.mutate(kind, key, |obj| {
            let meta = obj.metadata_mut();
            meta.finalizers
                .get_or_insert_with(Vec::new)
                .push(TEST_FINALIZER.to_string());
            meta.deletion_timestamp = now();
        })
        .is_some()
    }

    /// Drop the finalizer added by [`Self::mark_terminating`], completing the deletion
    pub fn release(&self, kind: DependentKind, key: &ObjectKey) -> bool {
        self.remove(kind, key)
    }

    // ---- fault injection and accounting ----------------------------------

    /// Make the next `times` matching calls fail
    ///
    /// `kind: None` matches every dependent kind and the RootSync calls.
    pub fn fail_next(
        &self,
        operation: Operation,
        kind: Option<DependentKind>,
        fault: Fault,
        times: u32,
    ) {
        if times == 0 {
            return;
        }
        self.lock().faults.push_back(InjectedFault {
            operation,
            kind,
            fault,
            remaining: times,
        });
    }

    /// Calls issued through the client for an operation and kind
    #[must_use]
    pub fn calls(&self, operation: Operation, kind: Option<DependentKind>) -> u64 {
        self.lock()
            .calls
            .get(&(operation, kind))
            .copied()
            .unwrap_or(0)
    }

    /// Total creates, updates and deletes issued through the client
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        self.lock()
            .calls
            .iter()
            .filter(|((op, _), _)| matches!(op, Operation::Create | Operation::Update | Operation::Delete))
            .map(|(_, n)| *n)
            .sum()
    }

    /// Forget recorded calls
    pub fn reset_counters(&self) {
        self.lock().calls.clear();
    }

    /// Latest resourceVersion handed out
    #[must_use]
    pub fn last_resource_version(&self) -> u64 {
        self.lock().last_resource_version
    }
}

fn matches_kind(kind: &WatchedKind, object: &ClusterObject) -> bool {
    match (kind, object) {
        (WatchedKind::Sync { namespace }, ClusterObject::Sync(rs)) => match namespace {
            Some(ns) => rs.metadata.namespace.as_deref() == Some(ns.as_str()),
            None => true,
        },
        (WatchedKind::Dependent(k), ClusterObject::Dependent(obj)) => obj.kind() == *k,
        _ => false,
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get_sync(&self, key: &SyncKey) -> Result<Option<RootSync>, ClusterError> {
        let mut state = self.lock();
        state.record(Operation::GetSync, None);
        if let Some(fault) = state.take_fault(Operation::GetSync, None) {
            return Err(fault.into_error(format!("RootSync {key}")));
        }
        Ok(state.syncs.get(key).cloned())
    }

    async fn patch_sync_status(
        &self,
        key: &SyncKey,
        status: &RootSyncStatus,
    ) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.record(Operation::PatchStatus, None);
        if let Some(fault) = state.take_fault(Operation::PatchStatus, None) {
            return Err(fault.into_error(format!("RootSync {key}")));
        }
        let rv = state.next_resource_version();
        let Some(rs) = state.syncs.get_mut(key) else {
            return Err(ClusterError::NotFound(format!("RootSync {key}")));
        };
        rs.status = Some(status.clone());
        rs.metadata.resource_version = Some(rv);
        let snapshot = rs.clone();
        self.publish(ChangeType::Modified, ClusterObject::Sync(Box::new(snapshot)));
        Ok(())
    }

    async fn get(
        &self,
        kind: DependentKind,
        key: &ObjectKey,
    ) -> Result<Option<DependentObject>, ClusterError> {
        let mut state = self.lock();
        state.record(Operation::Get, Some(kind));
        if let Some(fault) = state.take_fault(Operation::Get, Some(kind)) {
            return Err(fault.into_error(format!("{kind} {key}")));
        }
        Ok(state.objects.get(&(kind, key.clone())).cloned())
    }

    async fn create(&self, object: &DependentObject) -> Result<DependentObject, ClusterError> {
        let kind = object.kind();
        let key = object.key();
        let mut state = self.lock();
        state.record(Operation::Create, Some(kind));
        if let Some(fault) = state.take_fault(Operation::Create, Some(kind)) {
            return Err(fault.into_error(format!("{kind} {key}")));
        }
        if state.objects.contains_key(&(kind, key.clone())) {
            return Err(ClusterError::AlreadyExists(format!("{kind} {key}")));
        }
        let rv = state.next_resource_version();
        let mut stored = object.clone();
        let meta = stored.metadata_mut();
        meta.uid = Some(format!("uid-{rv}"));
        meta.resource_version = Some(rv);
        meta.deletion_timestamp = None;
        state.objects.insert((kind, key), stored.clone());
        self.publish(ChangeType::Added, ClusterObject::Dependent(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, object: &DependentObject) -> Result<DependentObject, ClusterError> {
        let kind = object.kind();
        let key = object.key();
        let mut state = self.lock();
        state.record(Operation::Update, Some(kind));
        if let Some(fault) = state.take_fault(Operation::Update, Some(kind)) {
            return Err(fault.into_error(format!("{kind} {key}")));
        }
        let Some(current) = state.objects.get(&(kind, key.clone())) else {
            return Err(ClusterError::NotFound(format!("{kind} {key}")));
        };
        if let Some(expected) = object.resource_version() {
            if current.resource_version() != Some(expected) {
                return Err(ClusterError::Conflict(format!("{kind} {key}")));
            }
        }
        let uid = current.metadata().uid.clone();
        let deletion_timestamp = current.metadata().deletion_timestamp.clone();
        let rv = state.next_resource_version();
        let mut stored = object.clone();
        let meta = stored.metadata_mut();
        meta.uid = uid;
        meta.deletion_timestamp = deletion_timestamp;
        meta.resource_version = Some(rv);
        state.objects.insert((kind, key), stored.clone());
        self.publish(ChangeType::Modified, ClusterObject::Dependent(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, kind: DependentKind, key: &ObjectKey) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.record(Operation::Delete, Some(kind));
        if let Some(fault) = state.take_fault(Operation::Delete, Some(kind)) {
            return Err(fault.into_error(format!("{kind} {key}")));
        }
        let map_key = (kind, key.clone());
        let Some(current) = state.objects.get(&map_key) else {
            return Err(ClusterError::NotFound(format!("{kind} {key}")));
        };
        if has_finalizers(current.metadata()) {
            if current.is_terminating() {
                return Ok(());
            }
            let rv = state.next_resource_version();
            if let Some(obj) = state.objects.get_mut(&map_key) {
                let meta = obj.metadata_mut();
                meta.deletion_timestamp = now();
                meta.resource_version = Some(rv);
                let snapshot = obj.clone();
                self.publish(ChangeType::Modified, ClusterObject::Dependent(snapshot));
            }
            return Ok(());
        }
        let rv = state.next_resource_version();
        if let Some(mut obj) = state.objects.remove(&map_key) {
            obj.metadata_mut().resource_version = Some(rv);
            self.publish(ChangeType::Deleted, ClusterObject::Dependent(obj));
        }
        Ok(())
    }

    fn watch(&self, kind: WatchedKind) -> BoxStream<'static, Result<WatchEvent, ClusterError>> {
        // Subscribe and snapshot under the same lock so no write falls between them
        let (initial, receiver) = {
            let state = self.lock();
            let receiver = self.events.subscribe();
            let initial: Vec<WatchEvent> = match &kind {
                WatchedKind::Sync { .. } => state
                    .syncs
                    .values()
                    .map(|rs| ClusterObject::Sync(Box::new(rs.clone())))
                    .filter(|o| matches_kind(&kind, o))
                    .map(|object| WatchEvent {
                        change: ChangeType::Added,
                        object,
                    })
                    .collect(),
                WatchedKind::Dependent(k) => state
                    .objects
                    .iter()
                    .filter(|((ok, _), _)| ok == k)
                    .map(|(_, obj)| WatchEvent {
                        change: ChangeType::Added,
                        object: ClusterObject::Dependent(obj.clone()),
                    })
                    .collect(),
            };
            (initial, receiver)
        };

        let live = stream::unfold((receiver, kind), |(mut receiver, kind)| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if matches_kind(&kind, &event.object) => {
                        return Some((Ok(event), (receiver, kind)));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let err = ClusterError::Watch(format!("watch lagged by {skipped} events"));
                        return Some((Err(err), (receiver, kind)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::iter(initial.into_iter().map(Ok)).chain(live).boxed()
    }
}

#[async_trait]
impl SecretMaterialProvider for InMemoryCluster {
    async fn resolve(&self, namespace: &str, name: &str) -> Result<SecretMaterial, SecretError> {
        self.lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| SecretError::NotFound(format!("{namespace}/{name}")))
    }
}
