//! # Controller Manager
//!
//! Hosts the reconciler on [`kube_runtime::applier`]. Watch events are mapped
//! to RootSync references and fed to the applier, whose scheduler keeps at most
//! one pending run per RootSync and never reconciles the same RootSync twice at
//! once. Delayed requeues and error backoff go through the same scheduler.
//!
//! ```text
//! watch(RootSync) ─┐
//! watch(Deployment)┤  mapper  ┌───────────┐  requests  ┌─────────┐     ┌────────────┐
//! watch(SA)        ├────────► │ SyncCache │ ─────────► │ applier │ ──► │ Reconciler │
//! watch(CRB)      ─┘          └───────────┘            └─────────┘ ◄── └────────────┘
//!                                   ▲                              error policy
//!                                   └──── released after teardown ─────┘
//! ```
//!
//! The applier only reconciles objects it can find in its store. Deleted
//! RootSyncs therefore stay cached until their teardown finished, and a
//! dependent whose RootSync was never seen caches a placeholder for it so the
//! leftovers still get removed.

use crate::cluster::{ClusterClient, ClusterError, ClusterObject, SyncKey, WatchEvent, WatchedKind};
use crate::config::ControllerConfig;
use crate::controller::backoff::ExponentialBackoff;
use crate::controller::dependent::{DependentKind, DependentObject};
use crate::controller::reconciler::{ReconcileError, ReconcileOutcome, ReconcileRequest, Reconciler};
use crate::crd::{RootSync, RootSyncSpec};
use crate::observability;
use crate::runtime::error_policy::{completion_action, handle_reconciliation_error};
use anyhow::{Context, Result};
use futures::channel::{mpsc, oneshot};
use futures::stream::{self, BoxStream};
use futures::{future, FutureExt, StreamExt};
use kube::api::DynamicObject;
use kube_runtime::controller::{self as runtime_controller, Action, ReconcileReason};
use kube_runtime::reflector::store::Writer;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Maps a dependent object to the RootSync that owns it
pub type KeyMapper = Arc<dyn Fn(&DependentObject) -> Option<SyncKey> + Send + Sync>;

struct DependentWatch {
    kind: DependentKind,
    mapper: KeyMapper,
}

/// Something that may require a RootSync to be reconciled
enum Trigger {
    /// The RootSync was added, changed or deleted
    Sync(Box<RootSync>),
    /// A dependent of `owner` was added, changed or deleted
    Dependent {
        owner: SyncKey,
        source: ObjectRef<DynamicObject>,
    },
    /// Teardown of this cached RootSync finished
    Released(Arc<RootSync>),
}

fn sync_ref(key: &SyncKey) -> ObjectRef<RootSync> {
    ObjectRef::new(&key.name).within(&key.namespace)
}

/// Stand-in for a RootSync we only know through its dependents
fn placeholder(key: &SyncKey) -> RootSync {
    let mut rs = RootSync::new(&key.name, RootSyncSpec::default());
    rs.metadata.namespace = Some(key.namespace.clone());
    rs
}

/// The applier's view of RootSyncs
///
/// Fed from the RootSync watch, it keeps deleted RootSyncs until the reconciler
/// released them, so teardown runs without finalizers.
struct SyncCache {
    writer: Writer<RootSync>,
    reader: Store<RootSync>,
}

impl SyncCache {
    fn new() -> Self {
        let mut writer = Writer::default();
        // Requests only reach the applier after their RootSync is cached
        writer.apply_watcher_event(&watcher::Event::InitDone);
        let reader = writer.as_reader();
        Self { writer, reader }
    }

    fn reader(&self) -> Store<RootSync> {
        self.reader.clone()
    }

    fn handle(&mut self, trigger: Trigger) -> Option<runtime_controller::ReconcileRequest<RootSync>> {
        match trigger {
            Trigger::Sync(rs) => {
                let obj_ref = ObjectRef::from_obj(&*rs);
                // Deletions are cached too, as tombstones
                self.writer.apply_watcher_event(&watcher::Event::Apply(*rs));
                Some(runtime_controller::ReconcileRequest {
                    obj_ref,
                    reason: ReconcileReason::ObjectUpdated,
                })
            }
            Trigger::Dependent { owner, source } => {
                let obj_ref = sync_ref(&owner);
                if self.reader.get(&obj_ref).is_none() {
                    debug!("Caching placeholder for unseen RootSync {}", owner);
                    self.writer
                        .apply_watcher_event(&watcher::Event::Apply(placeholder(&owner)));
                }
                Some(runtime_controller::ReconcileRequest {
                    obj_ref,
                    reason: ReconcileReason::RelatedObjectUpdated {
                        obj_ref: Box::new(source),
                    },
                })
            }
            Trigger::Released(rs) => {
                let obj_ref = ObjectRef::from_obj(&*rs);
                // A RootSync re-created under the same name has a newer version
                let unchanged = self.reader.get(&obj_ref).is_some_and(|cached| {
                    cached.metadata.resource_version == rs.metadata.resource_version
                });
                if unchanged {
                    debug!("Dropping {} from the RootSync cache", obj_ref);
                    self.writer
                        .apply_watcher_event(&watcher::Event::Delete(Arc::unwrap_or_clone(rs)));
                }
                None
            }
        }
    }
}

struct RestartingWatch {
    client: Arc<dyn ClusterClient>,
    kind: WatchedKind,
    restart_delay: Duration,
    events: Option<BoxStream<'static, Result<WatchEvent, ClusterError>>>,
}

/// Watch `kind` until the stream is dropped, re-subscribing after errors
fn watch_with_restart(
    client: Arc<dyn ClusterClient>,
    kind: WatchedKind,
    restart_delay: Duration,
) -> BoxStream<'static, WatchEvent> {
    let watch = RestartingWatch {
        client,
        kind,
        restart_delay,
        events: None,
    };
    stream::unfold(watch, |mut watch| async move {
        loop {
            let events = watch.events.get_or_insert_with(|| {
                debug!("Starting watch for {:?}", watch.kind);
                watch.client.watch(watch.kind.clone())
            });
            match events.next().await {
                Some(Ok(event)) => return Some((event, watch)),
                Some(Err(e)) => warn!("Watch for {:?} failed: {}", watch.kind, e),
                None => warn!("Watch for {:?} ended", watch.kind),
            }
            watch.events = None;
            warn!(
                "Restarting watch for {:?} in {:?}",
                watch.kind, watch.restart_delay
            );
            tokio::time::sleep(watch.restart_delay).await;
        }
    })
    .boxed()
}

/// Shared state handed to every reconcile and error policy call
pub struct ControllerContext {
    reconciler: Reconciler,
    /// Per-RootSync backoff for transient failures
    backoff_states: Mutex<HashMap<SyncKey, ExponentialBackoff>>,
    released: mpsc::UnboundedSender<Arc<RootSync>>,
}

impl std::fmt::Debug for ControllerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerContext")
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

impl ControllerContext {
    /// `released` receives RootSyncs whose teardown finished
    #[must_use]
    pub fn new(reconciler: Reconciler, released: mpsc::UnboundedSender<Arc<RootSync>>) -> Self {
        Self {
            reconciler,
            backoff_states: Mutex::new(HashMap::new()),
            released,
        }
    }

    #[must_use]
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Consecutive transient failures recorded for `key`
    #[must_use]
    pub fn retries(&self, key: &SyncKey) -> u32 {
        self.backoff_states()
            .get(key)
            .map_or(0, ExponentialBackoff::attempts)
    }

    /// Next retry delay for `key` and the attempt it belongs to
    pub fn next_backoff(&self, key: &SyncKey) -> (Duration, u32) {
        let config = self.reconciler.config();
        let mut states = self.backoff_states();
        let backoff = states.entry(key.clone()).or_insert_with(|| {
            ExponentialBackoff::new(config.backoff_start_duration(), config.backoff_max_duration())
        });
        let delay = backoff.next_backoff();
        (delay, backoff.attempts())
    }

    /// Drop the failure history of `key`
    pub fn forget(&self, key: &SyncKey) {
        self.backoff_states().remove(key);
    }

    fn release(&self, rs: Arc<RootSync>) {
        // Fails only once the manager is stopping
        if self.released.unbounded_send(rs).is_err() {
            debug!("RootSync cache already closed");
        }
    }

    fn backoff_states(&self) -> MutexGuard<'_, HashMap<SyncKey, ExponentialBackoff>> {
        self.backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// One applier run: reconcile the RootSync and turn the outcome into an [`Action`]
async fn reconcile_root_sync(
    rs: Arc<RootSync>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    let key = SyncKey::from(&*rs);
    let request = ReconcileRequest {
        retries: ctx.retries(&key),
        key,
    };

    observability::metrics::increment_reconciles_in_flight();
    let outcome = ctx.reconciler.reconcile(&request).await;
    observability::metrics::decrement_reconciles_in_flight();

    match &outcome {
        ReconcileOutcome::Converged => ctx.forget(&request.key),
        ReconcileOutcome::TornDown => {
            ctx.forget(&request.key);
            ctx.release(rs);
        }
        ReconcileOutcome::Pending { .. } | ReconcileOutcome::Failed(_) => {}
    }
    completion_action(outcome)
}

/// Runs watches and the applier for a registered reconciler
pub struct ControllerManager {
    client: Arc<dyn ClusterClient>,
    config: ControllerConfig,
    sync_watch: Option<WatchedKind>,
    dependent_watches: Vec<DependentWatch>,
    reconciler: Option<Reconciler>,
}

impl std::fmt::Debug for ControllerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerManager")
            .field("sync_watch", &self.sync_watch)
            .field(
                "dependent_watches",
                &self.dependent_watches.iter().map(|w| w.kind).collect::<Vec<_>>(),
            )
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

impl ControllerManager {
    pub fn new(client: Arc<dyn ClusterClient>, config: ControllerConfig) -> Self {
        Self {
            client,
            config,
            sync_watch: None,
            dependent_watches: Vec::new(),
            reconciler: None,
        }
    }

    /// Watch RootSyncs, in one namespace or cluster-wide
    pub fn watch_syncs(&mut self, namespace: Option<String>) {
        self.sync_watch = Some(WatchedKind::Sync { namespace });
    }

    /// Watch a dependent kind and reconcile the RootSync `mapper` names for each event
    pub fn watches<F>(&mut self, kind: DependentKind, mapper: F)
    where
        F: Fn(&DependentObject) -> Option<SyncKey> + Send + Sync + 'static,
    {
        self.dependent_watches.push(DependentWatch {
            kind,
            mapper: Arc::new(mapper),
        });
    }

    /// Set the reconciler the applier runs
    pub fn register(&mut self, reconciler: Reconciler) {
        self.reconciler = Some(reconciler);
    }

    /// Spawn the controller, returning a handle that stops it
    pub fn start(self) -> Result<ManagerHandle> {
        let reconciler = self
            .reconciler
            .context("no reconciler registered with the controller manager")?;
        let sync_kind = self
            .sync_watch
            .context("no RootSync watch registered with the controller manager")?;

        let restart_delay = self.config.watch_restart_delay_duration();
        let (released_tx, released_rx) = mpsc::unbounded();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let mut triggers: Vec<BoxStream<'static, Trigger>> = Vec::new();
        triggers.push(
            watch_with_restart(Arc::clone(&self.client), sync_kind, restart_delay)
                .filter_map(|event| {
                    future::ready(match event.object {
                        ClusterObject::Sync(rs) => Some(Trigger::Sync(rs)),
                        ClusterObject::Dependent(_) => None,
                    })
                })
                .boxed(),
        );
        let watch_count = 1 + self.dependent_watches.len();
        for watch in self.dependent_watches {
            let mapper = watch.mapper;
            triggers.push(
                watch_with_restart(
                    Arc::clone(&self.client),
                    WatchedKind::Dependent(watch.kind),
                    restart_delay,
                )
                .filter_map(move |event| {
                    let trigger = match &event.object {
                        ClusterObject::Dependent(object) => mapper(object).map(|owner| {
                            debug!("{:?} event on {} maps to {}", event.change, object.key(), owner);
                            Trigger::Dependent {
                                owner,
                                source: object.object_ref(),
                            }
                        }),
                        ClusterObject::Sync(_) => None,
                    };
                    future::ready(trigger)
                })
                .boxed(),
            );
        }
        triggers.push(released_rx.map(Trigger::Released).boxed());

        let mut cache = SyncCache::new();
        let store = cache.reader();
        let requests = stream::select_all(triggers)
            .take_until(shutdown_rx)
            .filter_map(move |trigger| future::ready(cache.handle(trigger)))
            .map(Ok::<_, Infallible>);

        let workers = self.config.max_concurrent_reconciles.max(1);
        let applier_config = runtime_controller::Config::default()
            .concurrency(u16::try_from(workers).unwrap_or(u16::MAX));
        let ctx = Arc::new(ControllerContext::new(reconciler, released_tx));

        let controller = kube_runtime::applier(
            |rs, ctx| reconcile_root_sync(rs, ctx).boxed(),
            handle_reconciliation_error,
            ctx,
            store,
            requests,
            applier_config,
        )
        .for_each(|result| {
            match result {
                Ok((obj_ref, action)) => debug!("Reconciled {}: {:?}", obj_ref, action),
                Err(runtime_controller::Error::ReconcilerFailed(e, obj_ref)) => {
                    debug!("Reconcile of {} failed: {}", obj_ref, e);
                }
                Err(e) => warn!("Controller error: {}", e),
            }
            future::ready(())
        });
        let task = tokio::spawn(controller.instrument(info_span!("controller")));

        info!(
            "🚀 Controller manager started ({} watches, {} workers)",
            watch_count, workers
        );

        Ok(ManagerHandle { shutdown_tx, task })
    }

    /// Run until `shutdown` resolves, then stop watches and drain reconciles
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let handle = self.start()?;
        shutdown.await;
        info!("Shutdown requested, stopping controller manager...");
        handle.stop().await;
        info!("Controller manager stopped gracefully");
        Ok(())
    }
}

/// Handle to a running [`ControllerManager`]
#[derive(Debug)]
pub struct ManagerHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ManagerHandle {
    /// Stop the watches, let in-flight reconciles finish and wait for the controller
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!("Controller task ended abnormally: {}", e);
        }
    }
}

impl Reconciler {
    /// Register this reconciler and its watches with a controller manager
    ///
    /// In single-tenant mode only RootSyncs in the controller namespace are
    /// watched. Dependent events map back to their RootSync through the
    /// object names, so objects we did not name are ignored.
    pub fn setup_with_controller(
        self,
        manager: &mut ControllerManager,
        multi_tenant: bool,
    ) -> Result<()> {
        let reconciler = self.multi_tenant(multi_tenant);
        let controller_namespace = reconciler.namer.controller_namespace().to_string();

        manager.watch_syncs((!multi_tenant).then(|| controller_namespace.clone()));

        for kind in DependentKind::ALL {
            let namer = reconciler.namer.clone();
            let controller_namespace = controller_namespace.clone();
            manager.watches(kind, move |object| {
                namer
                    .owner_of(object.kind(), &object.key())
                    .filter(|owner| multi_tenant || owner.namespace == controller_namespace)
            });
        }

        info!(
            "Registered RootSync reconciler (multi-tenant: {}, controller namespace: {})",
            multi_tenant, controller_namespace
        );
        manager.register(reconciler);
        Ok(())
    }
}
