use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::domain::{DispatchStats, Driver, DriverId, Load, LoadId, LoadStatus};
use tokio::{
    runtime::Handle,
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

pub mod assignment;
pub mod error;
pub mod pending;
pub mod registry;
pub mod remote;
pub mod sync;
pub mod transitions;

use assignment::{AssignmentOutcome, AvailableDrivers};
pub use error::{DispatchError, DispatchErrorKind, RemoteError, SyncError};
pub use pending::OperationKind;
use pending::{PendingLedger, PendingOperation};
use registry::LoadRegistry;
use error::RegistryError;
pub use remote::{HttpLoadService, RemoteLoadService};
pub use sync::ReconcileSummary;
use sync::BoardSnapshot;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    /// Upper bound for every call to the load service, including a whole refresh.
    pub request_timeout: Duration,
    pub event_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DispatchEvent {
    LoadChanged(Load),
    /// The service no longer lists this load.
    LoadRemoved(LoadId),
    Reconciled(ReconcileSummary),
    StatsUpdated(DispatchStats),
    DriversUpdated(Vec<Driver>),
    /// A refresh failed; the board shown is the last good one.
    SyncFailed(String),
    MutationConfirmed {
        load_id: LoadId,
        operation: OperationKind,
    },
    MutationRolledBack {
        load_id: LoadId,
        operation: OperationKind,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoardColumn {
    pub status: LoadStatus,
    pub loads: Vec<Load>,
}

/// Point-in-time copy of everything a board view renders.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardView {
    pub columns: Vec<BoardColumn>,
    pub stats: Option<DispatchStats>,
    pub drivers: Vec<Driver>,
    pub pending: Vec<LoadId>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl BoardView {
    pub fn column(&self, status: LoadStatus) -> &[Load] {
        self.columns
            .iter()
            .find(|column| column.status == status)
            .map(|column| column.loads.as_slice())
            .unwrap_or_default()
    }

    pub fn load(&self, load_id: LoadId) -> Option<&Load> {
        self.columns
            .iter()
            .flat_map(|column| column.loads.iter())
            .find(|load| load.id == load_id)
    }
}

#[derive(Default)]
struct BoardState {
    registry: LoadRegistry,
    drivers: AvailableDrivers,
    stats: Option<DispatchStats>,
    pending: PendingLedger,
    last_synced_at: Option<DateTime<Utc>>,
    /// Start revisions of refreshes still fetching, with a count per revision.
    refreshes_in_flight: BTreeMap<u64, usize>,
}

impl BoardState {
    fn finish_refresh(&mut self, started_at: u64) {
        if let Some(count) = self.refreshes_in_flight.get_mut(&started_at) {
            *count -= 1;
            if *count == 0 {
                self.refreshes_in_flight.remove(&started_at);
            }
        }
        let oldest = self
            .refreshes_in_flight
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.pending.revision());
        self.pending.forget_confirmations_up_to(oldest);
    }

    /// Undoes a pending mutation: frees the ledger slot and puts back the
    /// previous load and any driver taken from the cache.
    fn roll_back(&mut self, load_id: LoadId) -> Result<Option<Load>, RegistryError> {
        let Some(pending) = self.pending.abandon(load_id) else {
            return Ok(None);
        };
        debug!(
            load_id = load_id.0,
            operation = pending.kind.name(),
            pending_ms = (Utc::now() - pending.submitted_at).num_milliseconds(),
            "dispatch: rolling back pending operation"
        );
        if let Some(driver) = pending.released_driver {
            self.drivers.restore(driver);
        }
        let restored = pending.previous.load.clone();
        self.registry.restore(pending.previous)?;
        Ok(Some(restored))
    }
}

type Cleanup = Box<dyn FnOnce(&mut BoardState) + Send>;

/// Runs a cleanup against the board when the owning future is dropped before
/// it disarms the guard, so a cancelled call never leaves state behind.
struct CancelGuard {
    inner: Arc<Mutex<BoardState>>,
    cleanup: Option<Cleanup>,
}

impl CancelGuard {
    fn new(
        inner: &Arc<Mutex<BoardState>>,
        cleanup: impl FnOnce(&mut BoardState) + Send + 'static,
    ) -> Self {
        Self {
            inner: Arc::clone(inner),
            cleanup: Some(Box::new(cleanup)),
        }
    }

    fn replace(&mut self, cleanup: impl FnOnce(&mut BoardState) + Send + 'static) {
        self.cleanup = Some(Box::new(cleanup));
    }

    fn disarm(&mut self) {
        self.cleanup = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };
        if let Ok(mut state) = self.inner.try_lock() {
            cleanup(&mut *state);
            return;
        }
        let inner = Arc::clone(&self.inner);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut state = inner.lock().await;
                    cleanup(&mut *state);
                });
            }
            Err(_) => warn!("dispatch: board busy and no runtime, cancelled call left state behind"),
        }
    }
}

/// Keeps a local dispatch board in step with the load service and applies
/// dispatcher actions optimistically.
pub struct DispatchCoordinator {
    remote: Arc<dyn RemoteLoadService>,
    config: CoordinatorConfig,
    inner: Arc<Mutex<BoardState>>,
    events: broadcast::Sender<DispatchEvent>,
}

/// Owns the background refresh timer. Stopping or dropping it ends polling.
pub struct PollingHandle {
    task: JoinHandle<()>,
}

impl PollingHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl DispatchCoordinator {
    pub fn new(remote: Arc<dyn RemoteLoadService>, config: CoordinatorConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Arc::new(Self {
            remote,
            config,
            inner: Arc::new(Mutex::new(BoardState::default())),
            events,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DispatchEvent) {
        let _ = self.events.send(event);
    }

    pub async fn board(&self) -> BoardView {
        let guard = self.inner.lock().await;
        BoardView {
            columns: LoadStatus::ALL
                .into_iter()
                .map(|status| BoardColumn {
                    status,
                    loads: guard
                        .registry
                        .get_by_status(status)
                        .into_iter()
                        .cloned()
                        .collect(),
                })
                .collect(),
            stats: guard.stats,
            drivers: guard.drivers.as_slice().to_vec(),
            pending: guard.pending.pending_ids(),
            last_synced_at: guard.last_synced_at,
        }
    }

    pub async fn load(&self, load_id: LoadId) -> Option<Load> {
        self.inner.lock().await.registry.get(load_id).cloned()
    }

    pub async fn is_pending(&self, load_id: LoadId) -> bool {
        self.inner.lock().await.pending.is_pending(load_id)
    }

    /// Starts the fixed-interval refresh. The first refresh runs immediately.
    pub fn spawn_polling(self: &Arc<Self>) -> PollingHandle {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        let period = self.config.poll_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    debug!("sync: coordinator dropped, polling stopped");
                    break;
                };
                // Failures are reported through events; the next tick retries.
                let _ = coordinator.refresh().await;
            }
        });
        info!(interval_secs = period.as_secs(), "sync: polling started");
        PollingHandle { task }
    }

    /// Pulls loads, stats and free drivers and folds them into the board.
    /// On failure the board is left exactly as it was.
    pub async fn refresh(&self) -> Result<ReconcileSummary, DispatchError> {
        let started_at = {
            let mut guard = self.inner.lock().await;
            let revision = guard.pending.revision();
            *guard.refreshes_in_flight.entry(revision).or_default() += 1;
            revision
        };
        let mut in_flight = CancelGuard::new(&self.inner, move |state| {
            state.finish_refresh(started_at)
        });

        let fetched = self.fetch_snapshot().await;

        let mut guard = self.inner.lock().await;
        in_flight.disarm();
        let state = &mut *guard;
        let outcome = fetched.and_then(|snapshot| {
            let stats = snapshot.stats;
            let summary = sync::reconcile(
                &mut state.registry,
                &mut state.drivers,
                &state.pending,
                snapshot,
                started_at,
            )?;
            state.stats = Some(stats);
            state.last_synced_at = Some(Utc::now());
            Ok((summary, stats))
        });
        state.finish_refresh(started_at);

        match outcome {
            Ok((summary, stats)) => {
                let drivers = state.drivers.as_slice().to_vec();
                let changed: Vec<Load> = summary
                    .changed
                    .iter()
                    .filter_map(|load_id| state.registry.get(*load_id).cloned())
                    .collect();
                drop(guard);
                info!(
                    applied = summary.applied,
                    changed = summary.changed.len(),
                    skipped = summary.skipped.len(),
                    removed = summary.removed.len(),
                    "sync: board reconciled"
                );
                for load in changed {
                    self.emit(DispatchEvent::LoadChanged(load));
                }
                for load_id in &summary.removed {
                    self.emit(DispatchEvent::LoadRemoved(*load_id));
                }
                self.emit(DispatchEvent::Reconciled(summary.clone()));
                self.emit(DispatchEvent::StatsUpdated(stats));
                self.emit(DispatchEvent::DriversUpdated(drivers));
                Ok(summary)
            }
            Err(err) => {
                drop(guard);
                warn!(error = %err, "sync: refresh failed, keeping previous board");
                self.emit(DispatchEvent::SyncFailed(err.to_string()));
                Err(DispatchError::SyncFailed(err))
            }
        }
    }

    async fn fetch_snapshot(&self) -> Result<BoardSnapshot, SyncError> {
        let fetch = async {
            futures::try_join!(
                self.remote.fetch_loads_by_status(),
                self.remote.fetch_stats(),
                self.remote.fetch_available_drivers(),
            )
        };
        let (loads, stats, drivers) = tokio::time::timeout(self.config.request_timeout, fetch)
            .await
            .map_err(|_| RemoteError::Timeout {
                after: self.config.request_timeout,
            })??;
        BoardSnapshot::validate(loads, stats, drivers)
    }

    /// Drag-and-drop of a load onto another column.
    pub async fn request_status_change(
        &self,
        load_id: LoadId,
        target: LoadStatus,
    ) -> Result<Load, DispatchError> {
        self.run_mutation(load_id, OperationKind::StatusChange { target })
            .await
    }

    pub async fn request_assign(
        &self,
        load_id: LoadId,
        driver_id: DriverId,
    ) -> Result<Load, DispatchError> {
        self.run_mutation(load_id, OperationKind::AssignDriver { driver_id })
            .await
    }

    pub async fn request_unassign(&self, load_id: LoadId) -> Result<Load, DispatchError> {
        self.run_mutation(load_id, OperationKind::UnassignDriver)
            .await
    }

    /// Validate, apply locally, persist remotely, then confirm or roll back.
    /// The board lock is never held across the remote call.
    async fn run_mutation(
        &self,
        load_id: LoadId,
        operation: OperationKind,
    ) -> Result<Load, DispatchError> {
        let optimistic = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            state.pending.ensure_idle(load_id)?;
            let current = state
                .registry
                .get(load_id)
                .cloned()
                .ok_or(DispatchError::UnknownLoad { load_id })?;

            let Some(next) = plan_mutation(&current, operation)? else {
                debug!(load_id = load_id.0, %operation, "dispatch: already in requested state");
                return Ok(current);
            };

            let previous = state
                .registry
                .entry(load_id)
                .ok_or(DispatchError::UnknownLoad { load_id })?;
            state.registry.upsert(next.clone())?;
            let released_driver = match operation {
                OperationKind::AssignDriver { driver_id } => state.drivers.take(driver_id),
                _ => None,
            };
            state.pending.begin(PendingOperation {
                load_id,
                kind: operation,
                previous,
                released_driver,
                submitted_at: Utc::now(),
            })?;
            next
        };

        info!(
            load_id = load_id.0,
            operation = operation.name(),
            status = %optimistic.status,
            "dispatch: optimistic update applied"
        );
        self.emit(DispatchEvent::LoadChanged(optimistic.clone()));

        let events = self.events.clone();
        let mut settle = CancelGuard::new(&self.inner, move |state| {
            match state.roll_back(load_id) {
                Ok(Some(load)) => {
                    warn!(
                        load_id = load_id.0,
                        operation = operation.name(),
                        "dispatch: request cancelled, optimistic update rolled back"
                    );
                    let _ = events.send(DispatchEvent::LoadChanged(load));
                    let _ = events.send(DispatchEvent::MutationRolledBack {
                        load_id,
                        operation,
                        reason: "request cancelled before the service answered".to_string(),
                    });
                }
                Ok(None) => {}
                Err(err) => warn!(load_id = load_id.0, error = %err, "dispatch: rollback failed"),
            }
        });

        match self.persist(load_id, operation).await {
            Ok(()) => {
                settle.replace(move |state| {
                    state.pending.confirm(load_id);
                });
                {
                    let mut guard = self.inner.lock().await;
                    settle.disarm();
                    guard.pending.confirm(load_id);
                }
                info!(load_id = load_id.0, operation = operation.name(), "dispatch: change confirmed");
                self.emit(DispatchEvent::MutationConfirmed { load_id, operation });

                if let Err(err) = self.refresh().await {
                    warn!(load_id = load_id.0, error = %err, "dispatch: post-confirmation refresh failed");
                }
                Ok(self.load(load_id).await.unwrap_or(optimistic))
            }
            Err(source) => {
                let restored = {
                    let mut guard = self.inner.lock().await;
                    settle.disarm();
                    guard.roll_back(load_id)?
                };

                warn!(
                    load_id = load_id.0,
                    operation = operation.name(),
                    error = %source,
                    transient = source.is_transient(),
                    "dispatch: remote call failed, optimistic update rolled back"
                );
                if let Some(load) = restored {
                    self.emit(DispatchEvent::LoadChanged(load));
                }
                self.emit(DispatchEvent::MutationRolledBack {
                    load_id,
                    operation,
                    reason: source.to_string(),
                });
                Err(DispatchError::MutationFailed {
                    load_id,
                    operation,
                    source,
                })
            }
        }
    }

    async fn persist(&self, load_id: LoadId, operation: OperationKind) -> Result<(), RemoteError> {
        let call = async {
            match operation {
                OperationKind::StatusChange { target } => {
                    self.remote.update_load_status(load_id, target).await
                }
                OperationKind::AssignDriver { driver_id } => {
                    self.remote.assign_driver(load_id, driver_id).await
                }
                OperationKind::UnassignDriver => self.remote.unassign_driver(load_id).await,
            }
        };
        tokio::time::timeout(self.config.request_timeout, call)
            .await
            .map_err(|_| RemoteError::Timeout {
                after: self.config.request_timeout,
            })?
    }
}

/// The load after `operation`, or `None` when it is already in that state.
fn plan_mutation(current: &Load, operation: OperationKind) -> Result<Option<Load>, DispatchError> {
    match operation {
        OperationKind::StatusChange { target } if target == current.status => Ok(None),
        OperationKind::StatusChange { target } => {
            transitions::transition(current, target).map(Some)
        }
        OperationKind::AssignDriver { driver_id } => {
            Ok(match assignment::assign(current, driver_id)? {
                AssignmentOutcome::Applied(next) => Some(next),
                AssignmentOutcome::AlreadyApplied => None,
            })
        }
        OperationKind::UnassignDriver => Ok(match assignment::unassign(current)? {
            AssignmentOutcome::Applied(next) => Some(next),
            AssignmentOutcome::AlreadyApplied => None,
        }),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
