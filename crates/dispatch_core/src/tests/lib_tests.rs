use super::*;
use async_trait::async_trait;
use shared::protocol::LoadsByStatus;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex as StdMutex,
};
use tokio::sync::Notify;

#[derive(Clone)]
struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Gate {
    fn new() -> Self {
        Self {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

#[derive(Default)]
struct ScriptedRemote {
    loads: StdMutex<Vec<Load>>,
    stats: StdMutex<DispatchStats>,
    drivers: StdMutex<Vec<Driver>>,
    fail_mutations: StdMutex<Option<RemoteError>>,
    fail_fetches: StdMutex<Option<RemoteError>>,
    mutation_gate: StdMutex<Option<Gate>>,
    fetch_gate: StdMutex<Option<Gate>>,
    mutation_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl ScriptedRemote {
    fn new(loads: Vec<Load>, drivers: Vec<Driver>) -> Arc<Self> {
        let remote = Self::default();
        *remote.stats.lock().unwrap() = DispatchStats {
            available_loads: loads
                .iter()
                .filter(|load| load.status == LoadStatus::Available)
                .count() as u32,
            available_drivers: drivers.len() as u32,
            ..DispatchStats::default()
        };
        *remote.loads.lock().unwrap() = loads;
        *remote.drivers.lock().unwrap() = drivers;
        Arc::new(remote)
    }

    fn fail_mutations_with(&self, err: RemoteError) {
        *self.fail_mutations.lock().unwrap() = Some(err);
    }

    fn fail_fetches_with(&self, err: Option<RemoteError>) {
        *self.fail_fetches.lock().unwrap() = err;
    }

    fn hold_next_mutation(&self) -> Gate {
        let gate = Gate::new();
        *self.mutation_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn hold_next_fetch(&self) -> Gate {
        let gate = Gate::new();
        *self.fetch_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn set_load(&self, load: Load) {
        let mut loads = self.loads.lock().unwrap();
        match loads.iter_mut().find(|existing| existing.id == load.id) {
            Some(existing) => *existing = load,
            None => loads.push(load),
        }
    }

    fn mutation_calls(&self) -> usize {
        self.mutation_calls.load(Ordering::SeqCst)
    }

    async fn mutate<F>(&self, load_id: LoadId, apply: F) -> Result<(), RemoteError>
    where
        F: FnOnce(&mut Load, &mut Vec<Driver>) + Send,
    {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.mutation_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let failure = self.fail_mutations.lock().unwrap().clone();
        if let Some(err) = failure {
            return Err(err);
        }
        let mut loads = self.loads.lock().unwrap();
        let load = loads
            .iter_mut()
            .find(|load| load.id == load_id)
            .ok_or(RemoteError::Status {
                status: 404,
                api: None,
            })?;
        apply(load, &mut self.drivers.lock().unwrap());
        Ok(())
    }
}

#[async_trait]
impl RemoteLoadService for ScriptedRemote {
    async fn fetch_loads_by_status(&self) -> Result<LoadsByStatus, RemoteError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let snapshot = LoadsByStatus::from_loads(self.loads.lock().unwrap().clone());
        let gate = self.fetch_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let failure = self.fail_fetches.lock().unwrap().clone();
        match failure {
            Some(err) => Err(err),
            None => Ok(snapshot),
        }
    }

    async fn fetch_stats(&self) -> Result<DispatchStats, RemoteError> {
        Ok(*self.stats.lock().unwrap())
    }

    async fn fetch_available_drivers(&self) -> Result<Vec<Driver>, RemoteError> {
        Ok(self.drivers.lock().unwrap().clone())
    }

    async fn update_load_status(
        &self,
        load_id: LoadId,
        status: LoadStatus,
    ) -> Result<(), RemoteError> {
        self.mutate(load_id, move |load, _| {
            if status == LoadStatus::Available
                || (load.status == LoadStatus::InTransit && status == LoadStatus::Assigned)
            {
                load.driver_id = None;
            }
            load.status = status;
        })
        .await
    }

    async fn assign_driver(
        &self,
        load_id: LoadId,
        driver_id: DriverId,
    ) -> Result<(), RemoteError> {
        self.mutate(load_id, move |load, drivers| {
            load.status = LoadStatus::Assigned;
            load.driver_id = Some(driver_id);
            drivers.retain(|driver| driver.id != driver_id);
        })
        .await
    }

    async fn unassign_driver(&self, load_id: LoadId) -> Result<(), RemoteError> {
        self.mutate(load_id, |load, _| {
            load.status = LoadStatus::Available;
            load.driver_id = None;
        })
        .await
    }
}

fn sample_load(id: i64, status: LoadStatus, driver: Option<i64>) -> Load {
    Load {
        id: LoadId(id),
        status,
        pickup_address: format!("{id} Origin Rd, Dallas TX"),
        delivery_address: format!("{id} Dock St, Memphis TN"),
        rate_amount: Some(1850.0),
        driver_id: driver.map(DriverId),
        broker_name: Some("Acme Brokerage".to_string()),
    }
}

fn sample_driver(id: i64, name: &str) -> Driver {
    Driver {
        id: DriverId(id),
        name: name.to_string(),
        phone: None,
        email: None,
    }
}

async fn synced_coordinator(
    remote: &Arc<ScriptedRemote>,
    config: CoordinatorConfig,
) -> Arc<DispatchCoordinator> {
    let coordinator = DispatchCoordinator::new(remote.clone(), config);
    coordinator.refresh().await.expect("initial refresh");
    coordinator
}

async fn assert_board_consistent(coordinator: &DispatchCoordinator) {
    let guard = coordinator.inner.lock().await;
    assert!(guard.registry.is_consistent(), "available load carries a driver");
}

fn board_content(view: &BoardView) -> (Vec<BoardColumn>, Vec<Driver>, Option<DispatchStats>) {
    (view.columns.clone(), view.drivers.clone(), view.stats)
}

#[tokio::test]
async fn assign_applies_optimistically_and_confirms() {
    let remote = ScriptedRemote::new(
        vec![sample_load(1, LoadStatus::Available, None)],
        vec![sample_driver(7, "Dana"), sample_driver(8, "Eli")],
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    let gate = remote.hold_next_mutation();

    let task = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.request_assign(LoadId(1), DriverId(7)).await })
    };
    gate.entered.notified().await;

    let in_flight = coordinator.load(LoadId(1)).await.expect("load");
    assert_eq!(in_flight.status, LoadStatus::Assigned);
    assert_eq!(in_flight.driver_id, Some(DriverId(7)));
    assert!(coordinator.is_pending(LoadId(1)).await);
    let board = coordinator.board().await;
    assert!(board.drivers.iter().all(|driver| driver.id != DriverId(7)));
    assert_eq!(board.pending, vec![LoadId(1)]);

    gate.release.notify_one();
    let confirmed = task.await.expect("join").expect("assign");

    assert_eq!(confirmed.status, LoadStatus::Assigned);
    assert_eq!(confirmed.driver_id, Some(DriverId(7)));
    assert!(!coordinator.is_pending(LoadId(1)).await);
    let board = coordinator.board().await;
    assert_eq!(board.column(LoadStatus::Assigned).len(), 1);
    assert_eq!(board.drivers, vec![sample_driver(8, "Eli")]);
    assert_board_consistent(&coordinator).await;
}

#[tokio::test]
async fn failed_assign_restores_previous_board() {
    let remote = ScriptedRemote::new(
        vec![
            sample_load(1, LoadStatus::Available, None),
            sample_load(2, LoadStatus::Available, None),
        ],
        vec![sample_driver(6, "Cam"), sample_driver(7, "Dana")],
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    let before = coordinator.board().await;
    let mut events = coordinator.subscribe_events();
    remote.fail_mutations_with(RemoteError::Status {
        status: 503,
        api: None,
    });

    let err = coordinator
        .request_assign(LoadId(1), DriverId(7))
        .await
        .expect_err("remote failure");

    assert_eq!(err.kind(), DispatchErrorKind::MutationFailed);
    assert!(err.is_retryable());
    assert_eq!(coordinator.board().await, before);
    let load = coordinator.load(LoadId(1)).await.expect("load");
    assert_eq!(load.status, LoadStatus::Available);
    assert_eq!(load.driver_id, None);
    assert_board_consistent(&coordinator).await;

    let mut rolled_back = false;
    while let Ok(event) = events.try_recv() {
        if let DispatchEvent::MutationRolledBack { load_id, .. } = event {
            assert_eq!(load_id, LoadId(1));
            rolled_back = true;
        }
    }
    assert!(rolled_back, "rollback event expected");
}

#[tokio::test]
async fn failed_move_restores_column_position() {
    let remote = ScriptedRemote::new(
        vec![
            sample_load(1, LoadStatus::Assigned, Some(4)),
            sample_load(2, LoadStatus::Assigned, Some(5)),
            sample_load(3, LoadStatus::Assigned, None),
        ],
        Vec::new(),
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    let before = coordinator.board().await;
    remote.fail_mutations_with(RemoteError::Transport("connection reset".to_string()));

    coordinator
        .request_status_change(LoadId(2), LoadStatus::Available)
        .await
        .expect_err("remote failure");

    let after = coordinator.board().await;
    assert_eq!(after, before);
    let ids: Vec<_> = after
        .column(LoadStatus::Assigned)
        .iter()
        .map(|load| load.id)
        .collect();
    assert_eq!(ids, vec![LoadId(1), LoadId(2), LoadId(3)]);
}

#[tokio::test]
async fn invalid_move_is_rejected_before_network() {
    let remote = ScriptedRemote::new(
        vec![sample_load(2, LoadStatus::Assigned, Some(3))],
        Vec::new(),
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    let before = coordinator.board().await;

    let err = coordinator
        .request_status_change(LoadId(2), LoadStatus::Delivered)
        .await
        .expect_err("not in table");

    assert!(matches!(
        err,
        DispatchError::InvalidTransition {
            from: LoadStatus::Assigned,
            to: LoadStatus::Delivered,
            ..
        }
    ));
    assert!(!err.is_retryable());
    assert_eq!(remote.mutation_calls(), 0);
    assert_eq!(coordinator.board().await, before);
}

#[tokio::test]
async fn every_pair_follows_transition_table() {
    for from in LoadStatus::ALL {
        for to in LoadStatus::ALL {
            if from == to {
                continue;
            }
            let driver = (from != LoadStatus::Available).then_some(9);
            let remote = ScriptedRemote::new(vec![sample_load(1, from, driver)], Vec::new());
            let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;

            let result = coordinator.request_status_change(LoadId(1), to).await;

            if transitions::is_allowed(from, to) {
                let load = result.unwrap_or_else(|err| panic!("{from} -> {to}: {err}"));
                assert_eq!(load.status, to, "{from} -> {to}");
                assert_eq!(remote.mutation_calls(), 1);
            } else {
                let err = result.expect_err("pair outside table");
                assert_eq!(err.kind(), DispatchErrorKind::InvalidTransition, "{from} -> {to}");
                assert_eq!(remote.mutation_calls(), 0);
                let load = coordinator.load(LoadId(1)).await.expect("load");
                assert_eq!(load.status, from);
            }
            assert_board_consistent(&coordinator).await;
        }
    }
}

#[tokio::test]
async fn refresh_during_pending_move_keeps_optimistic_value() {
    let remote = ScriptedRemote::new(
        vec![
            sample_load(3, LoadStatus::Assigned, Some(2)),
            sample_load(4, LoadStatus::Available, None),
        ],
        Vec::new(),
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    let gate = remote.hold_next_mutation();

    let task = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator
                .request_status_change(LoadId(3), LoadStatus::InTransit)
                .await
        })
    };
    gate.entered.notified().await;

    remote.set_load(Load {
        broker_name: Some("Renamed Brokerage".to_string()),
        ..sample_load(4, LoadStatus::Available, None)
    });
    let summary = coordinator.refresh().await.expect("refresh");

    assert_eq!(summary.skipped, vec![LoadId(3)]);
    let pending = coordinator.load(LoadId(3)).await.expect("load");
    assert_eq!(pending.status, LoadStatus::InTransit);
    let other = coordinator.load(LoadId(4)).await.expect("load");
    assert_eq!(other.broker_name.as_deref(), Some("Renamed Brokerage"));

    gate.release.notify_one();
    let confirmed = task.await.expect("join").expect("move");
    assert_eq!(confirmed.status, LoadStatus::InTransit);
    assert!(!coordinator.is_pending(LoadId(3)).await);
}

#[tokio::test]
async fn refresh_started_before_confirmation_does_not_revert_it() {
    let remote = ScriptedRemote::new(
        vec![sample_load(5, LoadStatus::Available, None)],
        vec![sample_driver(7, "Dana")],
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    let fetch_gate = remote.hold_next_fetch();

    let stale_refresh = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.refresh().await })
    };
    fetch_gate.entered.notified().await;

    let confirmed = coordinator
        .request_assign(LoadId(5), DriverId(7))
        .await
        .expect("assign");
    assert_eq!(confirmed.status, LoadStatus::Assigned);

    fetch_gate.release.notify_one();
    let summary = stale_refresh.await.expect("join").expect("stale refresh");

    assert_eq!(summary.skipped, vec![LoadId(5)]);
    let load = coordinator.load(LoadId(5)).await.expect("load");
    assert_eq!(load.status, LoadStatus::Assigned);
    assert_eq!(load.driver_id, Some(DriverId(7)));
    let board = coordinator.board().await;
    assert!(board.drivers.is_empty(), "stale driver list must not resurrect driver 7");
}

#[tokio::test]
async fn second_mutation_on_same_load_conflicts() {
    let remote = ScriptedRemote::new(
        vec![
            sample_load(1, LoadStatus::Available, None),
            sample_load(2, LoadStatus::Assigned, Some(3)),
        ],
        vec![sample_driver(7, "Dana")],
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    let gate = remote.hold_next_mutation();

    let task = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.request_assign(LoadId(1), DriverId(7)).await })
    };
    gate.entered.notified().await;

    let err = coordinator
        .request_status_change(LoadId(1), LoadStatus::Available)
        .await
        .expect_err("conflict");
    assert!(matches!(
        err,
        DispatchError::Conflict {
            load_id: LoadId(1),
            pending: OperationKind::AssignDriver { .. },
        }
    ));
    assert!(err.is_retryable());

    let other = coordinator
        .request_status_change(LoadId(2), LoadStatus::InTransit)
        .await
        .expect("other loads are independent");
    assert_eq!(other.status, LoadStatus::InTransit);

    gate.release.notify_one();
    task.await.expect("join").expect("assign");
    assert_eq!(remote.mutation_calls(), 2);
}

#[tokio::test]
async fn timed_out_mutation_rolls_back() {
    let remote = ScriptedRemote::new(
        vec![sample_load(1, LoadStatus::InTransit, Some(4))],
        Vec::new(),
    );
    let config = CoordinatorConfig {
        request_timeout: Duration::from_millis(50),
        ..CoordinatorConfig::default()
    };
    let coordinator = synced_coordinator(&remote, config).await;
    let before = coordinator.board().await;
    let _gate = remote.hold_next_mutation();

    let err = coordinator
        .request_status_change(LoadId(1), LoadStatus::Delivered)
        .await
        .expect_err("timeout");

    match err {
        DispatchError::MutationFailed { source, .. } => {
            assert!(matches!(source, RemoteError::Timeout { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(coordinator.board().await, before);
    assert!(!coordinator.is_pending(LoadId(1)).await);
}

#[tokio::test]
async fn failed_refresh_keeps_previous_board() {
    let remote = ScriptedRemote::new(
        vec![sample_load(1, LoadStatus::Available, None)],
        vec![sample_driver(7, "Dana")],
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    let before = coordinator.board().await;
    let mut events = coordinator.subscribe_events();
    remote.fail_fetches_with(Some(RemoteError::Transport("dns failure".to_string())));

    let err = coordinator.refresh().await.expect_err("fetch failure");

    assert_eq!(err.kind(), DispatchErrorKind::SyncFailed);
    assert_eq!(coordinator.board().await, before);
    assert!(matches!(
        events.recv().await.expect("event"),
        DispatchEvent::SyncFailed(_)
    ));
}

#[tokio::test]
async fn malformed_snapshot_is_rejected_whole() {
    let remote = ScriptedRemote::new(
        vec![
            sample_load(1, LoadStatus::Available, None),
            sample_load(2, LoadStatus::Assigned, Some(3)),
        ],
        Vec::new(),
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    let before = coordinator.board().await;
    remote.set_load(sample_load(1, LoadStatus::Available, Some(8)));
    remote.set_load(sample_load(2, LoadStatus::Delivered, Some(3)));

    let err = coordinator.refresh().await.expect_err("malformed");

    assert!(matches!(
        err,
        DispatchError::SyncFailed(SyncError::MalformedSnapshot(_))
    ));
    assert_eq!(coordinator.board().await, before);
}

#[tokio::test]
async fn repeated_refresh_with_same_snapshot_is_stable() {
    let remote = ScriptedRemote::new(
        vec![
            sample_load(1, LoadStatus::Available, None),
            sample_load(2, LoadStatus::Assigned, Some(3)),
            sample_load(3, LoadStatus::InTransit, Some(4)),
            sample_load(4, LoadStatus::Delivered, Some(5)),
        ],
        vec![sample_driver(7, "Dana")],
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;

    coordinator.refresh().await.expect("first");
    let first = coordinator.board().await;
    let summary = coordinator.refresh().await.expect("second");
    let second = coordinator.board().await;

    assert_eq!(board_content(&first), board_content(&second));
    assert_eq!(summary.applied, 4);
    assert!(summary.changed.is_empty());
    assert!(summary.skipped.is_empty());
    assert!(summary.removed.is_empty());
}

#[tokio::test]
async fn loads_missing_from_snapshot_are_dropped() {
    let remote = ScriptedRemote::new(
        vec![
            sample_load(1, LoadStatus::Available, None),
            sample_load(2, LoadStatus::Delivered, Some(3)),
        ],
        Vec::new(),
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    remote.loads.lock().unwrap().retain(|load| load.id != LoadId(2));
    let mut events = coordinator.subscribe_events();

    let summary = coordinator.refresh().await.expect("refresh");

    assert_eq!(summary.removed, vec![LoadId(2)]);
    assert!(coordinator.load(LoadId(2)).await.is_none());
    assert!(matches!(
        events.recv().await.expect("event"),
        DispatchEvent::LoadRemoved(LoadId(2))
    ));
}

#[tokio::test]
async fn same_state_requests_succeed_without_network() {
    let remote = ScriptedRemote::new(
        vec![
            sample_load(1, LoadStatus::Available, None),
            sample_load(2, LoadStatus::Assigned, Some(7)),
        ],
        Vec::new(),
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;

    coordinator
        .request_status_change(LoadId(2), LoadStatus::Assigned)
        .await
        .expect("same column");
    coordinator
        .request_assign(LoadId(2), DriverId(7))
        .await
        .expect("same driver");
    coordinator
        .request_unassign(LoadId(1))
        .await
        .expect("already unassigned");

    assert_eq!(remote.mutation_calls(), 0);
    assert!(coordinator.board().await.pending.is_empty());
}

#[tokio::test]
async fn precondition_and_unknown_load_errors() {
    let remote = ScriptedRemote::new(
        vec![
            sample_load(1, LoadStatus::InTransit, Some(4)),
            sample_load(2, LoadStatus::Assigned, None),
        ],
        vec![sample_driver(7, "Dana")],
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;

    let err = coordinator
        .request_assign(LoadId(1), DriverId(7))
        .await
        .expect_err("in transit");
    assert_eq!(err.kind(), DispatchErrorKind::Precondition);

    let err = coordinator
        .request_unassign(LoadId(2))
        .await
        .expect_err("no driver");
    assert_eq!(err.kind(), DispatchErrorKind::Precondition);

    let err = coordinator
        .request_unassign(LoadId(99))
        .await
        .expect_err("unknown");
    assert!(matches!(err, DispatchError::UnknownLoad { load_id: LoadId(99) }));
    assert_eq!(remote.mutation_calls(), 0);
}

#[tokio::test]
async fn unassign_returns_load_to_available() {
    let remote = ScriptedRemote::new(
        vec![sample_load(1, LoadStatus::Assigned, Some(7))],
        Vec::new(),
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;

    let load = coordinator.request_unassign(LoadId(1)).await.expect("unassign");

    assert_eq!(load.status, LoadStatus::Available);
    assert_eq!(load.driver_id, None);
    assert_board_consistent(&coordinator).await;
}

#[tokio::test]
async fn polling_stops_when_handle_is_stopped() {
    let remote = ScriptedRemote::new(vec![sample_load(1, LoadStatus::Available, None)], Vec::new());
    let config = CoordinatorConfig {
        poll_interval: Duration::from_millis(20),
        ..CoordinatorConfig::default()
    };
    let coordinator = DispatchCoordinator::new(remote.clone(), config);

    let handle = coordinator.spawn_polling();
    tokio::time::sleep(Duration::from_millis(110)).await;
    assert!(handle.is_running());
    handle.stop();
    let polled = remote.fetch_calls.load(Ordering::SeqCst);
    assert!(polled >= 2, "expected several polls, saw {polled}");
    assert!(coordinator.board().await.last_synced_at.is_some());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(remote.fetch_calls.load(Ordering::SeqCst), polled);
}

fn column_ids(view: &BoardView, status: LoadStatus) -> Vec<LoadId> {
    view.column(status).iter().map(|load| load.id).collect()
}

#[tokio::test]
async fn failed_unassign_restores_previous_board() {
    let remote = ScriptedRemote::new(
        vec![
            sample_load(1, LoadStatus::Assigned, Some(7)),
            sample_load(2, LoadStatus::Assigned, Some(8)),
            sample_load(3, LoadStatus::Available, None),
        ],
        vec![sample_driver(6, "Cam")],
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    let before = coordinator.board().await;
    remote.fail_mutations_with(RemoteError::Transport("connection reset".to_string()));

    let err = coordinator
        .request_unassign(LoadId(1))
        .await
        .expect_err("remote failure");

    assert_eq!(err.kind(), DispatchErrorKind::MutationFailed);
    let after = coordinator.board().await;
    assert_eq!(after, before);
    assert_eq!(column_ids(&after, LoadStatus::Assigned), vec![LoadId(1), LoadId(2)]);
    let load = coordinator.load(LoadId(1)).await.expect("load");
    assert_eq!(load.driver_id, Some(DriverId(7)));
    assert!(!coordinator.is_pending(LoadId(1)).await);
}

#[tokio::test]
async fn failed_assign_after_mid_flight_refresh_restores_load_and_driver() {
    let remote = ScriptedRemote::new(
        vec![
            sample_load(1, LoadStatus::Available, None),
            sample_load(2, LoadStatus::Available, None),
            sample_load(3, LoadStatus::Available, None),
        ],
        vec![
            sample_driver(5, "Ann"),
            sample_driver(7, "Dana"),
            sample_driver(9, "Ike"),
        ],
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    let gate = remote.hold_next_mutation();

    let task = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.request_assign(LoadId(2), DriverId(7)).await })
    };
    gate.entered.notified().await;

    remote.loads.lock().unwrap().retain(|load| load.id != LoadId(1));
    remote
        .drivers
        .lock()
        .unwrap()
        .retain(|driver| driver.id != DriverId(5));
    let summary = coordinator.refresh().await.expect("refresh");
    assert_eq!(summary.skipped, vec![LoadId(2)]);
    assert_eq!(summary.removed, vec![LoadId(1)]);
    assert_eq!(coordinator.board().await.drivers, vec![sample_driver(9, "Ike")]);

    remote.fail_mutations_with(RemoteError::Status {
        status: 503,
        api: None,
    });
    gate.release.notify_one();
    let err = task.await.expect("join").expect_err("remote failure");
    assert_eq!(err.kind(), DispatchErrorKind::MutationFailed);

    let board = coordinator.board().await;
    assert_eq!(board.load(LoadId(2)), Some(&sample_load(2, LoadStatus::Available, None)));
    assert_eq!(column_ids(&board, LoadStatus::Available), vec![LoadId(3), LoadId(2)]);
    assert!(board.column(LoadStatus::Assigned).is_empty());
    assert_eq!(
        board.drivers,
        vec![sample_driver(9, "Ike"), sample_driver(7, "Dana")]
    );
    assert!(board.pending.is_empty());
    assert_board_consistent(&coordinator).await;

    coordinator.refresh().await.expect("refresh");
    let board = coordinator.board().await;
    assert_eq!(column_ids(&board, LoadStatus::Available), vec![LoadId(2), LoadId(3)]);
    assert_eq!(
        board.drivers,
        vec![sample_driver(7, "Dana"), sample_driver(9, "Ike")]
    );
}

#[tokio::test]
async fn cancelled_assign_releases_load_and_driver() {
    let remote = ScriptedRemote::new(
        vec![sample_load(1, LoadStatus::Available, None)],
        vec![sample_driver(6, "Cam"), sample_driver(7, "Dana")],
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    let before = coordinator.board().await;
    let mut events = coordinator.subscribe_events();
    let gate = remote.hold_next_mutation();

    let task = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.request_assign(LoadId(1), DriverId(7)).await })
    };
    gate.entered.notified().await;
    assert!(coordinator.is_pending(LoadId(1)).await);

    task.abort();
    assert!(task.await.expect_err("aborted").is_cancelled());

    assert!(!coordinator.is_pending(LoadId(1)).await);
    assert_eq!(coordinator.board().await, before);
    let mut rolled_back = false;
    while let Ok(event) = events.try_recv() {
        if let DispatchEvent::MutationRolledBack { load_id, .. } = event {
            assert_eq!(load_id, LoadId(1));
            rolled_back = true;
        }
    }
    assert!(rolled_back, "rollback event expected");

    let load = coordinator
        .request_assign(LoadId(1), DriverId(7))
        .await
        .expect("retry after cancel");
    assert_eq!(load.status, LoadStatus::Assigned);
    assert_eq!(load.driver_id, Some(DriverId(7)));
}

#[tokio::test]
async fn cancelled_refresh_does_not_pin_confirmations() {
    let remote = ScriptedRemote::new(
        vec![sample_load(1, LoadStatus::Available, None)],
        vec![sample_driver(7, "Dana")],
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    let gate = remote.hold_next_fetch();

    let task = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.refresh().await })
    };
    gate.entered.notified().await;
    assert_eq!(coordinator.inner.lock().await.refreshes_in_flight.len(), 1);

    task.abort();
    assert!(task.await.expect_err("aborted").is_cancelled());
    assert!(coordinator.inner.lock().await.refreshes_in_flight.is_empty());

    coordinator
        .request_assign(LoadId(1), DriverId(7))
        .await
        .expect("assign");
    let guard = coordinator.inner.lock().await;
    assert!(guard.pending.barrier(0).is_empty());
    assert!(guard.pending.reserved_drivers(0).is_empty());
}

#[tokio::test]
async fn server_side_move_is_reported_as_load_change() {
    let remote = ScriptedRemote::new(
        vec![
            sample_load(1, LoadStatus::Assigned, Some(4)),
            sample_load(2, LoadStatus::Available, None),
        ],
        Vec::new(),
    );
    let coordinator = synced_coordinator(&remote, CoordinatorConfig::default()).await;
    let mut events = coordinator.subscribe_events();
    remote.set_load(sample_load(1, LoadStatus::InTransit, Some(4)));

    let summary = coordinator.refresh().await.expect("refresh");

    assert_eq!(summary.changed, vec![LoadId(1)]);
    let mut changed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DispatchEvent::LoadChanged(load) = event {
            changed.push(load);
        }
    }
    assert_eq!(changed, vec![sample_load(1, LoadStatus::InTransit, Some(4))]);
}
