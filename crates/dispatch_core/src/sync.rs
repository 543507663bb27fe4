//! Folding a fetched board snapshot into local state.

use shared::{
    domain::{DispatchStats, Driver, Load, LoadId},
    protocol::{validate_drivers, LoadsByStatus},
};
use tracing::debug;

use crate::{
    assignment::AvailableDrivers, error::SyncError, pending::PendingLedger,
    registry::LoadRegistry, transitions,
};

/// A validated fetch result, loads flattened in board order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardSnapshot {
    pub loads: Vec<Load>,
    pub stats: DispatchStats,
    pub drivers: Vec<Driver>,
}

impl BoardSnapshot {
    pub fn validate(
        loads: LoadsByStatus,
        stats: DispatchStats,
        drivers: Vec<Driver>,
    ) -> Result<Self, SyncError> {
        let loads = loads.into_validated()?;
        validate_drivers(&drivers)?;
        Ok(Self {
            loads,
            stats,
            drivers,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub applied: usize,
    /// Loads whose value came in new or different from the local copy.
    pub changed: Vec<LoadId>,
    /// Loads left untouched because a mutation was pending or confirmed mid-refresh.
    pub skipped: Vec<LoadId>,
    pub removed: Vec<LoadId>,
}

/// Applies `snapshot` for a refresh that started when the ledger was at `started_at`.
pub fn reconcile(
    registry: &mut LoadRegistry,
    drivers: &mut AvailableDrivers,
    ledger: &PendingLedger,
    snapshot: BoardSnapshot,
    started_at: u64,
) -> Result<ReconcileSummary, SyncError> {
    let barrier = ledger.barrier(started_at);

    for load in &snapshot.loads {
        if barrier.contains(&load.id) {
            continue;
        }
        if let Some(local) = registry.get(load.id) {
            if local.status != load.status && !transitions::is_allowed(local.status, load.status) {
                debug!(
                    load_id = load.id.0,
                    from = %local.status,
                    to = %load.status,
                    "sync: service moved load outside the local transition table"
                );
            }
        }
    }

    let replaced = registry.replace_all(snapshot.loads, &barrier)?;
    drivers.replace(snapshot.drivers, &ledger.reserved_drivers(started_at));

    Ok(ReconcileSummary {
        applied: replaced.applied,
        changed: replaced.changed,
        skipped: replaced.skipped,
        removed: replaced.removed,
    })
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
