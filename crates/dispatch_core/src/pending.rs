//! Ledger of in-flight optimistic mutations.
//!
//! A pending entry blocks a second mutation of the same load and shields the
//! optimistic value from reconciliation. The ledger also keeps a revision
//! counter that advances whenever a mutation is confirmed, so a refresh that
//! started earlier can tell its copy of that load is older than the
//! confirmation.

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use chrono::{DateTime, Utc};
use shared::domain::{DriverId, LoadId, LoadStatus};

use crate::{assignment::ReleasedDriver, error::DispatchError, registry::RegistryEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    StatusChange { target: LoadStatus },
    AssignDriver { driver_id: DriverId },
    UnassignDriver,
}

impl OperationKind {
    pub fn name(self) -> &'static str {
        match self {
            OperationKind::StatusChange { .. } => "status_change",
            OperationKind::AssignDriver { .. } => "assign_driver",
            OperationKind::UnassignDriver => "unassign_driver",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::StatusChange { target } => write!(f, "move to {target}"),
            OperationKind::AssignDriver { driver_id } => write!(f, "assignment of driver {driver_id}"),
            OperationKind::UnassignDriver => f.write_str("driver release"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub load_id: LoadId,
    pub kind: OperationKind,
    /// The load and its slot before the optimistic apply.
    pub previous: RegistryEntry,
    /// Driver taken out of the available cache by an assignment.
    pub released_driver: Option<ReleasedDriver>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Confirmation {
    revision: u64,
    assigned_driver: Option<DriverId>,
}

#[derive(Debug, Default)]
pub struct PendingLedger {
    operations: HashMap<LoadId, PendingOperation>,
    revision: u64,
    confirmations: HashMap<LoadId, Confirmation>,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, load_id: LoadId) -> Option<&PendingOperation> {
        self.operations.get(&load_id)
    }

    pub fn is_pending(&self, load_id: LoadId) -> bool {
        self.operations.contains_key(&load_id)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn pending_ids(&self) -> Vec<LoadId> {
        let mut ids: Vec<_> = self.operations.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn ensure_idle(&self, load_id: LoadId) -> Result<(), DispatchError> {
        match self.operations.get(&load_id) {
            Some(existing) => Err(DispatchError::Conflict {
                load_id,
                pending: existing.kind,
            }),
            None => Ok(()),
        }
    }

    pub fn begin(&mut self, operation: PendingOperation) -> Result<(), DispatchError> {
        self.ensure_idle(operation.load_id)?;
        self.operations.insert(operation.load_id, operation);
        Ok(())
    }

    /// Removes the entry after the service accepted the change and advances the revision.
    pub fn confirm(&mut self, load_id: LoadId) -> Option<PendingOperation> {
        let operation = self.operations.remove(&load_id)?;
        self.revision += 1;
        let assigned_driver = match operation.kind {
            OperationKind::AssignDriver { driver_id } => Some(driver_id),
            _ => None,
        };
        self.confirmations.insert(
            load_id,
            Confirmation {
                revision: self.revision,
                assigned_driver,
            },
        );
        Some(operation)
    }

    /// Removes the entry after the service refused the change. The revision is
    /// untouched because the service state did not move.
    pub fn abandon(&mut self, load_id: LoadId) -> Option<PendingOperation> {
        self.operations.remove(&load_id)
    }

    /// Loads a refresh started at `revision` must leave alone.
    pub fn barrier(&self, revision: u64) -> HashSet<LoadId> {
        self.operations
            .keys()
            .copied()
            .chain(
                self.confirmations
                    .iter()
                    .filter(|(_, confirmation)| confirmation.revision > revision)
                    .map(|(load_id, _)| *load_id),
            )
            .collect()
    }

    /// Drivers a refresh started at `revision` must not put back in the free list.
    pub fn reserved_drivers(&self, revision: u64) -> HashSet<DriverId> {
        let in_flight = self.operations.values().filter_map(|op| match op.kind {
            OperationKind::AssignDriver { driver_id } => Some(driver_id),
            _ => None,
        });
        let confirmed = self
            .confirmations
            .values()
            .filter(|confirmation| confirmation.revision > revision)
            .filter_map(|confirmation| confirmation.assigned_driver);
        in_flight.chain(confirmed).collect()
    }

    /// Drops confirmation marks no running refresh can still need.
    pub fn forget_confirmations_up_to(&mut self, revision: u64) {
        self.confirmations
            .retain(|_, confirmation| confirmation.revision > revision);
    }
}

#[cfg(test)]
#[path = "tests/pending_tests.rs"]
mod tests;
