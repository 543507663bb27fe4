//! Closed transition table for dragging a load between columns.
//!
//! Forward moves follow the dispatch lifecycle; the three backward moves exist
//! so a dispatcher can correct a mistaken drop. No network access happens here.

use shared::domain::{Load, LoadStatus};

use crate::error::DispatchError;

const ALLOWED: [(LoadStatus, LoadStatus); 6] = [
    (LoadStatus::Available, LoadStatus::Assigned),
    (LoadStatus::Assigned, LoadStatus::InTransit),
    (LoadStatus::InTransit, LoadStatus::Delivered),
    (LoadStatus::Assigned, LoadStatus::Available),
    (LoadStatus::InTransit, LoadStatus::Assigned),
    (LoadStatus::Delivered, LoadStatus::InTransit),
];

pub fn is_allowed(from: LoadStatus, to: LoadStatus) -> bool {
    ALLOWED.contains(&(from, to))
}

/// Columns a load in `from` may be dropped on.
pub fn allowed_targets(from: LoadStatus) -> Vec<LoadStatus> {
    ALLOWED
        .iter()
        .filter(|(source, _)| *source == from)
        .map(|(_, target)| *target)
        .collect()
}

/// Moving back into these columns releases the driver.
fn clears_driver(from: LoadStatus, to: LoadStatus) -> bool {
    to == LoadStatus::Available || (from == LoadStatus::InTransit && to == LoadStatus::Assigned)
}

/// Returns the load as it looks after moving to `target`. Never sets a driver.
pub fn transition(load: &Load, target: LoadStatus) -> Result<Load, DispatchError> {
    if !is_allowed(load.status, target) {
        return Err(DispatchError::InvalidTransition {
            load_id: load.id,
            from: load.status,
            to: target,
        });
    }

    let mut next = load.clone();
    if clears_driver(load.status, target) {
        next.driver_id = None;
    }
    next.status = target;
    Ok(next)
}

#[cfg(test)]
#[path = "tests/transitions_tests.rs"]
mod tests;
