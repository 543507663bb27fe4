//! Binding and releasing drivers, plus the locally cached available-driver set.

use std::collections::HashSet;

use shared::domain::{Driver, DriverId, Load, LoadStatus};

use crate::{error::DispatchError, transitions};

#[derive(Debug, Clone, PartialEq)]
pub enum AssignmentOutcome {
    /// The load as it looks after the change.
    Applied(Load),
    /// The requested state is already in place.
    AlreadyApplied,
}

pub fn assign(load: &Load, driver_id: DriverId) -> Result<AssignmentOutcome, DispatchError> {
    if load.status == LoadStatus::Assigned && load.driver_id == Some(driver_id) {
        return Ok(AssignmentOutcome::AlreadyApplied);
    }
    if load.status != LoadStatus::Available {
        return Err(DispatchError::precondition(
            load.id,
            format!(
                "only available loads can take a driver (load is {})",
                load.status
            ),
        ));
    }

    let mut next = transitions::transition(load, LoadStatus::Assigned)?;
    next.driver_id = Some(driver_id);
    Ok(AssignmentOutcome::Applied(next))
}

pub fn unassign(load: &Load) -> Result<AssignmentOutcome, DispatchError> {
    if load.driver_id.is_none() {
        if load.status == LoadStatus::Available {
            return Ok(AssignmentOutcome::AlreadyApplied);
        }
        return Err(DispatchError::precondition(
            load.id,
            "no driver is assigned",
        ));
    }
    if load.status != LoadStatus::Assigned {
        return Err(DispatchError::precondition(
            load.id,
            format!(
                "driver can only be released from an assigned load (load is {})",
                load.status
            ),
        ));
    }

    let next = transitions::transition(load, LoadStatus::Available)?;
    Ok(AssignmentOutcome::Applied(next))
}

/// Drivers the service last reported as free, in service order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailableDrivers {
    drivers: Vec<Driver>,
}

/// A driver taken out of the cache and the slot it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedDriver {
    pub driver: Driver,
    pub position: usize,
}

impl AvailableDrivers {
    pub fn as_slice(&self) -> &[Driver] {
        &self.drivers
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn contains(&self, driver_id: DriverId) -> bool {
        self.drivers.iter().any(|driver| driver.id == driver_id)
    }

    pub fn take(&mut self, driver_id: DriverId) -> Option<ReleasedDriver> {
        let position = self
            .drivers
            .iter()
            .position(|driver| driver.id == driver_id)?;
        let driver = self.drivers.remove(position);
        Some(ReleasedDriver { driver, position })
    }

    pub fn restore(&mut self, released: ReleasedDriver) {
        if self.contains(released.driver.id) {
            return;
        }
        let position = released.position.min(self.drivers.len());
        self.drivers.insert(position, released.driver);
    }

    /// Replaces the cache with a fetched list, leaving out drivers still bound locally.
    pub fn replace(&mut self, drivers: Vec<Driver>, reserved: &HashSet<DriverId>) {
        self.drivers = drivers
            .into_iter()
            .filter(|driver| !reserved.contains(&driver.id))
            .collect();
    }
}

#[cfg(test)]
#[path = "tests/assignment_tests.rs"]
mod tests;
