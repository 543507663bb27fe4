use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Driver, DriverId, Load, LoadId, LoadStatus};

/// Board payload: every load the service knows, grouped by column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadsByStatus {
    #[serde(default)]
    pub available: Vec<Load>,
    #[serde(default)]
    pub assigned: Vec<Load>,
    #[serde(default)]
    pub in_transit: Vec<Load>,
    #[serde(default)]
    pub delivered: Vec<Load>,
}

impl LoadsByStatus {
    pub fn group(&self, status: LoadStatus) -> &[Load] {
        match status {
            LoadStatus::Available => &self.available,
            LoadStatus::Assigned => &self.assigned,
            LoadStatus::InTransit => &self.in_transit,
            LoadStatus::Delivered => &self.delivered,
        }
    }

    /// Builds a payload from a flat list, keeping list order within each group.
    pub fn from_loads(loads: impl IntoIterator<Item = Load>) -> Self {
        let mut grouped = Self::default();
        for load in loads {
            match load.status {
                LoadStatus::Available => grouped.available.push(load),
                LoadStatus::Assigned => grouped.assigned.push(load),
                LoadStatus::InTransit => grouped.in_transit.push(load),
                LoadStatus::Delivered => grouped.delivered.push(load),
            }
        }
        grouped
    }

    /// Checks the payload and flattens it in column order, server order within a column.
    pub fn into_validated(self) -> Result<Vec<Load>, SnapshotError> {
        let mut seen = HashSet::new();
        let mut loads = Vec::with_capacity(
            self.available.len() + self.assigned.len() + self.in_transit.len() + self.delivered.len(),
        );
        for status in LoadStatus::ALL {
            for load in self.group(status) {
                if load.status != status {
                    return Err(SnapshotError::MisfiledLoad {
                        load_id: load.id,
                        group: status,
                        status: load.status,
                    });
                }
                if !load.is_consistent() {
                    return Err(SnapshotError::AvailableWithDriver { load_id: load.id });
                }
                if !seen.insert(load.id) {
                    return Err(SnapshotError::DuplicateLoad { load_id: load.id });
                }
                loads.push(load.clone());
            }
        }
        Ok(loads)
    }
}

pub fn validate_drivers(drivers: &[Driver]) -> Result<(), SnapshotError> {
    let mut seen = HashSet::new();
    for driver in drivers {
        if driver.name.trim().is_empty() {
            return Err(SnapshotError::UnnamedDriver {
                driver_id: driver.id,
            });
        }
        if !seen.insert(driver.id) {
            return Err(SnapshotError::DuplicateDriver {
                driver_id: driver.id,
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("load {load_id} listed under {group} but reports status {status}")]
    MisfiledLoad {
        load_id: LoadId,
        group: LoadStatus,
        status: LoadStatus,
    },
    #[error("load {load_id} is available but carries a driver")]
    AvailableWithDriver { load_id: LoadId },
    #[error("load {load_id} appears more than once")]
    DuplicateLoad { load_id: LoadId },
    #[error("driver {driver_id} appears more than once")]
    DuplicateDriver { driver_id: DriverId },
    #[error("driver {driver_id} has no name")]
    UnnamedDriver { driver_id: DriverId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateLoadStatusRequest {
    pub status: LoadStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignDriverRequest {
    pub driver_id: DriverId,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
