//! In-memory board: every known load keyed by id, plus one ordered bucket per status.

use std::collections::{HashMap, HashSet};

use shared::domain::{Load, LoadId, LoadStatus};

use crate::error::RegistryError;

/// A load together with its slot in its bucket, enough to put it back exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub load: Load,
    pub position: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub applied: usize,
    /// Applied loads that are new or differ from the local copy.
    pub changed: Vec<LoadId>,
    pub skipped: Vec<LoadId>,
    pub removed: Vec<LoadId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadRegistry {
    loads: HashMap<LoadId, Load>,
    buckets: [Vec<LoadId>; 4],
}

fn slot(status: LoadStatus) -> usize {
    match status {
        LoadStatus::Available => 0,
        LoadStatus::Assigned => 1,
        LoadStatus::InTransit => 2,
        LoadStatus::Delivered => 3,
    }
}

impl LoadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.loads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
    }

    pub fn get(&self, load_id: LoadId) -> Option<&Load> {
        self.loads.get(&load_id)
    }

    pub fn contains(&self, load_id: LoadId) -> bool {
        self.loads.contains_key(&load_id)
    }

    pub fn ids_by_status(&self, status: LoadStatus) -> &[LoadId] {
        &self.buckets[slot(status)]
    }

    /// Loads of one column in board order.
    pub fn get_by_status(&self, status: LoadStatus) -> Vec<&Load> {
        self.ids_by_status(status)
            .iter()
            .filter_map(|id| self.loads.get(id))
            .collect()
    }

    pub fn count(&self, status: LoadStatus) -> usize {
        self.ids_by_status(status).len()
    }

    pub fn entry(&self, load_id: LoadId) -> Option<RegistryEntry> {
        let load = self.loads.get(&load_id)?;
        let position = self.buckets[slot(load.status)]
            .iter()
            .position(|id| *id == load_id)?;
        Some(RegistryEntry {
            load: load.clone(),
            position,
        })
    }

    /// Inserts or replaces a load. A load that keeps its status keeps its slot;
    /// one that changes column goes to the end of the new column.
    pub fn upsert(&mut self, load: Load) -> Result<(), RegistryError> {
        ensure_consistent(&load)?;
        let load_id = load.id;
        match self.loads.get(&load_id).map(|existing| existing.status) {
            Some(previous) if previous == load.status => {}
            Some(previous) => {
                self.detach(load_id, previous);
                self.buckets[slot(load.status)].push(load_id);
            }
            None => self.buckets[slot(load.status)].push(load_id),
        }
        self.loads.insert(load_id, load);
        Ok(())
    }

    pub fn remove(&mut self, load_id: LoadId) -> Option<Load> {
        let load = self.loads.remove(&load_id)?;
        self.detach(load_id, load.status);
        Some(load)
    }

    /// Puts a captured entry back at its recorded slot, clamped to the current column length.
    pub fn restore(&mut self, entry: RegistryEntry) -> Result<(), RegistryError> {
        ensure_consistent(&entry.load)?;
        if let Some(current) = self.loads.get(&entry.load.id).map(|load| load.status) {
            self.detach(entry.load.id, current);
        }
        let bucket = &mut self.buckets[slot(entry.load.status)];
        let position = entry.position.min(bucket.len());
        bucket.insert(position, entry.load.id);
        self.loads.insert(entry.load.id, entry.load);
        Ok(())
    }

    /// Replaces the board with a fetched snapshot. Ids in `protected` keep their
    /// current value and slot; the snapshot's copy of them is ignored and they are
    /// never removed. Nothing is touched if any incoming load is inconsistent.
    pub fn replace_all(
        &mut self,
        loads: Vec<Load>,
        protected: &HashSet<LoadId>,
    ) -> Result<ReplaceSummary, RegistryError> {
        for load in &loads {
            if !protected.contains(&load.id) {
                ensure_consistent(load)?;
            }
        }

        let mut summary = ReplaceSummary::default();
        let mut next_loads = HashMap::with_capacity(loads.len());
        let mut next_buckets: [Vec<LoadId>; 4] = Default::default();

        for load in loads {
            if protected.contains(&load.id) && self.loads.contains_key(&load.id) {
                summary.skipped.push(load.id);
                continue;
            }
            if next_loads.contains_key(&load.id) {
                continue;
            }
            if self.loads.get(&load.id) != Some(&load) {
                summary.changed.push(load.id);
            }
            next_buckets[slot(load.status)].push(load.id);
            next_loads.insert(load.id, load);
            summary.applied += 1;
        }

        for (index, bucket) in self.buckets.iter().enumerate() {
            for (position, load_id) in bucket.iter().enumerate() {
                if protected.contains(load_id) {
                    let target = &mut next_buckets[index];
                    let position = position.min(target.len());
                    target.insert(position, *load_id);
                    if let Some(load) = self.loads.get(load_id) {
                        next_loads.insert(*load_id, load.clone());
                    }
                } else if !next_loads.contains_key(load_id) {
                    summary.removed.push(*load_id);
                }
            }
        }

        self.loads = next_loads;
        self.buckets = next_buckets;
        Ok(summary)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Load> {
        LoadStatus::ALL
            .into_iter()
            .flat_map(move |status| self.get_by_status(status))
    }

    /// Every stored load satisfies the driver/status rule.
    pub fn is_consistent(&self) -> bool {
        self.loads.values().all(Load::is_consistent)
    }

    fn detach(&mut self, load_id: LoadId, status: LoadStatus) {
        self.buckets[slot(status)].retain(|id| *id != load_id);
    }
}

fn ensure_consistent(load: &Load) -> Result<(), RegistryError> {
    if load.is_consistent() {
        Ok(())
    } else {
        Err(RegistryError::AvailableWithDriver { load_id: load.id })
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
