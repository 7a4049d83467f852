//! # Telemetry Store
//!
//! Owns every known [`TelemetryRecord`], keyed by device id.
//!
//! The store is mutated only by the supervisor on its event loop; everything
//! else gets cloned snapshots.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use super::record::{DeviceId, TelemetryRecord, TelemetryUpdate, DEFAULT_TRAIL_LENGTH};
use crate::error::Result;

/// Device id → latest telemetry
#[derive(Debug)]
pub struct TelemetryStore {
    records: HashMap<DeviceId, TelemetryRecord>,
    trail_length: usize,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::with_trail_length(DEFAULT_TRAIL_LENGTH)
    }
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose records keep at most `trail_length` positions
    pub fn with_trail_length(trail_length: usize) -> Self {
        Self {
            records: HashMap::new(),
            trail_length,
        }
    }

    /// Return the record for `id`, registering it with defaults if unseen
    pub fn get_or_create(&mut self, id: &DeviceId) -> &mut TelemetryRecord {
        let trail_length = self.trail_length;
        self.records.entry(id.clone()).or_insert_with(|| {
            info!("Tracking new device {}", id);
            TelemetryRecord::with_trail_length(id.clone(), trail_length)
        })
    }

    /// Apply name/value pairs to `id`, creating the record if needed
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` if any name is outside the schema. Nothing is
    /// written and no record is created in that case.
    pub fn update<I, K>(&mut self, id: &DeviceId, pairs: I) -> Result<TelemetryRecord>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let update = TelemetryUpdate::from_pairs(pairs)?;
        Ok(self.apply(id, &update))
    }

    /// Apply a validated update to `id`, creating the record if needed
    pub fn apply(&mut self, id: &DeviceId, update: &TelemetryUpdate) -> TelemetryRecord {
        self.apply_at(id, update, Utc::now())
    }

    pub fn apply_at(
        &mut self,
        id: &DeviceId,
        update: &TelemetryUpdate,
        now: DateTime<Utc>,
    ) -> TelemetryRecord {
        let record = self.get_or_create(id);
        let written = record.apply_at(update, now);
        debug!("Updated {} field(s) on {}", written.len(), id);
        record.clone()
    }

    pub fn get(&self, id: &DeviceId) -> Option<&TelemetryRecord> {
        self.records.get(id)
    }

    pub fn all_ids(&self) -> BTreeSet<DeviceId> {
        self.records.keys().cloned().collect()
    }

    /// Cloned records, ordered by device id
    pub fn snapshot(&self) -> Vec<TelemetryRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Most recent contact across all devices
    pub fn last_contact(&self) -> Option<DateTime<Utc>> {
        self.records
            .values()
            .filter_map(TelemetryRecord::time_of_last_contact)
            .max()
    }

    /// Drop records not heard from within `max_age`
    ///
    /// Records that were registered but never updated are kept.
    ///
    /// # Returns
    ///
    /// * `Vec<DeviceId>` - Evicted ids
    pub fn evict_stale(&mut self, max_age: Duration, now: DateTime<Utc>) -> Vec<DeviceId> {
        let stale: Vec<DeviceId> = self
            .records
            .values()
            .filter(|record| {
                record
                    .time_since_last_contact_at(now)
                    .is_some_and(|age| age > max_age)
            })
            .map(|record| record.id().clone())
            .collect();

        for id in &stale {
            self.records.remove(id);
            info!("Evicted stale device {}", id);
        }

        stale
    }
}
