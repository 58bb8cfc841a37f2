//! Traffic store - last known record per junction
//!
//! Only the reconciler mutates the store. Readers get owned copies.

use crate::domain::types::{JunctionId, JunctionRecord};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Result of a single upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Incoming record was older than the stored one and was dropped
    Stale,
}

pub struct TrafficStore {
    junctions: FxHashMap<JunctionId, JunctionRecord>,
    reject_stale: bool,
}

impl TrafficStore {
    pub fn new(reject_stale: bool) -> Self {
        Self { junctions: FxHashMap::default(), reject_stale }
    }

    /// Insert or replace the record for its junction id
    ///
    /// Equal timestamps replace; with `reject_stale` a strictly older
    /// timestamp is ignored.
    pub fn upsert(&mut self, record: JunctionRecord) -> UpsertOutcome {
        match self.junctions.get_mut(&record.junction_id) {
            Some(current) => {
                if self.reject_stale && record.timestamp_ms < current.timestamp_ms {
                    debug!(
                        junction_id = %record.junction_id,
                        stored_ts = %current.timestamp_ms,
                        incoming_ts = %record.timestamp_ms,
                        "junction_update_stale"
                    );
                    return UpsertOutcome::Stale;
                }
                *current = record;
                UpsertOutcome::Updated
            }
            None => {
                self.junctions.insert(record.junction_id.clone(), record);
                UpsertOutcome::Inserted
            }
        }
    }

    pub fn get(&self, id: &JunctionId) -> Option<&JunctionRecord> {
        self.junctions.get(id)
    }

    /// Owned copy of every stored record, sorted by junction id
    pub fn snapshot(&self) -> Vec<JunctionRecord> {
        let mut records: Vec<JunctionRecord> = self.junctions.values().cloned().collect();
        records.sort_by(|a, b| a.junction_id.cmp(&b.junction_id));
        records
    }

    /// Drop junctions whose last timestamp is older than `cutoff_ms`
    ///
    /// Ids for which `keep` returns true survive regardless of age.
    pub fn evict_older_than<F>(&mut self, cutoff_ms: u64, keep: F) -> Vec<JunctionId>
    where
        F: Fn(&JunctionId) -> bool,
    {
        let expired: Vec<JunctionId> = self
            .junctions
            .iter()
            .filter(|(id, r)| r.timestamp_ms < cutoff_ms && !keep(id))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.junctions.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.junctions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.junctions.is_empty()
    }

    pub fn clear(&mut self) {
        self.junctions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, density: i64, ts: u64) -> JunctionRecord {
        JunctionRecord::new(id, 12.97, 77.59, density).with_timestamp(ts)
    }

    #[test]
    fn test_insert_then_update() {
        let mut store = TrafficStore::new(true);
        assert_eq!(store.upsert(record("J1", 10, 100)), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(record("J1", 20, 100)), UpsertOutcome::Updated);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&JunctionId::from("J1")).unwrap().vehicle_density, 20);
    }

    #[test]
    fn test_stale_rejected() {
        let mut store = TrafficStore::new(true);
        store.upsert(record("J1", 10, 200));
        assert_eq!(store.upsert(record("J1", 99, 150)), UpsertOutcome::Stale);
        assert_eq!(store.get(&JunctionId::from("J1")).unwrap().vehicle_density, 10);
    }

    #[test]
    fn test_last_write_wins_without_rejection() {
        let mut store = TrafficStore::new(false);
        store.upsert(record("J1", 10, 200));
        assert_eq!(store.upsert(record("J1", 99, 150)), UpsertOutcome::Updated);
        assert_eq!(store.get(&JunctionId::from("J1")).unwrap().vehicle_density, 99);
    }

    #[test]
    fn test_snapshot_sorted_and_owned() {
        let mut store = TrafficStore::new(true);
        store.upsert(record("J3", 1, 1));
        store.upsert(record("J1", 1, 1));
        store.upsert(record("J2", 1, 1));

        let mut snap = store.snapshot();
        let ids: Vec<_> = snap.iter().map(|r| r.junction_id.as_str()).collect();
        assert_eq!(ids, vec!["J1", "J2", "J3"]);

        snap[0].vehicle_density = 500;
        assert_eq!(store.get(&JunctionId::from("J1")).unwrap().vehicle_density, 1);
    }

    #[test]
    fn test_evict_older_than() {
        let mut store = TrafficStore::new(true);
        store.upsert(record("old", 1, 100));
        store.upsert(record("new", 1, 1_000));

        let evicted = store.evict_older_than(500, |_| false);
        assert_eq!(evicted, vec![JunctionId::from("old")]);
        assert_eq!(store.len(), 1);
        assert!(store.get(&JunctionId::from("new")).is_some());
    }

    #[test]
    fn test_evict_keeps_spared_ids() {
        let mut store = TrafficStore::new(true);
        store.upsert(record("old", 1, 100));
        store.upsert(record("pinned", 1, 100));

        let evicted = store.evict_older_than(500, |id| id.as_str() == "pinned");
        assert_eq!(evicted, vec![JunctionId::from("old")]);
        assert!(store.get(&JunctionId::from("pinned")).is_some());
    }

    #[test]
    fn test_clear() {
        let mut store = TrafficStore::new(true);
        store.upsert(record("J1", 1, 1));
        store.clear();
        assert!(store.is_empty());
    }
}
