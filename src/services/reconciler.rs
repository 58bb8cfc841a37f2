//! Reconciliation of raw feed snapshots into the traffic store
//!
//! Every feed push carries the full set of known junctions. Each record is
//! upserted by id; records missing from a later push stay in the store
//! unless the eviction window removes them.

use crate::domain::types::{JunctionId, JunctionRecord};
use crate::services::store::{TrafficStore, UpsertOutcome};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::debug;

/// Outcome of reconciling one snapshot
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// Post-reconciliation record for every id in the snapshot, input order
    pub updated: Arc<[JunctionRecord]>,
    /// Subset of `updated` with an emergency vehicle present
    pub emergencies: SmallVec<[JunctionRecord; 4]>,
    pub inserted: usize,
    pub changed: usize,
    pub stale: usize,
    pub evicted: Vec<JunctionId>,
}

pub struct Reconciler {
    store: TrafficStore,
    /// Eviction window in ms, 0 keeps junctions forever
    evict_after_ms: u64,
}

impl Reconciler {
    pub fn new(reject_stale: bool, evict_after_ms: u64) -> Self {
        Self { store: TrafficStore::new(reject_stale), evict_after_ms }
    }

    /// Apply a snapshot to the store and derive the update and emergency sets
    ///
    /// `now_ms` anchors the eviction window.
    pub fn reconcile(&mut self, snapshot: Vec<JunctionRecord>, now_ms: u64) -> Reconciliation {
        let mut inserted = 0;
        let mut changed = 0;
        let mut stale = 0;

        // Last position of each id so duplicates collapse in input order
        let mut last_index: FxHashMap<JunctionId, usize> = FxHashMap::default();
        for (i, record) in snapshot.iter().enumerate() {
            last_index.insert(record.junction_id.clone(), i);
        }

        let mut order: Vec<(usize, JunctionId)> =
            last_index.into_iter().map(|(id, i)| (i, id)).collect();
        order.sort_unstable_by_key(|(i, _)| *i);

        for record in snapshot {
            match self.store.upsert(record) {
                UpsertOutcome::Inserted => inserted += 1,
                UpsertOutcome::Updated => changed += 1,
                UpsertOutcome::Stale => stale += 1,
            }
        }

        let updated: Vec<JunctionRecord> =
            order.iter().filter_map(|(_, id)| self.store.get(id).cloned()).collect();

        // Junctions in this push were just seen, whatever their timestamp says
        let evicted = if self.evict_after_ms > 0 {
            let seen: FxHashSet<&JunctionId> = order.iter().map(|(_, id)| id).collect();
            self.store
                .evict_older_than(now_ms.saturating_sub(self.evict_after_ms), |id| seen.contains(id))
        } else {
            Vec::new()
        };

        let emergencies: SmallVec<[JunctionRecord; 4]> =
            updated.iter().filter(|r| r.emergency_vehicle_present).cloned().collect();

        debug!(
            updated = %updated.len(),
            inserted = %inserted,
            changed = %changed,
            stale = %stale,
            evicted = %evicted.len(),
            emergencies = %emergencies.len(),
            "snapshot_reconciled"
        );

        Reconciliation {
            updated: updated.into(),
            emergencies,
            inserted,
            changed,
            stale,
            evicted,
        }
    }

    pub fn snapshot(&self) -> Vec<JunctionRecord> {
        self.store.snapshot()
    }

    pub fn junction_count(&self) -> usize {
        self.store.len()
    }

    /// Discard all reconciled state
    pub fn clear(&mut self) {
        self.store.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, density: i64, ts: u64) -> JunctionRecord {
        JunctionRecord::new(id, 12.97, 77.59, density).with_timestamp(ts)
    }

    #[test]
    fn test_same_id_twice_keeps_last_density() {
        let mut reconciler = Reconciler::new(true, 0);
        let result =
            reconciler.reconcile(vec![record("J1", 10, 100), record("J1", 42, 100)], 100);

        assert_eq!(reconciler.junction_count(), 1);
        assert_eq!(reconciler.snapshot()[0].vehicle_density, 42);
        assert_eq!(result.updated.len(), 1);
        assert_eq!(result.updated[0].vehicle_density, 42);
    }

    #[test]
    fn test_same_id_across_snapshots() {
        let mut reconciler = Reconciler::new(true, 0);
        reconciler.reconcile(vec![record("J1", 10, 100)], 100);
        let result = reconciler.reconcile(vec![record("J1", 55, 200)], 200);

        assert_eq!(result.changed, 1);
        assert_eq!(result.inserted, 0);
        assert_eq!(reconciler.snapshot()[0].vehicle_density, 55);
    }

    #[test]
    fn test_emergency_partition() {
        let mut reconciler = Reconciler::new(true, 0);
        let result = reconciler.reconcile(
            vec![
                record("J1", 10, 1),
                record("J2", 65, 1).with_emergency(true),
                record("J3", 30, 1),
            ],
            1,
        );

        assert_eq!(result.updated.len(), 3);
        assert_eq!(result.emergencies.len(), 1);
        assert_eq!(result.emergencies[0].junction_id.as_str(), "J2");
    }

    #[test]
    fn test_absent_junctions_are_kept() {
        let mut reconciler = Reconciler::new(true, 0);
        reconciler.reconcile(vec![record("J1", 10, 1), record("J2", 20, 1)], 1);
        let result = reconciler.reconcile(vec![record("J2", 25, 2)], 2);

        assert_eq!(result.updated.len(), 1);
        assert_eq!(reconciler.junction_count(), 2);
    }

    #[test]
    fn test_stale_record_reports_stored_value() {
        let mut reconciler = Reconciler::new(true, 0);
        reconciler.reconcile(vec![record("J1", 10, 500)], 500);
        let result = reconciler.reconcile(vec![record("J1", 90, 400)], 500);

        assert_eq!(result.stale, 1);
        assert_eq!(result.updated[0].vehicle_density, 10);
    }

    #[test]
    fn test_eviction_window() {
        let mut reconciler = Reconciler::new(true, 1_000);
        reconciler.reconcile(vec![record("old", 1, 1_000)], 1_000);
        let result = reconciler.reconcile(vec![record("fresh", 1, 5_000)], 5_000);

        assert_eq!(result.evicted, vec![JunctionId::from("old")]);
        assert_eq!(reconciler.junction_count(), 1);
    }

    #[test]
    fn test_eviction_keeps_records_from_current_push() {
        let mut reconciler = Reconciler::new(true, 1_000);
        reconciler.reconcile(vec![record("old", 1, 1_000)], 1_000);
        let result =
            reconciler.reconcile(vec![record("J2", 70, 1_000).with_emergency(true)], 5_000);

        assert_eq!(result.updated.len(), 1);
        assert_eq!(result.updated[0].junction_id.as_str(), "J2");
        assert_eq!(result.emergencies.len(), 1);
        assert_eq!(result.emergencies[0].junction_id.as_str(), "J2");
        assert_eq!(result.evicted, vec![JunctionId::from("old")]);
        assert_eq!(reconciler.junction_count(), 1);

        // Once absent from a push it ages out like any other junction
        let result = reconciler.reconcile(vec![record("J3", 1, 9_000)], 9_000);
        assert_eq!(result.evicted, vec![JunctionId::from("J2")]);
    }

    #[test]
    fn test_clear() {
        let mut reconciler = Reconciler::new(true, 0);
        reconciler.reconcile(vec![record("J1", 1, 1)], 1);
        reconciler.clear();
        assert_eq!(reconciler.junction_count(), 0);
    }
}
