//! # Leak Table
//!
//! Fixed-capacity store of every currently held tracked resource, keyed by
//! [`ResourceKey`]. One mutex guards the slots and the process statistics
//! together; nothing inside the lock captures stacks, allocates, logs or
//! performs I/O.
//!
//! ## Per-key lifecycle
//!
//! ```text
//! absent ──add──▶ live(1) ──add──▶ live(n+1)
//!    ▲                │               │
//!    └─────remove─────┴───────────────┘
//! ```
//!
//! `remove` on an absent key and `add` of a new key into a full table are
//! defined no-ops (the latter bumps the discard counter).
//!
//! ## Snapshots
//!
//! [`LeakTable::dump`] copies slots and statistics into a preallocated
//! snapshot buffer under the table lock and builds the owned
//! [`TableSnapshot`] only after the table lock is released. Annotations are
//! moved, not cloned, so each one is reported at most once. Snapshot call
//! paths start at the first frame outside the detector's own code.

use fdleak_common::{LeakKind, MAX_LEAK_RECORDS};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::domain::ResourceKey;
use crate::self_region::SelfRegion;
use crate::stack::CallPath;

/// Frames at the top of a release call path that belong to the release
/// machinery itself: [`LeakTable::remove`], the interceptor method and the
/// exported shim. Self-suppression only looks at frames below them.
pub const SHIM_FRAMES: usize = 3;

/// Aggregate counters reported with every dump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LeakStats {
    /// Live records
    pub added: usize,
    /// Acquisitions dropped because the table was full
    pub discarded: usize,
    /// Live records per kind, indexed by [`LeakKind::index`]
    pub added_by_kind: [usize; LeakKind::COUNT],
    /// Duplicate acquisitions per kind; rolled back approximately on release
    pub same_by_kind: [usize; LeakKind::COUNT],
}

impl LeakStats {
    #[must_use]
    pub fn added_of(&self, kind: LeakKind) -> usize {
        self.added_by_kind[kind.index()]
    }

    #[must_use]
    pub fn same_of(&self, kind: LeakKind) -> usize {
        self.same_by_kind[kind.index()]
    }
}

/// One slot of the table
///
/// `kind == LeakKind::None` marks an empty slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeakRecord {
    pub kind: LeakKind,
    pub key: ResourceKey,
    pub occurrences: usize,
    pub call_path: CallPath,
}

impl LeakRecord {
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.kind != LeakKind::None
    }
}

/// What [`LeakTable::add`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// New live record
    Inserted,
    /// Existing record for the key; carries its new occurrence count
    Duplicate(usize),
    /// Table full; counted as discarded
    Discarded,
    /// `LeakKind::None` is never recorded
    Ignored,
}

/// What [`LeakTable::remove`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Record released; carries the occurrence count it had
    Removed(usize),
    /// No live record for the key
    Untracked,
    /// Call originated inside the detector; table untouched
    SelfSuppressed,
}

/// A live record as seen by a dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub record: LeakRecord,
    pub annotation: Option<String>,
}

/// Point-in-time copy of the table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSnapshot {
    pub stats: LeakStats,
    /// Live records in slot order
    pub records: Vec<SnapshotRecord>,
}

struct TableState {
    slots: Box<[LeakRecord]>,
    annotations: Box<[Option<Box<str>>]>,
    stats: LeakStats,
}

impl TableState {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![LeakRecord::default(); capacity].into_boxed_slice(),
            annotations: std::iter::repeat_with(|| None).take(capacity).collect(),
            stats: LeakStats::default(),
        }
    }

    fn find_live(&self, key: ResourceKey) -> Option<usize> {
        self.slots.iter().position(|slot| slot.is_live() && slot.key == key)
    }

    fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(|slot| !slot.is_live())
    }
}

/// Process-wide leak table
pub struct LeakTable {
    state: Mutex<TableState>,
    /// Dump staging area; its lock is always taken before the table lock
    snapshot: Mutex<TableState>,
    self_region: SelfRegion,
}

impl LeakTable {
    /// Create a table with `capacity` slots
    #[must_use]
    pub fn new(capacity: usize, self_region: SelfRegion) -> Self {
        Self {
            state: Mutex::new(TableState::new(capacity)),
            snapshot: Mutex::new(TableState::new(capacity)),
            self_region,
        }
    }

    /// Create a table with the default number of slots
    #[must_use]
    pub fn with_default_capacity(self_region: SelfRegion) -> Self {
        Self::new(MAX_LEAK_RECORDS, self_region)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    #[must_use]
    pub fn self_region(&self) -> &SelfRegion {
        &self.self_region
    }

    /// Record an acquisition of `key`
    ///
    /// The call path is captured before the lock is taken.
    #[inline(never)]
    pub fn add(&self, key: ResourceKey, kind: LeakKind) -> AddOutcome {
        if kind == LeakKind::None {
            return AddOutcome::Ignored;
        }
        let call_path = CallPath::capture();
        self.insert(key, kind, call_path, None)
    }

    /// Record an acquisition carrying an extended annotation
    ///
    /// The annotation is kept only when a new record is created. It is freed
    /// when the record is released, or handed to the next dump.
    #[inline(never)]
    pub fn add_annotated(&self, key: ResourceKey, kind: LeakKind, annotation: Box<str>) -> AddOutcome {
        if kind == LeakKind::None {
            return AddOutcome::Ignored;
        }
        let call_path = CallPath::capture();
        self.insert(key, kind, call_path, Some(annotation))
    }

    /// Insert-or-increment with an already captured call path
    pub fn insert(
        &self,
        key: ResourceKey,
        kind: LeakKind,
        call_path: CallPath,
        annotation: Option<Box<str>>,
    ) -> AddOutcome {
        if kind == LeakKind::None {
            return AddOutcome::Ignored;
        }

        let mut state = self.lock();
        if let Some(idx) = state.find_live(key) {
            state.slots[idx].occurrences += 1;
            state.stats.same_by_kind[kind.index()] += 1;
            let occurrences = state.slots[idx].occurrences;
            drop(state);
            // Only a fresh record keeps its annotation.
            drop(annotation);
            return AddOutcome::Duplicate(occurrences);
        }

        let Some(idx) = state.find_free() else {
            state.stats.discarded += 1;
            return AddOutcome::Discarded;
        };

        state.slots[idx] = LeakRecord { kind, key, occurrences: 1, call_path };
        let stale = std::mem::replace(&mut state.annotations[idx], annotation);
        state.stats.added += 1;
        state.stats.added_by_kind[kind.index()] += 1;
        drop(state);
        drop(stale);
        AddOutcome::Inserted
    }

    /// Record a release of `key`
    ///
    /// Calls whose callers (below [`SHIM_FRAMES`]) pass through the detector's
    /// own code are ignored.
    #[inline(never)]
    pub fn remove(&self, key: ResourceKey) -> RemoveOutcome {
        let call_path = CallPath::capture();
        if self.self_region.contains_any(call_path.callers(SHIM_FRAMES)) {
            return RemoveOutcome::SelfSuppressed;
        }
        self.release(key)
    }

    /// Remove the live record for `key` without the self-suppression check
    pub fn release(&self, key: ResourceKey) -> RemoveOutcome {
        let mut state = self.lock();
        let Some(idx) = state.find_live(key) else {
            return RemoveOutcome::Untracked;
        };

        let LeakRecord { kind, occurrences, .. } = state.slots[idx];
        let k = kind.index();
        state.stats.same_by_kind[k] = state.stats.same_by_kind[k].saturating_sub(occurrences - 1);
        state.stats.added_by_kind[k] = state.stats.added_by_kind[k].saturating_sub(1);
        state.stats.added = state.stats.added.saturating_sub(1);
        state.slots[idx] = LeakRecord::default();
        let annotation = state.annotations[idx].take();
        drop(state);
        drop(annotation);
        RemoveOutcome::Removed(occurrences)
    }

    /// Take a consistent snapshot of every live record and the statistics
    ///
    /// Concurrent dumps are serialized on the snapshot buffer.
    #[must_use]
    pub fn dump(&self) -> TableSnapshot {
        let mut staging = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut state = self.lock();
            staging.slots.copy_from_slice(&state.slots);
            staging.stats = state.stats;
            let TableState { annotations, .. } = &mut *state;
            for (dst, src) in staging.annotations.iter_mut().zip(annotations.iter_mut()) {
                // Empty slots never own an annotation, so moving drops nothing.
                *dst = src.take();
            }
        }

        let TableState { slots, annotations, stats } = &mut *staging;
        let records = slots
            .iter()
            .zip(annotations.iter_mut())
            .filter(|(slot, _)| slot.is_live())
            .map(|(slot, annotation)| SnapshotRecord {
                record: LeakRecord {
                    call_path: CallPath::from_frames(self.self_region.strip_leading(slot.call_path.frames())),
                    ..*slot
                },
                annotation: annotation.take().map(String::from),
            })
            .collect();
        TableSnapshot { stats: *stats, records }
    }

    #[must_use]
    pub fn stats(&self) -> LeakStats {
        self.lock().stats
    }

    /// Number of live records
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().slots.iter().filter(|slot| slot.is_live()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of empty slots
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.lock().slots.iter().filter(|slot| !slot.is_live()).count()
    }

    /// Occurrence count of the live record for `key`, if any
    #[must_use]
    pub fn occurrences(&self, key: ResourceKey) -> Option<usize> {
        let state = self.lock();
        state.find_live(key).map(|idx| state.slots[idx].occurrences)
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolization::MemoryRange;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn table(capacity: usize) -> LeakTable {
        LeakTable::new(capacity, SelfRegion::unresolved())
    }

    fn key(n: u64) -> ResourceKey {
        ResourceKey(n)
    }

    #[test]
    fn test_repeated_add_counts_occurrences() {
        let table = table(4);
        assert_eq!(table.add(key(7), LeakKind::File), AddOutcome::Inserted);
        assert_eq!(table.add(key(7), LeakKind::File), AddOutcome::Duplicate(2));
        assert_eq!(table.add(key(7), LeakKind::File), AddOutcome::Duplicate(3));

        assert_eq!(table.len(), 1);
        assert_eq!(table.occurrences(key(7)), Some(3));
        let stats = table.stats();
        assert_eq!(stats.added, 1);
        assert_eq!(stats.added_of(LeakKind::File), 1);
        assert_eq!(stats.same_of(LeakKind::File), 2);
    }

    #[test]
    fn test_add_then_remove_restores_state() {
        let table = table(4);
        let before = table.stats();
        table.add(key(3), LeakKind::Socket);
        assert_eq!(table.free_slots(), 3);

        assert_eq!(table.remove(key(3)), RemoveOutcome::Removed(1));
        assert_eq!(table.free_slots(), 4);
        assert_eq!(table.stats(), before);
    }

    #[test]
    fn test_remove_rolls_back_duplicates() {
        let table = table(4);
        for _ in 0..4 {
            table.add(key(9), LeakKind::Mmap);
        }
        assert_eq!(table.stats().same_of(LeakKind::Mmap), 3);
        assert_eq!(table.remove(key(9)), RemoveOutcome::Removed(4));
        assert_eq!(table.stats(), LeakStats::default());
    }

    #[test]
    fn test_same_counter_rolls_back_per_record() {
        let table = table(4);
        table.add(key(1), LeakKind::File);
        table.add(key(1), LeakKind::File);
        table.add(key(1), LeakKind::File);
        table.add(key(2), LeakKind::File);
        table.add(key(2), LeakKind::File);
        assert_eq!(table.stats().same_of(LeakKind::File), 3);
        table.remove(key(1));
        assert_eq!(table.stats().same_of(LeakKind::File), 1);
        table.remove(key(2));
        assert_eq!(table.stats().same_of(LeakKind::File), 0);
    }

    #[test]
    fn test_remove_unknown_key_changes_nothing() {
        let table = table(2);
        table.add(key(1), LeakKind::File);
        let before = table.stats();

        assert_eq!(table.remove(key(42)), RemoveOutcome::Untracked);
        assert_eq!(table.stats(), before);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_table_discards_without_eviction() {
        let table = table(2);
        table.add(key(1), LeakKind::File);
        table.add(key(2), LeakKind::File);

        assert_eq!(table.add(key(3), LeakKind::File), AddOutcome::Discarded);
        assert_eq!(table.stats().discarded, 1);
        assert_eq!(table.occurrences(key(1)), Some(1));
        assert_eq!(table.occurrences(key(2)), Some(1));
        assert_eq!(table.occurrences(key(3)), None);

        // Duplicates of live keys still count when full.
        assert_eq!(table.add(key(2), LeakKind::File), AddOutcome::Duplicate(2));
    }

    #[test]
    fn test_none_kind_is_ignored() {
        let table = table(2);
        assert_eq!(table.add(key(1), LeakKind::None), AddOutcome::Ignored);
        assert!(table.is_empty());
    }

    #[test]
    fn test_reused_key_gets_fresh_record() {
        let table = table(2);
        table.add(key(0x7f00), LeakKind::Mmap);
        table.remove(key(0x7f00));
        table.add(key(0x7f00), LeakKind::Mmap);
        assert_eq!(table.occurrences(key(0x7f00)), Some(1));
    }

    #[test]
    fn test_records_keep_call_path() {
        let table = table(2);
        table.add(key(5), LeakKind::File);
        let snapshot = table.dump();
        assert_eq!(snapshot.records.len(), 1);
        let record = snapshot.records[0].record;
        assert_eq!(record.key, key(5));
        assert!(!record.call_path.is_empty());
    }

    #[test]
    fn test_dump_drops_leading_detector_frames() {
        let region = SelfRegion::fixed(MemoryRange { start: 0x1000, end: 0x2000 });
        let table = LeakTable::new(2, region);
        let path = CallPath::from_frames(&[0x1010, 0x1020, 0x5000, 0x1030]);
        table.insert(key(4), LeakKind::Socket, path, None);

        let snapshot = table.dump();
        assert_eq!(snapshot.records[0].record.call_path.frames(), &[0x5000, 0x1030]);
        assert_eq!(snapshot.records[0].record.occurrences, 1);
    }

    #[test]
    fn test_annotation_is_reported_once() {
        let table = table(2);
        table.add_annotated(key(5), LeakKind::File, "extra".into());

        let first = table.dump();
        assert_eq!(first.records[0].annotation.as_deref(), Some("extra"));
        let second = table.dump();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].annotation, None);
    }

    #[test]
    fn test_annotation_freed_on_release() {
        let table = table(1);
        table.add_annotated(key(5), LeakKind::File, "first".into());
        table.remove(key(5));
        table.add(key(6), LeakKind::File);

        let snapshot = table.dump();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].annotation, None);
    }

    #[test]
    fn test_duplicate_drops_new_annotation() {
        let table = table(2);
        table.add_annotated(key(5), LeakKind::File, "kept".into());
        table.add_annotated(key(5), LeakKind::File, "dropped".into());
        let snapshot = table.dump();
        assert_eq!(snapshot.records[0].annotation.as_deref(), Some("kept"));
    }

    #[test]
    fn test_release_from_own_code_is_suppressed() {
        // Every address belongs to "the detector".
        let region = SelfRegion::fixed(MemoryRange { start: 0, end: u64::MAX });
        let table = LeakTable::new(2, region);
        table.add(key(1), LeakKind::File);

        assert_eq!(table.remove(key(1)), RemoveOutcome::SelfSuppressed);
        assert_eq!(table.len(), 1);
        assert_eq!(table.release(key(1)), RemoveOutcome::Removed(1));
    }

    #[test]
    fn test_release_outside_own_code_is_applied() {
        let region = SelfRegion::fixed(MemoryRange { start: 0x10, end: 0x20 });
        let table = LeakTable::new(2, region);
        table.add(key(1), LeakKind::File);
        assert_eq!(table.remove(key(1)), RemoveOutcome::Removed(1));
    }

    proptest! {
        #[test]
        fn test_op_sequences_match_model(
            ops in prop::collection::vec((any::<bool>(), 0u8..12), 0..400),
        ) {
            const CAPACITY: usize = 8;
            let table = table(CAPACITY);
            let mut model: HashMap<u64, usize> = HashMap::new();
            let mut discarded = 0;

            for (is_remove, k) in ops {
                let k = u64::from(k);
                if is_remove {
                    let outcome = table.remove(key(k));
                    match model.remove(&k) {
                        Some(count) => prop_assert_eq!(outcome, RemoveOutcome::Removed(count)),
                        None => prop_assert_eq!(outcome, RemoveOutcome::Untracked),
                    }
                } else {
                    table.add(key(k), LeakKind::File);
                    if let Some(count) = model.get_mut(&k) {
                        *count += 1;
                    } else if model.len() < CAPACITY {
                        model.insert(k, 1);
                    } else {
                        discarded += 1;
                    }
                }

                let snapshot = table.dump();
                prop_assert!(snapshot.records.len() <= CAPACITY);
                let seen: HashMap<u64, usize> =
                    snapshot.records.iter().map(|r| (r.record.key.0, r.record.occurrences)).collect();
                prop_assert_eq!(seen.len(), snapshot.records.len(), "duplicate live key");
                prop_assert_eq!(&seen, &model);
                prop_assert_eq!(snapshot.stats.added, model.len());
                prop_assert_eq!(snapshot.stats.discarded, discarded);
            }
        }
    }

    #[test]
    fn test_concurrent_disjoint_keys() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 200;
        let table = table(2048);

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let table = &table;
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        table.add(key(t * 10_000 + i), LeakKind::Socket);
                    }
                    // Release every other key again.
                    for i in (0..PER_THREAD).step_by(2) {
                        assert_eq!(table.remove(key(t * 10_000 + i)), RemoveOutcome::Removed(1));
                    }
                });
            }
        });

        let expected = usize::try_from(THREADS * PER_THREAD / 2).unwrap();
        assert_eq!(table.len(), expected);
        assert_eq!(table.stats().added_of(LeakKind::Socket), expected);
        for t in 0..THREADS {
            for i in 0..PER_THREAD {
                let present = table.occurrences(key(t * 10_000 + i)).is_some();
                assert_eq!(present, i % 2 == 1);
            }
        }
    }

    #[test]
    fn test_dump_during_mutation_is_consistent() {
        let table = table(64);

        std::thread::scope(|s| {
            for t in 0..4u64 {
                let table = &table;
                s.spawn(move || {
                    for round in 0..500u64 {
                        let k = key(t * 100 + round % 16);
                        table.add(k, LeakKind::File);
                        table.remove(k);
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..200 {
                    let snapshot = table.dump();
                    // A torn copy would disagree with its own statistics.
                    assert_eq!(snapshot.records.len(), snapshot.stats.added);
                    let file_records = snapshot
                        .records
                        .iter()
                        .filter(|r| r.record.kind == LeakKind::File)
                        .count();
                    assert_eq!(file_records, snapshot.stats.added_of(LeakKind::File));
                }
            });
        });

        assert!(table.is_empty());
    }
}
