use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use narrative_tagger_core::{
    aggregate_stats, narratives, select_for_user, topics, user_tagged_count, validate_identity,
    Record, SlotIndex, StatsPolicy, TagResult, TaggerError, TaggerSlot, TaggingStats,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rand::Rng;
use time::OffsetDateTime;

mod source;
mod sync;
mod writer;

pub use source::{
    MemoryTable, SourceRow, TabularSource, COLUMNS, COLUMN_LINK, COLUMN_NARRATIVE, COLUMN_STORY,
    COLUMN_TAGGER_1, COLUMN_TAGGER_1_RESULT, COLUMN_TAGGER_2, COLUMN_TAGGER_2_RESULT,
    COLUMN_TOPIC,
};
pub use sync::{records_from_rows, SyncController};
pub use writer::{CommitReceipt, FlushOutcome, PersistError, TagWriter};

/// Immutable, versioned view of every record. Readers hold an `Arc` to one
/// snapshot for the duration of a call.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    version: u64,
    records: Vec<Record>,
    positions: HashMap<String, usize>,
    reconciled_at: Option<OffsetDateTime>,
}

impl Snapshot {
    fn build(
        version: u64,
        records: Vec<Record>,
        reconciled_at: Option<OffsetDateTime>,
    ) -> Result<Self, TaggerError> {
        let mut positions = HashMap::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            if positions.insert(record.link.clone(), index).is_some() {
                return Err(TaggerError::DuplicateLink(record.link.clone()));
            }
        }
        Ok(Self { version, records, positions, reconciled_at })
    }

    fn with_appended(&self, record: Record) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next.positions.insert(record.link.clone(), next.records.len());
        next.records.push(record);
        next
    }

    fn with_replaced(&self, index: usize, record: Record) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next.records[index] = record;
        next
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, link: &str) -> Option<&Record> {
        self.positions.get(link).map(|index| &self.records[*index])
    }

    #[must_use]
    pub fn reconciled_at(&self) -> Option<OffsetDateTime> {
        self.reconciled_at
    }

    /// True when the snapshot was never reconciled with the source, or was
    /// last reconciled more than `max_age` ago.
    #[must_use]
    pub fn is_stale(&self, max_age: Duration, now: OffsetDateTime) -> bool {
        let Some(reconciled_at) = self.reconciled_at else {
            return true;
        };
        match time::Duration::try_from(max_age) {
            Ok(max_age) => now - reconciled_at > max_age,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InsertCommit {
    pub record: Record,
    pub snapshot_version: u64,
}

#[derive(Debug, Clone)]
pub struct TagCommit {
    pub record: Record,
    pub slot: SlotIndex,
    pub snapshot_version: u64,
}

/// Holds the current snapshot and serializes every writer.
///
/// Reads clone the current `Arc<Snapshot>` and never wait on a writer's work.
/// `insert`, `tag`, and snapshot replacement run inside one writer scope and
/// publish a new snapshot atomically.
///
/// Every link touched by `insert` or `tag` stays in the unpersisted set until
/// a source write of its latest state is confirmed. Snapshot replacement keeps
/// those records even when the loaded batch lacks them.
#[derive(Debug, Default)]
pub struct RecordStore {
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
    unpersisted: Mutex<BTreeSet<String>>,
}

impl RecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }

    #[must_use]
    pub fn all(&self) -> Vec<Record> {
        self.snapshot().records().to_vec()
    }

    /// # Errors
    /// Returns [`TaggerError::NotFound`] when no record has this link.
    pub fn by_link(&self, link: &str) -> Result<Record, TaggerError> {
        self.snapshot().get(link).cloned().ok_or_else(|| TaggerError::NotFound(link.to_string()))
    }

    /// Insert one new, untagged record.
    ///
    /// # Errors
    /// Returns [`TaggerError::Validation`] for invalid fields, or
    /// [`TaggerError::DuplicateLink`] when the link already exists.
    pub fn insert(&self, record: Record) -> Result<InsertCommit, TaggerError> {
        record.validate()?;

        let _writer = self.lock_writer();
        let current = self.snapshot();
        if current.get(&record.link).is_some() {
            return Err(TaggerError::DuplicateLink(record.link));
        }

        let next = current.with_appended(record.clone());
        let snapshot_version = next.version;
        self.publish(next);
        self.unpersisted.lock().insert(record.link.clone());
        tracing::debug!(link = %record.link, snapshot_version, "inserted record");
        Ok(InsertCommit { record, snapshot_version })
    }

    /// Claim the next free slot of `link` for `user`.
    ///
    /// # Errors
    /// Returns [`TaggerError::NotFound`], [`TaggerError::Validation`] for a blank
    /// identity, [`TaggerError::AlreadyTagged`], or [`TaggerError::SlotConflict`].
    pub fn tag(&self, link: &str, user: &str, result: TagResult) -> Result<TagCommit, TaggerError> {
        let _writer = self.lock_writer();
        let current = self.snapshot();
        let index = *current
            .positions
            .get(link)
            .ok_or_else(|| TaggerError::NotFound(link.to_string()))?;
        validate_identity(user)?;

        let mut record = current.records[index].clone();
        let slot = match record.claim_slot(user, result) {
            Ok(slot) => slot,
            Err(err) => {
                tracing::debug!(link, user, code = err.code(), "tag rejected");
                return Err(err);
            }
        };

        let next = current.with_replaced(index, record.clone());
        let snapshot_version = next.version;
        self.publish(next);
        self.unpersisted.lock().insert(link.to_string());
        tracing::debug!(link, user, slot = slot.number(), snapshot_version, "tag committed");
        Ok(TagCommit { record, slot, snapshot_version })
    }

    /// Replace the whole record set, carrying forward slot data for links that
    /// already exist in memory.
    ///
    /// # Errors
    /// Returns [`TaggerError::DuplicateLink`] when `records` repeats a link.
    pub fn replace_snapshot(&self, records: Vec<Record>) -> Result<Arc<Snapshot>, TaggerError> {
        self.replace_snapshot_with(move || Ok(records))
    }

    /// Run `load` inside the writer scope and publish its records merged with
    /// the snapshot being replaced. Nothing is published when `load` fails.
    ///
    /// # Errors
    /// Propagates any error from `load`, or [`TaggerError::DuplicateLink`] when
    /// the loaded records repeat a link.
    pub fn replace_snapshot_with<F>(&self, load: F) -> Result<Arc<Snapshot>, TaggerError>
    where
        F: FnOnce() -> Result<Vec<Record>, TaggerError>,
    {
        Ok(self.replace_snapshot_if(|_| true, load)?.unwrap_or_else(|| self.snapshot()))
    }

    /// Like [`RecordStore::replace_snapshot_with`], but first asks `should_load`
    /// about the snapshot seen inside the writer scope. Returns `None` without
    /// calling `load` when it declines.
    ///
    /// # Errors
    /// Same as [`RecordStore::replace_snapshot_with`].
    pub fn replace_snapshot_if<P, F>(
        &self,
        should_load: P,
        load: F,
    ) -> Result<Option<Arc<Snapshot>>, TaggerError>
    where
        P: FnOnce(&Snapshot) -> bool,
        F: FnOnce() -> Result<Vec<Record>, TaggerError>,
    {
        let _writer = self.lock_writer();
        if !should_load(self.snapshot().as_ref()) {
            return Ok(None);
        }

        // Taken before the load so a write confirmed mid-fetch still counts.
        let unpersisted = self.unpersisted.lock().clone();
        let incoming = load()?;
        let current = self.snapshot();

        let mut merged = incoming
            .into_iter()
            .map(|record| match current.get(&record.link) {
                Some(existing) => carry_forward_slots(existing, record),
                None => record,
            })
            .collect::<Vec<_>>();

        let loaded = merged.iter().map(|record| record.link.clone()).collect::<BTreeSet<_>>();
        for record in current.records() {
            if unpersisted.contains(&record.link) && !loaded.contains(&record.link) {
                tracing::debug!(link = %record.link, "keeping record not yet written to source");
                merged.push(record.clone());
            }
        }

        let next = Arc::new(Snapshot::build(
            current.version + 1,
            merged,
            Some(OffsetDateTime::now_utc()),
        )?);
        *self.current.write() = Arc::clone(&next);
        Ok(Some(next))
    }

    /// Links whose latest committed state has not been confirmed in the source.
    #[must_use]
    pub fn unpersisted_links(&self) -> Vec<String> {
        self.unpersisted.lock().iter().cloned().collect()
    }

    /// Clear `link` from the unpersisted set when `written` is still its
    /// current state. Returns whether it was cleared.
    pub(crate) fn confirm_persisted(&self, link: &str, written: &Record) -> bool {
        let mut unpersisted = self.unpersisted.lock();
        if self.snapshot().get(link) == Some(written) {
            unpersisted.remove(link);
            true
        } else {
            false
        }
    }

    /// # Errors
    /// Returns [`TaggerError::Exhausted`] when the user has nothing left to rate.
    pub fn next_for_user<R>(&self, user: &str, rng: &mut R) -> Result<Record, TaggerError>
    where
        R: Rng + ?Sized,
    {
        let snapshot = self.snapshot();
        select_for_user(snapshot.records(), user, rng).cloned()
    }

    #[must_use]
    pub fn stats(&self, policy: &StatsPolicy) -> TaggingStats {
        let snapshot = self.snapshot();
        aggregate_stats(snapshot.records(), policy, snapshot.version())
    }

    #[must_use]
    pub fn user_tagged_count(&self, user: &str) -> usize {
        user_tagged_count(self.snapshot().records(), user)
    }

    #[must_use]
    pub fn records_by_topic(&self, topic: &str) -> Vec<Record> {
        self.snapshot().records().iter().filter(|record| record.topic == topic).cloned().collect()
    }

    /// Records with at least one filled slot, in snapshot order.
    #[must_use]
    pub fn tagged_records(&self) -> Vec<Record> {
        self.snapshot().records().iter().filter(|record| !record.is_untouched()).cloned().collect()
    }

    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        topics(self.snapshot().records())
    }

    #[must_use]
    pub fn narratives(&self, topic: &str) -> Vec<String> {
        narratives(self.snapshot().records(), topic)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock()
    }

    fn publish(&self, next: Snapshot) {
        *self.current.write() = Arc::new(next);
    }
}

/// Content comes from `incoming`; each slot keeps the in-memory value when one
/// exists. Falls back to the in-memory slots verbatim if mixing would put one
/// identity in both slots.
fn carry_forward_slots(existing: &Record, mut incoming: Record) -> Record {
    if existing.is_untouched() {
        return incoming;
    }

    let slot_1 = pick_slot(existing.slot_1.as_ref(), incoming.slot_1.take());
    let slot_2 = pick_slot(existing.slot_2.as_ref(), incoming.slot_2.take());
    let collides = matches!((&slot_1, &slot_2), (Some(first), Some(second)) if first.tagger == second.tagger);

    if collides {
        tracing::debug!(link = %incoming.link, "upstream slots collide with memory; keeping memory slots");
        incoming.slot_1 = existing.slot_1.clone();
        incoming.slot_2 = existing.slot_2.clone();
    } else {
        incoming.slot_1 = slot_1;
        incoming.slot_2 = slot_2;
    }
    incoming
}

fn pick_slot(existing: Option<&TaggerSlot>, incoming: Option<TaggerSlot>) -> Option<TaggerSlot> {
    existing.cloned().or(incoming)
}
