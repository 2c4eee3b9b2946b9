use std::sync::Arc;

use narrative_tagger_core::{parse_result, Record, SlotIndex, TaggerError};
use parking_lot::Mutex;
use serde::Serialize;

use crate::{RecordStore, TabularSource};

#[derive(Debug, Clone, thiserror::Error, Serialize, Eq, PartialEq)]
#[error("failed to persist {link}: {message}")]
pub struct PersistError {
    pub link: String,
    pub message: String,
}

/// Outcome of a committed write. The in-memory commit stands even when
/// `persist_error` is set; the link then stays queued for [`TagWriter::flush_pending`].
#[derive(Debug, Clone, Serialize)]
pub struct CommitReceipt {
    pub record: Record,
    pub slot: Option<SlotIndex>,
    pub snapshot_version: u64,
    pub persist_error: Option<PersistError>,
}

impl CommitReceipt {
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.persist_error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct FlushOutcome {
    pub link: String,
    pub persisted: bool,
    pub error: Option<String>,
}

/// Commits writes to the [`RecordStore`] and then writes the touched row to the
/// tabular source.
///
/// Source writes happen outside the store's writer scope and are serialized by
/// the `persist` lock. Each one sends the latest in-memory state of the row, so
/// a slow write can never overwrite a newer slot. A link leaves the store's
/// unpersisted set only once the state it wrote is still the current one.
pub struct TagWriter {
    store: Arc<RecordStore>,
    source: Arc<dyn TabularSource>,
    persist: Mutex<()>,
}

impl TagWriter {
    #[must_use]
    pub fn new(store: Arc<RecordStore>, source: Arc<dyn TabularSource>) -> Self {
        Self { store, source, persist: Mutex::new(()) }
    }

    /// Validate and insert a new record, then write it through to the source.
    ///
    /// # Errors
    /// Returns [`TaggerError::Validation`] or [`TaggerError::DuplicateLink`].
    pub fn insert(
        &self,
        topic: &str,
        narrative: &str,
        story: &str,
        link: &str,
    ) -> Result<CommitReceipt, TaggerError> {
        let commit = self.store.insert(Record::new(topic, narrative, story, link)?)?;
        let persist_error = self.persist(&commit.record.link);

        Ok(CommitReceipt {
            record: commit.record,
            slot: None,
            snapshot_version: commit.snapshot_version,
            persist_error,
        })
    }

    /// Record `user`'s verdict on `link`.
    ///
    /// # Errors
    /// Returns [`TaggerError::NotFound`], [`TaggerError::InvalidResult`],
    /// [`TaggerError::Validation`], [`TaggerError::AlreadyTagged`], or
    /// [`TaggerError::SlotConflict`]. Nothing changes on error.
    pub fn tag(&self, link: &str, user: &str, result: &str) -> Result<CommitReceipt, TaggerError> {
        self.store.by_link(link)?;
        let result = parse_result(result)?;

        let commit = self.store.tag(link, user, result)?;
        let persist_error = self.persist(link);

        Ok(CommitReceipt {
            record: commit.record,
            slot: Some(commit.slot),
            snapshot_version: commit.snapshot_version,
            persist_error,
        })
    }

    /// Links whose latest state has not reached the source yet.
    #[must_use]
    pub fn pending_writes(&self) -> Vec<String> {
        self.store.unpersisted_links()
    }

    /// Retry every queued source write.
    pub fn flush_pending(&self) -> Vec<FlushOutcome> {
        let queued = self.pending_writes();
        if !queued.is_empty() {
            tracing::info!(count = queued.len(), "flushing pending source writes");
        }

        queued
            .into_iter()
            .map(|link| {
                let error = self.persist(&link).map(|err| err.message);
                FlushOutcome { persisted: error.is_none(), link, error }
            })
            .collect()
    }

    fn persist(&self, link: &str) -> Option<PersistError> {
        let _persist = self.persist.lock();

        let Ok(record) = self.store.by_link(link) else {
            tracing::warn!(link, "pending write for a link no longer in the store");
            return Some(PersistError {
                link: link.to_string(),
                message: "record is no longer in the store; nothing was written".to_string(),
            });
        };

        match self.source.append_or_update_row(&record) {
            Ok(()) => {
                if !self.store.confirm_persisted(link, &record) {
                    tracing::debug!(link, "row changed during write; keeping it pending");
                }
                None
            }
            Err(err) => {
                tracing::warn!(link, error = %format!("{err:#}"), "source write failed; queued for retry");
                Some(PersistError { link: link.to_string(), message: format!("{err:#}") })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use anyhow::{bail, Result};
    use narrative_tagger_core::{TagResult, TaggerSlot};

    use super::*;
    use crate::{MemoryTable, SourceRow, SyncController, COLUMN_TAGGER_1, COLUMN_TAGGER_1_RESULT};

    /// Wraps a [`MemoryTable`] and fails writes while `offline` is set.
    #[derive(Default)]
    struct FlakyTable {
        inner: MemoryTable,
        offline: AtomicBool,
    }

    impl TabularSource for FlakyTable {
        fn fetch_all_rows(&self) -> Result<Vec<SourceRow>> {
            self.inner.fetch_all_rows()
        }

        fn append_or_update_row(&self, record: &Record) -> Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                bail!("sheet write quota exceeded");
            }
            self.inner.append_or_update_row(record)
        }
    }

    fn writer_with(source: Arc<dyn TabularSource>) -> (Arc<RecordStore>, TagWriter) {
        let store = Arc::new(RecordStore::new());
        let writer = TagWriter::new(Arc::clone(&store), source);
        (store, writer)
    }

    #[test]
    fn insert_writes_through_to_source() -> Result<()> {
        let table = Arc::new(MemoryTable::default());
        let (store, writer) = writer_with(table.clone());

        let receipt = writer.insert("body-image", "feels isolated", "", "https://v/1")?;

        assert!(receipt.is_persisted());
        assert_eq!(receipt.slot, None);
        assert_eq!(store.by_link("https://v/1")?, receipt.record);
        assert!(table.row_for_link("https://v/1").is_some());
        Ok(())
    }

    #[test]
    fn tag_commits_and_updates_source_row() -> Result<()> {
        let table = Arc::new(MemoryTable::default());
        let (_, writer) = writer_with(table.clone());
        writer.insert("body-image", "feels isolated", "", "https://v/1")?;

        let receipt = writer.tag("https://v/1", "alice", "Yes")?;

        assert_eq!(receipt.slot, Some(SlotIndex::First));
        assert_eq!(receipt.record.slot_1, Some(TaggerSlot::new("alice", TagResult::Yes)));
        let row = match table.row_for_link("https://v/1") {
            Some(row) => row,
            None => panic!("row missing from source"),
        };
        assert_eq!(row.get(COLUMN_TAGGER_1), "alice");
        assert_eq!(row.get(COLUMN_TAGGER_1_RESULT), "Yes");
        Ok(())
    }

    #[test]
    fn tag_checks_link_before_result() -> Result<()> {
        let (store, writer) = writer_with(Arc::new(MemoryTable::default()));
        writer.insert("body-image", "feels isolated", "", "https://v/1")?;

        assert!(matches!(writer.tag("https://v/404", "alice", "Maybe"), Err(TaggerError::NotFound(_))));
        assert!(matches!(
            writer.tag("https://v/1", "alice", "Maybe"),
            Err(TaggerError::InvalidResult(_))
        ));
        assert!(store.by_link("https://v/1")?.is_untouched());
        Ok(())
    }

    #[test]
    fn failed_write_is_reported_queued_and_flushed() -> Result<()> {
        let table = Arc::new(FlakyTable::default());
        let (store, writer) = writer_with(table.clone());
        writer.insert("body-image", "feels isolated", "", "https://v/1")?;

        table.offline.store(true, Ordering::SeqCst);
        let receipt = writer.tag("https://v/1", "alice", "Problem")?;

        let persist_error = match receipt.persist_error {
            Some(err) => err,
            None => panic!("expected a persist error while offline"),
        };
        assert_eq!(persist_error.link, "https://v/1");
        assert!(persist_error.message.contains("quota"));
        assert!(store.by_link("https://v/1")?.has_tagger("alice"));
        assert_eq!(writer.pending_writes(), vec!["https://v/1".to_string()]);

        let outcomes = writer.flush_pending();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].persisted);

        table.offline.store(false, Ordering::SeqCst);
        let outcomes = writer.flush_pending();
        assert_eq!(
            outcomes,
            vec![FlushOutcome { link: "https://v/1".to_string(), persisted: true, error: None }]
        );
        assert!(writer.pending_writes().is_empty());
        let row = table.inner.row_for_link("https://v/1");
        assert!(row.is_some_and(|row| row.get(COLUMN_TAGGER_1) == "alice"));
        Ok(())
    }

    #[test]
    fn refresh_keeps_records_whose_writes_failed() -> Result<()> {
        let table = Arc::new(FlakyTable::default());
        let (store, writer) = writer_with(table.clone());
        let sync = SyncController::new(Arc::clone(&store), table.clone(), Duration::from_secs(2));

        table.offline.store(true, Ordering::SeqCst);
        assert!(!writer.insert("body-image", "feels isolated", "", "https://v/1")?.is_persisted());
        assert!(!writer.tag("https://v/1", "alice", "Yes")?.is_persisted());

        assert_eq!(sync.refresh()?, 1);
        let kept = store.by_link("https://v/1")?;
        assert_eq!(kept.slot_1, Some(TaggerSlot::new("alice", TagResult::Yes)));
        assert_eq!(writer.pending_writes(), vec!["https://v/1".to_string()]);

        table.offline.store(false, Ordering::SeqCst);
        assert_eq!(
            writer.flush_pending(),
            vec![FlushOutcome { link: "https://v/1".to_string(), persisted: true, error: None }]
        );
        assert!(writer.pending_writes().is_empty());
        let rows = table.inner.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(COLUMN_TAGGER_1), "alice");

        assert_eq!(sync.refresh()?, 1);
        assert!(store.by_link("https://v/1")?.has_tagger("alice"));
        Ok(())
    }

    #[test]
    fn persisting_an_unknown_link_is_an_error() {
        let (_, writer) = writer_with(Arc::new(MemoryTable::default()));
        match writer.persist("https://v/gone") {
            Some(err) => assert!(err.message.contains("no longer in the store")),
            None => panic!("expected a persist error for an unknown link"),
        }
    }

    #[test]
    fn concurrent_inserts_report_distinct_snapshot_versions() -> Result<()> {
        const INSERTS: u64 = 16;
        let (store, writer) = writer_with(Arc::new(MemoryTable::default()));
        let writer = Arc::new(writer);

        let handles = (0..INSERTS)
            .map(|index| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    writer.insert("body-image", "feels isolated", "", &format!("https://v/{index}"))
                })
            })
            .collect::<Vec<_>>();

        let mut versions = Vec::new();
        for handle in handles {
            match handle.join() {
                Ok(receipt) => versions.push(receipt?.snapshot_version),
                Err(_) => panic!("insert thread panicked"),
            }
        }

        versions.sort_unstable();
        assert_eq!(versions, (1..=INSERTS).collect::<Vec<_>>());
        assert_eq!(store.snapshot().version(), INSERTS);
        Ok(())
    }

    #[test]
    fn later_write_carries_both_slots() -> Result<()> {
        let table = Arc::new(FlakyTable::default());
        let (_, writer) = writer_with(table.clone());
        writer.insert("body-image", "feels isolated", "", "https://v/1")?;

        table.offline.store(true, Ordering::SeqCst);
        writer.tag("https://v/1", "alice", "Yes")?;
        table.offline.store(false, Ordering::SeqCst);
        let receipt = writer.tag("https://v/1", "bob", "No")?;

        assert!(receipt.is_persisted());
        let values = table.inner.row_for_link("https://v/1").map(|row| row.to_values());
        assert_eq!(
            values,
            Some(
                ["body-image", "feels isolated", "", "https://v/1", "alice", "Yes", "bob", "No"]
                    .map(String::from)
                    .to_vec()
            )
        );
        Ok(())
    }
}
