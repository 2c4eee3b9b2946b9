use std::collections::HashSet;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use narrative_tagger_core::{Record, TagResult, TaggerError, TaggerSlot};
use time::OffsetDateTime;

use crate::{
    RecordStore, Snapshot, SourceRow, TabularSource, COLUMN_LINK, COLUMN_NARRATIVE, COLUMN_STORY,
    COLUMN_TAGGER_1, COLUMN_TAGGER_1_RESULT, COLUMN_TAGGER_2, COLUMN_TAGGER_2_RESULT,
    COLUMN_TOPIC,
};

const COLUMN_SHEET: &str = "sheet";
const INIT_SENTINEL: &str = "init";

/// Reloads the [`RecordStore`] from the tabular source.
pub struct SyncController {
    store: Arc<RecordStore>,
    source: Arc<dyn TabularSource>,
    fetch_timeout: Duration,
}

impl SyncController {
    #[must_use]
    pub fn new(
        store: Arc<RecordStore>,
        source: Arc<dyn TabularSource>,
        fetch_timeout: Duration,
    ) -> Self {
        Self { store, source, fetch_timeout }
    }

    /// Fetch, coerce, merge, and publish a fresh snapshot. Returns the new
    /// record count. On any error the current snapshot stays in place.
    ///
    /// # Errors
    /// Returns [`TaggerError::Upstream`] when the fetch fails or exceeds the
    /// fetch timeout, or [`TaggerError::MalformedSource`] for rows that cannot
    /// become valid records.
    pub fn refresh(&self) -> Result<usize, TaggerError> {
        self.reload(|_| true).map(|snapshot| snapshot.map_or(0, |snapshot| snapshot.len()))
    }

    /// Refresh only when the snapshot is older than `max_age` or has never
    /// been reconciled. Returns whether a refresh ran.
    ///
    /// Staleness is checked again inside the store's writer scope, so callers
    /// racing on one stale snapshot trigger a single fetch.
    ///
    /// # Errors
    /// Same as [`SyncController::refresh`].
    pub fn refresh_if_stale(&self, max_age: Duration) -> Result<bool, TaggerError> {
        if !self.store.snapshot().is_stale(max_age, OffsetDateTime::now_utc()) {
            return Ok(false);
        }
        let refreshed =
            self.reload(|snapshot| snapshot.is_stale(max_age, OffsetDateTime::now_utc()))?;
        Ok(refreshed.is_some())
    }

    fn reload<P>(&self, should_load: P) -> Result<Option<Arc<Snapshot>>, TaggerError>
    where
        P: FnOnce(&Snapshot) -> bool,
    {
        let outcome = self.store.replace_snapshot_if(should_load, || {
            tracing::info!(timeout = ?self.fetch_timeout, "refreshing records from source");
            let rows = fetch_with_timeout(Arc::clone(&self.source), self.fetch_timeout)?;
            records_from_rows(&rows)
        });

        match outcome {
            Ok(Some(snapshot)) => {
                tracing::info!(
                    records = snapshot.len(),
                    snapshot_version = snapshot.version(),
                    "refresh complete"
                );
                Ok(Some(snapshot))
            }
            Ok(None) => {
                tracing::debug!("snapshot refreshed by another caller");
                Ok(None)
            }
            Err(err) => {
                tracing::warn!(code = err.code(), error = %err, "refresh failed; keeping current snapshot");
                Err(err)
            }
        }
    }
}

fn fetch_with_timeout(
    source: Arc<dyn TabularSource>,
    timeout: Duration,
) -> Result<Vec<SourceRow>, TaggerError> {
    let (sender, receiver) = mpsc::channel();
    thread::Builder::new()
        .name("narrative-tagger-fetch".to_string())
        .spawn(move || {
            let _ = sender.send(source.fetch_all_rows());
        })
        .map_err(|err| TaggerError::Upstream(format!("failed to spawn fetch thread: {err}")))?;

    match receiver.recv_timeout(timeout) {
        Ok(Ok(rows)) => Ok(rows),
        Ok(Err(err)) => Err(TaggerError::Upstream(format!("{err:#}"))),
        Err(RecvTimeoutError::Timeout) => Err(TaggerError::Upstream(format!(
            "fetch exceeded {} ms",
            timeout.as_millis()
        ))),
        Err(RecvTimeoutError::Disconnected) => {
            Err(TaggerError::Upstream("fetch thread exited without a result".to_string()))
        }
    }
}

/// Coerce loosely-typed rows into records, all or nothing.
///
/// # Errors
/// Returns [`TaggerError::MalformedSource`] naming the first bad row
/// (1-based) or a link repeated within the batch.
pub fn records_from_rows(rows: &[SourceRow]) -> Result<Vec<Record>, TaggerError> {
    let mut seen = HashSet::with_capacity(rows.len());
    let mut records = Vec::with_capacity(rows.len());

    for (index, row) in rows.iter().enumerate() {
        let row_number = index + 1;
        let record = record_from_row(row)
            .map_err(|reason| TaggerError::MalformedSource(format!("row {row_number}: {reason}")))?;
        if !seen.insert(record.link.clone()) {
            return Err(TaggerError::MalformedSource(format!(
                "row {row_number}: duplicate link {}",
                record.link
            )));
        }
        records.push(record);
    }

    Ok(records)
}

fn record_from_row(row: &SourceRow) -> Result<Record, String> {
    let topic = match row.get(COLUMN_TOPIC).trim() {
        "" => row.get(COLUMN_SHEET).trim(),
        topic => topic,
    };

    let mut record = Record::new(
        topic,
        row.get(COLUMN_NARRATIVE).trim(),
        row.get(COLUMN_STORY),
        row.get(COLUMN_LINK).trim(),
    )
    .map_err(|err| err.to_string())?;
    record.slot_1 = slot_from_cells(row.get(COLUMN_TAGGER_1), row.get(COLUMN_TAGGER_1_RESULT))
        .map_err(|reason| format!("tagger_1: {reason}"))?;
    record.slot_2 = slot_from_cells(row.get(COLUMN_TAGGER_2), row.get(COLUMN_TAGGER_2_RESULT))
        .map_err(|reason| format!("tagger_2: {reason}"))?;
    record.validate().map_err(|err| err.to_string())?;

    Ok(record)
}

fn slot_from_cells(tagger: &str, result: &str) -> Result<Option<TaggerSlot>, String> {
    let tagger = tagger.trim();
    let result = result.trim();
    let blank_result = result.is_empty() || result == "0";
    let blank_tagger = tagger.is_empty() || tagger.eq_ignore_ascii_case(INIT_SENTINEL);

    match (blank_tagger, blank_result) {
        (true, true) => Ok(None),
        (true, false) => Err(format!("result {result:?} without a tagger")),
        (false, true) => Err(format!("tagger {tagger:?} without a result")),
        (false, false) => {
            let result = lenient_result(result).ok_or_else(|| format!("unknown result {result:?}"))?;
            Ok(Some(TaggerSlot::new(tagger, result)))
        }
    }
}

/// Case-insensitive match that ignores spaces, `_` and `-`, so legacy cells
/// like `Too Obvious` and `too_obvious` parse.
fn lenient_result(value: &str) -> Option<TagResult> {
    let folded = value
        .chars()
        .filter(|ch| !matches!(ch, ' ' | '_' | '-'))
        .map(|ch| ch.to_ascii_lowercase())
        .collect::<String>();
    TagResult::ALL.into_iter().find(|result| result.as_str().eq_ignore_ascii_case(&folded))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{bail, Result};

    use super::*;
    use crate::{MemoryTable, TagWriter};

    fn row(cells: &[(&str, &str)]) -> SourceRow {
        SourceRow::from_pairs(cells.iter().copied())
    }

    fn content_row(link: &str) -> SourceRow {
        row(&[("Topic", "body-image"), ("Narrative", "feels isolated"), ("Link", link)])
    }

    fn controller(source: Arc<dyn TabularSource>) -> (Arc<RecordStore>, SyncController) {
        let store = Arc::new(RecordStore::new());
        let sync = SyncController::new(Arc::clone(&store), source, Duration::from_secs(2));
        (store, sync)
    }

    struct SlowTable {
        delay: Duration,
    }

    impl TabularSource for SlowTable {
        fn fetch_all_rows(&self) -> Result<Vec<SourceRow>> {
            thread::sleep(self.delay);
            Ok(Vec::new())
        }

        fn append_or_update_row(&self, _record: &Record) -> Result<()> {
            Ok(())
        }
    }

    struct BrokenTable;

    impl TabularSource for BrokenTable {
        fn fetch_all_rows(&self) -> Result<Vec<SourceRow>> {
            bail!("connection reset")
        }

        fn append_or_update_row(&self, _record: &Record) -> Result<()> {
            bail!("connection reset")
        }
    }

    #[derive(Default)]
    struct CountingTable {
        inner: MemoryTable,
        fetches: AtomicUsize,
        delay: Duration,
    }

    impl TabularSource for CountingTable {
        fn fetch_all_rows(&self) -> Result<Vec<SourceRow>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.inner.fetch_all_rows()
        }

        fn append_or_update_row(&self, record: &Record) -> Result<()> {
            self.inner.append_or_update_row(record)
        }
    }

    #[test]
    fn refresh_loads_rows_in_source_order() -> Result<()> {
        let table = Arc::new(MemoryTable::new(vec![
            content_row("https://v/2"),
            row(&[
                ("topic", "grief"),
                ("narrative", "hidden grief"),
                ("story", "lost a parent"),
                ("link", "https://v/1"),
                ("tagger_1", "alice"),
                ("tagger_1_result", "No"),
            ]),
        ]));
        let (store, sync) = controller(table);

        assert_eq!(sync.refresh()?, 2);

        let records = store.all();
        assert_eq!(records[0].link, "https://v/2");
        assert_eq!(records[1].story, "lost a parent");
        assert_eq!(records[1].slot_1, Some(TaggerSlot::new("alice", TagResult::No)));
        Ok(())
    }

    #[test]
    fn legacy_cells_are_coerced() -> Result<()> {
        let rows = vec![
            row(&[
                ("Sheet", "body-image"),
                ("Narrative", "feels isolated"),
                ("Link", "https://v/1"),
                ("Tagger_1", "Init"),
                ("Tagger_1_Result", "0"),
                ("Tagger_2", "bob"),
                ("Tagger_2_Result", "Too Obvious"),
            ]),
            row(&[
                ("topic", "grief"),
                ("narrative", "hidden grief"),
                ("link", "https://v/2"),
                ("tagger_1", "carol"),
                ("tagger_1_result", "too_obvious"),
                ("tagger_2", "INIT"),
            ]),
        ];

        let records = records_from_rows(&rows)?;

        assert_eq!(records[0].topic, "body-image");
        assert_eq!(records[0].slot_1, None);
        assert_eq!(records[0].slot_2, Some(TaggerSlot::new("bob", TagResult::TooObvious)));
        assert_eq!(records[1].slot_1, Some(TaggerSlot::new("carol", TagResult::TooObvious)));
        assert_eq!(records[1].slot_2, None);
        Ok(())
    }

    #[test]
    fn malformed_rows_are_rejected_with_row_number() {
        let cases = [
            (vec![content_row("https://v/1"), content_row("https://v/1")], "row 2: duplicate link"),
            (vec![content_row("not a url")], "row 1"),
            (
                vec![row(&[
                    ("topic", "t"),
                    ("narrative", "n"),
                    ("link", "https://v/1"),
                    ("tagger_1", "alice"),
                    ("tagger_1_result", "Maybe"),
                ])],
                "unknown result",
            ),
            (
                vec![row(&[
                    ("topic", "t"),
                    ("narrative", "n"),
                    ("link", "https://v/1"),
                    ("tagger_1", "alice"),
                ])],
                "without a result",
            ),
            (
                vec![row(&[
                    ("topic", "t"),
                    ("narrative", "n"),
                    ("link", "https://v/1"),
                    ("tagger_1", "alice"),
                    ("tagger_1_result", "Yes"),
                    ("tagger_2", "alice"),
                    ("tagger_2_result", "No"),
                ])],
                "both tagger slots",
            ),
        ];

        for (rows, expected) in cases {
            match records_from_rows(&rows) {
                Err(TaggerError::MalformedSource(message)) => {
                    assert!(message.contains(expected), "`{message}` lacks `{expected}`");
                }
                other => panic!("expected malformed source for `{expected}`, got {other:?}"),
            }
        }
    }

    #[test]
    fn malformed_batch_leaves_snapshot_unchanged() -> Result<()> {
        let table = Arc::new(MemoryTable::new(vec![content_row("https://v/1")]));
        let (store, sync) = controller(table.clone());
        sync.refresh()?;
        let before = store.snapshot();

        table.push_row(content_row("https://v/1"));
        assert!(matches!(sync.refresh(), Err(TaggerError::MalformedSource(_))));
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
        Ok(())
    }

    #[test]
    fn fetch_failure_maps_to_upstream_error() {
        let (store, sync) = controller(Arc::new(BrokenTable));
        match sync.refresh() {
            Err(TaggerError::Upstream(message)) => assert!(message.contains("connection reset")),
            other => panic!("expected upstream error, got {other:?}"),
        }
        assert_eq!(store.snapshot().version(), 0);
    }

    #[test]
    fn slow_fetch_times_out() {
        let store = Arc::new(RecordStore::new());
        let sync = SyncController::new(
            Arc::clone(&store),
            Arc::new(SlowTable { delay: Duration::from_millis(500) }),
            Duration::from_millis(20),
        );

        match sync.refresh() {
            Err(TaggerError::Upstream(message)) => assert!(message.contains("exceeded")),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(store.snapshot().reconciled_at().is_none());
    }

    #[test]
    fn refresh_keeps_tags_not_yet_in_source() -> Result<()> {
        let table = Arc::new(MemoryTable::new(vec![content_row("https://v/1")]));
        let (store, sync) = controller(table.clone());
        sync.refresh()?;

        let fresh = Arc::new(MemoryTable::new(table.rows()));
        let writer = TagWriter::new(Arc::clone(&store), fresh);
        writer.tag("https://v/1", "alice", "Yes")?;
        assert!(table.row_for_link("https://v/1").is_some_and(|row| row.get("tagger_1").is_empty()));

        sync.refresh()?;
        assert_eq!(
            store.by_link("https://v/1")?.slot_1,
            Some(TaggerSlot::new("alice", TagResult::Yes))
        );
        Ok(())
    }

    #[test]
    fn scenario_insert_refresh_round_trip() -> Result<()> {
        let table = Arc::new(MemoryTable::default());
        let (store, sync) = controller(table.clone());
        let writer = TagWriter::new(Arc::clone(&store), table);

        writer.insert("body-image", "feels isolated", "", "https://v/1")?;
        writer.tag("https://v/1", "alice", "Yes")?;
        sync.refresh()?;

        let record = store.by_link("https://v/1")?;
        assert_eq!(record.slot_1, Some(TaggerSlot::new("alice", TagResult::Yes)));
        assert_eq!(store.all().len(), 1);
        Ok(())
    }

    #[test]
    fn refresh_if_stale_only_fetches_when_needed() -> Result<()> {
        let table = Arc::new(CountingTable::default());
        let (_, sync) = controller(table.clone());

        assert!(sync.refresh_if_stale(Duration::from_secs(60))?);
        assert!(!sync.refresh_if_stale(Duration::from_secs(60))?);
        thread::sleep(Duration::from_millis(5));
        assert!(sync.refresh_if_stale(Duration::from_millis(1))?);
        assert_eq!(table.fetches.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn racing_stale_refreshes_fetch_once() -> Result<()> {
        const CALLERS: usize = 8;
        let table = Arc::new(CountingTable {
            delay: Duration::from_millis(100),
            ..CountingTable::default()
        });
        let (store, sync) = controller(table.clone());
        let sync = Arc::new(sync);

        let handles = (0..CALLERS)
            .map(|_| {
                let sync = Arc::clone(&sync);
                thread::spawn(move || sync.refresh_if_stale(Duration::from_secs(60)))
            })
            .collect::<Vec<_>>();

        let mut ran = 0;
        for handle in handles {
            match handle.join() {
                Ok(Ok(true)) => ran += 1,
                Ok(Ok(false)) => {}
                Ok(Err(err)) => panic!("unexpected refresh error: {err}"),
                Err(_) => panic!("refresh thread panicked"),
            }
        }

        assert_eq!(ran, 1);
        assert_eq!(table.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(store.snapshot().version(), 1);
        Ok(())
    }
}
