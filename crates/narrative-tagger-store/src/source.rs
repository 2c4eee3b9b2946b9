use std::collections::BTreeMap;

use anyhow::Result;
use narrative_tagger_core::{Record, TaggerSlot};
use parking_lot::Mutex;

pub const COLUMN_TOPIC: &str = "topic";
pub const COLUMN_NARRATIVE: &str = "narrative";
pub const COLUMN_STORY: &str = "story";
pub const COLUMN_LINK: &str = "link";
pub const COLUMN_TAGGER_1: &str = "tagger_1";
pub const COLUMN_TAGGER_1_RESULT: &str = "tagger_1_result";
pub const COLUMN_TAGGER_2: &str = "tagger_2";
pub const COLUMN_TAGGER_2_RESULT: &str = "tagger_2_result";

/// Column order of the external flat table.
pub const COLUMNS: [&str; 8] = [
    COLUMN_TOPIC,
    COLUMN_NARRATIVE,
    COLUMN_STORY,
    COLUMN_LINK,
    COLUMN_TAGGER_1,
    COLUMN_TAGGER_1_RESULT,
    COLUMN_TAGGER_2,
    COLUMN_TAGGER_2_RESULT,
];

/// The external tabular source of truth. Rows are keyed by `link`.
pub trait TabularSource: Send + Sync {
    /// Fetch every row currently held by the source, in source order.
    ///
    /// # Errors
    /// Returns an error when the source cannot be reached or read.
    fn fetch_all_rows(&self) -> Result<Vec<SourceRow>>;

    /// Insert the record's row, or overwrite the row with the same `link`.
    ///
    /// # Errors
    /// Returns an error when the write cannot be applied.
    fn append_or_update_row(&self, record: &Record) -> Result<()>;
}

/// One loosely-typed row: column name to raw cell text. Missing cells read as
/// blank. Column names are stored trimmed and lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceRow {
    cells: BTreeMap<String, String>,
}

impl SourceRow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut row = Self::new();
        for (column, value) in pairs {
            row.set(column.as_ref(), value);
        }
        row
    }

    /// Canonical row for a typed record; empty slots become blank cells.
    #[must_use]
    pub fn from_record(record: &Record) -> Self {
        let (tagger_1, result_1) = slot_cells(record.slot_1.as_ref());
        let (tagger_2, result_2) = slot_cells(record.slot_2.as_ref());
        Self::from_pairs([
            (COLUMN_TOPIC, record.topic.clone()),
            (COLUMN_NARRATIVE, record.narrative.clone()),
            (COLUMN_STORY, record.story.clone()),
            (COLUMN_LINK, record.link.clone()),
            (COLUMN_TAGGER_1, tagger_1),
            (COLUMN_TAGGER_1_RESULT, result_1),
            (COLUMN_TAGGER_2, tagger_2),
            (COLUMN_TAGGER_2_RESULT, result_2),
        ])
    }

    pub fn set(&mut self, column: &str, value: impl Into<String>) {
        self.cells.insert(column.trim().to_ascii_lowercase(), value.into());
    }

    #[must_use]
    pub fn get(&self, column: &str) -> &str {
        self.cells.get(column).map_or("", String::as_str)
    }

    /// Cells in [`COLUMNS`] order.
    #[must_use]
    pub fn to_values(&self) -> Vec<String> {
        COLUMNS.iter().map(|column| self.get(column).to_string()).collect()
    }
}

fn slot_cells(slot: Option<&TaggerSlot>) -> (String, String) {
    match slot {
        Some(slot) => (slot.tagger.clone(), slot.result.as_str().to_string()),
        None => (String::new(), String::new()),
    }
}

/// Process-local table, useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryTable {
    rows: Mutex<Vec<SourceRow>>,
}

impl MemoryTable {
    #[must_use]
    pub fn new(rows: Vec<SourceRow>) -> Self {
        Self { rows: Mutex::new(rows) }
    }

    #[must_use]
    pub fn rows(&self) -> Vec<SourceRow> {
        self.rows.lock().clone()
    }

    pub fn push_row(&self, row: SourceRow) {
        self.rows.lock().push(row);
    }

    #[must_use]
    pub fn row_for_link(&self, link: &str) -> Option<SourceRow> {
        self.rows().into_iter().find(|row| row.get(COLUMN_LINK) == link)
    }
}

impl TabularSource for MemoryTable {
    fn fetch_all_rows(&self) -> Result<Vec<SourceRow>> {
        Ok(self.rows())
    }

    fn append_or_update_row(&self, record: &Record) -> Result<()> {
        let mut rows = self.rows.lock();
        let row = SourceRow::from_record(record);
        match rows.iter_mut().find(|existing| existing.get(COLUMN_LINK) == record.link) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
        Ok(())
    }
}
