use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use narrative_tagger_core::{
    validate_identity, Record, StatsPolicy, TaggerError, TaggingStats,
    DEFAULT_FULLY_WORKED_THRESHOLD, DEFAULT_TARGET_COVERAGE,
};
use narrative_tagger_store::{
    CommitReceipt, FlushOutcome, RecordStore, SyncController, TabularSource, TagWriter,
};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_SNAPSHOT_AGE_SECS: u64 = 60;

/// Runtime knobs, usually read from a YAML file. Every field is optional.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TaggerConfig {
    pub fully_worked_threshold: usize,
    pub target_coverage: usize,
    pub fetch_timeout_ms: u64,
    pub max_snapshot_age_secs: u64,
}

impl Default for TaggerConfig {
    fn default() -> Self {
        Self {
            fully_worked_threshold: DEFAULT_FULLY_WORKED_THRESHOLD,
            target_coverage: DEFAULT_TARGET_COVERAGE,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_snapshot_age_secs: DEFAULT_MAX_SNAPSHOT_AGE_SECS,
        }
    }
}

impl TaggerConfig {
    /// # Errors
    /// Returns an error when the YAML is invalid or a value is out of range.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("failed to parse tagger config")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when `fetch_timeout_ms` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.fetch_timeout_ms == 0 {
            return Err(anyhow!("fetch_timeout_ms MUST be greater than zero"));
        }
        Ok(())
    }

    #[must_use]
    pub fn policy(&self) -> StatsPolicy {
        StatsPolicy {
            fully_worked_threshold: self.fully_worked_threshold,
            target_coverage: self.target_coverage,
        }
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    #[must_use]
    pub fn max_snapshot_age(&self) -> Duration {
        Duration::from_secs(self.max_snapshot_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InsertRecordRequest {
    pub topic: String,
    pub narrative: String,
    #[serde(default)]
    pub story: String,
    pub link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagRecordRequest {
    pub link: String,
    pub user: String,
    pub result: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshResult {
    pub records: usize,
    pub snapshot_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserTaggedCount {
    pub user: String,
    pub tagged_count: usize,
}

/// Facade over the record store, tag writer, and sync controller sharing one
/// tabular source. Cheap to clone.
#[derive(Clone)]
pub struct NarrativeTaggerApi {
    store: Arc<RecordStore>,
    writer: Arc<TagWriter>,
    sync: Arc<SyncController>,
    config: TaggerConfig,
}

impl fmt::Debug for NarrativeTaggerApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NarrativeTaggerApi")
            .field("config", &self.config)
            .field("snapshot_version", &self.store.snapshot().version())
            .finish_non_exhaustive()
    }
}

impl NarrativeTaggerApi {
    /// Build an empty facade. Call [`NarrativeTaggerApi::refresh`] to load the
    /// source before serving reads.
    #[must_use]
    pub fn new(source: Arc<dyn TabularSource>, config: TaggerConfig) -> Self {
        let store = Arc::new(RecordStore::new());
        let writer = Arc::new(TagWriter::new(Arc::clone(&store), Arc::clone(&source)));
        let sync = Arc::new(SyncController::new(Arc::clone(&store), source, config.fetch_timeout()));
        Self { store, writer, sync, config }
    }

    #[must_use]
    pub fn config(&self) -> &TaggerConfig {
        &self.config
    }

    /// # Errors
    /// Returns [`TaggerError::Validation`] or [`TaggerError::DuplicateLink`].
    pub fn insert_record(&self, input: InsertRecordRequest) -> Result<CommitReceipt, TaggerError> {
        self.writer.insert(&input.topic, &input.narrative, &input.story, &input.link)
    }

    /// Pick a random record `user` may still rate. Reloads the source first
    /// when the snapshot is older than `max_snapshot_age_secs`; a failed
    /// reload is logged and the current snapshot is served.
    ///
    /// # Errors
    /// Returns [`TaggerError::Validation`] for a blank user, or
    /// [`TaggerError::Exhausted`] when nothing is left.
    pub fn next_for_user(&self, user: &str) -> Result<Record, TaggerError> {
        validate_identity(user)?;

        if let Err(err) = self.sync.refresh_if_stale(self.config.max_snapshot_age()) {
            tracing::warn!(user, code = err.code(), error = %err, "stale refresh failed; serving current snapshot");
        }

        self.store.next_for_user(user, &mut rand::thread_rng())
    }

    /// # Errors
    /// Returns [`TaggerError::NotFound`], [`TaggerError::InvalidResult`],
    /// [`TaggerError::Validation`], [`TaggerError::AlreadyTagged`], or
    /// [`TaggerError::SlotConflict`].
    pub fn tag_record(&self, input: TagRecordRequest) -> Result<CommitReceipt, TaggerError> {
        self.writer.tag(&input.link, &input.user, &input.result)
    }

    #[must_use]
    pub fn get_stats(&self) -> TaggingStats {
        self.store.stats(&self.config.policy())
    }

    /// # Errors
    /// Returns [`TaggerError::Upstream`] or [`TaggerError::MalformedSource`].
    pub fn refresh(&self) -> Result<RefreshResult, TaggerError> {
        let records = self.sync.refresh()?;
        Ok(RefreshResult { records, snapshot_version: self.store.snapshot().version() })
    }

    /// # Errors
    /// Returns [`TaggerError::Validation`] for a blank user.
    pub fn user_tagged_count(&self, user: &str) -> Result<UserTaggedCount, TaggerError> {
        validate_identity(user)?;
        Ok(UserTaggedCount {
            user: user.to_string(),
            tagged_count: self.store.user_tagged_count(user),
        })
    }

    #[must_use]
    pub fn records_by_topic(&self, topic: &str) -> Vec<Record> {
        self.store.records_by_topic(topic)
    }

    #[must_use]
    pub fn tagged_records(&self) -> Vec<Record> {
        self.store.tagged_records()
    }

    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.store.topics()
    }

    #[must_use]
    pub fn narratives(&self, topic: &str) -> Vec<String> {
        self.store.narratives(topic)
    }

    #[must_use]
    pub fn pending_writes(&self) -> Vec<String> {
        self.writer.pending_writes()
    }

    #[must_use]
    pub fn flush_pending(&self) -> Vec<FlushOutcome> {
        self.writer.flush_pending()
    }
}
