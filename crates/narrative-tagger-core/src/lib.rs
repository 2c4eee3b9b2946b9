use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_FULLY_WORKED_THRESHOLD: usize = 5;
pub const DEFAULT_TARGET_COVERAGE: usize = 10;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TaggerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("duplicate link: {0}")]
    DuplicateLink(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("no more records to tag for user {0}")]
    Exhausted(String),
    #[error("invalid result: {0}")]
    InvalidResult(String),
    #[error("user {user} already tagged {link}")]
    AlreadyTagged { link: String, user: String },
    #[error("both tagger slots are already filled for {0}")]
    SlotConflict(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("malformed source: {0}")]
    MalformedSource(String),
}

impl TaggerError {
    /// Stable machine-readable code for boundary adapters.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::DuplicateLink(_) => "duplicate_link",
            Self::NotFound(_) => "not_found",
            Self::Exhausted(_) => "exhausted",
            Self::InvalidResult(_) => "invalid_result",
            Self::AlreadyTagged { .. } => "already_tagged",
            Self::SlotConflict(_) => "slot_conflict",
            Self::Upstream(_) => "upstream_error",
            Self::MalformedSource(_) => "malformed_source",
        }
    }

    /// Absence conditions are signals ("no more work"), not failures.
    #[must_use]
    pub fn is_absence(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Exhausted(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TagResult {
    Yes,
    No,
    TooObvious,
    Problem,
}

impl TagResult {
    pub const ALL: [Self; 4] = [Self::Yes, Self::No, Self::TooObvious, Self::Problem];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "Yes",
            Self::No => "No",
            Self::TooObvious => "TooObvious",
            Self::Problem => "Problem",
        }
    }

    /// Strict parse of the canonical spelling.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Yes" => Some(Self::Yes),
            "No" => Some(Self::No),
            "TooObvious" => Some(Self::TooObvious),
            "Problem" => Some(Self::Problem),
            _ => None,
        }
    }
}

impl Display for TagResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SlotIndex {
    First,
    Second,
}

impl SlotIndex {
    #[must_use]
    pub fn number(self) -> u8 {
        match self {
            Self::First => 1,
            Self::Second => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaggerSlot {
    pub tagger: String,
    pub result: TagResult,
}

impl TaggerSlot {
    #[must_use]
    pub fn new(tagger: impl Into<String>, result: TagResult) -> Self {
        Self { tagger: tagger.into(), result }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Record {
    pub topic: String,
    pub narrative: String,
    #[serde(default)]
    pub story: String,
    pub link: String,
    #[serde(default)]
    pub slot_1: Option<TaggerSlot>,
    #[serde(default)]
    pub slot_2: Option<TaggerSlot>,
}

impl Record {
    /// Build an untagged record from validated content fields.
    ///
    /// # Errors
    /// Returns [`TaggerError::Validation`] when `topic`, `narrative`, or `link`
    /// is empty, or `link` is not an absolute URL.
    pub fn new(
        topic: impl Into<String>,
        narrative: impl Into<String>,
        story: impl Into<String>,
        link: impl Into<String>,
    ) -> Result<Self, TaggerError> {
        let record = Self {
            topic: topic.into(),
            narrative: narrative.into(),
            story: story.into(),
            link: link.into(),
            slot_1: None,
            slot_2: None,
        };
        record.validate()?;
        Ok(record)
    }

    /// Validate content fields and slot invariants.
    ///
    /// # Errors
    /// Returns [`TaggerError::Validation`] when a required field is empty, the
    /// link is not a valid URL, a tagger identity is blank, or one identity
    /// occupies both slots.
    pub fn validate(&self) -> Result<(), TaggerError> {
        if self.topic.trim().is_empty() {
            return Err(TaggerError::Validation("topic MUST be non-empty".to_string()));
        }

        if self.narrative.trim().is_empty() {
            return Err(TaggerError::Validation("narrative MUST be non-empty".to_string()));
        }

        validate_link(&self.link)?;

        for slot in self.filled_slots() {
            validate_identity(&slot.tagger)?;
        }

        if let (Some(first), Some(second)) = (&self.slot_1, &self.slot_2) {
            if first.tagger == second.tagger {
                return Err(TaggerError::Validation(format!(
                    "user {} MUST NOT occupy both tagger slots of {}",
                    first.tagger, self.link
                )));
            }
        }

        Ok(())
    }

    pub fn filled_slots(&self) -> impl Iterator<Item = &TaggerSlot> {
        self.slot_1.iter().chain(self.slot_2.iter())
    }

    #[must_use]
    pub fn occupied_slots(&self) -> usize {
        self.filled_slots().count()
    }

    #[must_use]
    pub fn is_untouched(&self) -> bool {
        self.slot_1.is_none() && self.slot_2.is_none()
    }

    #[must_use]
    pub fn has_open_slot(&self) -> bool {
        self.slot_1.is_none() || self.slot_2.is_none()
    }

    #[must_use]
    pub fn has_tagger(&self, user: &str) -> bool {
        self.filled_slots().any(|slot| slot.tagger == user)
    }

    #[must_use]
    pub fn has_result(&self, result: TagResult) -> bool {
        self.filled_slots().any(|slot| slot.result == result)
    }

    /// A record is assignable to `user` while it has a free slot and the user
    /// does not already hold the other one.
    #[must_use]
    pub fn is_assignable_to(&self, user: &str) -> bool {
        self.has_open_slot() && !self.has_tagger(user)
    }

    #[must_use]
    pub fn group_key(&self) -> (&str, &str) {
        (self.topic.as_str(), self.narrative.as_str())
    }

    /// Claim the next free slot for `user`.
    ///
    /// Callers serialize this per record; the check and the write happen on the
    /// same `&mut` borrow.
    ///
    /// # Errors
    /// Returns [`TaggerError::Validation`] for a blank identity,
    /// [`TaggerError::AlreadyTagged`] when the user already holds a slot, or
    /// [`TaggerError::SlotConflict`] when both slots are taken.
    pub fn claim_slot(&mut self, user: &str, result: TagResult) -> Result<SlotIndex, TaggerError> {
        validate_identity(user)?;

        if self.has_tagger(user) {
            return Err(TaggerError::AlreadyTagged {
                link: self.link.clone(),
                user: user.to_string(),
            });
        }

        if self.slot_1.is_none() {
            self.slot_1 = Some(TaggerSlot::new(user, result));
            return Ok(SlotIndex::First);
        }

        if self.slot_2.is_none() {
            self.slot_2 = Some(TaggerSlot::new(user, result));
            return Ok(SlotIndex::Second);
        }

        Err(TaggerError::SlotConflict(self.link.clone()))
    }
}

/// # Errors
/// Returns [`TaggerError::Validation`] when `link` is empty or is not an
/// absolute URL with a host.
pub fn validate_link(link: &str) -> Result<(), TaggerError> {
    if link.trim().is_empty() {
        return Err(TaggerError::Validation("link MUST be non-empty".to_string()));
    }

    let parsed = Url::parse(link)
        .map_err(|err| TaggerError::Validation(format!("link is not a valid URL ({err}): {link}")))?;
    if !parsed.has_host() {
        return Err(TaggerError::Validation(format!("link MUST include a host: {link}")));
    }

    Ok(())
}

/// # Errors
/// Returns [`TaggerError::Validation`] when the identity is blank.
pub fn validate_identity(user: &str) -> Result<(), TaggerError> {
    if user.trim().is_empty() {
        return Err(TaggerError::Validation("user identity MUST be non-empty".to_string()));
    }
    Ok(())
}

/// Parse a boundary-supplied result string into the enumerated value.
///
/// # Errors
/// Returns [`TaggerError::InvalidResult`] for anything but the four canonical
/// spellings.
pub fn parse_result(value: &str) -> Result<TagResult, TaggerError> {
    TagResult::parse(value).ok_or_else(|| {
        TaggerError::InvalidResult(format!(
            "{value:?} is not one of Yes, No, TooObvious, Problem"
        ))
    })
}

#[must_use]
pub fn eligible_for<'a>(records: &'a [Record], user: &str) -> Vec<&'a Record> {
    records.iter().filter(|record| record.is_assignable_to(user)).collect()
}

/// Pick uniformly at random among the records `user` may still rate.
///
/// # Errors
/// Returns [`TaggerError::Exhausted`] when no eligible record remains.
pub fn select_for_user<'a, R>(
    records: &'a [Record],
    user: &str,
    rng: &mut R,
) -> Result<&'a Record, TaggerError>
where
    R: Rng + ?Sized,
{
    eligible_for(records, user)
        .choose(rng)
        .copied()
        .ok_or_else(|| TaggerError::Exhausted(user.to_string()))
}

#[must_use]
pub fn user_tagged_count(records: &[Record], user: &str) -> usize {
    records.iter().filter(|record| record.has_tagger(user)).count()
}

/// Distinct topics in first-seen order.
#[must_use]
pub fn topics(records: &[Record]) -> Vec<String> {
    let mut seen = Vec::<String>::new();
    for record in records {
        if !seen.iter().any(|topic| topic == &record.topic) {
            seen.push(record.topic.clone());
        }
    }
    seen
}

/// Distinct narratives of one topic in first-seen order.
#[must_use]
pub fn narratives(records: &[Record], topic: &str) -> Vec<String> {
    let mut seen = Vec::<String>::new();
    for record in records.iter().filter(|record| record.topic == topic) {
        if !seen.iter().any(|narrative| narrative == &record.narrative) {
            seen.push(record.narrative.clone());
        }
    }
    seen
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatsPolicy {
    pub fully_worked_threshold: usize,
    pub target_coverage: usize,
}

impl Default for StatsPolicy {
    fn default() -> Self {
        Self {
            fully_worked_threshold: DEFAULT_FULLY_WORKED_THRESHOLD,
            target_coverage: DEFAULT_TARGET_COVERAGE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NarrativeGroupStats {
    pub topic: String,
    pub narrative: String,
    pub records: usize,
    pub initial: usize,
    pub yes: usize,
    pub no: usize,
    pub too_obvious: usize,
    pub problem: usize,
    pub missing: usize,
    pub yes_records: usize,
    pub fully_worked: bool,
}

impl NarrativeGroupStats {
    fn empty(topic: &str, narrative: &str) -> Self {
        Self {
            topic: topic.to_string(),
            narrative: narrative.to_string(),
            records: 0,
            initial: 0,
            yes: 0,
            no: 0,
            too_obvious: 0,
            problem: 0,
            missing: 0,
            yes_records: 0,
            fully_worked: false,
        }
    }

    fn count_record(&mut self, record: &Record) {
        self.records += 1;
        if record.is_untouched() {
            self.initial += 1;
        }
        if record.has_result(TagResult::Yes) {
            self.yes_records += 1;
        }
        for slot in record.filled_slots() {
            match slot.result {
                TagResult::Yes => self.yes += 1,
                TagResult::No => self.no += 1,
                TagResult::TooObvious => self.too_obvious += 1,
                TagResult::Problem => self.problem += 1,
            }
        }
    }

    fn finish(&mut self, policy: &StatsPolicy) {
        self.missing = policy.target_coverage.saturating_sub(self.records);
        self.fully_worked = self.yes_records > policy.fully_worked_threshold;
    }

    #[must_use]
    pub fn result_slots(&self) -> usize {
        self.yes + self.no + self.too_obvious + self.problem
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatsTotals {
    pub records: usize,
    pub occupied_slots: usize,
    pub initial: usize,
    pub yes: usize,
    pub no: usize,
    pub too_obvious: usize,
    pub problem: usize,
    pub missing: usize,
    pub topics: usize,
    pub narratives: usize,
    pub fully_worked_narratives: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LeaderboardEntry {
    pub user: String,
    pub tagged_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaggingStats {
    pub snapshot_version: u64,
    pub groups: Vec<NarrativeGroupStats>,
    pub totals: StatsTotals,
    pub leaderboard: Vec<LeaderboardEntry>,
}

impl TaggingStats {
    #[must_use]
    pub fn group(&self, topic: &str, narrative: &str) -> Option<&NarrativeGroupStats> {
        self.groups.iter().find(|group| group.topic == topic && group.narrative == narrative)
    }
}

/// Aggregate per-group buckets, global totals, and the leaderboard in one pass
/// over `records`. Groups keep first-seen order.
#[must_use]
pub fn aggregate_stats(
    records: &[Record],
    policy: &StatsPolicy,
    snapshot_version: u64,
) -> TaggingStats {
    let mut group_index: BTreeMap<(&str, &str), usize> = BTreeMap::new();
    let mut groups: Vec<NarrativeGroupStats> = Vec::new();
    let mut per_user: BTreeMap<&str, usize> = BTreeMap::new();
    let mut topic_names: Vec<&str> = Vec::new();
    let mut occupied_slots = 0_usize;

    for record in records {
        let key = record.group_key();
        let index = *group_index.entry(key).or_insert_with(|| {
            groups.push(NarrativeGroupStats::empty(key.0, key.1));
            groups.len() - 1
        });
        groups[index].count_record(record);

        if !topic_names.contains(&key.0) {
            topic_names.push(key.0);
        }

        for slot in record.filled_slots() {
            occupied_slots += 1;
            *per_user.entry(slot.tagger.as_str()).or_insert(0) += 1;
        }
    }

    let mut totals = StatsTotals {
        records: records.len(),
        occupied_slots,
        topics: topic_names.len(),
        narratives: groups.len(),
        ..StatsTotals::default()
    };
    for group in &mut groups {
        group.finish(policy);
        totals.initial += group.initial;
        totals.yes += group.yes;
        totals.no += group.no;
        totals.too_obvious += group.too_obvious;
        totals.problem += group.problem;
        totals.missing += group.missing;
        if group.fully_worked {
            totals.fully_worked_narratives += 1;
        }
    }

    let mut leaderboard = per_user
        .into_iter()
        .map(|(user, tagged_count)| LeaderboardEntry { user: user.to_string(), tagged_count })
        .collect::<Vec<_>>();
    leaderboard.sort_by(|lhs, rhs| {
        rhs.tagged_count.cmp(&lhs.tagged_count).then_with(|| lhs.user.cmp(&rhs.user))
    });

    TaggingStats { snapshot_version, groups, totals, leaderboard }
}
