//! Domain model for the RunLedger experiment catalog.
//!
//! Everything here is pure in-memory logic: the staged [`ExperimentDraft`]
//! a session accumulates before commit, the [`ExperimentRecord`] shape a
//! ranking query returns, and the error contract shared by the storage and
//! CLI crates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

/// Store-assigned experiment identifier (SQLite rowid).
pub type ExperimentId = i64;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("invalid experiment: {0}")]
    InvalidExperiment(String),
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("session is closed: experiment {0} is already committed")]
    SessionClosed(ExperimentId),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("no scores recorded with label '{0}'")]
    UnknownScoreLabel(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Ranking direction for best-experiment queries.
///
/// `Max` returns the highest score first, `Min` the lowest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Max,
    Min,
}

impl SortOrder {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Max => "max",
            Self::Min => "min",
        }
    }

    /// SQL `ORDER BY` direction implementing this ranking.
    #[must_use]
    pub fn sql_direction(self) -> &'static str {
        match self {
            Self::Max => "DESC",
            Self::Min => "ASC",
        }
    }

    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        match value {
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            other => Err(LedgerError::InvalidArgument(format!(
                "order must be 'max' or 'min', got '{other}'"
            ))),
        }
    }
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .format(&Rfc3339)
        .map_err(|err| LedgerError::InvalidArgument(format!("unformattable timestamp: {err}")))
}

pub fn parse_rfc3339_utc(raw: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|err| LedgerError::InvalidArgument(format!("invalid RFC 3339 timestamp: {err}")))?;
    Ok(parsed.to_offset(UtcOffset::UTC))
}

/// Coerces a staged score value to the finite float the store persists.
pub fn coerce_score(key: &str, raw: &str) -> Result<f64, LedgerError> {
    let value = raw.trim().parse::<f64>().map_err(|_| LedgerError::InvalidValue {
        key: key.to_string(),
        reason: format!("'{raw}' is not numeric"),
    })?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(LedgerError::InvalidValue {
            key: key.to_string(),
            reason: format!("'{raw}' is not a finite number"),
        })
    }
}

/// One experiment's staged metadata before commit.
///
/// Each collection is a name-to-value map: re-adding a name overwrites the
/// previous value (last write wins), and insertion order carries no meaning.
/// The draft never touches storage; the session in the store crate owns the
/// durable write.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentDraft {
    name: String,
    comment: Option<String>,
    recorded_at: OffsetDateTime,
    parameters: BTreeMap<String, String>,
    outputs: BTreeMap<String, String>,
    scores: BTreeMap<String, f64>,
    features: BTreeMap<String, String>,
}

impl ExperimentDraft {
    /// Creates an empty draft. The name must be non-empty after trimming;
    /// the timestamp defaults to the current UTC time.
    pub fn new(
        name: &str,
        comment: Option<&str>,
        recorded_at: Option<OffsetDateTime>,
    ) -> Result<Self, LedgerError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(LedgerError::InvalidExperiment(
                "experiment name must not be empty".to_string(),
            ));
        }

        Ok(Self {
            name: trimmed.to_string(),
            comment: comment.map(str::to_string),
            recorded_at: recorded_at.unwrap_or_else(now_utc),
            parameters: BTreeMap::new(),
            outputs: BTreeMap::new(),
            scores: BTreeMap::new(),
            features: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    #[must_use]
    pub fn recorded_at(&self) -> OffsetDateTime {
        self.recorded_at
    }

    pub fn merge_parameters<I, K, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        merge_text(&mut self.parameters, entries);
    }

    pub fn merge_outputs<I, K, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        merge_text(&mut self.outputs, entries);
    }

    pub fn merge_features<I, K, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        merge_text(&mut self.features, entries);
    }

    /// Merges score entries, coercing each value to a finite float.
    ///
    /// Validation runs over the whole batch before anything is staged, so a
    /// failing call leaves the draft exactly as it was.
    pub fn merge_scores<I, K, V>(&mut self, entries: I) -> Result<(), LedgerError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let mut staged = Vec::new();
        for (key, value) in entries {
            let key = key.into();
            let coerced = coerce_score(&key, &value.to_string())?;
            staged.push((key, coerced));
        }
        self.scores.extend(staged);
        Ok(())
    }

    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    #[must_use]
    pub fn outputs(&self) -> &BTreeMap<String, String> {
        &self.outputs
    }

    #[must_use]
    pub fn scores(&self) -> &BTreeMap<String, f64> {
        &self.scores
    }

    #[must_use]
    pub fn features(&self) -> &BTreeMap<String, String> {
        &self.features
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
            && self.outputs.is_empty()
            && self.scores.is_empty()
            && self.features.is_empty()
    }
}

fn merge_text<I, K, V>(target: &mut BTreeMap<String, String>, entries: I)
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: ToString,
{
    for (key, value) in entries {
        target.insert(key.into(), value.to_string());
    }
}

/// Identity row of a committed experiment. `recorded_at` is the RFC 3339
/// text exactly as stored.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExperimentSummary {
    pub experiment_id: ExperimentId,
    pub name: String,
    pub comment: Option<String>,
    pub recorded_at: String,
}

/// A committed experiment joined with all of its child records, one map per
/// entity kind. This is the shape ranking queries return and the renderer
/// consumes as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentRecord {
    pub experiment: ExperimentSummary,
    pub parameters: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
    pub scores: BTreeMap<String, f64>,
    pub features: BTreeMap<String, String>,
}

impl ExperimentRecord {
    #[must_use]
    pub fn score(&self, label: &str) -> Option<f64> {
        self.scores.get(label).copied()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;

    fn must<T>(result: Result<T, LedgerError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_draft() -> ExperimentDraft {
        must(ExperimentDraft::new("mnist-baseline", Some("resnet18"), None))
    }

    #[test]
    fn draft_rejects_empty_and_blank_names() {
        for name in ["", "   ", "\t\n"] {
            match ExperimentDraft::new(name, None, None) {
                Err(LedgerError::InvalidExperiment(_)) => {}
                other => panic!("expected InvalidExperiment, got {other:?}"),
            }
        }
    }

    #[test]
    fn draft_trims_name_and_defaults_identity_fields() {
        let before = now_utc();
        let draft = must(ExperimentDraft::new("  mnist  ", None, None));
        assert_eq!(draft.name(), "mnist");
        assert_eq!(draft.comment(), None);
        assert!(draft.recorded_at() >= before);
        assert!(draft.is_empty());
    }

    #[test]
    fn merge_keeps_last_write_per_key() {
        let mut draft = fixture_draft();
        draft.merge_parameters([("dropout", "0.2"), ("kernel_size", "3x3")]);
        draft.merge_parameters([("dropout", "0.5")]);

        assert_eq!(draft.parameters().len(), 2);
        assert_eq!(draft.parameters().get("dropout").map(String::as_str), Some("0.5"));

        must(draft.merge_scores([("val acc", 0.90)]));
        must(draft.merge_scores([("val acc", 0.94)]));
        assert_eq!(draft.scores().get("val acc").copied(), Some(0.94));
    }

    #[test]
    fn merge_scores_coerces_numeric_text() {
        let mut draft = fixture_draft();
        must(draft.merge_scores([("val acc", "0.94"), ("epochs", " 12 ")]));
        assert_eq!(draft.scores().get("val acc").copied(), Some(0.94));
        assert_eq!(draft.scores().get("epochs").copied(), Some(12.0));
    }

    #[test]
    fn merge_scores_names_the_offending_key_and_stages_nothing() {
        let mut draft = fixture_draft();
        let result = draft.merge_scores([("val acc", "0.94"), ("val loss", "not a number")]);
        match result {
            Err(LedgerError::InvalidValue { key, .. }) => assert_eq!(key, "val loss"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
        assert!(draft.scores().is_empty());
    }

    #[test]
    fn merge_scores_rejects_non_finite_values() {
        let mut draft = fixture_draft();
        for raw in ["NaN", "inf", "-inf"] {
            match draft.merge_scores([("val acc", raw)]) {
                Err(LedgerError::InvalidValue { key, .. }) => assert_eq!(key, "val acc"),
                other => panic!("expected InvalidValue for {raw}, got {other:?}"),
            }
        }
        assert!(draft.scores().is_empty());
    }

    #[test]
    fn sort_order_parses_its_own_labels() {
        assert_eq!(must(SortOrder::parse("max")), SortOrder::Max);
        assert_eq!(must(SortOrder::parse("min")), SortOrder::Min);
        assert_eq!(SortOrder::Max.as_str(), "max");
        assert_eq!(SortOrder::Max.sql_direction(), "DESC");
        assert_eq!(SortOrder::Min.sql_direction(), "ASC");

        match SortOrder::parse("median") {
            Err(LedgerError::InvalidArgument(message)) => {
                assert!(message.contains("median"));
            }
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
    }

    #[test]
    fn rfc3339_roundtrip_normalizes_to_utc() {
        let parsed = must(parse_rfc3339_utc("2026-08-28T10:30:00+02:00"));
        assert_eq!(parsed.offset(), UtcOffset::UTC);
        assert_eq!(must(format_rfc3339(parsed)), "2026-08-28T08:30:00Z");

        match parse_rfc3339_utc("not a timestamp") {
            Err(LedgerError::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
    }

    #[test]
    fn record_score_lookup_is_by_exact_label() {
        let record = ExperimentRecord {
            experiment: ExperimentSummary {
                experiment_id: 1,
                name: "mnist".to_string(),
                comment: None,
                recorded_at: "2026-08-28T08:30:00Z".to_string(),
            },
            parameters: BTreeMap::new(),
            outputs: BTreeMap::new(),
            scores: BTreeMap::from([("val acc".to_string(), 0.94)]),
            features: BTreeMap::new(),
        };
        assert_eq!(record.score("val acc"), Some(0.94));
        assert_eq!(record.score("val_acc"), None);
    }
}
