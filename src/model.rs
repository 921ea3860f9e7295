use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

pub const MAX_QUERIES_PER_SET: usize = 1000;

pub type Metadata = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "QueryRecord")]
pub struct Query {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct QueryRecord {
    text: String,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    metadata: Metadata,
}

impl TryFrom<QueryRecord> for Query {
    type Error = EngineError;

    fn try_from(record: QueryRecord) -> Result<Self, Self::Error> {
        Query::with_details(record.text, record.reference, record.metadata)
    }
}

impl Query {
    #[cfg(test)]
    pub fn new(text: impl Into<String>) -> Result<Self, EngineError> {
        Self::with_details(text, None, Metadata::new())
    }

    pub fn with_details(
        text: impl Into<String>,
        reference: Option<String>,
        metadata: Metadata,
    ) -> Result<Self, EngineError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(EngineError::validation("query text must not be empty"));
        }

        let reference = reference.filter(|value| !value.trim().is_empty());
        Ok(Self {
            text,
            reference,
            metadata,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    #[cfg(test)]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Two queries occupy the same slot in a comparison when text and reference agree.
    pub fn aligns_with(&self, other: &Query) -> bool {
        self.text == other.text && self.reference == other.reference
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "QuerySetRecord")]
pub struct QuerySet {
    name: String,
    domain: String,
    queries: Vec<Query>,
}

#[derive(Debug, Deserialize)]
struct QuerySetRecord {
    name: String,
    domain: String,
    queries: Vec<Query>,
}

impl TryFrom<QuerySetRecord> for QuerySet {
    type Error = EngineError;

    fn try_from(record: QuerySetRecord) -> Result<Self, Self::Error> {
        QuerySet::new(record.name, record.domain, record.queries)
    }
}

impl QuerySet {
    pub fn new(
        name: impl Into<String>,
        domain: impl Into<String>,
        queries: Vec<Query>,
    ) -> Result<Self, EngineError> {
        let name = name.into();
        let domain = domain.into();
        if name.trim().is_empty() {
            return Err(EngineError::validation("query set name must not be empty"));
        }
        if domain.trim().is_empty() {
            return Err(EngineError::validation(format!(
                "query set '{name}' has an empty domain"
            )));
        }
        if queries.is_empty() {
            return Err(EngineError::validation(format!(
                "query set '{name}' contains no queries"
            )));
        }
        if queries.len() > MAX_QUERIES_PER_SET {
            return Err(EngineError::validation(format!(
                "query set '{name}' has {} queries; the limit is {MAX_QUERIES_PER_SET}",
                queries.len()
            )));
        }

        Ok(Self {
            name,
            domain,
            queries,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub content: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl RetrievedChunk {
    pub fn new(content: impl Into<String>, score: f64) -> Self {
        Self {
            content: content.into(),
            score,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub query: Query,
    #[serde(default)]
    pub retrieved: Vec<RetrievedChunk>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    pub fn success(query: Query, retrieved: Vec<RetrievedChunk>, duration_ms: u64) -> Self {
        Self {
            query,
            retrieved,
            duration_ms,
            error: None,
        }
    }

    pub fn failure(query: Query, error: impl Into<String>, duration_ms: u64) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "unknown retrieval error".to_string();
        }
        Self {
            query,
            retrieved: Vec::new(),
            duration_ms,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error
            .as_deref()
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Partial)
    }

    pub fn from_error_counts(errored: usize, total: usize) -> Self {
        if errored == 0 {
            Self::Completed
        } else if errored == total {
            Self::Failed
        } else {
            Self::Partial
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub domain: String,
    pub system_name: String,
    pub query_set_name: String,
    pub status: RunStatus,
    pub results: Vec<QueryResult>,
    pub system_config_snapshot: Value,
    pub query_set_snapshot: QuerySet,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Run {
    pub fn error_count(&self) -> usize {
        self.results.iter().filter(|result| result.is_error()).count()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished() && self.completed_at.is_some()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "systems", rename_all = "snake_case")]
pub enum Winner {
    Systems(Vec<String>),
    Tie,
    Error,
}

impl Winner {
    pub fn system(name: impl Into<String>) -> Self {
        Self::Systems(vec![name.into()])
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }

    pub fn includes(&self, system: &str) -> bool {
        match self {
            Self::Systems(systems) => systems.iter().any(|name| name == system),
            Self::Tie | Self::Error => false,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Systems(systems) => systems.join("+"),
            Self::Tie => "tie".to_string(),
            Self::Error => "error".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub per_system_results: BTreeMap<String, QueryResult>,
    pub winner: Winner,
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonStatus {
    Completed,
    Partial,
    Failed,
}

impl ComparisonStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparison {
    pub id: String,
    pub domain: String,
    pub run_ids: Vec<String>,
    pub systems: Vec<String>,
    pub evaluations: Vec<Evaluation>,
    pub evaluator_config_snapshot: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Comparison {
    pub fn status(&self) -> ComparisonStatus {
        let errored = self
            .evaluations
            .iter()
            .filter(|evaluation| evaluation.winner.is_error())
            .count();
        if errored == 0 {
            ComparisonStatus::Completed
        } else if errored == self.evaluations.len() {
            ComparisonStatus::Failed
        } else {
            ComparisonStatus::Partial
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_rejects_blank_text() {
        let err = Query::new("   ").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn query_drops_blank_reference() {
        let query = Query::with_details("What is zakat?", Some(" ".to_string()), Metadata::new())
            .unwrap();
        assert!(query.reference().is_none());
    }

    #[test]
    fn query_set_enforces_size_limit_at_construction() {
        let queries = (0..=MAX_QUERIES_PER_SET)
            .map(|index| Query::new(format!("question {index}")).unwrap())
            .collect::<Vec<Query>>();
        let err = QuerySet::new("too-big", "fiqh", queries).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = QuerySet::new("empty", "fiqh", Vec::new()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn query_set_deserialization_validates_queries() {
        let raw = r#"{"name": "pillars", "domain": "fiqh", "queries": [{"text": ""}]}"#;
        assert!(serde_json::from_str::<QuerySet>(raw).is_err());

        let raw = r#"
        {
          "name": "pillars",
          "domain": "fiqh",
          "queries": [
            {"text": "What is zakat?", "reference": "Obligatory alms", "metadata": {"topic": "zakat"}},
            {"text": "What is hajj?"}
          ]
        }
        "#;
        let query_set: QuerySet = serde_json::from_str(raw).expect("query set should parse");
        assert_eq!(query_set.len(), 2);
        assert_eq!(query_set.queries()[0].reference(), Some("Obligatory alms"));
        assert_eq!(
            query_set.queries()[0].metadata().get("topic"),
            Some(&Value::from("zakat"))
        );
    }

    #[test]
    fn run_status_follows_error_counts() {
        assert_eq!(RunStatus::from_error_counts(0, 3), RunStatus::Completed);
        assert_eq!(RunStatus::from_error_counts(3, 3), RunStatus::Failed);
        assert_eq!(RunStatus::from_error_counts(1, 3), RunStatus::Partial);
        assert_eq!(
            serde_json::to_value(RunStatus::Partial).unwrap(),
            Value::from("partial")
        );
    }

    #[test]
    fn failure_result_always_carries_a_message() {
        let query = Query::new("What is hajj?").unwrap();
        let result = QueryResult::failure(query, "", 12);
        assert!(result.is_error());
        assert_eq!(result.error.as_deref(), Some("unknown retrieval error"));
    }

    #[test]
    fn winner_serializes_as_tagged_object() {
        let value = serde_json::to_value(Winner::system("bm25")).unwrap();
        assert_eq!(value["outcome"], "systems");
        assert_eq!(value["systems"][0], "bm25");

        let tie: Winner = serde_json::from_str(r#"{"outcome":"tie"}"#).unwrap();
        assert_eq!(tie, Winner::Tie);
    }
}
