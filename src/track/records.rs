use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Root of the audit trail. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: Uuid,
    pub raw_text: String,
    pub submitted_at: DateTime<Utc>,
    pub user_id: String,
    pub schema_version: u64,
}

/// A candidate restatement of the raw query. Rank equals insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interpretation {
    pub id: Uuid,
    pub query_id: Uuid,
    pub rank: usize,
    pub restated_text: String,
    pub confidence: f64,
    pub rationale: String,
    pub sql_pattern_hint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMethod {
    Manual,
    Auto,
    /// Disambiguation abandoned or timed out; `interpretation_id` is None.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub query_id: Uuid,
    pub interpretation_id: Option<Uuid>,
    pub method: SelectionMethod,
    pub selected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedSql {
    pub query_id: Uuid,
    pub sql_text: String,
    pub validation_status: ValidationStatus,
    pub validation_errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub query_id: Uuid,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub error: Option<String>,
    /// True when the result was replayed from the cache instead of a fresh
    /// engine invocation.
    pub cached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackScore {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub query_id: Uuid,
    pub score: FeedbackScore,
    pub comment: Option<String>,
}

/// The single terminal state every query chain ends in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryOutcome {
    CompletedExecution {
        row_count: usize,
        execution_time_ms: u64,
        error: Option<String>,
        cached: bool,
    },
    ValidationRejected {
        errors: Vec<String>,
    },
    SynthesisRejected {
        errors: Vec<String>,
    },
    ClarificationAbandoned,
    GenerationFailed {
        reason: String,
    },
}

impl QueryOutcome {
    /// Stable label used for metrics bucketing.
    pub fn label(&self) -> &'static str {
        match self {
            QueryOutcome::CompletedExecution { .. } => "completed_execution",
            QueryOutcome::ValidationRejected { .. } => "validation_rejected",
            QueryOutcome::SynthesisRejected { .. } => "synthesis_rejected",
            QueryOutcome::ClarificationAbandoned => "clarification_abandoned",
            QueryOutcome::GenerationFailed { .. } => "generation_failed",
        }
    }
}

/// Everything recorded about one query, in stage order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryTrace {
    pub query: QueryRecord,
    pub interpretations: Vec<Interpretation>,
    pub selection: Option<Selection>,
    pub generated_sql: Vec<GeneratedSql>,
    pub execution: Option<ExecutionRecord>,
    pub feedback: Option<Feedback>,
    pub outcome: Option<QueryOutcome>,
}

impl QueryTrace {
    pub fn new(query: QueryRecord) -> Self {
        Self {
            query,
            interpretations: Vec::new(),
            selection: None,
            generated_sql: Vec::new(),
            execution: None,
            feedback: None,
            outcome: None,
        }
    }
}
