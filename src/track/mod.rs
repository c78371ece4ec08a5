//! Append-only audit store for the query pipeline. The tracker is the sole
//! writer of every record chain; entries are never deleted or rewritten,
//! only appended, and the first recorded outcome for a query wins.

pub mod records;

use records::*;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackDistribution {
    pub positive: usize,
    pub neutral: usize,
    pub negative: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_queries: usize,
    pub accepted_queries: usize,
    /// accepted / total
    pub success_rate: f64,
    /// Mean over fresh (non-cached) executions that ran without error.
    pub avg_execution_time_ms: f64,
    /// Fraction of resolved selections that picked the top-ranked
    /// interpretation.
    pub selection_accuracy: f64,
    pub feedback: FeedbackDistribution,
    pub outcomes: HashMap<String, usize>,
}

pub struct QueryTracker {
    traces: RwLock<HashMap<Uuid, QueryTrace>>,
}

impl QueryTracker {
    pub fn new() -> Self {
        Self {
            traces: RwLock::new(HashMap::new()),
        }
    }

    pub async fn record_query(&self, query: QueryRecord) {
        let mut traces = self.traces.write().await;
        traces
            .entry(query.id)
            .or_insert_with(|| QueryTrace::new(query));
    }

    pub async fn record_interpretations(&self, query_id: Uuid, interps: Vec<Interpretation>) {
        let mut traces = self.traces.write().await;
        if let Some(trace) = traces.get_mut(&query_id) {
            if trace.interpretations.is_empty() {
                trace.interpretations = interps;
            } else {
                warn!(%query_id, "interpretations already recorded; keeping originals");
            }
        }
    }

    pub async fn record_selection(&self, selection: Selection) {
        let mut traces = self.traces.write().await;
        if let Some(trace) = traces.get_mut(&selection.query_id) {
            if trace.selection.is_none() {
                trace.selection = Some(selection);
            } else {
                warn!(query_id = %selection.query_id, "selection already recorded");
            }
        }
    }

    /// Rejected attempts accumulate; at most one accepted statement per
    /// query is enforced here.
    pub async fn record_generated_sql(&self, sql: GeneratedSql) {
        let mut traces = self.traces.write().await;
        if let Some(trace) = traces.get_mut(&sql.query_id) {
            let already_accepted = trace
                .generated_sql
                .iter()
                .any(|g| g.validation_status == ValidationStatus::Accepted);
            if already_accepted && sql.validation_status == ValidationStatus::Accepted {
                warn!(query_id = %sql.query_id, "accepted SQL already recorded");
                return;
            }
            trace.generated_sql.push(sql);
        }
    }

    pub async fn record_execution(&self, execution: ExecutionRecord) {
        let mut traces = self.traces.write().await;
        if let Some(trace) = traces.get_mut(&execution.query_id) {
            if trace.execution.is_none() {
                trace.execution = Some(execution);
            } else {
                warn!(query_id = %execution.query_id, "execution already recorded");
            }
        }
    }

    pub async fn record_feedback(&self, feedback: Feedback) -> bool {
        let mut traces = self.traces.write().await;
        match traces.get_mut(&feedback.query_id) {
            Some(trace) => {
                trace.feedback = Some(feedback);
                true
            }
            None => false,
        }
    }

    /// First write wins; a second outcome for the same query is a bug
    /// upstream and is logged, not applied.
    pub async fn record_outcome(&self, query_id: Uuid, outcome: QueryOutcome) {
        let mut traces = self.traces.write().await;
        if let Some(trace) = traces.get_mut(&query_id) {
            if trace.outcome.is_none() {
                trace.outcome = Some(outcome);
            } else {
                warn!(%query_id, attempted = outcome.label(), "outcome already recorded");
            }
        }
    }

    pub async fn trace(&self, query_id: Uuid) -> Option<QueryTrace> {
        self.traces.read().await.get(&query_id).cloned()
    }

    pub async fn query_count(&self) -> usize {
        self.traces.read().await.len()
    }

    pub async fn metrics_summary(&self) -> MetricsSummary {
        let traces = self.traces.read().await;

        let total = traces.len();
        let mut accepted = 0usize;
        let mut exec_times: Vec<u64> = Vec::new();
        let mut resolved_selections = 0usize;
        let mut top_ranked_picks = 0usize;
        let mut feedback = FeedbackDistribution {
            positive: 0,
            neutral: 0,
            negative: 0,
        };
        let mut outcomes: HashMap<String, usize> = HashMap::new();

        for trace in traces.values() {
            if let Some(outcome) = &trace.outcome {
                *outcomes.entry(outcome.label().to_string()).or_default() += 1;
                if matches!(outcome, QueryOutcome::CompletedExecution { .. }) {
                    accepted += 1;
                }
            }

            if let Some(exec) = &trace.execution {
                if !exec.cached && exec.error.is_none() {
                    exec_times.push(exec.execution_time_ms);
                }
            }

            if let Some(selection) = &trace.selection {
                if let Some(chosen) = selection.interpretation_id {
                    resolved_selections += 1;
                    let top = trace.interpretations.iter().find(|i| i.rank == 0);
                    if top.map(|i| i.id) == Some(chosen) {
                        top_ranked_picks += 1;
                    }
                }
            }

            if let Some(fb) = &trace.feedback {
                match fb.score {
                    FeedbackScore::Positive => feedback.positive += 1,
                    FeedbackScore::Neutral => feedback.neutral += 1,
                    FeedbackScore::Negative => feedback.negative += 1,
                }
            }
        }

        MetricsSummary {
            total_queries: total,
            accepted_queries: accepted,
            success_rate: ratio(accepted, total),
            avg_execution_time_ms: if exec_times.is_empty() {
                0.0
            } else {
                exec_times.iter().sum::<u64>() as f64 / exec_times.len() as f64
            },
            selection_accuracy: ratio(top_ranked_picks, resolved_selections),
            feedback,
            outcomes,
        }
    }
}

impl Default for QueryTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn query(id: Uuid) -> QueryRecord {
        QueryRecord {
            id,
            raw_text: "show top 5 campaigns by spend".to_string(),
            submitted_at: Utc::now(),
            user_id: "analyst-1".to_string(),
            schema_version: 1,
        }
    }

    fn interp(query_id: Uuid, rank: usize, confidence: f64) -> Interpretation {
        Interpretation {
            id: Uuid::new_v4(),
            query_id,
            rank,
            restated_text: format!("interpretation {rank}"),
            confidence,
            rationale: "mentions campaigns.spend".to_string(),
            sql_pattern_hint: "top-N by metric".to_string(),
        }
    }

    #[tokio::test]
    async fn trace_returns_full_chain() {
        let tracker = QueryTracker::new();
        let id = Uuid::new_v4();
        tracker.record_query(query(id)).await;
        let interps = vec![interp(id, 0, 0.9), interp(id, 1, 0.5)];
        let top_id = interps[0].id;
        tracker.record_interpretations(id, interps).await;
        tracker
            .record_selection(Selection {
                query_id: id,
                interpretation_id: Some(top_id),
                method: SelectionMethod::Auto,
                selected_at: Utc::now(),
            })
            .await;
        tracker
            .record_outcome(
                id,
                QueryOutcome::CompletedExecution {
                    row_count: 5,
                    execution_time_ms: 12,
                    error: None,
                    cached: false,
                },
            )
            .await;

        let trace = tracker.trace(id).await.expect("trace exists");
        assert_eq!(trace.interpretations.len(), 2);
        assert!(trace.selection.is_some());
        assert_eq!(trace.outcome.unwrap().label(), "completed_execution");
    }

    #[tokio::test]
    async fn outcome_first_write_wins() {
        let tracker = QueryTracker::new();
        let id = Uuid::new_v4();
        tracker.record_query(query(id)).await;
        tracker
            .record_outcome(id, QueryOutcome::ClarificationAbandoned)
            .await;
        tracker
            .record_outcome(
                id,
                QueryOutcome::ValidationRejected {
                    errors: vec!["unknown_identifier:x".to_string()],
                },
            )
            .await;

        let trace = tracker.trace(id).await.unwrap();
        assert_eq!(trace.outcome.unwrap().label(), "clarification_abandoned");
    }

    #[tokio::test]
    async fn at_most_one_accepted_sql() {
        let tracker = QueryTracker::new();
        let id = Uuid::new_v4();
        tracker.record_query(query(id)).await;
        for status in [
            ValidationStatus::Rejected,
            ValidationStatus::Accepted,
            ValidationStatus::Accepted,
        ] {
            tracker
                .record_generated_sql(GeneratedSql {
                    query_id: id,
                    sql_text: "SELECT name FROM campaigns".to_string(),
                    validation_status: status,
                    validation_errors: Vec::new(),
                })
                .await;
        }

        let trace = tracker.trace(id).await.unwrap();
        let accepted = trace
            .generated_sql
            .iter()
            .filter(|g| g.validation_status == ValidationStatus::Accepted)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(trace.generated_sql.len(), 2);
    }

    #[tokio::test]
    async fn metrics_aggregate_outcomes_and_selection_accuracy() {
        let tracker = QueryTracker::new();

        // Query 1: completed, top interpretation selected.
        let q1 = Uuid::new_v4();
        tracker.record_query(query(q1)).await;
        let interps = vec![interp(q1, 0, 0.9), interp(q1, 1, 0.4)];
        let top = interps[0].id;
        tracker.record_interpretations(q1, interps).await;
        tracker
            .record_selection(Selection {
                query_id: q1,
                interpretation_id: Some(top),
                method: SelectionMethod::Manual,
                selected_at: Utc::now(),
            })
            .await;
        tracker
            .record_execution(ExecutionRecord {
                query_id: q1,
                row_count: 5,
                execution_time_ms: 40,
                error: None,
                cached: false,
            })
            .await;
        tracker
            .record_outcome(
                q1,
                QueryOutcome::CompletedExecution {
                    row_count: 5,
                    execution_time_ms: 40,
                    error: None,
                    cached: false,
                },
            )
            .await;
        tracker
            .record_feedback(Feedback {
                query_id: q1,
                score: FeedbackScore::Positive,
                comment: None,
            })
            .await;

        // Query 2: second-ranked interpretation selected, validation rejected.
        let q2 = Uuid::new_v4();
        tracker.record_query(query(q2)).await;
        let interps = vec![interp(q2, 0, 0.6), interp(q2, 1, 0.5)];
        let second = interps[1].id;
        tracker.record_interpretations(q2, interps).await;
        tracker
            .record_selection(Selection {
                query_id: q2,
                interpretation_id: Some(second),
                method: SelectionMethod::Manual,
                selected_at: Utc::now(),
            })
            .await;
        tracker
            .record_outcome(
                q2,
                QueryOutcome::ValidationRejected {
                    errors: vec!["unknown_identifier:revenue".to_string()],
                },
            )
            .await;

        let metrics = tracker.metrics_summary().await;
        assert_eq!(metrics.total_queries, 2);
        assert_eq!(metrics.accepted_queries, 1);
        assert!((metrics.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((metrics.selection_accuracy - 0.5).abs() < f64::EPSILON);
        assert!((metrics.avg_execution_time_ms - 40.0).abs() < f64::EPSILON);
        assert_eq!(metrics.feedback.positive, 1);
        assert_eq!(metrics.outcomes.get("validation_rejected"), Some(&1));
    }
}
