//! Query pipeline orchestration. Stages within one query run strictly in
//! order (interpret → select → synthesize → validate → execute); concurrent
//! queries share nothing but the cache and the schema provider.

pub mod interpret;
pub mod synthesize;

use crate::cache::{self, QueryCache};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::exec::ExecutionEngine;
use crate::llm::{LlmError, LlmManager};
use crate::schema::{SchemaProvider, SchemaSnapshot};
use crate::track::records::{
    ExecutionRecord, GeneratedSql, Interpretation, QueryOutcome, QueryRecord, Selection,
    SelectionMethod, ValidationStatus,
};
use crate::track::QueryTracker;
use crate::validate;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub query_id: Uuid,
    pub interpretations: Vec<Interpretation>,
    /// Present when the pipeline already reached a terminal state inline
    /// (auto-selection or generation failure); otherwise the query is parked
    /// at the disambiguation gate.
    pub outcome: Option<QueryOutcome>,
}

struct PendingQuery {
    interpretations: Vec<Interpretation>,
    schema: Arc<SchemaSnapshot>,
    user_id: String,
}

pub struct QueryPipeline {
    config: PipelineConfig,
    llm: Arc<LlmManager>,
    schema_provider: Arc<SchemaProvider>,
    cache: Arc<QueryCache>,
    engine: Arc<ExecutionEngine>,
    tracker: Arc<QueryTracker>,
    pending: Arc<Mutex<HashMap<Uuid, PendingQuery>>>,
}

impl QueryPipeline {
    pub fn new(
        config: PipelineConfig,
        llm: Arc<LlmManager>,
        schema_provider: Arc<SchemaProvider>,
        engine: Arc<ExecutionEngine>,
        tracker: Arc<QueryTracker>,
    ) -> Self {
        let cache = Arc::new(QueryCache::new(Duration::from_secs(config.cache_ttl_secs)));
        Self {
            config,
            llm,
            schema_provider,
            cache,
            engine,
            tracker,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn tracker(&self) -> &Arc<QueryTracker> {
        &self.tracker
    }

    pub fn schema_provider(&self) -> &Arc<SchemaProvider> {
        &self.schema_provider
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Phase one of the disambiguation protocol. Generates interpretations
    /// and either completes the pipeline inline (auto-selection, generation
    /// failure) or parks the query at the gate until `select_interpretation`
    /// or the timeout resolves it.
    pub async fn submit_query(
        &self,
        raw_text: &str,
        user_id: &str,
        interactive: bool,
    ) -> Result<SubmitResponse, PipelineError> {
        let schema = self.schema_provider.current().await;
        let query_id = Uuid::new_v4();

        self.tracker
            .record_query(QueryRecord {
                id: query_id,
                raw_text: raw_text.to_string(),
                submitted_at: Utc::now(),
                user_id: user_id.to_string(),
                schema_version: schema.version,
            })
            .await;

        let interpretations =
            match interpret::generate(&self.llm, user_id, query_id, raw_text, &schema).await {
                Ok(interps) => interps,
                Err(interpret::RateLimited) => {
                    self.tracker
                        .record_outcome(
                            query_id,
                            QueryOutcome::GenerationFailed {
                                reason: "rate_limited".to_string(),
                            },
                        )
                        .await;
                    return Err(PipelineError::RateLimited);
                }
            };

        self.tracker
            .record_interpretations(query_id, interpretations.clone())
            .await;

        // The degraded fallback short-circuits the rest of the pipeline.
        if interpretations.len() == 1
            && interpretations[0].rationale == interpret::GENERATION_FAILED
        {
            let outcome = QueryOutcome::GenerationFailed {
                reason: "text_generation_unavailable".to_string(),
            };
            self.tracker.record_outcome(query_id, outcome.clone()).await;
            warn!(%query_id, "interpretation generation failed; query terminated");
            return Ok(SubmitResponse {
                query_id,
                interpretations,
                outcome: Some(outcome),
            });
        }

        let top = &interpretations[0];
        if !interactive && top.confidence >= self.config.auto_select_threshold {
            info!(%query_id, confidence = top.confidence, "auto-selecting top interpretation");
            self.tracker
                .record_selection(Selection {
                    query_id,
                    interpretation_id: Some(top.id),
                    method: SelectionMethod::Auto,
                    selected_at: Utc::now(),
                })
                .await;
            let outcome = self
                .run_selected(query_id, user_id, top.clone(), schema)
                .await;
            return Ok(SubmitResponse {
                query_id,
                interpretations,
                outcome: Some(outcome),
            });
        }

        self.pending.lock().await.insert(
            query_id,
            PendingQuery {
                interpretations: interpretations.clone(),
                schema,
                user_id: user_id.to_string(),
            },
        );
        self.spawn_gate_timeout(query_id);

        Ok(SubmitResponse {
            query_id,
            interpretations,
            outcome: None,
        })
    }

    /// Phase two. `choice = None` abandons the query; an index selects the
    /// interpretation and drives the rest of the pipeline to its terminal
    /// state.
    pub async fn select_interpretation(
        &self,
        query_id: Uuid,
        choice: Option<usize>,
    ) -> Result<QueryOutcome, PipelineError> {
        let entry = {
            let mut pending = self.pending.lock().await;
            let Some(entry) = pending.get(&query_id) else {
                return if self.tracker.trace(query_id).await.is_some() {
                    Err(PipelineError::NotPending(query_id))
                } else {
                    Err(PipelineError::UnknownQuery(query_id))
                };
            };
            if let Some(idx) = choice {
                if idx >= entry.interpretations.len() {
                    // Leave the query pending so the caller can pick again
                    // within the timeout window.
                    return Err(PipelineError::SelectionOutOfRange {
                        choice: idx,
                        len: entry.interpretations.len(),
                    });
                }
            }
            pending.remove(&query_id).expect("checked above")
        };

        match choice {
            None => {
                self.tracker
                    .record_selection(Selection {
                        query_id,
                        interpretation_id: None,
                        method: SelectionMethod::None,
                        selected_at: Utc::now(),
                    })
                    .await;
                let outcome = QueryOutcome::ClarificationAbandoned;
                self.tracker.record_outcome(query_id, outcome.clone()).await;
                info!(%query_id, "clarification abandoned by caller");
                Ok(outcome)
            }
            Some(idx) => {
                let interpretation = entry.interpretations[idx].clone();
                self.tracker
                    .record_selection(Selection {
                        query_id,
                        interpretation_id: Some(interpretation.id),
                        method: SelectionMethod::Manual,
                        selected_at: Utc::now(),
                    })
                    .await;
                Ok(self
                    .run_selected(query_id, &entry.user_id, interpretation, entry.schema)
                    .await)
            }
        }
    }

    fn spawn_gate_timeout(&self, query_id: Uuid) {
        let pending = Arc::clone(&self.pending);
        let tracker = Arc::clone(&self.tracker);
        let timeout = Duration::from_secs(self.config.disambiguation_timeout_secs);

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if pending.lock().await.remove(&query_id).is_some() {
                tracker
                    .record_selection(Selection {
                        query_id,
                        interpretation_id: None,
                        method: SelectionMethod::None,
                        selected_at: Utc::now(),
                    })
                    .await;
                tracker
                    .record_outcome(query_id, QueryOutcome::ClarificationAbandoned)
                    .await;
                info!(%query_id, "disambiguation timed out; clarification abandoned");
            }
        });
    }

    /// Cache lookup keyed on the interpretation fingerprint; on a miss,
    /// synthesis, validation and a single execution run under the
    /// per-fingerprint lock. Hits replay the stored summary without touching
    /// the engine.
    async fn run_selected(
        &self,
        query_id: Uuid,
        caller: &str,
        interpretation: Interpretation,
        schema: Arc<SchemaSnapshot>,
    ) -> QueryOutcome {
        let fp = cache::fingerprint(&interpretation.restated_text, schema.version);

        let result = self
            .cache
            .get_or_compute(&fp, || async {
                let sql = match synthesize::synthesize(
                    &self.llm,
                    caller,
                    &interpretation,
                    &schema,
                )
                .await
                {
                    Ok(sql) => sql,
                    Err(synthesize::SynthesisError::Rejected { errors, raw }) => {
                        self.tracker
                            .record_generated_sql(GeneratedSql {
                                query_id,
                                sql_text: raw,
                                validation_status: ValidationStatus::Rejected,
                                validation_errors: errors.clone(),
                            })
                            .await;
                        return Err(QueryOutcome::SynthesisRejected { errors });
                    }
                    Err(synthesize::SynthesisError::Llm(LlmError::RateLimited)) => {
                        return Err(QueryOutcome::GenerationFailed {
                            reason: "rate_limited".to_string(),
                        });
                    }
                    Err(synthesize::SynthesisError::Llm(e)) => {
                        return Err(QueryOutcome::GenerationFailed {
                            reason: format!("synthesis: {}", e),
                        });
                    }
                };

                match validate::validate(&sql, &schema) {
                    Ok(()) => {
                        self.tracker
                            .record_generated_sql(GeneratedSql {
                                query_id,
                                sql_text: sql.clone(),
                                validation_status: ValidationStatus::Accepted,
                                validation_errors: Vec::new(),
                            })
                            .await;
                    }
                    Err(errors) => {
                        self.tracker
                            .record_generated_sql(GeneratedSql {
                                query_id,
                                sql_text: sql.clone(),
                                validation_status: ValidationStatus::Rejected,
                                validation_errors: errors.clone(),
                            })
                            .await;
                        warn!(%query_id, ?errors, "validation rejected statement");
                        return Err(QueryOutcome::ValidationRejected { errors });
                    }
                }

                let output = self.engine.execute(&sql).await;
                self.tracker
                    .record_execution(ExecutionRecord {
                        query_id,
                        row_count: output.summary.row_count,
                        execution_time_ms: output.execution_time_ms,
                        error: output.error.clone(),
                        cached: false,
                    })
                    .await;

                if let Some(err) = output.error {
                    // A flagged execution is terminal and is not cached.
                    return Err(QueryOutcome::CompletedExecution {
                        row_count: output.summary.row_count,
                        execution_time_ms: output.execution_time_ms,
                        error: Some(err),
                        cached: false,
                    });
                }

                Ok((sql, output.summary))
            })
            .await;

        let outcome = match result {
            Ok((entry, true)) => {
                // Replayed from cache: record the chain, skip the engine.
                self.tracker
                    .record_generated_sql(GeneratedSql {
                        query_id,
                        sql_text: entry.sql_text.clone(),
                        validation_status: ValidationStatus::Accepted,
                        validation_errors: Vec::new(),
                    })
                    .await;
                self.tracker
                    .record_execution(ExecutionRecord {
                        query_id,
                        row_count: entry.result_summary.row_count,
                        execution_time_ms: 0,
                        error: None,
                        cached: true,
                    })
                    .await;
                QueryOutcome::CompletedExecution {
                    row_count: entry.result_summary.row_count,
                    execution_time_ms: 0,
                    error: None,
                    cached: true,
                }
            }
            Ok((entry, false)) => {
                let execution_time_ms = self
                    .tracker
                    .trace(query_id)
                    .await
                    .and_then(|t| t.execution)
                    .map(|e| e.execution_time_ms)
                    .unwrap_or(0);
                QueryOutcome::CompletedExecution {
                    row_count: entry.result_summary.row_count,
                    execution_time_ms,
                    error: None,
                    cached: false,
                }
            }
            Err(outcome) => outcome,
        };

        self.tracker.record_outcome(query_id, outcome.clone()).await;
        outcome
    }
}
