//! Interpretation generation: one text-generation call producing 3-5 ranked
//! restatements of the raw question, with bounded retries and a fallback
//! that lets the rest of the pipeline short-circuit gracefully.

use crate::llm::providers::extract_fenced;
use crate::llm::{LlmError, LlmManager};
use crate::schema::SchemaSnapshot;
use crate::track::records::Interpretation;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const GENERATION_FAILED: &str = "generation_failed";

const MAX_RETRIES: u32 = 2;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// The only error `generate` surfaces; every other failure degrades to the
/// fallback interpretation after retries.
#[derive(Debug, PartialEq, Eq)]
pub struct RateLimited;

#[derive(Debug, Deserialize)]
struct Candidate {
    restated: String,
    confidence: f64,
    rationale: String,
    #[serde(default)]
    sql_hint: String,
}

fn interpretation_prompt(question: &str, schema: &SchemaSnapshot) -> String {
    format!(
        r#"### Instructions:
An analyst asked a question about campaign data. Produce 3 to 5 candidate
interpretations of the question against the schema below. For each candidate
give a restated version of the question, a confidence between 0 and 1, a short
rationale naming the tables/columns it implies, and a hint at the SQL shape
(for example "top-N by metric" or "period-over-period delta").

### Schema:
{}

### Question:
{}

### Response:
Reply with only a JSON array, no prose:
[{{"restated": "...", "confidence": 0.9, "rationale": "...", "sql_hint": "..."}}]
"#,
        schema.prompt_catalog(),
        question
    )
}

fn parse_candidates(raw: &str) -> Option<Vec<Candidate>> {
    let payload = extract_fenced(raw);
    let candidates: Vec<Candidate> = serde_json::from_str(&payload).ok()?;
    if candidates.is_empty() {
        return None;
    }
    Some(candidates)
}

fn to_interpretations(query_id: Uuid, mut candidates: Vec<Candidate>) -> Vec<Interpretation> {
    for c in &mut candidates {
        c.confidence = c.confidence.clamp(0.0, 1.0);
    }
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(5);

    candidates
        .into_iter()
        .enumerate()
        .map(|(rank, c)| Interpretation {
            id: Uuid::new_v4(),
            query_id,
            rank,
            restated_text: c.restated,
            confidence: c.confidence,
            rationale: c.rationale,
            sql_pattern_hint: c.sql_hint,
        })
        .collect()
}

fn fallback(query_id: Uuid, question: &str) -> Vec<Interpretation> {
    vec![Interpretation {
        id: Uuid::new_v4(),
        query_id,
        rank: 0,
        restated_text: question.to_string(),
        confidence: 0.1,
        rationale: GENERATION_FAILED.to_string(),
        sql_pattern_hint: String::new(),
    }]
}

/// Asks the text-generation client for candidate interpretations. Malformed
/// or empty output is retried up to twice with exponential backoff (base
/// 500 ms); rate limiting is surfaced immediately and never retried. Once
/// retries are exhausted the single low-confidence fallback interpretation
/// is returned so callers can terminate the query as a generation failure.
pub async fn generate(
    llm: &LlmManager,
    caller: &str,
    query_id: Uuid,
    question: &str,
    schema: &SchemaSnapshot,
) -> Result<Vec<Interpretation>, RateLimited> {
    let prompt = interpretation_prompt(question, schema);

    for attempt in 0..=MAX_RETRIES {
        match llm.generate(caller, &prompt).await {
            Ok(raw) => match parse_candidates(&raw) {
                Some(candidates) => return Ok(to_interpretations(query_id, candidates)),
                None => {
                    warn!(%query_id, attempt, "malformed interpretation output");
                }
            },
            Err(LlmError::RateLimited) => return Err(RateLimited),
            Err(e) => {
                warn!(%query_id, attempt, "interpretation generation failed: {}", e);
            }
        }

        if attempt < MAX_RETRIES {
            let delay = BACKOFF_BASE * 2u32.pow(attempt);
            debug!(%query_id, ?delay, "retrying interpretation generation");
            tokio::time::sleep(delay).await;
        }
    }

    Ok(fallback(query_id, question))
}
