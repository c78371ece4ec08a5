//! Constrained SQL synthesis. The prompt enumerates the schema snapshot's
//! tables and columns so the model has no legitimate reason to reference
//! anything else; ambiguous output is rejected, never repaired.

use crate::llm::providers::extract_fenced;
use crate::llm::{LlmError, LlmManager};
use crate::schema::SchemaSnapshot;
use crate::track::records::Interpretation;
use tracing::{debug, warn};

pub const MULTI_STATEMENT_OR_NON_SQL: &str = "multi_statement_or_non_sql";

#[derive(Debug)]
pub enum SynthesisError {
    /// Output was more than one statement or not SQL. Terminal, no retry.
    /// The raw model output rides along for the audit trail.
    Rejected { errors: Vec<String>, raw: String },
    /// The text-generation call itself failed.
    Llm(LlmError),
}

fn synthesis_prompt(interpretation: &Interpretation, schema: &SchemaSnapshot) -> String {
    format!(
        r#"### Instructions:
Write exactly one DuckDB SELECT statement answering the request below.
Only the tables and columns listed here exist; reference nothing else:
{}

Request: {}
Shape hint: {}

### Response:
Reply with only the SQL statement:
```sql
"#,
        schema.prompt_catalog(),
        interpretation.restated_text,
        interpretation.sql_pattern_hint,
    )
}

/// True when a `;` appears outside single-quoted string literals.
fn semicolon_outside_literals(sql: &str) -> bool {
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\'' => {
                i += 1;
                while i < chars.len() {
                    if chars[i] == '\'' {
                        if i + 1 < chars.len() && chars[i + 1] == '\'' {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            ';' => return true,
            _ => i += 1,
        }
    }
    false
}

/// Pulls one statement out of the raw model output. A single trailing
/// semicolon is tolerated; anything that leaves a terminator behind, or that
/// does not start with SELECT, is rejected.
pub fn extract_statement(raw: &str) -> Result<String, Vec<String>> {
    let mut sql = extract_fenced(raw).replace('`', "").trim().to_string();

    if let Some(stripped) = sql.strip_suffix(';') {
        sql = stripped.trim_end().to_string();
    }

    if sql.is_empty() || semicolon_outside_literals(&sql) {
        return Err(vec![MULTI_STATEMENT_OR_NON_SQL.to_string()]);
    }

    let first_word = sql
        .split_whitespace()
        .next()
        .map(|w| w.to_ascii_uppercase())
        .unwrap_or_default();
    if first_word != "SELECT" {
        return Err(vec![MULTI_STATEMENT_OR_NON_SQL.to_string()]);
    }

    Ok(sql)
}

/// One synthesis call for the selected interpretation. Transport errors are
/// surfaced for the caller's retry policy; malformed SQL output is terminal.
pub async fn synthesize(
    llm: &LlmManager,
    caller: &str,
    interpretation: &Interpretation,
    schema: &SchemaSnapshot,
) -> Result<String, SynthesisError> {
    let prompt = synthesis_prompt(interpretation, schema);

    let raw = llm
        .generate(caller, &prompt)
        .await
        .map_err(SynthesisError::Llm)?;

    match extract_statement(&raw) {
        Ok(sql) => {
            debug!(query_id = %interpretation.query_id, "synthesized statement");
            Ok(sql)
        }
        Err(errors) => {
            warn!(query_id = %interpretation.query_id, "synthesis rejected: {:?}", errors);
            Err(SynthesisError::Rejected { errors, raw })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_select() {
        let raw = "Here it is:\n```sql\nSELECT name FROM campaigns ORDER BY spend DESC LIMIT 5\n```";
        let sql = extract_statement(raw).unwrap();
        assert!(sql.starts_with("SELECT"));
        assert!(!sql.contains('`'));
    }

    #[test]
    fn tolerates_single_trailing_semicolon() {
        let sql = extract_statement("SELECT name FROM campaigns;").unwrap();
        assert_eq!(sql, "SELECT name FROM campaigns");
    }

    #[test]
    fn rejects_two_statements() {
        let err =
            extract_statement("SELECT name FROM campaigns; DROP TABLE campaigns;").unwrap_err();
        assert_eq!(err, vec![MULTI_STATEMENT_OR_NON_SQL.to_string()]);
    }

    #[test]
    fn allows_semicolon_inside_literal() {
        let sql = extract_statement("SELECT name FROM campaigns WHERE name = 'a;b'").unwrap();
        assert!(sql.contains("'a;b'"));
    }

    #[test]
    fn rejects_prose_output() {
        let err = extract_statement("I am not able to write that query.").unwrap_err();
        assert_eq!(err, vec![MULTI_STATEMENT_OR_NON_SQL.to_string()]);
    }

    #[test]
    fn rejects_empty_output() {
        assert!(extract_statement("").is_err());
        assert!(extract_statement("```sql\n```").is_err());
    }
}
