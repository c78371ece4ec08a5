//! Read-only execution of validated SQL against the data store. Only
//! statements that cleared the validator arrive here; the engine still
//! enforces a wall-clock timeout and a row cap of its own.

pub mod pool;

use duckdb::types::ValueRef;
use pool::DuckDBConnectionManager;
use r2d2::Pool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub summary: ResultSummary,
    pub execution_time_ms: u64,
    pub error: Option<String>,
}

pub struct ExecutionEngine {
    pool: Pool<DuckDBConnectionManager>,
    timeout: Duration,
    row_cap: usize,
    invocations: AtomicU64,
}

impl ExecutionEngine {
    pub fn new(pool: Pool<DuckDBConnectionManager>, timeout: Duration, row_cap: usize) -> Self {
        Self {
            pool,
            timeout,
            row_cap,
            invocations: AtomicU64::new(0),
        }
    }

    /// How many times the engine has actually been invoked. Cache hits never
    /// bump this counter.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Runs one validated statement. Exceeding the row cap truncates and
    /// flags `row_cap_exceeded`; blowing the wall-clock budget flags
    /// `timeout`; store errors land in `error` with an empty summary.
    pub async fn execute(&self, sql: &str) -> ExecutionOutput {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let pool = self.pool.clone();
        let sql = sql.to_string();
        let row_cap = self.row_cap;

        let task = tokio::task::spawn_blocking(move || run_query(&pool, &sql, row_cap));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok((summary, cap_hit)))) => {
                let execution_time_ms = started.elapsed().as_millis() as u64;
                debug!(
                    rows = summary.row_count,
                    ms = execution_time_ms,
                    "query executed"
                );
                ExecutionOutput {
                    summary,
                    execution_time_ms,
                    error: cap_hit.then(|| "row_cap_exceeded".to_string()),
                }
            }
            Ok(Ok(Err(e))) => {
                warn!("data store error: {}", e);
                ExecutionOutput {
                    summary: empty_summary(),
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    error: Some(format!("store_error: {}", e)),
                }
            }
            Ok(Err(join_err)) => {
                warn!("execution task failed: {}", join_err);
                ExecutionOutput {
                    summary: empty_summary(),
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    error: Some("store_error: execution task failed".to_string()),
                }
            }
            Err(_) => {
                // The blocking task keeps running; the timeout is the
                // caller-facing backstop.
                warn!("query exceeded {}ms budget", self.timeout.as_millis());
                ExecutionOutput {
                    summary: empty_summary(),
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    error: Some("timeout".to_string()),
                }
            }
        }
    }
}

fn empty_summary() -> ResultSummary {
    ResultSummary {
        columns: Vec::new(),
        rows: Vec::new(),
        row_count: 0,
        truncated: false,
    }
}

fn run_query(
    pool: &Pool<DuckDBConnectionManager>,
    sql: &str,
    row_cap: usize,
) -> Result<(ResultSummary, bool), String> {
    let conn = pool.get().map_err(|e| e.to_string())?;
    let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;

    let mut rows = stmt.query([]).map_err(|e| e.to_string())?;

    // Column metadata is only available once the statement has executed;
    // reading it earlier panics inside the duckdb bindings.
    let (column_count, columns) = match rows.as_ref() {
        Some(executed) => {
            let count = executed.column_count();
            let mut names = Vec::with_capacity(count);
            for i in 0..count {
                if let Ok(name) = executed.column_name(i) {
                    names.push(name.to_string());
                }
            }
            (count, names)
        }
        None => (0, Vec::new()),
    };
    let mut out: Vec<Vec<Value>> = Vec::new();
    let mut cap_hit = false;

    while let Some(row) = rows.next().map_err(|e| e.to_string())? {
        if out.len() >= row_cap {
            cap_hit = true;
            break;
        }
        let mut record = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let value = row
                .get_ref(i)
                .map(value_to_json)
                .unwrap_or(Value::Null);
            record.push(value);
        }
        out.push(record);
    }

    let row_count = out.len();
    Ok((
        ResultSummary {
            columns,
            rows: out,
            row_count,
            truncated: cap_hit,
        },
        cap_hit,
    ))
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::from(i),
        ValueRef::SmallInt(i) => Value::from(i),
        ValueRef::Int(i) => Value::from(i),
        ValueRef::BigInt(i) => Value::from(i),
        ValueRef::UTinyInt(u) => Value::from(u),
        ValueRef::USmallInt(u) => Value::from(u),
        ValueRef::UInt(u) => Value::from(u),
        ValueRef::UBigInt(u) => Value::from(u),
        ValueRef::HugeInt(i) => Value::from(i.to_string()),
        ValueRef::Float(f) => Value::from(f),
        ValueRef::Double(f) => Value::from(f),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
        other => Value::from(format!("{:?}", other)),
    }
}
