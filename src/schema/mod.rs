use duckdb::Connection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

/// An immutable, versioned view of the queryable tables. A query holds one
/// `Arc<SchemaSnapshot>` end-to-end, so a concurrent schema refresh never
/// changes what an in-flight query sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub version: u64,
    pub tables: Vec<TableInfo>,
}

impl SchemaSnapshot {
    pub fn new(version: u64, tables: Vec<TableInfo>) -> Self {
        Self { version, tables }
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// True when any table carries a column with this name.
    pub fn has_column(&self, name: &str) -> bool {
        self.tables.iter().any(|t| {
            t.columns
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(name))
        })
    }

    pub fn has_table_column(&self, table: &str, column: &str) -> bool {
        self.table(table)
            .map(|t| {
                t.columns
                    .iter()
                    .any(|c| c.name.eq_ignore_ascii_case(column))
            })
            .unwrap_or(false)
    }

    /// Renders the `table(col type, col type)` enumeration handed to the
    /// text-generation prompts. Only names from this catalog may appear in
    /// synthesized SQL.
    pub fn prompt_catalog(&self) -> String {
        self.tables
            .iter()
            .map(|t| {
                let cols = t
                    .columns
                    .iter()
                    .map(|c| format!("{} {}", c.name, c.data_type))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{}({})", t.name, cols)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Publishes schema snapshots. Writers replace the current snapshot
/// atomically; readers clone the `Arc` and keep reading the old version
/// until they finish.
pub struct SchemaProvider {
    current: RwLock<Arc<SchemaSnapshot>>,
}

impl SchemaProvider {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(SchemaSnapshot::new(0, Vec::new()))),
        }
    }

    pub async fn current(&self) -> Arc<SchemaSnapshot> {
        self.current.read().await.clone()
    }

    /// Publishes a new snapshot with a bumped version. Cache entries keyed
    /// on the old version become unreachable through the fingerprint.
    pub async fn publish(&self, tables: Vec<TableInfo>) -> Arc<SchemaSnapshot> {
        let mut guard = self.current.write().await;
        let next = Arc::new(SchemaSnapshot::new(guard.version + 1, tables));
        *guard = next.clone();
        info!(
            version = next.version,
            tables = next.tables.len(),
            "published schema snapshot"
        );
        next
    }

    /// Re-introspects the data store and publishes the result. Skips the
    /// publish (keeping the current version) when nothing changed, so cache
    /// entries stay valid across no-op refreshes.
    pub async fn refresh_from_store(
        &self,
        connection_string: &str,
    ) -> Result<Arc<SchemaSnapshot>, Box<dyn std::error::Error + Send + Sync>> {
        let conn_str = connection_string.to_string();

        let tables = tokio::task::spawn_blocking(move || introspect(&conn_str)).await??;

        let current = self.current().await;
        if current.tables == tables && current.version > 0 {
            debug!("schema unchanged, keeping version {}", current.version);
            return Ok(current);
        }

        Ok(self.publish(tables).await)
    }
}

impl Default for SchemaProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads table and column metadata out of DuckDB's information_schema.
fn introspect(
    connection_string: &str,
) -> Result<Vec<TableInfo>, Box<dyn std::error::Error + Send + Sync>> {
    let conn = Connection::open(connection_string)?;

    let mut stmt = conn.prepare(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema NOT IN ('information_schema', 'pg_catalog') \
         ORDER BY table_name",
    )?;
    let table_names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .filter_map(Result::ok)
        .collect();

    let mut tables = Vec::with_capacity(table_names.len());
    for table_name in &table_names {
        let mut col_stmt = conn.prepare(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_name = ? ORDER BY ordinal_position",
        )?;
        let columns: Vec<ColumnInfo> = col_stmt
            .query_map([table_name], |row| {
                Ok(ColumnInfo {
                    name: row.get::<_, String>(0)?,
                    data_type: row.get::<_, String>(1)?,
                })
            })?
            .filter_map(Result::ok)
            .collect();

        tables.push(TableInfo {
            name: table_name.clone(),
            columns,
        });
    }

    debug!("introspected {} tables", tables.len());
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campaigns_snapshot() -> SchemaSnapshot {
        SchemaSnapshot::new(
            3,
            vec![TableInfo {
                name: "campaigns".to_string(),
                columns: vec![
                    ColumnInfo {
                        name: "name".to_string(),
                        data_type: "VARCHAR".to_string(),
                    },
                    ColumnInfo {
                        name: "spend".to_string(),
                        data_type: "DOUBLE".to_string(),
                    },
                ],
            }],
        )
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let snap = campaigns_snapshot();
        assert!(snap.has_table("CAMPAIGNS"));
        assert!(snap.has_column("Spend"));
        assert!(snap.has_table_column("campaigns", "NAME"));
        assert!(!snap.has_table_column("campaigns", "budget"));
        assert!(!snap.has_table("channels"));
    }

    #[test]
    fn prompt_catalog_lists_tables_and_columns() {
        let snap = campaigns_snapshot();
        assert_eq!(snap.prompt_catalog(), "campaigns(name VARCHAR, spend DOUBLE)");
    }

    #[tokio::test]
    async fn publish_bumps_version_and_old_arcs_survive() {
        let provider = SchemaProvider::new();
        let before = provider.current().await;
        assert_eq!(before.version, 0);

        let after = provider.publish(campaigns_snapshot().tables).await;
        assert_eq!(after.version, 1);
        // The earlier snapshot is still readable by whoever holds it.
        assert_eq!(before.version, 0);
        assert_eq!(provider.current().await.version, 1);
    }
}
