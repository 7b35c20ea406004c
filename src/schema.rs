//! Schema planner: derives the fixed column layout from a key catalog and
//! renders/applies the target table DDL.

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::catalog::KeyCatalog;

/// Fixed column layout for the flattened target schema. Derivation from a
/// catalog is a pure function; catalog invariants (unique, sorted keys) are
/// enforced when a catalog is built or loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaPlan {
    int_columns: usize,
    float_columns: usize,
}

impl SchemaPlan {
    pub fn from_catalog(catalog: &KeyCatalog) -> Self {
        Self {
            int_columns: catalog.int_key_count(),
            float_columns: catalog.float_key_count(),
        }
    }

    pub fn int_columns(&self) -> usize {
        self.int_columns
    }

    pub fn float_columns(&self) -> usize {
        self.float_columns
    }

    /// Metric column names in slot order: `int1..intN`, then
    /// `float1..floatM`.
    pub fn column_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.int_columns + self.float_columns);
        for i in 1..=self.int_columns {
            names.push(format!("int{i}"));
        }
        for i in 1..=self.float_columns {
            names.push(format!("float{i}"));
        }
        names
    }

    /// Column name for an integer slot index.
    pub fn int_column_name(slot: usize) -> String {
        format!("int{}", slot + 1)
    }

    /// Column name for a float slot index.
    pub fn float_column_name(slot: usize) -> String {
        format!("float{}", slot + 1)
    }

    /// Renders the CREATE TABLE DDL for the flattened target table.
    pub fn create_table_ddl(&self, table: &str) -> String {
        let mut columns = vec![
            "timestampMs DateTime64(3) CODEC(ZSTD(1))".to_string(),
            "customerId Int32 CODEC(ZSTD(1))".to_string(),
            "clientId String CODEC(ZSTD(1))".to_string(),
            "sessionId Int64 CODEC(ZSTD(1))".to_string(),
            "platform LowCardinality(String) CODEC(ZSTD(1))".to_string(),
            "appName LowCardinality(String) CODEC(ZSTD(1))".to_string(),
            "appVersion LowCardinality(String) CODEC(ZSTD(1))".to_string(),
            "userId String DEFAULT '' CODEC(ZSTD(1))".to_string(),
            "deviceName LowCardinality(String) DEFAULT '' CODEC(ZSTD(1))".to_string(),
            "deviceModel LowCardinality(String) DEFAULT '' CODEC(ZSTD(1))".to_string(),
            "deviceOperatingSystem LowCardinality(String) DEFAULT '' CODEC(ZSTD(1))".to_string(),
            "countryIso LowCardinality(String) CODEC(ZSTD(1))".to_string(),
            "isp Int32 DEFAULT 0 CODEC(ZSTD(1))".to_string(),
            "asn Int32 DEFAULT 0 CODEC(ZSTD(1))".to_string(),
            "connType Int32 DEFAULT 0 CODEC(ZSTD(1))".to_string(),
        ];

        for i in 1..=self.int_columns {
            columns.push(format!("int{i} Int32 DEFAULT 0 CODEC(ZSTD(1))"));
        }
        for i in 1..=self.float_columns {
            columns.push(format!("float{i} Float32 DEFAULT 0 CODEC(ZSTD(1))"));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n    {}\n) ENGINE = MergeTree()\n\
             PARTITION BY toYYYYMM(timestampMs)\n\
             ORDER BY (customerId, clientId, sessionId, timestampMs)\n\
             SETTINGS index_granularity = 8192;",
            columns.join(",\n    "),
        )
    }
}

/// Applies the planned schema to the target store, optionally dropping an
/// existing table first (destructive full-restart switch).
pub async fn apply_schema(
    pool: &Pool,
    plan: &SchemaPlan,
    table: &str,
    drop_first: bool,
) -> Result<()> {
    let mut handle = pool
        .get_handle()
        .await
        .context("getting ClickHouse handle for schema DDL")?;

    if drop_first {
        handle
            .execute(format!("DROP TABLE IF EXISTS {table}").as_str())
            .await
            .context("dropping existing target table")?;
        tracing::info!(table, "dropped existing target table");
    }

    let ddl = plan.create_table_ddl(table);
    for statement in split_statements(&ddl) {
        handle.execute(statement).await.with_context(|| {
            let preview: String = statement.chars().take(80).collect();
            format!("executing DDL statement: {preview}...")
        })?;
    }

    tracing::info!(
        table,
        int_columns = plan.int_columns(),
        float_columns = plan.float_columns(),
        "target table created",
    );

    Ok(())
}

/// Splits SQL text into individual statements by semicolons.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::model::TimeWindow;

    use super::*;

    fn catalog(int: &[&str], float: &[&str]) -> KeyCatalog {
        let window = TimeWindow::new(0, 60_000).unwrap();
        let int: BTreeSet<String> = int.iter().map(|s| s.to_string()).collect();
        let float: BTreeSet<String> = float.iter().map(|s| s.to_string()).collect();
        KeyCatalog::build(window, int, float)
    }

    #[test]
    fn test_plan_counts_follow_catalog() {
        let plan = SchemaPlan::from_catalog(&catalog(&["a", "b", "c"], &["x"]));
        assert_eq!(plan.int_columns(), 3);
        assert_eq!(plan.float_columns(), 1);
        assert_eq!(plan.column_names(), vec!["int1", "int2", "int3", "float1"]);
    }

    #[test]
    fn test_zero_float_columns_is_legal() {
        let plan = SchemaPlan::from_catalog(&catalog(&["a"], &[]));
        assert_eq!(plan.float_columns(), 0);
        assert_eq!(plan.column_names(), vec!["int1"]);
    }

    #[test]
    fn test_slot_to_column_name() {
        assert_eq!(SchemaPlan::int_column_name(0), "int1");
        assert_eq!(SchemaPlan::float_column_name(2), "float3");
    }

    #[test]
    fn test_ddl_contains_metric_columns() {
        let plan = SchemaPlan::from_catalog(&catalog(&["a", "b"], &["x"]));
        let ddl = plan.create_table_ddl("db.flat");

        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS db.flat"));
        assert!(ddl.contains("int1 Int32 DEFAULT 0"));
        assert!(ddl.contains("int2 Int32 DEFAULT 0"));
        assert!(!ddl.contains("int3"));
        assert!(ddl.contains("float1 Float32 DEFAULT 0"));
        assert!(ddl.contains("ORDER BY (customerId, clientId, sessionId, timestampMs)"));
    }

    #[test]
    fn test_split_statements() {
        let sql = "CREATE TABLE foo (id Int32); CREATE TABLE bar (id Int32);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[1].starts_with("CREATE TABLE bar"));
        assert!(split_statements("").is_empty());
        assert_eq!(split_statements("SELECT 1;;;").len(), 1);
    }
}
