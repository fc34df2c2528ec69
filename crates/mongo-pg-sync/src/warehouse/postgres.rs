//! PostgreSQL warehouse connections.

use async_trait::async_trait;
use deadpool::managed::{self, Metrics, RecycleError, RecycleResult};
use deadpool_postgres::{ClientWrapper, Manager, ManagerConfig, RecyclingMethod};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, info, warn};

use super::tls::{make_tls_connector, SslMode};
use super::{UpsertCounts, WarehouseConnection};
use crate::config::TargetConfig;
use crate::core::{ColumnKind, EntityType, Row, SqlValue, ORIGIN_ID_COLUMN, SURROGATE_ID_COLUMN};
use crate::error::{Result, SyncError};

/// Rows per INSERT statement. Keeps statements well under the protocol limits
/// while amortizing round trips.
pub const UPSERT_CHUNK_ROWS: usize = 500;

/// `deadpool` manager producing [`PgConnection`]s.
///
/// Connection setup and fast recycling are delegated to `deadpool-postgres`.
pub struct PgConnectionManager {
    inner: Manager,
    schema: String,
    endpoint: String,
}

impl PgConnectionManager {
    pub fn new(config: &TargetConfig) -> Result<Self> {
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let ssl_mode = SslMode::parse(&config.ssl_mode)?;
        let inner = match make_tls_connector(ssl_mode)? {
            Some(tls) => Manager::from_config(config.pg_config(), tls, mgr_config),
            None => Manager::from_config(config.pg_config(), NoTls, mgr_config),
        };

        let endpoint = format!("{}:{}/{}", config.host, config.port, config.database);
        info!("PostgreSQL target: {} (sslmode={})", endpoint, ssl_mode);

        Ok(Self {
            inner,
            schema: config.schema.clone(),
            endpoint,
        })
    }
}

impl managed::Manager for PgConnectionManager {
    type Type = PgConnection;
    type Error = SyncError;

    async fn create(&self) -> Result<PgConnection> {
        let client = managed::Manager::create(&self.inner).await?;
        debug!("Opened warehouse connection to {}", self.endpoint);
        Ok(PgConnection {
            client,
            schema: self.schema.clone(),
        })
    }

    async fn recycle(&self, conn: &mut PgConnection, metrics: &Metrics) -> RecycleResult<SyncError> {
        match managed::Manager::recycle(&self.inner, &mut conn.client, metrics).await {
            Ok(()) => Ok(()),
            Err(RecycleError::Backend(e)) => Err(RecycleError::Backend(SyncError::Target(e))),
            Err(other) => Err(RecycleError::Backend(SyncError::pool(
                other.to_string(),
                "recycling warehouse connection",
            ))),
        }
    }
}

/// One PostgreSQL session.
pub struct PgConnection {
    client: ClientWrapper,
    schema: String,
}

#[async_trait]
impl WarehouseConnection for PgConnection {
    async fn upsert_batch(&mut self, entity: EntityType, rows: &[Row]) -> Result<UpsertCounts> {
        if rows.is_empty() {
            return Ok(UpsertCounts::default());
        }

        let client: &mut Client = &mut self.client;
        let tx = client.transaction().await?;

        let mut counts = UpsertCounts::default();
        for chunk in rows.chunks(UPSERT_CHUNK_ROWS) {
            let sql = build_upsert_sql(&self.schema, entity, chunk);
            let messages = tx.simple_query(&sql).await.map_err(|e| {
                warn!("Upsert into {} failed: {}", entity.table(), e);
                SyncError::Target(e)
            })?;

            for message in messages {
                if let SimpleQueryMessage::Row(row) = message {
                    match row.get(0) {
                        Some("t") => counts.inserted += 1,
                        Some(_) => counts.updated += 1,
                        None => {}
                    }
                }
            }
        }

        // Dropping an uncommitted transaction rolls it back
        tx.commit().await?;

        counts.unchanged = (rows.len() as u64).saturating_sub(counts.inserted + counts.updated);
        Ok(counts)
    }

    async fn ping(&mut self) -> Result<()> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.client.is_closed()
    }
}

/// Build one `INSERT ... ON CONFLICT` statement with literal values.
///
/// Rows whose mutable columns already match are skipped by the `WHERE` on the
/// update, so they neither bump `xmax` nor appear in `RETURNING`. The returned
/// column is `t` for inserts and `f` for updates.
///
/// `rows` must not repeat an `origin_id`.
pub fn build_upsert_sql(schema: &str, entity: EntityType, rows: &[Row]) -> String {
    let columns = entity.columns();

    let mut col_list = vec![quote_ident(ORIGIN_ID_COLUMN)];
    col_list.extend(columns.iter().map(|c| quote_ident(c.name)));

    let value_rows: Vec<String> = rows
        .iter()
        .map(|row| {
            let mut values = Vec::with_capacity(columns.len() + 1);
            values.push(quote_literal(&row.origin_id));
            for (column, value) in columns.iter().zip(&row.values) {
                values.push(match column.kind {
                    ColumnKind::Value(_) => sql_value_to_literal(value),
                    ColumnKind::Reference(target) => reference_lookup(schema, target, value),
                });
            }
            format!("({})", values.join(", "))
        })
        .collect();

    let update_cols: Vec<String> = columns
        .iter()
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c.name), quote_ident(c.name)))
        .collect();

    let change_detection: Vec<String> = columns
        .iter()
        .map(|c| {
            format!(
                "t.{} IS DISTINCT FROM EXCLUDED.{}",
                quote_ident(c.name),
                quote_ident(c.name)
            )
        })
        .collect();

    format!(
        "INSERT INTO {} AS t ({}) VALUES {} ON CONFLICT ({}) DO UPDATE SET {} WHERE {} RETURNING (xmax = 0)",
        qualify_table(schema, entity.table()),
        col_list.join(", "),
        value_rows.join(", "),
        quote_ident(ORIGIN_ID_COLUMN),
        update_cols.join(", "),
        change_detection.join(" OR ")
    )
}

/// Scalar subquery resolving a source id to the referenced row's surrogate id.
fn reference_lookup(schema: &str, target: EntityType, value: &SqlValue) -> String {
    match value.as_str() {
        Some(origin_id) => format!(
            "(SELECT {} FROM {} WHERE {} = {})",
            quote_ident(SURROGATE_ID_COLUMN),
            qualify_table(schema, target.table()),
            quote_ident(ORIGIN_ID_COLUMN),
            quote_literal(origin_id)
        ),
        None => "NULL".to_string(),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn qualify_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Quote a string literal. Assumes `standard_conforming_strings = on`.
///
/// PostgreSQL text cannot hold NUL, so it is dropped from free text. Ids
/// containing it never get here: the transformer rejects them.
fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\0', "").replace('\'', "''"))
}

/// Convert SqlValue to SQL literal string.
fn sql_value_to_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null(_) => "NULL".to_string(),
        SqlValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        SqlValue::I32(n) => n.to_string(),
        SqlValue::I64(n) => n.to_string(),
        SqlValue::F64(n) if n.is_finite() => format!("{}::double precision", n),
        SqlValue::F64(_) => "'NaN'::double precision".to_string(),
        SqlValue::String(s) => quote_literal(s),
        SqlValue::Decimal(d) => format!("{}::numeric", d),
        SqlValue::DateTime(dt) => format!("'{}'::timestamp", dt.format("%Y-%m-%d %H:%M:%S%.6f")),
        SqlValue::Date(d) => format!("'{}'::date", d),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlNullType;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn sale_row(id: &str, customer: Option<&str>) -> Row {
        Row::new(
            id,
            vec![
                SqlValue::opt_string(customer.map(str::to_string)),
                SqlValue::Null(SqlNullType::String),
                SqlValue::String("confirmada".into()),
                SqlValue::Decimal(Decimal::from_str("1250.50").unwrap()),
                SqlValue::DateTime(
                    NaiveDate::from_ymd_opt(2024, 3, 15)
                        .unwrap()
                        .and_hms_opt(10, 30, 0)
                        .unwrap(),
                ),
                SqlValue::I32(5),
            ],
        )
    }

    #[test]
    fn test_upsert_sql_shape() {
        let sql = build_upsert_sql("public", EntityType::Sale, &[sale_row("venta_009", Some("cli_1"))]);

        assert!(sql.starts_with("INSERT INTO \"public\".\"ventas\" AS t (\"origen_id\", \"cliente_id\""));
        assert!(sql.contains("ON CONFLICT (\"origen_id\") DO UPDATE SET"));
        assert!(sql.contains("\"estado\" = EXCLUDED.\"estado\""));
        assert!(sql.contains("t.\"monto\" IS DISTINCT FROM EXCLUDED.\"monto\""));
        assert!(sql.ends_with("RETURNING (xmax = 0)"));
        // the natural key is never rewritten
        assert!(!sql.contains("\"origen_id\" = EXCLUDED"));
    }

    #[test]
    fn test_references_resolve_by_origin_id() {
        let sql = build_upsert_sql("public", EntityType::Sale, &[sale_row("venta_009", Some("cli_1"))]);
        assert!(sql.contains(
            "(SELECT \"id\" FROM \"public\".\"clientes\" WHERE \"origen_id\" = 'cli_1')"
        ));

        let sql = build_upsert_sql("public", EntityType::Sale, &[sale_row("venta_010", None)]);
        assert!(sql.contains("('venta_010', NULL, NULL, 'confirmada'"));
    }

    #[test]
    fn test_values_are_typed_literals() {
        let sql = build_upsert_sql("public", EntityType::Sale, &[sale_row("venta_009", None)]);
        assert!(sql.contains("1250.50::numeric"));
        assert!(sql.contains("'2024-03-15 10:30:00.000000'::timestamp"));
        assert!(sql.contains(", 5)"));
    }

    #[test]
    fn test_literals_are_escaped() {
        let row = Row::new(
            "cli_'x",
            vec![
                SqlValue::String("O'Brien".into()),
                SqlValue::Null(SqlNullType::String),
                SqlValue::Null(SqlNullType::String),
                SqlValue::Null(SqlNullType::DateTime),
            ],
        );
        let sql = build_upsert_sql("ventas \"q\"", EntityType::Customer, &[row]);
        assert!(sql.contains("'cli_''x'"));
        assert!(sql.contains("'O''Brien'"));
        assert!(sql.contains("\"ventas \"\"q\"\"\""));
    }

    #[test]
    fn test_multiple_rows_single_statement() {
        let rows = vec![sale_row("v1", None), sale_row("v2", None), sale_row("v3", None)];
        let sql = build_upsert_sql("public", EntityType::Sale, &rows);
        assert_eq!(sql.matches("INSERT INTO").count(), 1);
        assert!(sql.contains("('v1',"));
        assert!(sql.contains("('v3',"));
    }
}
