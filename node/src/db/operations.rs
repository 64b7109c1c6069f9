//! Database operations for the operations table.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{Row, SqliteConnection};
use tandem_engine::Operation;

use super::Pool;

/// A stored operation row from the database.
#[derive(Debug)]
pub struct StoredOperation {
    pub op_id: String,
    pub entity_id: String,
    pub origin: String,
    pub counter: i64,
    pub operation: Operation,
    pub recorded_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredOperation {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let Json(operation) = row.try_get::<Json<Operation>, _>("body")?;
        Ok(StoredOperation {
            op_id: row.try_get("op_id")?,
            entity_id: row.try_get("entity_id")?,
            origin: row.try_get("origin")?,
            counter: row.try_get("counter")?,
            operation,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

/// Insert an operation unless its op id is already stored.
///
/// Returns the number of rows written, 0 or 1.
pub async fn insert_operation(
    conn: &mut SqliteConnection,
    op: &Operation,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO operations (
            op_id, entity_id, entity_type, origin, counter,
            physical_time, logical_counter, kind, body, recorded_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&op.op_id)
    .bind(&op.entity_id)
    .bind(&op.entity_type)
    .bind(&op.origin)
    .bind(op.counter as i64)
    .bind(op.timestamp.physical_time as i64)
    .bind(op.timestamp.logical_counter as i64)
    .bind(op.mutation.kind())
    .bind(Json(op))
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Load the whole log in timestamp order.
pub async fn load_operations(pool: &Pool) -> Result<Vec<StoredOperation>, sqlx::Error> {
    sqlx::query_as::<_, StoredOperation>(
        r#"
        SELECT op_id, entity_id, origin, counter, body, recorded_at
        FROM operations
        ORDER BY physical_time ASC, logical_counter ASC, origin ASC
        "#,
    )
    .fetch_all(pool)
    .await
}

/// Operations for one entity in timestamp order.
pub async fn operations_for_entity(
    pool: &Pool,
    entity_id: &str,
) -> Result<Vec<StoredOperation>, sqlx::Error> {
    sqlx::query_as::<_, StoredOperation>(
        r#"
        SELECT op_id, entity_id, origin, counter, body, recorded_at
        FROM operations
        WHERE entity_id = ?
        ORDER BY physical_time ASC, logical_counter ASC, origin ASC
        "#,
    )
    .bind(entity_id)
    .fetch_all(pool)
    .await
}

/// Number of stored operations.
pub async fn operation_count(pool: &Pool) -> Result<i64, sqlx::Error> {
    let result: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM operations"#)
        .fetch_one(pool)
        .await?;

    Ok(result.0)
}
