//! Database module for SQLite persistence.
//!
//! Holds the operation log, entity snapshots and sync cursors. Writes that
//! belong together share one transaction.

mod cursors;
mod entities;
mod operations;
mod pool;

pub use cursors::*;
pub use entities::*;
pub use operations::*;
pub use pool::*;

use tandem_engine::{Entity, Operation};

/// Persist a local write and the entity it produces in one transaction.
pub async fn record_local_write(
    pool: &Pool,
    op: &Operation,
    entity: &Entity,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    insert_operation(&mut tx, op).await?;
    upsert_entity(&mut tx, entity).await?;
    tx.commit().await
}

/// Append remote operations in one transaction.
///
/// Returns how many were new.
pub async fn record_operations(pool: &Pool, ops: &[Operation]) -> Result<u64, sqlx::Error> {
    if ops.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    let mut inserted = 0;
    for op in ops {
        inserted += insert_operation(&mut tx, op).await?;
    }
    tx.commit().await?;
    Ok(inserted)
}

/// Upsert entity snapshots in one transaction.
pub async fn record_entities<'a>(
    pool: &Pool,
    entities: impl IntoIterator<Item = &'a Entity>,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for entity in entities {
        upsert_entity(&mut tx, entity).await?;
    }
    tx.commit().await
}
