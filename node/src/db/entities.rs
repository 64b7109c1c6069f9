//! Database operations for the entities table.

use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::types::Json;
use sqlx::SqliteConnection;
use tandem_engine::{Entity, EntityId};

use super::Pool;

/// Insert or replace the stored snapshot of an entity.
pub async fn upsert_entity(conn: &mut SqliteConnection, entity: &Entity) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO entities (entity_id, entity_type, tombstone, body, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (entity_id) DO UPDATE SET
            entity_type = excluded.entity_type,
            tombstone = excluded.tombstone,
            body = excluded.body,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&entity.id)
    .bind(&entity.entity_type)
    .bind(entity.tombstone)
    .bind(Json(entity))
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(())
}

/// Load every stored entity snapshot.
pub async fn load_entities(pool: &Pool) -> Result<BTreeMap<EntityId, Entity>, sqlx::Error> {
    let rows: Vec<(Json<Entity>,)> = sqlx::query_as(r#"SELECT body FROM entities"#)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(Json(entity),)| (entity.id.clone(), entity))
        .collect())
}

/// Load one stored entity snapshot.
pub async fn load_entity(pool: &Pool, entity_id: &str) -> Result<Option<Entity>, sqlx::Error> {
    let row: Option<(Json<Entity>,)> =
        sqlx::query_as(r#"SELECT body FROM entities WHERE entity_id = ?"#)
            .bind(entity_id)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|(Json(entity),)| entity))
}

/// Number of stored entities, tombstoned ones included.
pub async fn entity_count(pool: &Pool) -> Result<i64, sqlx::Error> {
    let result: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM entities"#)
        .fetch_one(pool)
        .await?;

    Ok(result.0)
}
