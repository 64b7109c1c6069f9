//! Database operations for the sync_cursors table.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::Row;
use tandem_engine::{NodeId, VectorSummary};

use super::Pool;

/// The last acknowledged exchange with one peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncCursor {
    pub peer_id: NodeId,
    pub session_id: String,
    /// Local summary when the peer acknowledged
    pub local: VectorSummary,
    /// Summary the peer acknowledged with
    pub remote: VectorSummary,
    pub updated_at: DateTime<Utc>,
}

impl SyncCursor {
    /// Both sides held the same entities at the same versions when the
    /// peer acknowledged.
    pub fn is_settled(&self) -> bool {
        self.local == self.remote
    }

    /// Whether the exchange was settled and neither side changed since.
    pub fn still_settled(&self, local: &VectorSummary, remote: &VectorSummary) -> bool {
        self.is_settled() && &self.local == local && &self.remote == remote
    }
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for SyncCursor {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let Json(local) = row.try_get::<Json<VectorSummary>, _>("local_summary")?;
        let Json(remote) = row.try_get::<Json<VectorSummary>, _>("remote_summary")?;
        Ok(SyncCursor {
            peer_id: row.try_get("peer_id")?,
            session_id: row.try_get("session_id")?,
            local,
            remote,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Store the cursor for a peer, replacing any previous one.
pub async fn store_cursor(pool: &Pool, cursor: &SyncCursor) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO sync_cursors (peer_id, session_id, local_summary, remote_summary, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (peer_id) DO UPDATE SET
            session_id = excluded.session_id,
            local_summary = excluded.local_summary,
            remote_summary = excluded.remote_summary,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&cursor.peer_id)
    .bind(&cursor.session_id)
    .bind(Json(&cursor.local))
    .bind(Json(&cursor.remote))
    .bind(cursor.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Load the cursor for a peer.
pub async fn load_cursor(pool: &Pool, peer_id: &str) -> Result<Option<SyncCursor>, sqlx::Error> {
    sqlx::query_as::<_, SyncCursor>(
        r#"
        SELECT peer_id, session_id, local_summary, remote_summary, updated_at
        FROM sync_cursors
        WHERE peer_id = ?
        "#,
    )
    .bind(peer_id)
    .fetch_optional(pool)
    .await
}

/// All cursors, ordered by peer.
pub async fn list_cursors(pool: &Pool) -> Result<Vec<SyncCursor>, sqlx::Error> {
    sqlx::query_as::<_, SyncCursor>(
        r#"
        SELECT peer_id, session_id, local_summary, remote_summary, updated_at
        FROM sync_cursors
        ORDER BY peer_id ASC
        "#,
    )
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, run_migrations};
    use tandem_engine::VersionVector;

    fn summary(entries: &[(&str, &str, u64)]) -> VectorSummary {
        let mut summary = VectorSummary::new();
        for (entity, node, count) in entries {
            let vv: VersionVector = [(node.to_string(), *count)].into_iter().collect();
            summary.insert(entity.to_string(), vv);
        }
        summary
    }

    #[tokio::test]
    async fn test_store_and_replace_cursor() {
        let pool = create_pool("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        assert!(load_cursor(&pool, "phone").await.unwrap().is_none());

        let mut cursor = SyncCursor {
            peer_id: "phone".into(),
            session_id: "s1".into(),
            local: summary(&[("e1", "laptop", 2)]),
            remote: summary(&[("e1", "laptop", 1)]),
            updated_at: Utc::now(),
        };
        store_cursor(&pool, &cursor).await.unwrap();

        cursor.session_id = "s2".into();
        cursor.remote = cursor.local.clone();
        store_cursor(&pool, &cursor).await.unwrap();

        let stored = load_cursor(&pool, "phone").await.unwrap().unwrap();
        assert_eq!(stored.session_id, "s2");
        assert!(stored.is_settled());
        assert!(stored.still_settled(&cursor.local, &cursor.local));
        assert!(!stored.still_settled(&summary(&[]), &cursor.local));
        assert_eq!(list_cursors(&pool).await.unwrap().len(), 1);
    }
}
