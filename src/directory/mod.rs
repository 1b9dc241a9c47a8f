/// User directory
///
/// Lookup of actor rows by UID, DID, or handle. Absence is surfaced as the
/// distinguishable not-found signal so callers can drive the
/// missing-record creation paths.
use crate::db::models::{Actor, Uid};
use crate::error::{RelayError, RelayResult};
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct UserDirectory {
    db: SqlitePool,
}

impl UserDirectory {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn lookup_by_uid(&self, uid: Uid) -> RelayResult<Actor> {
        sqlx::query_as::<_, Actor>(
            "SELECT uid, did, handle, display_name, pds, tombstoned, taken_down FROM actor WHERE uid = ?1",
        )
        .bind(uid)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| RelayError::NotFound(format!("no actor with uid {}", uid)))
    }

    pub async fn lookup_by_did(&self, did: &str) -> RelayResult<Actor> {
        sqlx::query_as::<_, Actor>(
            "SELECT uid, did, handle, display_name, pds, tombstoned, taken_down FROM actor WHERE did = ?1",
        )
        .bind(did)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| RelayError::NotFound(format!("no actor with did {}", did)))
    }

    pub async fn lookup_by_handle(&self, handle: &str) -> RelayResult<Actor> {
        sqlx::query_as::<_, Actor>(
            "SELECT uid, did, handle, display_name, pds, tombstoned, taken_down FROM actor WHERE handle = ?1",
        )
        .bind(handle)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| RelayError::NotFound(format!("no actor with handle {}", handle)))
    }

    pub async fn did_for_user(&self, uid: Uid) -> RelayResult<String> {
        Ok(self.lookup_by_uid(uid).await?.did)
    }

    /// Register a bare actor row for an externally-referenced DID. Returns
    /// the existing row when the DID is already known.
    pub async fn create_bare_actor(&self, did: &str, pds: i64) -> RelayResult<Actor> {
        sqlx::query("INSERT OR IGNORE INTO actor (did, pds) VALUES (?1, ?2)")
            .bind(did)
            .bind(pds)
            .execute(&self.db)
            .await?;

        self.lookup_by_did(did).await
    }

    /// Upsert an actor observed from a local repo init, keeping its UID.
    pub async fn upsert_actor(
        &self,
        did: &str,
        handle: Option<&str>,
        display_name: Option<&str>,
        pds: i64,
    ) -> RelayResult<Actor> {
        sqlx::query(
            r#"
            INSERT INTO actor (did, handle, display_name, pds)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(did) DO UPDATE SET
                handle = excluded.handle,
                display_name = excluded.display_name,
                pds = excluded.pds
            "#,
        )
        .bind(did)
        .bind(handle)
        .bind(display_name)
        .bind(pds)
        .execute(&self.db)
        .await?;

        self.lookup_by_did(did).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn make_directory() -> UserDirectory {
        let pool = db::create_memory_pool().await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        UserDirectory::new(pool)
    }

    #[tokio::test]
    async fn test_lookup_not_found_is_distinguishable() {
        let dir = make_directory().await;
        let err = dir.lookup_by_did("did:plc:nobody").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_uid_did_mapping_is_stable() {
        let dir = make_directory().await;
        let a = dir.create_bare_actor("did:plc:alice", 1).await.unwrap();
        let b = dir.create_bare_actor("did:plc:alice", 2).await.unwrap();
        assert_eq!(a.uid, b.uid);
        assert_eq!(b.pds, 1); // bare creation never rebinds an existing row
    }

    #[tokio::test]
    async fn test_upsert_updates_handle_keeps_uid() {
        let dir = make_directory().await;
        let a = dir.upsert_actor("did:plc:alice", Some("alice.test"), None, 1).await.unwrap();
        let b = dir
            .upsert_actor("did:plc:alice", Some("alice2.test"), Some("Alice"), 1)
            .await
            .unwrap();
        assert_eq!(a.uid, b.uid);
        assert_eq!(b.handle.as_deref(), Some("alice2.test"));
        assert_eq!(b.display_name.as_deref(), Some("Alice"));
    }
}
