/// SQLite-backed repository storage
///
/// Stores raw blocks per user, tracks the head commit and revision, and
/// maintains a record index from commit ops. CAR snapshots are passed
/// through without Merkle verification.
use crate::{
    car::{CarEncoder, CarFile},
    db::models::Uid,
    error::{RelayError, RelayResult},
    records::RecordPayload,
    repo::{CommitOp, OpKind, RepoEvent, RepoEventSink, RepoManager, RepoOp},
};
use async_trait::async_trait;
use libipld::Cid;
use serde_cbor::Value;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Repository storage backed by the relay database
pub struct RepoStorage {
    db: SqlitePool,
    sink: RwLock<Option<Arc<dyn RepoEventSink>>>,
}

impl RepoStorage {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            sink: RwLock::new(None),
        }
    }

    async fn head(&self, uid: Uid) -> RelayResult<Option<(Cid, String)>> {
        let row = sqlx::query("SELECT root, rev FROM repo_head WHERE uid = ?1")
            .bind(uid)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => {
                let root: String = row.try_get("root")?;
                let rev: String = row.try_get("rev")?;
                let cid = Cid::try_from(root.as_str())
                    .map_err(|e| RelayError::Internal(format!("stored root invalid: {}", e)))?;
                Ok(Some((cid, rev)))
            }
            None => Ok(None),
        }
    }

    async fn store_blocks(&self, uid: Uid, blocks: &[(Cid, Vec<u8>)]) -> RelayResult<()> {
        for (cid, content) in blocks {
            sqlx::query("INSERT OR REPLACE INTO repo_block (uid, cid, content) VALUES (?1, ?2, ?3)")
                .bind(uid)
                .bind(cid.to_string())
                .bind(content.as_slice())
                .execute(&self.db)
                .await?;
        }
        Ok(())
    }

    async fn set_head(&self, uid: Uid, root: &Cid, rev: &str) -> RelayResult<()> {
        sqlx::query("INSERT OR REPLACE INTO repo_head (uid, root, rev) VALUES (?1, ?2, ?3)")
            .bind(uid)
            .bind(root.to_string())
            .bind(rev)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn emit(&self, evt: RepoEvent) -> RelayResult<()> {
        let sink = self.sink.read().await.clone();
        if let Some(sink) = sink {
            sink.handle_repo_event(evt).await?;
        }
        Ok(())
    }

    /// The revision token stored in a commit block, when decodable.
    fn commit_rev(commit_block: &[u8]) -> Option<String> {
        let value: Value = serde_cbor::from_slice(commit_block).ok()?;
        if let Value::Map(map) = value {
            if let Some(Value::Text(rev)) = map.get(&Value::Text("rev".to_string())) {
                return Some(rev.clone());
            }
        }
        None
    }
}

#[async_trait]
impl RepoManager for RepoStorage {
    async fn import_new_repo(
        &self,
        uid: Uid,
        _did: &str,
        car_bytes: &[u8],
        rev: Option<String>,
    ) -> RelayResult<()> {
        let car = CarFile::decode(car_bytes)?;
        let root = car.root()?;

        let commit_block = car
            .blocks
            .iter()
            .find(|(cid, _)| *cid == root)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| {
                RelayError::MissingBlock(format!("commit block {} absent from snapshot", root))
            })?;

        let new_rev = Self::commit_rev(&commit_block)
            .or(rev)
            .unwrap_or_default();

        let old_root = self.head(uid).await?.map(|(cid, _)| cid);

        self.store_blocks(uid, &car.blocks).await?;
        self.set_head(uid, &root, &new_rev).await?;

        self.emit(RepoEvent {
            user: uid,
            pds: 0,
            old_root,
            new_root: root,
            rev: new_rev,
            since: None,
            ops: Vec::new(),
            repo_slice: car_bytes.to_vec(),
        })
        .await
    }

    async fn get_repo_root(&self, uid: Uid) -> RelayResult<Cid> {
        self.head(uid)
            .await?
            .map(|(cid, _)| cid)
            .ok_or_else(|| RelayError::NotFound(format!("no repo for uid {}", uid)))
    }

    async fn get_repo_rev(&self, uid: Uid) -> RelayResult<String> {
        self.head(uid)
            .await?
            .map(|(_, rev)| rev)
            .ok_or_else(|| RelayError::NotFound(format!("no repo for uid {}", uid)))
    }

    async fn get_record(
        &self,
        uid: Uid,
        collection: &str,
        rkey: &str,
        commit: Option<Cid>,
    ) -> RelayResult<(Cid, Vec<u8>)> {
        let cid = match commit {
            Some(cid) => cid,
            None => {
                let row = sqlx::query(
                    "SELECT cid FROM repo_record WHERE uid = ?1 AND collection = ?2 AND rkey = ?3",
                )
                .bind(uid)
                .bind(collection)
                .bind(rkey)
                .fetch_optional(&self.db)
                .await?
                .ok_or_else(|| {
                    RelayError::NotFound(format!("record {}/{} not indexed", collection, rkey))
                })?;
                let cid: String = row.try_get("cid")?;
                Cid::try_from(cid.as_str())
                    .map_err(|e| RelayError::Internal(format!("stored cid invalid: {}", e)))?
            }
        };

        let row = sqlx::query("SELECT content FROM repo_block WHERE uid = ?1 AND cid = ?2")
            .bind(uid)
            .bind(cid.to_string())
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("block {} not stored", cid)))?;

        let content: Vec<u8> = row.try_get("content")?;
        Ok((cid, content))
    }

    async fn handle_external_user_event(
        &self,
        pds: i64,
        uid: Uid,
        did: &str,
        since: Option<String>,
        rev: &str,
        blocks: &[u8],
        ops: &[CommitOp],
    ) -> RelayResult<()> {
        // Linkage check: an event whose parent revision does not match the
        // stored revision cannot be applied incrementally.
        let stored = self.head(uid).await?;
        if let (Some(expected), Some((_, current))) = (&since, &stored) {
            if expected != current {
                return Err(RelayError::Validation(format!(
                    "commit chain gap for {}: since {} but stored rev {}",
                    did, expected, current
                )));
            }
        }

        let car = CarFile::decode(blocks)?;
        let root = car.root()?;

        let mut out_ops = Vec::with_capacity(ops.len());
        for op in ops {
            let kind = match op.action.as_str() {
                "create" => OpKind::Create,
                "update" => OpKind::Update,
                "delete" => OpKind::Delete,
                other => {
                    warn!(action = other, path = %op.path, "skipping op with unknown action");
                    continue;
                }
            };

            let (collection, rkey) = op
                .path
                .split_once('/')
                .ok_or_else(|| RelayError::Validation(format!("malformed op path: {}", op.path)))?;

            let cid = match &op.cid {
                Some(s) => Some(
                    Cid::try_from(s.as_str())
                        .map_err(|e| RelayError::Validation(format!("invalid op cid: {}", e)))?,
                ),
                None => None,
            };

            match kind {
                OpKind::Create | OpKind::Update => {
                    let cid = cid.ok_or_else(|| {
                        RelayError::Validation(format!("{} op without cid: {}", kind.as_str(), op.path))
                    })?;
                    sqlx::query(
                        "INSERT OR REPLACE INTO repo_record (uid, collection, rkey, cid) VALUES (?1, ?2, ?3, ?4)",
                    )
                    .bind(uid)
                    .bind(collection)
                    .bind(rkey)
                    .bind(cid.to_string())
                    .execute(&self.db)
                    .await?;
                }
                OpKind::Delete => {
                    sqlx::query(
                        "DELETE FROM repo_record WHERE uid = ?1 AND collection = ?2 AND rkey = ?3",
                    )
                    .bind(uid)
                    .bind(collection)
                    .bind(rkey)
                    .execute(&self.db)
                    .await?;
                }
            }

            let record = cid.and_then(|cid| {
                car.blocks
                    .iter()
                    .find(|(block_cid, _)| *block_cid == cid)
                    .and_then(|(_, data)| RecordPayload::from_cbor(data).ok())
            });

            out_ops.push(RepoOp {
                kind,
                collection: collection.to_string(),
                rkey: rkey.to_string(),
                cid,
                record,
            });
        }

        let old_root = stored.map(|(cid, _)| cid);
        self.store_blocks(uid, &car.blocks).await?;
        self.set_head(uid, &root, rev).await?;

        self.emit(RepoEvent {
            user: uid,
            pds,
            old_root,
            new_root: root,
            rev: rev.to_string(),
            since,
            ops: out_ops,
            repo_slice: blocks.to_vec(),
        })
        .await
    }

    async fn read_repo_car(&self, uid: Uid, _since: &str) -> RelayResult<Vec<u8>> {
        let root = self.get_repo_root(uid).await?;

        let rows = sqlx::query("SELECT cid, content FROM repo_block WHERE uid = ?1")
            .bind(uid)
            .fetch_all(&self.db)
            .await?;

        let mut encoder = CarEncoder::new(&root)?;
        for row in rows {
            let cid: String = row.try_get("cid")?;
            let content: Vec<u8> = row.try_get("content")?;
            let cid = Cid::try_from(cid.as_str())
                .map_err(|e| RelayError::Internal(format!("stored cid invalid: {}", e)))?;
            encoder.add_block(&cid, &content);
        }

        Ok(encoder.finalize())
    }

    async fn set_event_sink(&self, sink: Arc<dyn RepoEventSink>) {
        *self.sink.write().await = Some(sink);
    }
}
