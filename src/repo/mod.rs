/// Repository manager contract and event types
///
/// The relay treats the repository manager as a collaborator: it ingests
/// CAR snapshots and per-commit slices, tracks each user's head and
/// revision, serves records, and feeds every applied commit to a
/// registered sink (the indexer).
pub mod store;

use crate::db::models::Uid;
use crate::error::RelayResult;
use crate::records::RecordPayload;
use async_trait::async_trait;
use libipld::Cid;
use std::sync::Arc;

pub use store::RepoStorage;

/// Kind of a record operation inside a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

/// A single record operation inside a commit
#[derive(Debug, Clone)]
pub struct RepoOp {
    pub kind: OpKind,
    pub collection: String,
    pub rkey: String,
    pub cid: Option<Cid>,
    /// Decoded record; absent for deletes and undecodable payloads
    pub record: Option<RecordPayload>,
}

/// A repository commit surfaced to the indexer
#[derive(Debug, Clone)]
pub struct RepoEvent {
    pub user: Uid,
    pub pds: i64,
    pub old_root: Option<Cid>,
    pub new_root: Cid,
    pub rev: String,
    pub since: Option<String>,
    pub ops: Vec<RepoOp>,
    /// CAR-encoded slice of the blocks this commit touched
    pub repo_slice: Vec<u8>,
}

/// An op as carried on the wire inside a subscribed commit frame
#[derive(Debug, Clone)]
pub struct CommitOp {
    pub action: String,
    pub path: String,
    pub cid: Option<String>,
}

/// A live commit as received from a PDS subscription, buffered during
/// catch-up and replayed through the repository manager.
#[derive(Debug, Clone)]
pub struct CommitBundle {
    pub seq: i64,
    pub since: Option<String>,
    pub rev: String,
    pub blocks: Vec<u8>,
    pub ops: Vec<CommitOp>,
}

/// Sink invoked for each applied repository event. Handlers must be safe
/// for concurrent entry.
#[async_trait]
pub trait RepoEventSink: Send + Sync {
    async fn handle_repo_event(&self, evt: RepoEvent) -> RelayResult<()>;
}

/// Contract the relay expects from its repository manager.
#[async_trait]
pub trait RepoManager: Send + Sync {
    /// Import a full or incremental CAR snapshot for a user. `rev` is the
    /// revision the fetch was issued against; empty for a full snapshot.
    /// Fails with `RelayError::MissingBlock` when the snapshot references
    /// blocks it does not carry.
    async fn import_new_repo(
        &self,
        uid: Uid,
        did: &str,
        car_bytes: &[u8],
        rev: Option<String>,
    ) -> RelayResult<()>;

    /// Current head CID for a user.
    async fn get_repo_root(&self, uid: Uid) -> RelayResult<Cid>;

    /// Current revision token for a user; `NotFound` if never imported.
    async fn get_repo_rev(&self, uid: Uid) -> RelayResult<String>;

    /// Fetch a record's CID and raw bytes.
    async fn get_record(
        &self,
        uid: Uid,
        collection: &str,
        rkey: &str,
        commit: Option<Cid>,
    ) -> RelayResult<(Cid, Vec<u8>)>;

    /// Apply a single live commit received from a PDS subscription.
    #[allow(clippy::too_many_arguments)]
    async fn handle_external_user_event(
        &self,
        pds: i64,
        uid: Uid,
        did: &str,
        since: Option<String>,
        rev: &str,
        blocks: &[u8],
        ops: &[CommitOp],
    ) -> RelayResult<()>;

    /// Export a user's repository as CAR bytes, buffered in memory.
    async fn read_repo_car(&self, uid: Uid, since: &str) -> RelayResult<Vec<u8>>;

    /// Register the sink that receives every applied event.
    async fn set_event_sink(&self, sink: Arc<dyn RepoEventSink>);
}
