//! Shared test harness: in-memory database wiring, scriptable collaborator
//! stubs, and event/record builders.
#![allow(dead_code)]

use async_trait::async_trait;
use borealis::{
    config::FirehoseConfig,
    db::{self, models::Actor, models::Uid},
    error::{RelayError, RelayResult},
    events::EventManager,
    indexer::{Indexer, IndexerHooks},
    ingest::client::{DescribeServerResponse, PdsClient},
    notifs::DbNotificationManager,
    records::RecordPayload,
    repo::{CommitOp, OpKind, RepoEvent, RepoEventSink, RepoManager, RepoOp},
};
use libipld::multihash::{Code, MultihashDigest};
use libipld::Cid;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub fn make_cid(data: &[u8]) -> Cid {
    Cid::new_v1(0x71, Code::Sha2_256.digest(data))
}

/// Scriptable repository manager stub. Records every call; behavior is
/// driven by the fields set up by each test.
#[derive(Default)]
pub struct StubRepoManager {
    pub revs: Mutex<HashMap<Uid, String>>,
    pub roots: Mutex<HashMap<Uid, Cid>>,
    /// (pds, uid, since, rev) per handle_external_user_event call
    pub external_events: Mutex<Vec<(i64, Uid, Option<String>, String)>>,
    /// fail the nth external event (0-based)
    pub fail_external_at: Mutex<Option<usize>>,
    /// (uid, since-rev-argument) per import call
    pub imports: Mutex<Vec<(Uid, Option<String>)>>,
    /// errors to return for successive import calls
    pub import_errors: Mutex<Vec<Option<RelayError>>>,
}

impl StubRepoManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_rev(&self, uid: Uid, rev: &str) {
        self.revs.lock().unwrap().insert(uid, rev.to_string());
    }

    pub fn set_root(&self, uid: Uid, root: Cid) {
        self.roots.lock().unwrap().insert(uid, root);
    }
}

#[async_trait]
impl RepoManager for StubRepoManager {
    async fn import_new_repo(
        &self,
        uid: Uid,
        _did: &str,
        _car_bytes: &[u8],
        rev: Option<String>,
    ) -> RelayResult<()> {
        self.imports.lock().unwrap().push((uid, rev));
        let mut errors = self.import_errors.lock().unwrap();
        if !errors.is_empty() {
            if let Some(err) = errors.remove(0) {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn get_repo_root(&self, uid: Uid) -> RelayResult<Cid> {
        self.roots
            .lock()
            .unwrap()
            .get(&uid)
            .copied()
            .ok_or_else(|| RelayError::NotFound(format!("no repo for uid {}", uid)))
    }

    async fn get_repo_rev(&self, uid: Uid) -> RelayResult<String> {
        self.revs
            .lock()
            .unwrap()
            .get(&uid)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(format!("no repo for uid {}", uid)))
    }

    async fn get_record(
        &self,
        _uid: Uid,
        collection: &str,
        rkey: &str,
        _commit: Option<Cid>,
    ) -> RelayResult<(Cid, Vec<u8>)> {
        Err(RelayError::NotFound(format!(
            "record {}/{} not indexed",
            collection, rkey
        )))
    }

    async fn handle_external_user_event(
        &self,
        pds: i64,
        uid: Uid,
        _did: &str,
        since: Option<String>,
        rev: &str,
        _blocks: &[u8],
        _ops: &[CommitOp],
    ) -> RelayResult<()> {
        let n = {
            let mut events = self.external_events.lock().unwrap();
            events.push((pds, uid, since, rev.to_string()));
            events.len() - 1
        };

        if *self.fail_external_at.lock().unwrap() == Some(n) {
            return Err(RelayError::Internal("scripted catchup failure".to_string()));
        }

        self.revs.lock().unwrap().insert(uid, rev.to_string());
        Ok(())
    }

    async fn read_repo_car(&self, uid: Uid, _since: &str) -> RelayResult<Vec<u8>> {
        Err(RelayError::NotFound(format!("no repo for uid {}", uid)))
    }

    async fn set_event_sink(&self, _sink: Arc<dyn RepoEventSink>) {}
}

/// Scriptable PDS client stub: records fetches, returns canned bytes.
#[derive(Default)]
pub struct StubPdsClient {
    /// (host, did, since) per getRepo call
    pub fetches: Mutex<Vec<(String, String, String)>>,
    pub repo_bytes: Mutex<Vec<u8>>,
}

impl StubPdsClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl PdsClient for StubPdsClient {
    async fn get_repo(
        &self,
        pds: &borealis::db::models::Pds,
        did: &str,
        since: &str,
    ) -> RelayResult<Vec<u8>> {
        self.fetches
            .lock()
            .unwrap()
            .push((pds.host.clone(), did.to_string(), since.to_string()));
        Ok(self.repo_bytes.lock().unwrap().clone())
    }

    async fn describe_server(
        &self,
        _host: &str,
        _ssl: bool,
    ) -> RelayResult<DescribeServerResponse> {
        Ok(DescribeServerResponse {
            available_user_domains: vec![],
            did: None,
        })
    }
}

/// Everything an indexer test needs in one place.
pub struct Harness {
    pub pool: SqlitePool,
    pub indexer: Arc<Indexer>,
    pub repoman: Arc<StubRepoManager>,
    pub client: Arc<StubPdsClient>,
    pub events: Arc<EventManager>,
}

pub async fn build_harness() -> Harness {
    build_harness_with_firehose(FirehoseConfig::default()).await
}

pub async fn build_harness_with_firehose(firehose: FirehoseConfig) -> Harness {
    let pool = db::create_memory_pool().await.unwrap();
    db::run_migrations(&pool).await.unwrap();

    let events = Arc::new(EventManager::new(64));
    let notifman = Arc::new(DbNotificationManager::new(pool.clone()));
    let repoman = StubRepoManager::new();
    let client = StubPdsClient::new();

    // resolve unknown DIDs by registering a bare actor row
    let hook_pool = pool.clone();
    let hooks = IndexerHooks {
        create_external_user: Arc::new(move |did| {
            let pool = hook_pool.clone();
            Box::pin(async move {
                borealis::directory::UserDirectory::new(pool)
                    .create_bare_actor(&did, 1)
                    .await
            })
        }),
        send_remote_follow: Arc::new(|_, _| Box::pin(async { Ok(()) })),
    };

    let indexer = Indexer::new(
        pool.clone(),
        notifman,
        Arc::clone(&events),
        repoman.clone(),
        client.clone(),
        hooks,
        true,
        firehose,
    );

    Harness {
        pool,
        indexer,
        repoman,
        client,
        events,
    }
}

pub async fn create_actor(pool: &SqlitePool, did: &str, pds: i64) -> Actor {
    sqlx::query("INSERT INTO actor (did, pds) VALUES (?1, ?2)")
        .bind(did)
        .bind(pds)
        .execute(pool)
        .await
        .unwrap();

    sqlx::query_as::<_, Actor>(
        "SELECT uid, did, handle, display_name, pds, tombstoned, taken_down FROM actor WHERE did = ?1",
    )
    .bind(did)
    .fetch_one(pool)
    .await
    .unwrap()
}

pub async fn create_pds(pool: &SqlitePool, host: &str) -> i64 {
    sqlx::query(
        "INSERT INTO pds (host, ssl, crawl_rate_limit, registered) VALUES (?1, 0, 100.0, 1) RETURNING id",
    )
    .bind(host)
    .fetch_one(pool)
    .await
    .unwrap()
    .try_get("id")
    .unwrap()
}

/// Build a one-op repo event for `uid`.
pub fn repo_event(uid: Uid, pds: i64, kind: OpKind, collection: &str, rkey: &str, record: Option<RecordPayload>) -> RepoEvent {
    let cid = match kind {
        OpKind::Delete => None,
        _ => Some(make_cid(format!("{}/{}", collection, rkey).as_bytes())),
    };

    RepoEvent {
        user: uid,
        pds,
        old_root: None,
        new_root: make_cid(format!("head-{}-{}", uid, rkey).as_bytes()),
        rev: "r1".to_string(),
        since: Some("r0".to_string()),
        ops: vec![RepoOp {
            kind,
            collection: collection.to_string(),
            rkey: rkey.to_string(),
            cid,
            record,
        }],
        repo_slice: vec![0u8; 64],
    }
}
