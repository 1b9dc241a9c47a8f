/// PDS ingest pipeline
///
/// Maintains one firehose subscription per registered PDS host. Incoming
/// commits are linked against the stored repo revision: linked commits are
/// applied directly through the repository manager, gapped commits admit
/// the user to the crawl dispatcher with the commit buffered for catch-up.
pub mod client;

use crate::{
    db::models::{Pds, Uid},
    error::{RelayError, RelayResult},
    indexer::Indexer,
    repo::{CommitBundle, CommitOp, RepoManager},
};
use futures_util::{SinkExt, StreamExt};
use serde_cbor::Value;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long to wait before reconnecting a dropped subscription
const RECONNECT_INTERVAL_SECS: u64 = 5;

/// Per-PDS subscription manager
pub struct Slurper {
    db: SqlitePool,
    indexer: Arc<Indexer>,
    repoman: Arc<dyn RepoManager>,
    ssl: bool,
    default_crawl_rate: f64,
    subscriptions: Mutex<HashMap<String, CancellationToken>>,
    cancel: CancellationToken,
}

impl Slurper {
    pub fn new(
        db: SqlitePool,
        indexer: Arc<Indexer>,
        repoman: Arc<dyn RepoManager>,
        ssl: bool,
        default_crawl_rate: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            indexer,
            repoman,
            ssl,
            default_crawl_rate,
            subscriptions: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Whether a host is on the persisted ban list.
    pub async fn domain_is_banned(&self, host: &str) -> RelayResult<bool> {
        let row = sqlx::query("SELECT domain FROM domain_ban WHERE domain = ?1")
            .bind(host)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.is_some())
    }

    /// Register a PDS host and open its firehose subscription. Re-entrant:
    /// an already-subscribed host is a no-op.
    pub async fn subscribe_to_pds(self: &Arc<Self>, host: &str, registered: bool) -> RelayResult<()> {
        let pds_id: i64 = sqlx::query(
            r#"
            INSERT INTO pds (host, ssl, crawl_rate_limit, registered)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(host) DO UPDATE SET registered = excluded.registered
            RETURNING id
            "#,
        )
        .bind(host)
        .bind(self.ssl)
        .bind(self.default_crawl_rate)
        .bind(registered)
        .fetch_one(&self.db)
        .await?
        .try_get("id")?;

        let token = {
            let mut subs = self.subscriptions.lock().unwrap();
            if subs.contains_key(host) {
                return Ok(());
            }
            let token = self.cancel.child_token();
            subs.insert(host.to_string(), token.clone());
            token
        };

        let slurper = Arc::clone(self);
        let host = host.to_string();
        tokio::spawn(async move {
            slurper.subscription_loop(pds_id, host, token).await;
        });

        Ok(())
    }

    /// Reopen subscriptions for every registered host; called at startup.
    pub async fn resubscribe_all(self: &Arc<Self>) -> RelayResult<()> {
        let hosts = sqlx::query_as::<_, Pds>(
            "SELECT id, host, ssl, crawl_rate_limit, registered FROM pds WHERE registered = 1",
        )
        .fetch_all(&self.db)
        .await?;

        for pds in hosts {
            self.subscribe_to_pds(&pds.host, true).await?;
        }

        Ok(())
    }

    async fn subscription_loop(self: Arc<Self>, pds_id: i64, host: String, cancel: CancellationToken) {
        let scheme = if self.ssl { "wss" } else { "ws" };
        let ws_url = format!("{}://{}/xrpc/com.atproto.sync.subscribeRepos", scheme, host);

        loop {
            if cancel.is_cancelled() {
                return;
            }

            info!(%host, "connecting to PDS firehose");
            match connect_async(&ws_url).await {
                Ok((mut stream, _)) => {
                    info!(%host, "connected to PDS firehose");

                    loop {
                        let msg = tokio::select! {
                            _ = cancel.cancelled() => return,
                            msg = stream.next() => msg,
                        };

                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                if let Err(e) = self.handle_frame(pds_id, &data).await {
                                    warn!(%host, error = %e, "failed to handle firehose frame");
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if stream.send(Message::Pong(data)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!(%host, "PDS closed subscription");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!(%host, error = %e, "subscription stream error");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(%host, error = %e, "failed to connect to PDS firehose");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_INTERVAL_SECS)) => {}
            }
        }
    }

    /// Decode and route one firehose frame.
    async fn handle_frame(&self, pds_id: i64, data: &[u8]) -> RelayResult<()> {
        let (kind, body) = decode_frame(data)?;

        match kind.as_str() {
            "#commit" => {
                let (did, bundle) = parse_commit_body(&body)?;
                self.handle_commit(pds_id, &did, bundle).await
            }
            "#identity" | "#account" => {
                let did = body_text(&body, "did")
                    .ok_or_else(|| RelayError::Validation("frame missing did".to_string()))?;
                let handle = body_text(&body, "handle");
                self.indexer
                    .handle_init_actor(&did, handle.as_deref(), None, pds_id)
                    .await?;
                Ok(())
            }
            other => {
                debug!(kind = other, "ignoring firehose frame");
                Ok(())
            }
        }
    }

    /// Apply or buffer one live commit.
    pub async fn handle_commit(
        &self,
        pds_id: i64,
        did: &str,
        bundle: CommitBundle,
    ) -> RelayResult<()> {
        let actor = self.indexer.get_user_or_missing(did).await?;
        let uid: Uid = actor.uid;

        // a pending scrape for this user absorbs its live events
        if let Some(crawler) = self.indexer.crawler() {
            if crawler.buffer_event(uid, bundle.clone()) {
                return Ok(());
            }
        }

        let stored_rev = match self.repoman.get_repo_rev(uid).await {
            Ok(rev) => Some(rev),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let linked = match (&bundle.since, &stored_rev) {
            (Some(since), Some(rev)) => since == rev,
            (None, _) => true,
            (Some(_), None) => false,
        };

        if linked {
            return self
                .repoman
                .handle_external_user_event(
                    pds_id,
                    uid,
                    did,
                    bundle.since.clone(),
                    &bundle.rev,
                    &bundle.blocks,
                    &bundle.ops,
                )
                .await;
        }

        // revision gap: schedule a scrape and keep the event for catch-up
        warn!(%did, since = ?bundle.since, stored = ?stored_rev, "commit gap detected, scheduling crawl");
        if let Some(crawler) = self.indexer.crawler() {
            crawler.crawl(&actor)?;
            crawler.buffer_event(uid, bundle);
        }

        Ok(())
    }
}

/// Split a firehose frame into its header type tag and body value.
fn decode_frame(data: &[u8]) -> RelayResult<(String, Value)> {
    let mut de = serde_cbor::Deserializer::from_slice(data);
    let header: Value = serde::Deserialize::deserialize(&mut de)
        .map_err(|e| RelayError::Validation(format!("invalid frame header: {}", e)))?;
    let offset = de.byte_offset();

    let kind = match &header {
        Value::Map(map) => match map.get(&Value::Text("t".to_string())) {
            Some(Value::Text(t)) => t.clone(),
            _ => return Err(RelayError::Validation("frame header missing type".to_string())),
        },
        _ => return Err(RelayError::Validation("frame header is not a map".to_string())),
    };

    let body: Value = serde_cbor::from_slice(&data[offset..])
        .map_err(|e| RelayError::Validation(format!("invalid frame body: {}", e)))?;

    Ok((kind, body))
}

fn body_text(body: &Value, key: &str) -> Option<String> {
    if let Value::Map(map) = body {
        if let Some(Value::Text(s)) = map.get(&Value::Text(key.to_string())) {
            return Some(s.clone());
        }
    }
    None
}

fn body_int(body: &Value, key: &str) -> Option<i64> {
    if let Value::Map(map) = body {
        if let Some(Value::Integer(n)) = map.get(&Value::Text(key.to_string())) {
            return i64::try_from(*n).ok();
        }
    }
    None
}

fn body_bytes(body: &Value, key: &str) -> Option<Vec<u8>> {
    if let Value::Map(map) = body {
        if let Some(Value::Bytes(b)) = map.get(&Value::Text(key.to_string())) {
            return Some(b.clone());
        }
    }
    None
}

/// A CID inside a frame is either text or a tag-42 binary link.
fn value_cid(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s.clone()),
        Value::Tag(42, boxed) => match boxed.as_ref() {
            Value::Bytes(b) if !b.is_empty() => {
                libipld::Cid::try_from(&b[1..]).ok().map(|c| c.to_string())
            }
            _ => None,
        },
        _ => None,
    }
}

/// Extract the repo DID and commit bundle from a #commit frame body.
fn parse_commit_body(body: &Value) -> RelayResult<(String, CommitBundle)> {
    let did = body_text(body, "repo")
        .ok_or_else(|| RelayError::Validation("commit frame missing repo".to_string()))?;
    let rev = body_text(body, "rev")
        .ok_or_else(|| RelayError::Validation("commit frame missing rev".to_string()))?;
    let since = body_text(body, "since");
    let seq = body_int(body, "seq").unwrap_or_default();
    let blocks = body_bytes(body, "blocks").unwrap_or_default();

    let mut ops = Vec::new();
    if let Value::Map(map) = body {
        if let Some(Value::Array(raw_ops)) = map.get(&Value::Text("ops".to_string())) {
            for raw in raw_ops {
                let action = body_text(raw, "action")
                    .ok_or_else(|| RelayError::Validation("op missing action".to_string()))?;
                let path = body_text(raw, "path")
                    .ok_or_else(|| RelayError::Validation("op missing path".to_string()))?;
                let cid = if let Value::Map(op_map) = raw {
                    op_map
                        .get(&Value::Text("cid".to_string()))
                        .and_then(value_cid)
                } else {
                    None
                };
                ops.push(CommitOp { action, path, cid });
            }
        }
    }

    Ok((did, CommitBundle {
        seq,
        since,
        rev,
        blocks,
        ops,
    }))
}
