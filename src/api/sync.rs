/// Synchronization API endpoints
///
/// Implements the com.atproto.sync.* surface the relay exposes to
/// downstream consumers and to PDS hosts requesting a crawl.
use crate::{
    context::AppContext,
    db::models::Actor,
    error::{RelayError, RelayResult},
    validation::{normalize_hostname, parse_cursor},
};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use libipld::Cid;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Reject content serving for tombstoned and taken-down accounts.
fn check_account_visible(actor: &Actor) -> RelayResult<()> {
    if actor.tombstoned {
        return Err(RelayError::AccountGone("account was deleted".to_string()));
    }
    if actor.taken_down {
        return Err(RelayError::AccountGone("account was taken down".to_string()));
    }
    Ok(())
}

/// Request parameters for getRecord
#[derive(Debug, Deserialize)]
pub struct GetRecordParams {
    pub did: String,
    pub collection: String,
    pub rkey: String,
    pub commit: Option<String>,
}

/// Get a single record as DAG-CBOR
///
/// Implements com.atproto.sync.getRecord
pub async fn get_record(
    State(ctx): State<AppContext>,
    Query(params): Query<GetRecordParams>,
) -> RelayResult<Response> {
    let actor = ctx
        .directory
        .lookup_by_did(&params.did)
        .await
        .map_err(|e| match e {
            e if e.is_not_found() => RelayError::NotFound("user not found".to_string()),
            e => e,
        })?;
    check_account_visible(&actor)?;

    let commit = match &params.commit {
        Some(c) if !c.is_empty() => Some(
            Cid::try_from(c.as_str())
                .map_err(|e| RelayError::Validation(format!("failed to decode commit cid: {}", e)))?,
        ),
        _ => None,
    };

    let (_, bytes) = ctx
        .repoman
        .get_record(actor.uid, &params.collection, &params.rkey, commit)
        .await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/cbor")
        .body(Body::from(bytes))
        .unwrap())
}

/// Request parameters for getRepo
#[derive(Debug, Deserialize)]
pub struct GetRepoParams {
    pub did: String,
    pub since: Option<String>,
}

/// Get a repository diff as a CAR file, buffered fully in memory
///
/// Implements com.atproto.sync.getRepo
pub async fn get_repo(
    State(ctx): State<AppContext>,
    Query(params): Query<GetRepoParams>,
) -> RelayResult<Response> {
    let actor = ctx
        .directory
        .lookup_by_did(&params.did)
        .await
        .map_err(|e| match e {
            e if e.is_not_found() => RelayError::NotFound("user not found".to_string()),
            e => e,
        })?;
    check_account_visible(&actor)?;

    let car_bytes = ctx
        .repoman
        .read_repo_car(actor.uid, params.since.as_deref().unwrap_or(""))
        .await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/vnd.ipld.car")
        .body(Body::from(car_bytes))
        .unwrap())
}

/// Request parameters for getBlob
#[derive(Debug, Deserialize)]
pub struct GetBlobParams {
    pub did: String,
    pub cid: String,
}

/// Get blob bytes, 404 when blob storage is not enabled
///
/// Implements com.atproto.sync.getBlob
pub async fn get_blob(
    State(ctx): State<AppContext>,
    Query(params): Query<GetBlobParams>,
) -> RelayResult<Response> {
    let Some(blobs) = &ctx.blob_store else {
        return Err(RelayError::NotFound(
            "blobs not enabled on this server".to_string(),
        ));
    };

    let bytes = blobs.get_blob(&params.did, &params.cid).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(bytes))
        .unwrap())
}

/// Request parameters for listRepos
#[derive(Debug, Deserialize)]
pub struct ListReposParams {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

/// Response for listRepos
#[derive(Debug, Serialize)]
pub struct ListReposResponse {
    pub repos: Vec<RepoInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Repository information
#[derive(Debug, Serialize)]
pub struct RepoInfo {
    pub did: String,
    pub head: String,
}

/// List hosted repositories, paged by UID ascending, excluding tombstoned
/// and taken-down actors
///
/// Implements com.atproto.sync.listRepos
pub async fn list_repos(
    State(ctx): State<AppContext>,
    Query(params): Query<ListReposParams>,
) -> RelayResult<Json<ListReposResponse>> {
    let cursor = parse_cursor(params.cursor.as_deref())?;
    let limit = params.limit.unwrap_or(500).clamp(1, 1000);

    let users = sqlx::query_as::<_, Actor>(
        r#"
        SELECT uid, did, handle, display_name, pds, tombstoned, taken_down
        FROM actor
        WHERE uid > ?1 AND NOT tombstoned AND NOT taken_down
        ORDER BY uid
        LIMIT ?2
        "#,
    )
    .bind(cursor)
    .bind(limit)
    .fetch_all(&ctx.db)
    .await?;

    if users.is_empty() {
        return Ok(Json(ListReposResponse {
            repos: vec![],
            cursor: None,
        }));
    }

    let mut repos = Vec::with_capacity(users.len());
    for user in &users {
        let root = ctx.repoman.get_repo_root(user.uid).await.map_err(|e| {
            RelayError::Internal(format!("failed to get repo root for ({}): {}", user.did, e))
        })?;
        repos.push(RepoInfo {
            did: user.did.clone(),
            head: root.to_string(),
        });
    }

    let next = cursor + users.len() as i64;
    Ok(Json(ListReposResponse {
        repos,
        cursor: Some(next.to_string()),
    }))
}

/// Request parameters for getLatestCommit
#[derive(Debug, Deserialize)]
pub struct GetLatestCommitParams {
    pub did: String,
}

/// Response for getLatestCommit
#[derive(Debug, Serialize)]
pub struct LatestCommitResponse {
    pub cid: String,
    pub rev: String,
}

/// Get the latest commit CID and revision for a repository
///
/// Implements com.atproto.sync.getLatestCommit
pub async fn get_latest_commit(
    State(ctx): State<AppContext>,
    Query(params): Query<GetLatestCommitParams>,
) -> RelayResult<Json<LatestCommitResponse>> {
    let actor = ctx
        .directory
        .lookup_by_did(&params.did)
        .await
        .map_err(|e| match e {
            e if e.is_not_found() => RelayError::NotFound("user not found".to_string()),
            e => e,
        })?;
    check_account_visible(&actor)?;

    let root = ctx.repoman.get_repo_root(actor.uid).await?;
    let rev = ctx.repoman.get_repo_rev(actor.uid).await?;

    Ok(Json(LatestCommitResponse {
        cid: root.to_string(),
        rev,
    }))
}

/// Request body for requestCrawl
#[derive(Debug, Deserialize)]
pub struct RequestCrawlInput {
    pub hostname: String,
}

/// Register a PDS host and subscribe to its firehose
///
/// Implements com.atproto.sync.requestCrawl
pub async fn request_crawl(
    State(ctx): State<AppContext>,
    Json(body): Json<RequestCrawlInput>,
) -> RelayResult<Json<serde_json::Value>> {
    let norm = normalize_hostname(&body.hostname)?;

    if ctx.slurper.domain_is_banned(&norm).await? {
        return Err(RelayError::Banned("domain is banned".to_string()));
    }

    // probe the host before committing to a subscription
    ctx.pds_client
        .describe_server(&norm, ctx.config.service.ssl)
        .await
        .map_err(|e| {
            RelayError::Upstream(format!("given host failed to respond to ping: {}", e))
        })?;

    info!(host = %norm, "crawl requested, subscribing to PDS");
    ctx.slurper.subscribe_to_pds(&norm, true).await?;

    Ok(Json(serde_json::json!({})))
}

/// Accepted but currently a no-op
///
/// Implements com.atproto.sync.notifyOfUpdate
pub async fn notify_of_update(
    State(_ctx): State<AppContext>,
    body: Option<Json<serde_json::Value>>,
) -> RelayResult<Json<serde_json::Value>> {
    let _ = body;
    Ok(Json(serde_json::json!({})))
}

/// Build sync API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/xrpc/com.atproto.sync.getRecord", get(get_record))
        .route("/xrpc/com.atproto.sync.getRepo", get(get_repo))
        .route("/xrpc/com.atproto.sync.getBlob", get(get_blob))
        .route("/xrpc/com.atproto.sync.listRepos", get(list_repos))
        .route("/xrpc/com.atproto.sync.getLatestCommit", get(get_latest_commit))
        .route("/xrpc/com.atproto.sync.requestCrawl", post(request_crawl))
        .route("/xrpc/com.atproto.sync.notifyOfUpdate", post(notify_of_update))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_repos_params_deserialize() {
        let params: ListReposParams =
            serde_json::from_str(r#"{"cursor":"2","limit":2}"#).unwrap();
        assert_eq!(params.cursor.as_deref(), Some("2"));
        assert_eq!(params.limit, Some(2));
    }

    #[test]
    fn test_latest_commit_response_serialize() {
        let response = LatestCommitResponse {
            cid: "bafyreie5cvv4h45feadgeuwhbcutmh6t2ceseocckahdoe6uat64zmz454".to_string(),
            rev: "3l4example".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("cid"));
        assert!(json.contains("rev"));
    }
}
