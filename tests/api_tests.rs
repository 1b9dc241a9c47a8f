/// Sync API behavior: pagination, crawl admission policy, account
/// visibility.
mod common;

use axum::extract::{Json, Query, State};
use borealis::{
    api::sync,
    config::{CrawlConfig, FirehoseConfig, LoggingConfig, RelayConfig, ServiceConfig, StorageConfig},
    context::AppContext,
    db,
    error::RelayError,
};
use common::make_cid;

fn test_config() -> RelayConfig {
    RelayConfig {
        service: ServiceConfig {
            hostname: "localhost".into(),
            port: 0,
            version: "0.0.0-test".into(),
            ssl: false,
        },
        storage: StorageConfig {
            data_directory: "./data".into(),
            relay_db: "./data/relay.sqlite".into(),
            blob_directory: None,
        },
        crawl: CrawlConfig::default(),
        firehose: FirehoseConfig::default(),
        logging: LoggingConfig {
            level: "info".into(),
        },
    }
}

async fn test_context() -> AppContext {
    let pool = db::create_memory_pool().await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    AppContext::assemble(test_config(), pool).await.unwrap()
}

async fn seed_actor(ctx: &AppContext, did: &str, tombstoned: bool) -> i64 {
    sqlx::query("INSERT INTO actor (did, pds, tombstoned) VALUES (?1, 1, ?2)")
        .bind(did)
        .bind(tombstoned)
        .execute(&ctx.db)
        .await
        .unwrap();

    let actor = ctx.directory.lookup_by_did(did).await.unwrap();

    let head = make_cid(did.as_bytes());
    sqlx::query("INSERT INTO repo_head (uid, root, rev) VALUES (?1, ?2, ?3)")
        .bind(actor.uid)
        .bind(head.to_string())
        .bind("r1")
        .execute(&ctx.db)
        .await
        .unwrap();

    actor.uid
}

// S1: listRepos pages by UID, skipping tombstoned actors, with additive
// cursor arithmetic.
#[tokio::test]
async fn test_list_repos_pagination_skips_tombstoned() {
    let ctx = test_context().await;
    for (i, tombstoned) in [false, false, true, false, false].iter().enumerate() {
        seed_actor(&ctx, &format!("did:plc:user{}", i + 1), *tombstoned).await;
    }

    let page1 = sync::list_repos(
        State(ctx.clone()),
        Query(sync::ListReposParams {
            cursor: None,
            limit: Some(2),
        }),
    )
    .await
    .unwrap();
    let dids: Vec<&str> = page1.0.repos.iter().map(|r| r.did.as_str()).collect();
    assert_eq!(dids, vec!["did:plc:user1", "did:plc:user2"]);
    assert_eq!(page1.0.cursor.as_deref(), Some("2"));

    let page2 = sync::list_repos(
        State(ctx.clone()),
        Query(sync::ListReposParams {
            cursor: Some("2".into()),
            limit: Some(2),
        }),
    )
    .await
    .unwrap();
    let dids: Vec<&str> = page2.0.repos.iter().map(|r| r.did.as_str()).collect();
    assert_eq!(dids, vec!["did:plc:user4", "did:plc:user5"]);
    assert_eq!(page2.0.cursor.as_deref(), Some("4"));
}

#[tokio::test]
async fn test_list_repos_rejects_bad_cursor() {
    let ctx = test_context().await;
    let err = sync::list_repos(
        State(ctx),
        Query(sync::ListReposParams {
            cursor: Some("not-a-number".into()),
            limit: None,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));
}

// S2: requestCrawl rejects hostnames carrying a protocol scheme.
#[tokio::test]
async fn test_request_crawl_rejects_scheme() {
    let ctx = test_context().await;
    let err = sync::request_crawl(
        State(ctx),
        Json(sync::RequestCrawlInput {
            hostname: "https://example.com".into(),
        }),
    )
    .await
    .unwrap_err();

    match err {
        RelayError::Validation(msg) => {
            assert_eq!(msg, "must pass domain without protocol scheme")
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_request_crawl_rejects_banned_domain() {
    let ctx = test_context().await;
    sqlx::query("INSERT INTO domain_ban (domain) VALUES ('bad.example.com')")
        .execute(&ctx.db)
        .await
        .unwrap();

    let err = sync::request_crawl(
        State(ctx),
        Json(sync::RequestCrawlInput {
            hostname: "Bad.Example.Com".into(),
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RelayError::Banned(_)));
}

#[tokio::test]
async fn test_get_latest_commit_roundtrip() {
    let ctx = test_context().await;
    seed_actor(&ctx, "did:plc:alice", false).await;

    let out = sync::get_latest_commit(
        State(ctx),
        Query(sync::GetLatestCommitParams {
            did: "did:plc:alice".into(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(out.0.rev, "r1");
    assert_eq!(out.0.cid, make_cid("did:plc:alice".as_bytes()).to_string());
}

#[tokio::test]
async fn test_get_latest_commit_unknown_user_is_not_found() {
    let ctx = test_context().await;
    let err = sync::get_latest_commit(
        State(ctx),
        Query(sync::GetLatestCommitParams {
            did: "did:plc:nobody".into(),
        }),
    )
    .await
    .unwrap_err();
    assert!(err.is_not_found());
}

// Account-gone is distinct from not-found and never maps to 404.
#[tokio::test]
async fn test_tombstoned_account_serves_no_content() {
    let ctx = test_context().await;
    seed_actor(&ctx, "did:plc:gone", true).await;

    let err = sync::get_latest_commit(
        State(ctx.clone()),
        Query(sync::GetLatestCommitParams {
            did: "did:plc:gone".into(),
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RelayError::AccountGone(_)));

    let err = sync::get_repo(
        State(ctx),
        Query(sync::GetRepoParams {
            did: "did:plc:gone".into(),
            since: None,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RelayError::AccountGone(_)));
}

#[tokio::test]
async fn test_get_blob_disabled_returns_not_found() {
    let ctx = test_context().await;
    let err = sync::get_blob(
        State(ctx),
        Query(sync::GetBlobParams {
            did: "did:plc:alice".into(),
            cid: "bafk123".into(),
        }),
    )
    .await
    .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_notify_of_update_is_accepted() {
    let ctx = test_context().await;
    sync::notify_of_update(State(ctx), None).await.unwrap();
}

#[tokio::test]
async fn test_get_record_bad_commit_cid_is_validation_error() {
    let ctx = test_context().await;
    seed_actor(&ctx, "did:plc:alice", false).await;

    let err = sync::get_record(
        State(ctx),
        Query(sync::GetRecordParams {
            did: "did:plc:alice".into(),
            collection: "app.bsky.feed.post".into(),
            rkey: "3k1".into(),
            commit: Some("not-a-cid".into()),
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));
}
