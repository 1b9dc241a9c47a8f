/// Ingest pipeline: live commit linkage, gap detection, and buffering
/// behind an active scrape.
mod common;

use borealis::{indexer::dispatcher::CrawlDispatcher, ingest::Slurper, repo::CommitBundle};
use common::{build_harness, create_actor, create_pds};

fn bundle(seq: i64, since: Option<&str>, rev: &str) -> CommitBundle {
    CommitBundle {
        seq,
        since: since.map(str::to_string),
        rev: rev.to_string(),
        blocks: vec![],
        ops: vec![],
    }
}

#[tokio::test]
async fn test_linked_commit_applies_directly() {
    let h = build_harness().await;
    let pds = create_pds(&h.pool, "pds.test").await;
    let actor = create_actor(&h.pool, "did:plc:user", pds).await;
    h.repoman.set_rev(actor.uid, "r0");

    let slurper = Slurper::new(
        h.pool.clone(),
        h.indexer.clone(),
        h.repoman.clone(),
        false,
        100.0,
    );

    slurper
        .handle_commit(pds, "did:plc:user", bundle(1, Some("r0"), "r1"))
        .await
        .unwrap();

    let events = h.repoman.external_events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, actor.uid);
    assert_eq!(events[0].3, "r1");
}

#[tokio::test]
async fn test_gap_commit_schedules_crawl_and_buffers() {
    let h = build_harness().await;
    let pds = create_pds(&h.pool, "pds.test").await;
    let actor = create_actor(&h.pool, "did:plc:user", pds).await;
    h.repoman.set_rev(actor.uid, "r0");

    let crawler = CrawlDispatcher::new(h.indexer.clone(), 2);
    h.indexer.set_crawler(crawler.clone());
    // workers not started so the scheduled job stays observable

    let slurper = Slurper::new(
        h.pool.clone(),
        h.indexer.clone(),
        h.repoman.clone(),
        false,
        100.0,
    );

    slurper
        .handle_commit(pds, "did:plc:user", bundle(5, Some("r7"), "r8"))
        .await
        .unwrap();

    // not applied directly
    assert!(h.repoman.external_events.lock().unwrap().is_empty());
    assert!(crawler.has_job(actor.uid));
}

#[tokio::test]
async fn test_commit_for_unseen_repo_schedules_crawl() {
    let h = build_harness().await;
    let pds = create_pds(&h.pool, "pds.test").await;
    let actor = create_actor(&h.pool, "did:plc:user", pds).await;
    // no stored rev at all

    let crawler = CrawlDispatcher::new(h.indexer.clone(), 2);
    h.indexer.set_crawler(crawler.clone());

    let slurper = Slurper::new(
        h.pool.clone(),
        h.indexer.clone(),
        h.repoman.clone(),
        false,
        100.0,
    );

    slurper
        .handle_commit(pds, "did:plc:user", bundle(1, Some("r0"), "r1"))
        .await
        .unwrap();

    assert!(h.repoman.external_events.lock().unwrap().is_empty());
    assert!(crawler.has_job(actor.uid));
}

// While a scrape is pending, live commits are absorbed into its buffer
// rather than applied.
#[tokio::test]
async fn test_commit_buffers_behind_active_job() {
    let h = build_harness().await;
    let pds = create_pds(&h.pool, "pds.test").await;
    let actor = create_actor(&h.pool, "did:plc:user", pds).await;
    h.repoman.set_rev(actor.uid, "r0");

    let crawler = CrawlDispatcher::new(h.indexer.clone(), 2);
    h.indexer.set_crawler(crawler.clone());
    crawler.crawl(&actor).unwrap(); // job queued, workers not started

    let slurper = Slurper::new(
        h.pool.clone(),
        h.indexer.clone(),
        h.repoman.clone(),
        false,
        100.0,
    );

    slurper
        .handle_commit(pds, "did:plc:user", bundle(9, Some("r0"), "r1"))
        .await
        .unwrap();

    // swallowed by the job buffer, not applied
    assert!(h.repoman.external_events.lock().unwrap().is_empty());
    assert!(crawler.has_job(actor.uid));
}

#[tokio::test]
async fn test_domain_ban_lookup() {
    let h = build_harness().await;
    let slurper = Slurper::new(
        h.pool.clone(),
        h.indexer.clone(),
        h.repoman.clone(),
        false,
        100.0,
    );

    sqlx::query("INSERT INTO domain_ban (domain) VALUES ('bad.example.com')")
        .execute(&h.pool)
        .await
        .unwrap();

    assert!(slurper.domain_is_banned("bad.example.com").await.unwrap());
    assert!(!slurper.domain_is_banned("good.example.com").await.unwrap());
}
