/// Metrics and telemetry for the Borealis relay
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - Crawl dispatcher throughput and queue depth
/// - Repo fetch success/failure rates
/// - Catch-up replay volume
/// - Reference crawling and external user creation
/// - Firehose event emission

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Buffered events replayed during crawl catch-up
    pub static ref CATCHUP_EVENTS_PROCESSED: IntCounter = register_int_counter!(
        "catchup_events_processed",
        "Number of buffered events replayed during crawl catch-up"
    )
    .unwrap();

    /// Repo fetches from PDS hosts, by outcome
    pub static ref REPOS_FETCHED: IntCounterVec = register_int_counter_vec!(
        "repos_fetched",
        "Number of repos fetched from PDS hosts",
        &["status"]
    )
    .unwrap();

    /// Attempts to materialize externally-referenced users
    pub static ref EXTERNAL_USER_CREATION_ATTEMPTS: IntCounter = register_int_counter!(
        "external_user_creation_attempts",
        "Number of attempts to create externally-referenced users"
    )
    .unwrap();

    /// Record references walked for crawling
    pub static ref REFERENCES_CRAWLED: IntCounter = register_int_counter!(
        "references_crawled",
        "Number of record references walked for crawling"
    )
    .unwrap();

    /// Events pushed to the outbound firehose, by disposition
    pub static ref FIREHOSE_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "firehose_events_total",
        "Number of events pushed to the outbound firehose",
        &["disposition"]
    )
    .unwrap();

    /// Jobs waiting in the crawl admission queue
    pub static ref CRAWL_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "crawl_queue_depth",
        "Number of jobs waiting in the crawl admission queue"
    )
    .unwrap();

    /// Jobs currently executing across all workers
    pub static ref CRAWL_JOBS_ACTIVE: IntGauge = register_int_gauge!(
        "crawl_jobs_active",
        "Number of crawl jobs currently executing"
    )
    .unwrap();

    /// Repo ops handled by the indexer, by kind and outcome
    pub static ref INDEXER_OPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "indexer_ops_total",
        "Number of repo ops handled by the indexer",
        &["kind", "status"]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
