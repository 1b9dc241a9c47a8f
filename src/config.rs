/// Configuration management for the Borealis relay
use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub crawl: CrawlConfig,
    pub firehose: FirehoseConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    pub version: String,
    /// Outbound URL scheme: https/wss when true
    pub ssl: bool,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub relay_db: PathBuf,
    /// Blob directory; blob serving is disabled when absent
    pub blob_directory: Option<PathBuf>,
}

/// Crawl dispatcher and PDS fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Fixed worker pool size across all users
    pub concurrency: usize,
    /// Default per-PDS crawl rate, events/sec
    pub default_crawl_rate: f64,
}

/// Outbound firehose configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirehoseConfig {
    /// Events with a larger repo slice are emitted with tooBig set
    pub max_event_slice_bytes: usize,
    /// Events with more ops are emitted with tooBig set
    pub max_ops: usize,
    /// Broadcast channel capacity
    pub buffer_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            default_crawl_rate: 5.0,
        }
    }
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            max_event_slice_bytes: 1_000_000,
            max_ops: 200,
            buffer_size: 1024,
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> RelayResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("BGS_HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let port = env::var("BGS_PORT")
            .unwrap_or_else(|_| "2470".to_string())
            .parse()
            .map_err(|_| RelayError::Validation("Invalid port number".to_string()))?;
        let ssl = env::var("BGS_SSL")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        let data_directory: PathBuf = env::var("BGS_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let relay_db = env::var("BGS_DB_LOCATION")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("relay.sqlite"));
        let blob_directory = env::var("BGS_BLOB_DIRECTORY").map(PathBuf::from).ok();

        let concurrency = env::var("BGS_CRAWL_CONCURRENCY")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);
        let default_crawl_rate = env::var("BGS_CRAWL_RATE_LIMIT")
            .unwrap_or_else(|_| "5.0".to_string())
            .parse()
            .unwrap_or(5.0);

        let max_event_slice_bytes = env::var("BGS_MAX_EVENT_SLICE_BYTES")
            .unwrap_or_else(|_| "1000000".to_string())
            .parse()
            .unwrap_or(1_000_000);
        let max_ops = env::var("BGS_MAX_OPS")
            .unwrap_or_else(|_| "200".to_string())
            .parse()
            .unwrap_or(200);
        let buffer_size = env::var("BGS_FIREHOSE_BUFFER")
            .unwrap_or_else(|_| "1024".to_string())
            .parse()
            .unwrap_or(1024);

        let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        Ok(RelayConfig {
            service: ServiceConfig {
                hostname,
                port,
                version: env!("CARGO_PKG_VERSION").to_string(),
                ssl,
            },
            storage: StorageConfig {
                data_directory,
                relay_db,
                blob_directory,
            },
            crawl: CrawlConfig {
                concurrency,
                default_crawl_rate,
            },
            firehose: FirehoseConfig {
                max_event_slice_bytes,
                max_ops,
                buffer_size,
            },
            logging: LoggingConfig { level: log_level },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> RelayResult<()> {
        if self.service.hostname.is_empty() {
            return Err(RelayError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.crawl.concurrency == 0 {
            return Err(RelayError::Validation(
                "Crawl concurrency must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
