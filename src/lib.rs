/// Borealis - ATProto relay (Big Graph Server)
///
/// Crawls user repositories from federated PDS hosts, indexes records into
/// relational tables, and re-broadcasts normalized commit events on an
/// outbound firehose.

pub mod api;
pub mod blob_store;
pub mod car;
pub mod config;
pub mod context;
pub mod db;
pub mod directory;
pub mod error;
pub mod events;
pub mod indexer;
pub mod ingest;
pub mod metrics;
pub mod notifs;
pub mod records;
pub mod repo;
pub mod server;
pub mod validation;
