/// Application context and dependency wiring
use crate::{
    blob_store::BlobStore,
    config::RelayConfig,
    db,
    directory::UserDirectory,
    error::RelayResult,
    events::EventManager,
    indexer::{dispatcher::CrawlDispatcher, Indexer, IndexerHooks},
    ingest::client::{HttpPdsClient, PdsClient},
    ingest::Slurper,
    notifs::DbNotificationManager,
    repo::{RepoManager, RepoStorage},
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<RelayConfig>,
    pub db: SqlitePool,
    pub directory: UserDirectory,
    pub indexer: Arc<Indexer>,
    pub crawler: Arc<CrawlDispatcher>,
    pub repoman: Arc<dyn RepoManager>,
    pub slurper: Arc<Slurper>,
    pub events: Arc<EventManager>,
    pub pds_client: Arc<dyn PdsClient>,
    pub blob_store: Option<Arc<BlobStore>>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: RelayConfig) -> RelayResult<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.storage.data_directory).await?;

        let pool = db::create_pool(&config.storage.relay_db, db::DatabaseOptions::default()).await?;
        db::run_migrations(&pool).await?;
        db::test_connection(&pool).await?;

        Self::assemble(config, pool).await
    }

    /// Wire the services onto an existing pool; tests use this with an
    /// in-memory database.
    pub async fn assemble(config: RelayConfig, pool: SqlitePool) -> RelayResult<Self> {
        let directory = UserDirectory::new(pool.clone());
        let events = Arc::new(EventManager::new(config.firehose.buffer_size));
        let notifman = Arc::new(DbNotificationManager::new(pool.clone()));
        let pds_client: Arc<dyn PdsClient> = Arc::new(HttpPdsClient::new(None)?);

        let repoman: Arc<dyn RepoManager> = Arc::new(RepoStorage::new(pool.clone()));

        // DID resolution is a collaborator concern; the default hook
        // registers a bare actor row so references still materialize.
        let hook_directory = directory.clone();
        let hooks = IndexerHooks {
            create_external_user: Arc::new(move |did| {
                let directory = hook_directory.clone();
                Box::pin(async move { directory.create_bare_actor(&did, 0).await })
            }),
            send_remote_follow: Arc::new(|_, _| Box::pin(async { Ok(()) })),
        };

        let indexer = Indexer::new(
            pool.clone(),
            notifman,
            Arc::clone(&events),
            Arc::clone(&repoman),
            Arc::clone(&pds_client),
            hooks,
            true,
            config.firehose.clone(),
        );

        let crawler = CrawlDispatcher::new(indexer.clone(), config.crawl.concurrency);
        indexer.set_crawler(Arc::clone(&crawler));
        crawler.run();

        repoman.set_event_sink(indexer.clone()).await;

        let slurper = Slurper::new(
            pool.clone(),
            Arc::clone(&indexer),
            Arc::clone(&repoman),
            config.service.ssl,
            config.crawl.default_crawl_rate,
        );

        let blob_store = config
            .storage
            .blob_directory
            .clone()
            .map(|dir| Arc::new(BlobStore::new(dir)));

        Ok(Self {
            config: Arc::new(config),
            db: pool,
            directory,
            indexer,
            crawler,
            repoman,
            slurper,
            events,
            pds_client,
            blob_store,
        })
    }

    /// Stop background workers and subscriptions.
    pub fn shutdown(&self) {
        self.crawler.shutdown();
        self.slurper.shutdown();
    }
}
