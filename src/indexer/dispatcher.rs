/// Crawl dispatcher
///
/// Serializes crawl work per user, coalesces duplicate requests, buffers
/// live events while an initial scrape is pending, and caps concurrency
/// with a fixed worker pool. For a given UID at most one job is ever
/// executing; requests arriving during execution mark the job for exactly
/// one re-run.
use crate::db::models::{Actor, Uid};
use crate::error::{RelayError, RelayResult};
use crate::metrics::{CRAWL_JOBS_ACTIVE, CRAWL_QUEUE_DEPTH};
use crate::repo::CommitBundle;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// The work handed to a fetcher: a snapshot of the job at dequeue time.
#[derive(Debug, Clone)]
pub struct CrawlWork {
    pub actor: Actor,
    /// True only for a user's first scrape; immutable for a job's lifetime
    pub init_scrape: bool,
    /// Live events buffered while the job waited, in arrival order
    pub catchup: Vec<CommitBundle>,
}

/// Executes one crawl job; implemented by the indexer.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn fetch_and_index(&self, work: CrawlWork) -> RelayResult<()>;
}

struct CrawlJob {
    actor: Actor,
    init_scrape: bool,
    catchup: Vec<CommitBundle>,
    rerequested: bool,
    executing: bool,
}

struct DispatchState {
    active: HashMap<Uid, CrawlJob>,
}

pub struct CrawlDispatcher {
    state: Mutex<DispatchState>,
    work_tx: mpsc::UnboundedSender<Uid>,
    work_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Uid>>,
    fetcher: Arc<dyn RepoFetcher>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl CrawlDispatcher {
    pub fn new(fetcher: Arc<dyn RepoFetcher>, concurrency: usize) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(DispatchState {
                active: HashMap::new(),
            }),
            work_tx,
            work_rx: tokio::sync::Mutex::new(work_rx),
            fetcher,
            concurrency,
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the worker pool.
    pub fn run(self: &Arc<Self>) {
        for n in 0..self.concurrency {
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                dispatcher.worker(n).await;
            });
        }
    }

    /// Stop the workers; in-flight jobs finish their current await point.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Admit an actor for crawling. No-op if already queued; marks the job
    /// for a second pass if currently executing.
    pub fn crawl(&self, actor: &Actor) -> RelayResult<()> {
        let mut state = self.state.lock().unwrap();

        match state.active.get_mut(&actor.uid) {
            Some(job) if job.executing => {
                job.rerequested = true;
                Ok(())
            }
            Some(_) => Ok(()), // already queued; coalesce
            None => {
                state.active.insert(
                    actor.uid,
                    CrawlJob {
                        actor: actor.clone(),
                        init_scrape: true,
                        catchup: Vec::new(),
                        rerequested: false,
                        executing: false,
                    },
                );
                self.enqueue(actor.uid)
            }
        }
    }

    /// Append a live event to the active job's catch-up buffer. Returns
    /// false when no job is active, in which case the caller processes the
    /// event directly.
    pub fn buffer_event(&self, uid: Uid, bundle: CommitBundle) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.active.get_mut(&uid) {
            Some(job) => {
                job.catchup.push(bundle);
                true
            }
            None => false,
        }
    }

    /// Whether a job is queued or executing for this UID.
    pub fn has_job(&self, uid: Uid) -> bool {
        self.state.lock().unwrap().active.contains_key(&uid)
    }

    fn enqueue(&self, uid: Uid) -> RelayResult<()> {
        CRAWL_QUEUE_DEPTH.inc();
        self.work_tx
            .send(uid)
            .map_err(|_| RelayError::Internal("crawl dispatcher is shut down".to_string()))
    }

    async fn worker(self: Arc<Self>, n: usize) {
        loop {
            let uid = {
                let mut rx = self.work_rx.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    msg = rx.recv() => match msg {
                        Some(uid) => uid,
                        None => return,
                    },
                }
            };
            CRAWL_QUEUE_DEPTH.dec();

            let work = {
                let mut state = self.state.lock().unwrap();
                let Some(job) = state.active.get_mut(&uid) else {
                    continue;
                };
                job.executing = true;
                CrawlWork {
                    actor: job.actor.clone(),
                    init_scrape: job.init_scrape,
                    catchup: std::mem::take(&mut job.catchup),
                }
            };

            debug!(worker = n, uid, init = work.init_scrape, "starting crawl job");
            CRAWL_JOBS_ACTIVE.inc();
            if let Err(e) = self.fetcher.fetch_and_index(work).await {
                // the dispatcher never retries; the actor may be re-admitted later
                error!(uid, error = %e, "crawl job failed");
            }
            CRAWL_JOBS_ACTIVE.dec();

            let requeue = {
                let mut state = self.state.lock().unwrap();
                match state.active.get_mut(&uid) {
                    Some(job) if job.rerequested => {
                        job.rerequested = false;
                        job.executing = false;
                        job.init_scrape = false;
                        true
                    }
                    _ => {
                        state.active.remove(&uid);
                        false
                    }
                }
            };

            if requeue {
                if let Err(e) = self.enqueue(uid) {
                    error!(uid, error = %e, "failed to requeue crawl job");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn actor(uid: Uid) -> Actor {
        Actor {
            uid,
            did: format!("did:plc:user{}", uid),
            handle: None,
            display_name: None,
            pds: 1,
            tombstoned: false,
            taken_down: false,
        }
    }

    /// Records each execution and can hold jobs open until released.
    struct GatedFetcher {
        runs: Mutex<Vec<CrawlWork>>,
        started: Notify,
        gate: Notify,
        hold: std::sync::atomic::AtomicBool,
        current: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl GatedFetcher {
        fn new(hold: bool) -> Arc<Self> {
            Arc::new(Self {
                runs: Mutex::new(Vec::new()),
                started: Notify::new(),
                gate: Notify::new(),
                hold: std::sync::atomic::AtomicBool::new(hold),
                current: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }

        fn run_count(&self) -> usize {
            self.runs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RepoFetcher for GatedFetcher {
        async fn fetch_and_index(&self, work: CrawlWork) -> RelayResult<()> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);

            self.runs.lock().unwrap().push(work);
            self.started.notify_one();
            if self.hold.load(Ordering::SeqCst) {
                self.gate.notified().await;
            } else {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }

            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn bundle(seq: i64, since: &str, rev: &str) -> CommitBundle {
        CommitBundle {
            seq,
            since: Some(since.to_string()),
            rev: rev.to_string(),
            blocks: Vec::new(),
            ops: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_coalesces_queued_requests() {
        let fetcher = GatedFetcher::new(false);
        let dispatcher = CrawlDispatcher::new(fetcher.clone(), 2);

        let a = actor(1);
        dispatcher.crawl(&a).unwrap();
        dispatcher.crawl(&a).unwrap();
        dispatcher.crawl(&a).unwrap();

        dispatcher.run();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // all pre-execution requests merged into one job
        assert_eq!(fetcher.run_count(), 1);
        assert!(!dispatcher.has_job(1));
    }

    #[tokio::test]
    async fn test_rerequest_during_execution_runs_exactly_once_more() {
        let fetcher = GatedFetcher::new(true);
        let dispatcher = CrawlDispatcher::new(fetcher.clone(), 1);
        dispatcher.run();

        let a = actor(1);
        dispatcher.crawl(&a).unwrap();
        fetcher.started.notified().await;

        // three requests while executing collapse into a single re-run
        dispatcher.crawl(&a).unwrap();
        dispatcher.crawl(&a).unwrap();
        dispatcher.crawl(&a).unwrap();

        // events buffered during execution must survive into the re-run
        assert!(dispatcher.buffer_event(1, bundle(1, "r0", "r1")));
        assert!(dispatcher.buffer_event(1, bundle(2, "r1", "r2")));

        fetcher.hold.store(false, Ordering::SeqCst);
        fetcher.gate.notify_one();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let runs = fetcher.runs.lock().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].init_scrape);
        assert!(!runs[1].init_scrape);
        let seqs: Vec<i64> = runs[1].catchup.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let fetcher = GatedFetcher::new(false);
        let dispatcher = CrawlDispatcher::new(fetcher.clone(), 3);
        dispatcher.run();

        for uid in 1..=20 {
            dispatcher.crawl(&actor(uid)).unwrap();
        }

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(fetcher.run_count(), 20);
        assert!(fetcher.max_concurrent.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_buffer_event_without_job() {
        let fetcher = GatedFetcher::new(false);
        let dispatcher = CrawlDispatcher::new(fetcher, 1);
        assert!(!dispatcher.buffer_event(42, bundle(1, "r0", "r1")));
    }

    #[tokio::test]
    async fn test_clean_completion_discards_buffer() {
        let fetcher = GatedFetcher::new(true);
        let dispatcher = CrawlDispatcher::new(fetcher.clone(), 1);
        dispatcher.run();

        let a = actor(1);
        dispatcher.crawl(&a).unwrap();
        fetcher.started.notified().await;
        assert!(dispatcher.buffer_event(1, bundle(1, "r0", "r1")));

        fetcher.hold.store(false, Ordering::SeqCst);
        fetcher.gate.notify_one();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // no re-request: job is gone and its buffer with it
        assert_eq!(fetcher.run_count(), 1);
        assert!(!dispatcher.has_job(1));
    }
}
