#![forbid(unsafe_code)]

//! Bounded download worker pool.
//!
//! Submissions are queued as [`DownloadJob`]s keyed by record id. A fixed
//! number of workers pull from the queue, run the blocking extraction on the
//! blocking thread pool and write the outcome back to that exact row.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use anyhow::{Result, anyhow, bail};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::assets::remove_assets;
use crate::fetch::{Fetcher, download_media};
use crate::metadata::VideoStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub record_id: i64,
    pub url: String,
}

/// Snapshot of the queue counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct QueueCounters {
    queued: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Everything a worker needs to finish a job.
pub struct WorkerContext {
    pub store: Arc<VideoStore>,
    pub fetcher: Arc<dyn Fetcher>,
    pub assets_dir: PathBuf,
}

#[derive(Clone)]
pub struct DownloadQueue {
    sender: mpsc::UnboundedSender<DownloadJob>,
    counters: Arc<QueueCounters>,
}

impl DownloadQueue {
    /// Spawns `workers` worker tasks (at least one) on the current runtime.
    /// Workers stop once every clone of the returned queue is dropped.
    pub fn start(context: WorkerContext, workers: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(QueueCounters::default());
        let context = Arc::new(context);

        let workers = workers.max(1);
        for worker in 0..workers {
            tokio::spawn(worker_loop(
                worker,
                receiver.clone(),
                context.clone(),
                counters.clone(),
            ));
        }
        info!(workers, "download workers started");

        Self { sender, counters }
    }

    pub fn enqueue(&self, job: DownloadJob) -> Result<()> {
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(job).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            bail!("download workers are not running");
        }
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.counters.queued.load(Ordering::SeqCst),
            running: self.counters.running.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    /// Re-queues rows left `pending` by a previous run. Rows without a source
    /// URL cannot be retried and are marked failed instead.
    pub async fn recover_pending(&self, store: &VideoStore) -> Result<usize> {
        let mut requeued = 0;
        for record in store.pending().await? {
            if record.url.trim().is_empty() {
                store
                    .mark_failed(record.id, "record has no source URL")
                    .await?;
                continue;
            }
            self.enqueue(DownloadJob {
                record_id: record.id,
                url: record.url,
            })?;
            requeued += 1;
        }
        Ok(requeued)
    }
}

async fn worker_loop(
    worker: usize,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<DownloadJob>>>,
    context: Arc<WorkerContext>,
    counters: Arc<QueueCounters>,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };
        counters.running.fetch_add(1, Ordering::SeqCst);
        counters.queued.fetch_sub(1, Ordering::SeqCst);

        let outcome = process_job(&context, &job).await;

        counters.running.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(
                    worker,
                    record_id = job.record_id,
                    url = %job.url,
                    "download failed: {err:#}"
                );
            }
        }
    }
    debug!(worker, "download worker stopped");
}

/// Downloads one job and records the result on its row.
async fn process_job(context: &WorkerContext, job: &DownloadJob) -> Result<()> {
    info!(record_id = job.record_id, url = %job.url, "download started");

    let fetcher = context.fetcher.clone();
    let url = job.url.clone();
    let assets_dir = context.assets_dir.clone();
    let result = tokio::task::spawn_blocking(move || {
        download_media(fetcher.as_ref(), &url, &assets_dir)
    })
    .await
    .map_err(|err| anyhow!("download task aborted: {err}"))
    .and_then(|result| result);

    let completion = match result {
        Ok(completion) => completion,
        Err(err) => {
            record_failure(context, job.record_id, &err).await;
            return Err(err);
        }
    };
    let produced: Vec<String> = std::iter::once(completion.filename.clone())
        .chain(completion.thumbnail.clone())
        .collect();

    match context.store.mark_ready(job.record_id, &completion).await {
        Ok(true) => {
            info!(
                record_id = job.record_id,
                video_id = %completion.video_id,
                filename = %completion.filename,
                "download finished"
            );
            Ok(())
        }
        Ok(false) => {
            warn!(
                record_id = job.record_id,
                "record deleted while downloading; discarding files"
            );
            discard_assets(context, job.record_id, &produced).await;
            Ok(())
        }
        Err(err) => {
            let err = err.context("recording finished download");
            discard_assets(context, job.record_id, &produced).await;
            record_failure(context, job.record_id, &err).await;
            Err(err)
        }
    }
}

/// If this write fails as well the row stays `pending` and is retried by
/// startup recovery.
async fn record_failure(context: &WorkerContext, record_id: i64, err: &anyhow::Error) {
    if let Err(store_err) = context
        .store
        .mark_failed(record_id, &format!("{err:#}"))
        .await
    {
        error!(record_id, "could not record download failure: {store_err:#}");
    }
}

/// Removes freshly produced files unless another row already points at them.
async fn discard_assets(context: &WorkerContext, record_id: i64, names: &[String]) {
    let names = match context.store.unshared_assets(record_id, names).await {
        Ok(names) => names,
        Err(err) => {
            warn!(record_id, "keeping downloaded files: {err:#}");
            return;
        }
    };
    remove_assets(&context.assets_dir, &names).await;
}
