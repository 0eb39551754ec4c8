//! Bounded producer/consumer ingestion.
//!
//! One worker task per work item pages through its resource and streams transformed chunks into
//! a shared bounded channel; at most `workers` items are fetched at once. The caller's task is
//! the single consumer and the only place rows are persisted. Each worker always ends with a
//! `Done` sentinel, even when it fails or panics, so the consumer knows when to stop.

use async_trait::async_trait;
use futures::{stream::FuturesUnordered, FutureExt, StreamExt};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{PersistenceError, PipelineError};
use crate::http::paginate::{ChunkSink, CollectReport, Collector, PagedResource, SinkFlow};
use crate::normalization::records::RecordTransform;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// One unit of producer work, e.g. a single indicator series.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: String,
    pub resource: PagedResource,
}

#[derive(Debug)]
pub enum Message<R> {
    Chunk { item: String, rows: Vec<R> },
    Done { item: String, outcome: ItemOutcome },
}

/// How a worker's fetch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Completed(CollectReport),
    /// Non-success status or undecodable first page.
    Skipped { reason: String },
    /// Network failure or panic.
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Completed,
    Skipped,
    Failed,
    /// No sentinel was observed (channel closed early).
    Unfinished,
}

#[derive(Debug, Clone, Default)]
pub struct ItemReport {
    pub outcome: Option<ItemOutcome>,
    pub chunks: usize,
    pub rows_received: usize,
    pub rows_written: u64,
    pub persist_errors: Vec<String>,
}

impl ItemReport {
    /// A persistence failure fails the item even if its fetch completed.
    pub fn status(&self) -> ItemStatus {
        match &self.outcome {
            _ if !self.persist_errors.is_empty() => ItemStatus::Failed,
            Some(ItemOutcome::Completed(_)) => ItemStatus::Completed,
            Some(ItemOutcome::Skipped { .. }) => ItemStatus::Skipped,
            Some(ItemOutcome::Failed { .. }) => ItemStatus::Failed,
            None => ItemStatus::Unfinished,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub items: BTreeMap<String, ItemReport>,
    pub chunks: usize,
    pub rows_written: u64,
    pub cancelled: bool,
}

impl PipelineReport {
    fn ids_with(&self, status: ItemStatus) -> Vec<String> {
        self.items
            .iter()
            .filter(|(_, r)| r.status() == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn failed_items(&self) -> Vec<String> {
        let mut ids = self.ids_with(ItemStatus::Failed);
        ids.extend(self.ids_with(ItemStatus::Unfinished));
        ids
    }

    pub fn skipped_items(&self) -> Vec<String> {
        self.ids_with(ItemStatus::Skipped)
    }

    pub fn completed_items(&self) -> Vec<String> {
        self.ids_with(ItemStatus::Completed)
    }
}

/// Persists chunks on behalf of the pipeline. Called from a single task, in arrival order.
#[async_trait]
pub trait ChunkConsumer<R: Send + 'static>: Send {
    async fn consume(&mut self, item: &str, rows: Vec<R>) -> Result<u64, PersistenceError>;
}

/// Cooperative cancellation flag shared by every worker of a run.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Producer side of the queue for one work item. `accept` waits while the channel is full.
pub struct ChannelSink<R> {
    item: String,
    tx: mpsc::Sender<Message<R>>,
    stop: StopHandle,
}

impl<R> ChannelSink<R> {
    pub fn new(item: impl Into<String>, tx: mpsc::Sender<Message<R>>, stop: StopHandle) -> Self {
        Self {
            item: item.into(),
            tx,
            stop,
        }
    }
}

#[async_trait]
impl<R: Send + 'static> ChunkSink<R> for ChannelSink<R> {
    async fn accept(&mut self, chunk: Vec<R>) -> SinkFlow {
        if self.stop.is_stopped() {
            debug!(item = %self.item, rows = chunk.len(), "stop requested; dropping chunk");
            return SinkFlow::Stop;
        }
        let msg = Message::Chunk {
            item: self.item.clone(),
            rows: chunk,
        };
        match self.tx.send(msg).await {
            Ok(()) => SinkFlow::Continue,
            Err(_) => SinkFlow::Stop,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    workers: usize,
    queue_capacity: usize,
    stop: StopHandle,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS, DEFAULT_QUEUE_CAPACITY)
    }
}

impl Pipeline {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        Self {
            workers: workers.max(1),
            queue_capacity: queue_capacity.max(1),
            stop: StopHandle::default(),
        }
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run every item to completion and drain the queue into `consumer`.
    ///
    /// Failures of single items never abort their siblings. Once all sentinels are in, any
    /// failed item turns the result into [`PipelineError::ItemsFailed`], which still carries
    /// the full report.
    #[instrument(skip_all, fields(items = items.len(), workers = self.workers, capacity = self.queue_capacity))]
    pub async fn run<T, C>(
        &self,
        collector: Arc<Collector>,
        transform: Arc<T>,
        items: Vec<WorkItem>,
        consumer: &mut C,
    ) -> Result<PipelineReport, PipelineError>
    where
        T: RecordTransform + 'static,
        C: ChunkConsumer<T::Row> + ?Sized,
    {
        let (tx, mut rx) = mpsc::channel::<Message<T::Row>>(self.queue_capacity);
        let sem = Arc::new(Semaphore::new(self.workers));
        let expected = items.len();

        let mut report = PipelineReport::default();
        for item in &items {
            report.items.entry(item.id.clone()).or_default();
        }

        let mut tasks = FuturesUnordered::new();
        for item in items {
            let tx = tx.clone();
            let sem = sem.clone();
            let collector = collector.clone();
            let transform = transform.clone();
            let stop = self.stop.clone();
            tasks.push(tokio::spawn(async move {
                let outcome = match sem.acquire_owned().await {
                    Ok(permit) => {
                        let _p = permit;
                        run_worker(&collector, transform.as_ref(), &item, &tx, &stop).await
                    }
                    Err(_) => ItemOutcome::Failed {
                        reason: "worker pool closed".to_string(),
                    },
                };
                let done = Message::Done {
                    item: item.id,
                    outcome,
                };
                if tx.send(done).await.is_err() {
                    warn!("consumer gone before sentinel could be delivered");
                }
            }));
        }
        // Only worker clones remain, so the channel closes when the last worker exits.
        drop(tx);

        let mut done = 0usize;
        while done < expected {
            let Some(msg) = rx.recv().await else {
                warn!(done, expected, "queue closed before every sentinel arrived");
                break;
            };
            match msg {
                Message::Chunk { item, rows } => {
                    report.chunks += 1;
                    let entry = report.items.entry(item.clone()).or_default();
                    entry.chunks += 1;
                    entry.rows_received += rows.len();
                    match consumer.consume(&item, rows).await {
                        Ok(n) => {
                            entry.rows_written += n;
                            report.rows_written += n;
                        }
                        Err(e) => {
                            error!(item = %item, table = e.table, error = %e, "chunk persistence failed");
                            entry.persist_errors.push(e.to_string());
                        }
                    }
                }
                Message::Done { item, outcome } => {
                    done += 1;
                    match &outcome {
                        ItemOutcome::Completed(r) => {
                            debug!(item = %item, pages = r.pages_fetched, rows = r.rows, "item completed")
                        }
                        ItemOutcome::Skipped { reason } => {
                            warn!(item = %item, reason = %reason, "item skipped")
                        }
                        ItemOutcome::Failed { reason } => {
                            error!(item = %item, reason = %reason, "item failed")
                        }
                    }
                    report.items.entry(item).or_default().outcome = Some(outcome);
                }
            }
        }

        while let Some(joined) = tasks.next().await {
            if let Err(e) = joined {
                warn!(error = %e, "worker task did not finish cleanly");
            }
        }

        report.cancelled = self.stop.is_stopped();
        let failed = report.failed_items();
        info!(
            chunks = report.chunks,
            rows_written = report.rows_written,
            failed = failed.len(),
            skipped = report.skipped_items().len(),
            cancelled = report.cancelled,
            "pipeline drained"
        );
        if failed.is_empty() {
            Ok(report)
        } else {
            Err(PipelineError::ItemsFailed {
                report: Box::new(report),
            })
        }
    }
}

async fn run_worker<T: RecordTransform>(
    collector: &Collector,
    transform: &T,
    item: &WorkItem,
    tx: &mpsc::Sender<Message<T::Row>>,
    stop: &StopHandle,
) -> ItemOutcome {
    if stop.is_stopped() {
        return ItemOutcome::Skipped {
            reason: "stopped before start".to_string(),
        };
    }
    let mut sink = ChannelSink::new(item.id.clone(), tx.clone(), stop.clone());
    let work = collector.collect_into(&item.resource, transform, &mut sink);
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(report)) => ItemOutcome::Completed(report),
        Ok(Err(e)) if e.is_skip() => ItemOutcome::Skipped {
            reason: e.to_string(),
        },
        Ok(Err(e)) => ItemOutcome::Failed {
            reason: e.to_string(),
        },
        Err(_) => ItemOutcome::Failed {
            reason: "worker panicked".to_string(),
        },
    }
}
