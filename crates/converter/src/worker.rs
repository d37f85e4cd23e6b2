//! Worker loop for the video converter
//!
//! Receives raw task payloads over a channel and runs them through the
//! conversion pipeline strictly one after another.

use crate::pipeline::ConversionPipeline;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// Capacity of the payload queue
const QUEUE_CAPACITY: usize = 100;

/// Error type for worker operations
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker stopped and no longer accepts payloads
    #[error("Failed to submit task: worker queue closed")]
    QueueClosed,
}

/// Counters for processed tasks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Payloads taken off the queue
    pub received: u64,
    /// Tasks that finished every stage
    pub completed: u64,
    /// Tasks that stopped at a failing stage
    pub failed: u64,
}

/// Shared worker counters
pub type SharedStats = Arc<RwLock<WorkerStats>>;

/// Sequential task worker
pub struct Worker {
    pipeline: Arc<ConversionPipeline>,
    stats: SharedStats,
    job_tx: mpsc::Sender<Vec<u8>>,
    job_rx: mpsc::Receiver<Vec<u8>>,
}

impl Worker {
    /// Create a worker around a pipeline
    pub fn new(pipeline: ConversionPipeline) -> Self {
        let (job_tx, job_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            pipeline: Arc::new(pipeline),
            stats: Arc::new(RwLock::new(WorkerStats::default())),
            job_tx,
            job_rx,
        }
    }

    /// Queue a raw payload for processing
    pub async fn submit(&self, payload: Vec<u8>) -> Result<(), WorkerError> {
        self.job_tx
            .send(payload)
            .await
            .map_err(|_| WorkerError::QueueClosed)
    }

    /// Get a clone of the payload sender for external submission
    pub fn job_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.job_tx.clone()
    }

    /// Get the shared counters
    pub fn stats(&self) -> SharedStats {
        self.stats.clone()
    }

    /// Process queued payloads until every sender is dropped
    ///
    /// Failures are already reported by the pipeline; the loop only counts
    /// them and moves on to the next payload.
    pub async fn run(self) -> WorkerStats {
        let Worker {
            pipeline,
            stats,
            job_tx,
            mut job_rx,
        } = self;
        drop(job_tx);

        while let Some(payload) = job_rx.recv().await {
            stats.write().await.received += 1;

            match pipeline.handle(&payload).await {
                Ok(report) => {
                    info!(
                        video_id = report.video_id,
                        chunks = report.chunk_count,
                        manifest = %report.manifest_path.display(),
                        "task finished"
                    );
                    stats.write().await.completed += 1;
                }
                Err(e) => {
                    warn!(stage = %e.stage(), "task failed: {}", e);
                    stats.write().await.failed += 1;
                }
            }
        }

        let final_stats = stats.read().await.clone();
        info!(
            received = final_stats.received,
            completed = final_stats.completed,
            failed = final_stats.failed,
            "worker queue drained"
        );
        final_stats
    }
}
