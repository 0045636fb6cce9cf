//! Multipart transfer engine
//!
//! Planning, the bounded worker pool, upload and download orchestration and
//! the fan-in buffer that reorders parallel downloads into a stream.

pub mod download;
pub mod fan_in;
pub mod planner;
pub mod pool;
pub mod sink;
pub mod upload;

pub use download::ObjectReader;
pub use fan_in::{fan_in, BufferStrategy, FanInReader, FanInWriter};
pub use planner::{plan_ranges, TransferRange};
pub use pool::WorkerPool;
pub use sink::{FileWriteAt, SharedBuffer, WriteAt};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::TransferConfig;
use crate::metrics::TransferMetrics;
use crate::storage::{ByteBufferPool, CosClient, MultipartSession};

/// Shared handles every transfer runs with
#[derive(Clone)]
pub(crate) struct TransferContext {
    pub cos: Arc<CosClient>,
    pub config: TransferConfig,
    pub buffers: Arc<ByteBufferPool>,
    pub metrics: Arc<TransferMetrics>,
    /// Detached cleanup work (aborts) outliving the call that failed
    pub cleanup: TaskTracker,
}

impl TransferContext {
    pub fn part_size(&self) -> u64 {
        self.config.effective_part_size()
    }

    pub fn concurrency(&self) -> usize {
        self.config.effective_concurrency()
    }

    /// Drain `pool` (if any) and abort `session` in the background
    ///
    /// Runs on a fresh token so the caller's cancellation does not stop the
    /// cleanup. Failures are only logged.
    pub fn spawn_abort<T: Send + 'static>(
        &self,
        session: Arc<MultipartSession>,
        pool: Option<WorkerPool<T>>,
    ) {
        let cos = self.cos.clone();
        let metrics = self.metrics.clone();
        self.cleanup.spawn(async move {
            if let Some(mut pool) = pool {
                pool.cancel();
                let _ = pool.join(true).await;
            }

            let token = CancellationToken::new();
            match cos.abort_multipart_upload(&token, &session).await {
                Ok(()) => {
                    metrics.sessions_aborted.inc();
                    info!(
                        "Aborted multipart upload {} of {}",
                        session.upload_id, session.file_id
                    );
                }
                Err(e) => warn!(
                    "Failed to abort multipart upload {} of {}: {}",
                    session.upload_id, session.file_id, e
                ),
            }
        });
    }
}
