//! Sink executor
//!
//! Runs deferred sink writes concurrently and reports the first failure.
//!
//! - One blocking worker per task, bounded by `max_workers` when configured
//! - Returns on the first failure without waiting for the rest; tasks already
//!   running are not interrupted
//! - A fired cancellation token abandons the wait and is not a failure
//! - The task group is shut down on every exit path

use crate::backend::SinkTask;
use crate::error::{PipelineError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How the wait for sink tasks ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    /// Every task finished successfully
    Completed(usize),
    /// The wait was abandoned; `pending` tasks had not reported yet
    Interrupted { pending: usize },
}

#[derive(Debug, Clone, Default)]
pub struct SinkExecutor {
    max_workers: Option<usize>,
}

impl SinkExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of concurrently running sink tasks
    pub fn with_max_workers(max_workers: Option<usize>) -> Self {
        Self { max_workers }
    }

    /// Worker count for `task_count` tasks
    pub fn worker_count(&self, task_count: usize) -> usize {
        match self.max_workers {
            Some(max) => max.clamp(1, task_count.max(1)),
            None => task_count.max(1),
        }
    }

    pub async fn execute(
        &self,
        tasks: Vec<SinkTask>,
        cancel: &CancellationToken,
    ) -> Result<SinkOutcome> {
        let total = tasks.len();
        if total == 0 {
            return Ok(SinkOutcome::Completed(0));
        }

        let workers = self.worker_count(total);
        info!("Running {} sink tasks on {} workers", total, workers);

        let permits = Arc::new(Semaphore::new(workers));
        let mut group = JoinSet::new();

        for task in tasks {
            let permits = permits.clone();
            group.spawn(async move {
                let stage = task.stage().to_string();
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::SinkPanicked {
                        stage: stage.clone(),
                        message: e.to_string(),
                    })?;

                debug!(stage = %stage, "sink task started");
                match tokio::task::spawn_blocking(move || task.run()).await {
                    Ok(Ok(())) => {
                        debug!(stage = %stage, "sink task completed");
                        Ok(())
                    }
                    Ok(Err(source)) => Err(PipelineError::SinkFailed { stage, source }),
                    Err(join_err) => Err(PipelineError::SinkPanicked {
                        stage,
                        message: join_err.to_string(),
                    }),
                }
            });
        }

        let outcome = wait_first_failure(&mut group, total, cancel).await;
        group.shutdown().await;
        outcome
    }
}

async fn wait_first_failure(
    group: &mut JoinSet<Result<()>>,
    total: usize,
    cancel: &CancellationToken,
) -> Result<SinkOutcome> {
    let mut completed = 0;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let pending = total - completed;
                warn!("Sink wait interrupted with {} tasks pending", pending);
                return Ok(SinkOutcome::Interrupted { pending });
            }

            next = group.join_next() => match next {
                None => return Ok(SinkOutcome::Completed(completed)),
                Some(Ok(Ok(()))) => completed += 1,
                Some(Ok(Err(e))) => {
                    error!("Sink task failed: {}", e);
                    return Err(e);
                }
                Some(Err(join_err)) => {
                    error!("Sink task aborted: {}", join_err);
                    return Err(PipelineError::SinkPanicked {
                        stage: "<unknown>".to_string(),
                        message: join_err.to_string(),
                    });
                }
            },
        }
    }
}
