use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::driver::{Outcome, Pipeline, PipelineError};
use crate::RawEmail;

struct PipelineJob {
    digest: String,
    raw: RawEmail,
}

type JobResult = (String, Result<Outcome, PipelineError>);

#[derive(Debug, thiserror::Error)]
#[error("pipeline queue is closed")]
pub struct QueueClosed;

/// Cloneable handle used by the HTTP boundary to enqueue accepted emails.
#[derive(Clone)]
pub struct PipelineSubmitter {
    sender: mpsc::Sender<PipelineJob>,
}

impl PipelineSubmitter {
    /// Waits for queue space when the queue is full.
    pub async fn submit(&self, digest: String, raw: RawEmail) -> Result<(), QueueClosed> {
        self.sender
            .send(PipelineJob { digest, raw })
            .await
            .map_err(|_| QueueClosed)
    }
}

/// Supervised background runner for freshly accepted emails.
///
/// Jobs flow through a bounded channel into a supervisor that spawns one task
/// per email, never more than `max_in_flight` at a time, and observes every
/// task's result.
pub struct PipelineQueue {
    submitter: PipelineSubmitter,
    supervisor: JoinHandle<()>,
}

impl PipelineQueue {
    pub fn start(pipeline: Arc<Pipeline>, capacity: usize, max_in_flight: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let limiter = Arc::new(Semaphore::new(max_in_flight.max(1)));
        let supervisor = tokio::spawn(supervise(pipeline, receiver, limiter));
        info!(
            "pipeline queue started: capacity={}, max_in_flight={}",
            capacity, max_in_flight
        );
        Self {
            submitter: PipelineSubmitter { sender },
            supervisor,
        }
    }

    pub fn submitter(&self) -> PipelineSubmitter {
        self.submitter.clone()
    }

    /// Stops accepting work and waits for in-flight emails to finish.
    ///
    /// Every submitter clone must be dropped first or this waits forever.
    pub async fn shutdown(self) {
        drop(self.submitter);
        if let Err(err) = self.supervisor.await {
            error!("pipeline supervisor ended abnormally: {}", err);
        }
        info!("pipeline queue drained");
    }
}

async fn supervise(
    pipeline: Arc<Pipeline>,
    mut receiver: mpsc::Receiver<PipelineJob>,
    limiter: Arc<Semaphore>,
) {
    let mut tasks: JoinSet<JobResult> = JoinSet::new();
    loop {
        tokio::select! {
            job = receiver.recv() => {
                let Some(job) = job else { break };
                let permit = match limiter.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!("[{}] pipeline limiter closed, dropping job", job.digest);
                        break;
                    }
                };
                let pipeline = pipeline.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let result = pipeline.handle_new_email(&job.digest, &job.raw, true).await;
                    (job.digest, result)
                });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => observe(joined),
        }
    }

    while let Some(joined) = tasks.join_next().await {
        observe(joined);
    }
}

fn observe(joined: Result<JobResult, JoinError>) {
    match joined {
        Ok((digest, Ok(outcome))) => debug!("[{}] pipeline task finished: {:?}", digest, outcome),
        Ok((digest, Err(err))) => warn!("[{}] pipeline task failed, marker kept: {}", digest, err),
        Err(err) if err.is_panic() => error!("pipeline task panicked: {}", err),
        Err(err) => warn!("pipeline task cancelled: {}", err),
    }
}
