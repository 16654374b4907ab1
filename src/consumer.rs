use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use crate::error::{PipelineError, Stage};
use crate::pipeline::{JobOutcome, JobPipeline};
use crate::services::queue::{MessageQueue, QueueMessage};

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    /// Long-poll wait passed to each receive call.
    pub poll_wait: Duration,
    /// Sleep after a poll that returned nothing.
    pub idle_sleep: Duration,
    /// Sleep after an iteration that failed outside the pipeline's taxonomy.
    pub error_pause: Duration,
    /// Number of pipeline workers. 1 keeps processing strictly sequential.
    pub concurrency: usize,
}

/// Result of a single poll/dispatch iteration.
#[derive(Debug)]
pub enum Poll {
    Idle,
    Handled(JobOutcome),
}

/// Polls the queue forever and hands each message to the pipeline.
pub struct ConsumerLoop {
    queue: Arc<dyn MessageQueue>,
    pipeline: Arc<JobPipeline>,
    settings: LoopSettings,
}

impl ConsumerLoop {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        pipeline: Arc<JobPipeline>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            queue,
            pipeline,
            settings,
        }
    }

    /// One receive followed, if a message arrived, by one pipeline run.
    pub async fn run_once(&self) -> Result<Poll, PipelineError> {
        match self.receive().await? {
            Some(message) => dispatch(&self.pipeline, message).await.map(Poll::Handled),
            None => Ok(Poll::Idle),
        }
    }

    /// Never returns. Errors are logged and the loop keeps polling.
    pub async fn run(self) {
        tracing::info!(
            concurrency = self.settings.concurrency,
            poll_wait_ms = self.settings.poll_wait.as_millis() as u64,
            "Consumer loop started"
        );

        if self.settings.concurrency <= 1 {
            self.run_sequential().await
        } else {
            self.run_pool().await
        }
    }

    async fn run_sequential(&self) {
        loop {
            match self.run_once().await {
                Ok(Poll::Handled(outcome)) => {
                    tracing::debug!(outcome = outcome.as_str(), "Message handled");
                }
                Ok(Poll::Idle) => {
                    tracing::trace!("No messages available, sleeping");
                    sleep(self.settings.idle_sleep).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, stage = ?e.stage(), "Consumer iteration failed");
                    sleep(self.settings.error_pause).await;
                }
            }
        }
    }

    /// One poller feeding `concurrency` workers through a single-slot channel,
    /// so at most `concurrency + 1` messages are leased at any time.
    async fn run_pool(&self) {
        let (tx, rx) = mpsc::channel::<QueueMessage>(1);
        let rx = Arc::new(Mutex::new(rx));

        let workers: Vec<_> = (0..self.settings.concurrency)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let pipeline = Arc::clone(&self.pipeline);
                let error_pause = self.settings.error_pause;
                async move {
                    loop {
                        let message = rx.lock().await.recv().await;
                        let Some(message) = message else {
                            break;
                        };
                        match dispatch(&pipeline, message).await {
                            Ok(outcome) => {
                                tracing::debug!(worker, outcome = outcome.as_str(), "Message handled");
                            }
                            Err(e) => {
                                tracing::error!(worker, error = %e, "Worker iteration failed");
                                sleep(error_pause).await;
                            }
                        }
                    }
                }
            })
            .collect();

        let poller = async move {
            loop {
                match self.receive().await {
                    Ok(Some(message)) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => sleep(self.settings.idle_sleep).await,
                    Err(e) => {
                        tracing::error!(error = %e, "Queue receive failed");
                        sleep(self.settings.error_pause).await;
                    }
                }
            }
        };

        futures::future::join(poller, futures::future::join_all(workers)).await;
    }

    async fn receive(&self) -> Result<Option<QueueMessage>, PipelineError> {
        self.queue
            .receive(self.settings.poll_wait)
            .await
            .map_err(|e| PipelineError::catastrophic(Stage::Receive, e))
    }
}

/// Run the pipeline on its own task so a panic in any stage is contained
/// and reported as an error instead of taking the loop down.
async fn dispatch(
    pipeline: &Arc<JobPipeline>,
    message: QueueMessage,
) -> Result<JobOutcome, PipelineError> {
    let pipeline = Arc::clone(pipeline);
    match tokio::spawn(async move { pipeline.handle(message).await }).await {
        Ok(result) => result,
        Err(join) => Err(PipelineError::catastrophic(
            Stage::Dispatch,
            format!("job task panicked: {join}"),
        )),
    }
}

