//! Round-robin dispatch over a fixed worker pool with one message in flight
//! per worker.

use std::time::Duration;

use async_trait::async_trait;
use pipeline_plugin::{PluginError, connection::{AckedPush, Inbound}};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A connection to one worker that acknowledges every message it takes.
#[async_trait]
pub trait WorkerLink: Send + 'static {
    fn id(&self) -> &str;

    async fn send_request(&mut self, message: &str) -> Result<(), PluginError>;

    async fn await_ack(&mut self, wait: Duration) -> Result<(), PluginError>;
}

#[async_trait]
impl WorkerLink for AckedPush {
    fn id(&self) -> &str {
        self.peer()
    }

    async fn send_request(&mut self, message: &str) -> Result<(), PluginError> {
        AckedPush::send_request(self, message).await
    }

    async fn await_ack(&mut self, wait: Duration) -> Result<(), PluginError> {
        AckedPush::await_ack(self, wait).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub ack_timeout: Duration,
}

impl RetryPolicy {
    /// Wait for attempt `n` (0 based); grows linearly.
    pub fn wait_for(&self, attempt: u32) -> Duration {
        self.ack_timeout * (attempt + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub id: String,
    pub acknowledged: u64,
    pub removed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub workers: Vec<WorkerOutcome>,
}

impl DispatchReport {
    pub fn acknowledged(&self) -> u64 {
        self.workers.iter().map(|w| w.acknowledged).sum()
    }

    pub fn removed(&self) -> usize {
        self.workers.iter().filter(|w| w.removed).count()
    }
}

pub struct Dispatcher<L> {
    workers: Vec<L>,
    policy: RetryPolicy,
}

impl<L: WorkerLink> Dispatcher<L> {
    pub fn new(workers: Vec<L>, policy: RetryPolicy) -> Self {
        Self { workers, policy }
    }

    /// Hands every inbound message to the next live worker until the inbound
    /// side ends or `token` is cancelled. Fails once no worker is left.
    pub async fn run<I: Inbound + ?Sized>(
        self,
        inbound: &mut I,
        token: &CancellationToken,
    ) -> Result<DispatchReport, PluginError> {
        let scope = token.child_token();
        let mut queues: Vec<(String, mpsc::Sender<String>)> = Vec::with_capacity(self.workers.len());
        let mut tasks: Vec<JoinHandle<WorkerOutcome>> = Vec::with_capacity(self.workers.len());
        for link in self.workers {
            let (tx, rx) = mpsc::channel(1);
            queues.push((link.id().to_string(), tx));
            tasks.push(tokio::spawn(dispatch_worker(link, rx, self.policy, scope.clone())));
        }
        info!(workers = queues.len(), "dispatching");

        let routed = route(inbound, &mut queues, &scope).await;

        // closing the queues lets every worker finish what it holds
        drop(queues);
        if routed.is_err() {
            scope.cancel();
        }
        let mut report = DispatchReport::default();
        for task in tasks {
            match task.await {
                Ok(outcome) => report.workers.push(outcome),
                Err(e) => warn!(error = %e, "dispatch task failed"),
            }
        }
        routed.map(|_| report)
    }
}

async fn route<I: Inbound + ?Sized>(
    inbound: &mut I,
    queues: &mut Vec<(String, mpsc::Sender<String>)>,
    token: &CancellationToken,
) -> Result<(), PluginError> {
    let mut next = 0usize;
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            message = inbound.pull() => message?,
        };
        let Some(mut message) = message else {
            info!("upstream finished");
            return Ok(());
        };
        loop {
            if queues.is_empty() {
                error!("every worker was removed from the pool");
                return Err(PluginError::Closed("no workers left in the pool".into()));
            }
            let index = next % queues.len();
            let sent = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                sent = queues[index].1.send(message) => sent,
            };
            match sent {
                Ok(()) => {
                    next = index + 1;
                    break;
                }
                Err(mpsc::error::SendError(returned)) => {
                    let (id, _) = queues.remove(index);
                    warn!(worker = %id, remaining = queues.len(), "skipping removed worker");
                    message = returned;
                    next = index;
                }
            }
        }
    }
}

async fn dispatch_worker<L: WorkerLink>(
    mut link: L,
    mut queue: mpsc::Receiver<String>,
    policy: RetryPolicy,
    token: CancellationToken,
) -> WorkerOutcome {
    let id = link.id().to_string();
    let mut acknowledged = 0u64;
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            message = queue.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        match deliver(&mut link, &message, &policy, &token).await {
            Ok(()) => {
                acknowledged += 1;
                debug!(worker = %id, acknowledged, "acknowledged");
            }
            Err(e) => {
                queue.close();
                let mut dropped = 1;
                while queue.try_recv().is_ok() {
                    dropped += 1;
                }
                error!(
                    worker = %id,
                    error = %e,
                    dropped,
                    "worker failed, removing it from the pool"
                );
                return WorkerOutcome {
                    id,
                    acknowledged,
                    removed: true,
                };
            }
        }
    }
    WorkerOutcome {
        id,
        acknowledged,
        removed: false,
    }
}

/// Sends once, then waits for the acknowledgement, each retry waiting longer.
async fn deliver<L: WorkerLink>(
    link: &mut L,
    message: &str,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> Result<(), PluginError> {
    link.send_request(message).await?;
    let mut attempt = 0;
    loop {
        let waited = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(PluginError::Closed("dispatch cancelled".into())),
            waited = link.await_ack(policy.wait_for(attempt)) => waited,
        };
        match waited {
            Ok(()) => return Ok(()),
            Err(PluginError::Timeout(ms)) if attempt < policy.max_retries => {
                attempt += 1;
                warn!(worker = link.id(), attempt, waited_ms = ms, "no acknowledgement yet, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}
