pub mod dispatcher;
pub mod worker_manager;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use pipeline_plugin::{
    HasPipelineConfig, PeerConnectionInformation, PipelinePlugin, PipelinePluginConfiguration,
    PluginError, PluginRuntime, StageRole,
    connection::{AckedPush, PipelinePull, PipelinePush, bind},
    plugin_runtime::run_loop,
    registration::serve_registrations,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    dispatcher::{DispatchReport, Dispatcher, RetryPolicy},
    worker_manager::WorkerRegistrar,
};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 10_000;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_ack_timeout_ms() -> u64 {
    DEFAULT_ACK_TIMEOUT_MS
}

fn default_drain_timeout_ms() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfiguration {
    #[serde(rename = "plugin")]
    pub pipeline: PipelinePluginConfiguration,
    /// Number of workers to wait for before dispatching.
    pub workers: usize,
    /// Where workers register.
    pub worker_manager: String,
    /// Where workers connect to receive messages.
    pub dispatch: String,
    /// Where workers send their results.
    pub sink: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// How long worker results may still arrive once the upstream has ended.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl HasPipelineConfig for LoadBalancerConfiguration {
    fn pipeline(&self) -> &PipelinePluginConfiguration {
        &self.pipeline
    }

    fn verify_stage(&self) -> Result<(), PluginError> {
        if self.workers == 0 {
            return Err(PluginError::Configuration("workers must be at least 1".into()));
        }
        if self.ack_timeout_ms == 0 || self.drain_timeout_ms == 0 {
            return Err(PluginError::Configuration("ackTimeoutMs and drainTimeoutMs must be positive".into()));
        }
        let addresses = [&self.worker_manager, &self.dispatch, &self.sink];
        if addresses.iter().any(|a| a.trim().is_empty()) {
            return Err(PluginError::Configuration(
                "workerManager, dispatch and sink must be set".into(),
            ));
        }
        if self.worker_manager == self.dispatch
            || self.worker_manager == self.sink
            || self.dispatch == self.sink
        {
            return Err(PluginError::Configuration(
                "workerManager, dispatch and sink must be distinct".into(),
            ));
        }
        Ok(())
    }
}

impl LoadBalancerConfiguration {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
        }
    }
}

/// Accepts exactly `count` worker connections on `listener`.
pub async fn accept_workers(
    listener: &TcpListener,
    count: usize,
    token: &CancellationToken,
) -> Result<Vec<AckedPush>, PluginError> {
    let mut workers = Vec::with_capacity(count);
    while workers.len() < count {
        let (stream, peer) = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(PluginError::Closed("cancelled while waiting for workers".into()));
            }
            accepted = listener.accept() => accepted?,
        };
        info!(%peer, connected = workers.len() + 1, expected = count, "worker connected");
        workers.push(AckedPush::new(stream));
    }
    Ok(workers)
}

struct Forward;

#[async_trait]
impl PipelinePlugin for Forward {
    async fn process(&mut self, input: String) -> anyhow::Result<Option<String>> {
        Ok(Some(input))
    }
}

pub struct LoadBalancer {
    config: LoadBalancerConfiguration,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfiguration) -> Self {
        Self { config }
    }

    /// Registers with the plugin manager, brings up the worker manager and the
    /// sink, waits for the worker pool and dispatches until the upstream ends.
    pub async fn run(self, mut runtime: PluginRuntime) -> Result<DispatchReport, PluginError> {
        let config = self.config;
        let id = config.pipeline.id.clone();
        let token = runtime.cancellation_token();
        let info = runtime.resolve_topology().await?.clone();
        StageRole::Sink.validate(&id, &info)?;

        let scope = token.child_token();
        let _stop_on_exit = scope.clone().drop_guard();
        let has_downstream = info.downstream.is_present();

        let forwarder = if has_downstream {
            let mut sink = PipelinePull::open(
                &PeerConnectionInformation::bind(config.sink.clone()),
                config.pipeline.buffer_size,
                scope.clone(),
            )
            .await?;
            let acceptor = sink.acceptor_token();
            let mut outbound = PipelinePush::open(&info.downstream, scope.clone()).await?;
            let forward_token = scope.clone();
            let task = tokio::spawn(async move {
                run_loop(&mut Forward, &mut sink, Some(&mut outbound), &forward_token).await
            });
            Some((task, acceptor))
        } else {
            None
        };

        let dispatch_listener = bind(&config.dispatch).await?;
        let registrar = Arc::new(WorkerRegistrar::new(
            config.dispatch.clone(),
            has_downstream.then(|| config.sink.clone()),
        ));
        let worker_listener = bind(&config.worker_manager).await?;
        let worker_manager = tokio::spawn(serve_registrations(
            worker_listener,
            registrar,
            scope.clone(),
        ));

        let mut inbound =
            PipelinePull::open(&info.upstream, config.pipeline.buffer_size, scope.clone()).await?;

        info!(%id, workers = config.workers, "waiting for workers");
        let result = match accept_workers(&dispatch_listener, config.workers, &scope).await {
            Ok(workers) => {
                Dispatcher::new(workers, config.retry_policy())
                    .run(&mut inbound, &scope)
                    .await
            }
            Err(e) => Err(e),
        };
        // every worker link is closed by now
        drop(dispatch_listener);
        drop(inbound);

        if result.is_err() || token.is_cancelled() {
            scope.cancel();
        }
        if let Some((task, acceptor)) = forwarder {
            if let Some(acceptor) = acceptor {
                acceptor.cancel();
            }
            drain_sink(task, Duration::from_millis(config.drain_timeout_ms), &scope).await;
        }
        scope.cancel();
        if let Err(e) = worker_manager.await {
            warn!(error = %e, "worker manager task failed");
        }

        let report = result?;
        info!(
            %id,
            acknowledged = report.acknowledged(),
            removed = report.removed(),
            "load balancer stopped"
        );
        Ok(report)
    }
}

/// Waits for the workers to close their result connections so every result
/// they already pushed reaches the downstream.
async fn drain_sink(
    mut task: JoinHandle<Result<u64, PluginError>>,
    wait: Duration,
    scope: &CancellationToken,
) {
    let joined = match timeout(wait, &mut task).await {
        Ok(joined) => joined,
        Err(_) => {
            warn!(waited_ms = wait.as_millis() as u64, "workers still connected to the sink, closing it");
            scope.cancel();
            task.await
        }
    };
    match joined {
        Ok(Ok(forwarded)) => info!(forwarded, "sink closed"),
        Ok(Err(e)) => warn!(error = %e, "sink forwarding failed"),
        Err(e) => warn!(error = %e, "sink task failed"),
    }
}
