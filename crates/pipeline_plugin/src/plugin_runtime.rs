//! Runs one pipeline stage: asks the plugin manager where its neighbours are,
//! opens the data plane and drives the message loop.
//!
//! ```ignore
//! use pipeline_plugin::{PluginRuntime, StageConfiguration};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config: StageConfiguration = pipeline_plugin::config::load_stage_config(path)?;
//!     PluginRuntime::new(config.pipeline).run(MyPlugin::default()).await?;
//!     Ok(())
//! }
//! ```

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::PipelinePluginConfiguration,
    connection::{Inbound, Outbound, PipelinePull, PipelinePush},
    manager_client::{PluginManagerConnection, TcpPluginManagerConnection},
    message::{
        ConnectionInformation, ConnectionType, PeerConnectionInformation, PluginRegistration,
    },
    plugin::{PeriodicTask, PipelinePlugin, PluginError, SourcePlugin, StageRole},
};

const REGISTRATION_BACKOFF: Duration = Duration::from_millis(500);

// -----------------------------------------------------------------------------
// Channels
// -----------------------------------------------------------------------------

/// The data plane of a stage. A side is `None` when the topology has no
/// neighbour there.
pub struct ConnectionPair {
    pub inbound: Option<PipelinePull>,
    pub outbound: Option<PipelinePush>,
}

impl ConnectionPair {
    pub async fn open(
        info: &ConnectionInformation,
        buffer_size: usize,
        token: &CancellationToken,
    ) -> Result<Self, PluginError> {
        // bind before connecting so two neighbours never wait on each other
        let (inbound, outbound) = if info.upstream.is_bind {
            let inbound = open_pull(info, buffer_size, token).await?;
            let outbound = open_push(info, token).await?;
            (inbound, outbound)
        } else {
            let outbound = open_push(info, token).await?;
            let inbound = open_pull(info, buffer_size, token).await?;
            (inbound, outbound)
        };
        Ok(Self { inbound, outbound })
    }
}

async fn open_pull(
    info: &ConnectionInformation,
    buffer_size: usize,
    token: &CancellationToken,
) -> Result<Option<PipelinePull>, PluginError> {
    if !info.upstream.is_present() {
        return Ok(None);
    }
    Ok(Some(PipelinePull::open(&info.upstream, buffer_size, token.clone()).await?))
}

async fn open_push(
    info: &ConnectionInformation,
    token: &CancellationToken,
) -> Result<Option<PipelinePush>, PluginError> {
    if !info.downstream.is_present() {
        return Ok(None);
    }
    Ok(Some(PipelinePush::open(&info.downstream, token.clone()).await?))
}

// -----------------------------------------------------------------------------
// Runtime
// -----------------------------------------------------------------------------

pub struct PluginRuntime {
    config: PipelinePluginConfiguration,
    manager: Arc<dyn PluginManagerConnection>,
    token: CancellationToken,
    periodic: Vec<Arc<dyn PeriodicTask>>,
    connection_info: Option<ConnectionInformation>,
}

impl PluginRuntime {
    pub fn new(config: PipelinePluginConfiguration) -> Self {
        let manager = TcpPluginManagerConnection::new(config.plugin_manager.clone())
            .with_retries(config.registration_retries, REGISTRATION_BACKOFF);
        Self::with_manager(config, Arc::new(manager))
    }

    pub fn with_manager(
        config: PipelinePluginConfiguration,
        manager: Arc<dyn PluginManagerConnection>,
    ) -> Self {
        Self {
            config,
            manager,
            token: CancellationToken::new(),
            periodic: Vec::new(),
            connection_info: None,
        }
    }

    /// Adds work run every `task.period()` while the stage is running.
    pub fn with_periodic(mut self, task: Arc<dyn PeriodicTask>) -> Self {
        self.periodic.push(task);
        self
    }

    pub fn config(&self) -> &PipelinePluginConfiguration {
        &self.config
    }

    /// Cancelling this token stops the stage.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn connection_information(&self) -> Option<&ConnectionInformation> {
        self.connection_info.as_ref()
    }

    /// Queries the plugin manager for both sides of this stage. Only allowed once.
    pub async fn resolve_topology(&mut self) -> Result<&ConnectionInformation, PluginError> {
        if self.connection_info.is_some() {
            return Err(PluginError::AlreadyResolved(self.config.id.clone()));
        }
        let id = self.config.id.as_str();
        let upstream = self
            .request(&PluginRegistration::new(id, ConnectionType::Pull))
            .await?;
        let downstream = self
            .request(&PluginRegistration::new(id, ConnectionType::Push))
            .await?;
        info!(
            id,
            upstream = ?upstream.address,
            downstream = ?downstream.address,
            "resolved topology"
        );
        Ok(self.connection_info.insert(ConnectionInformation {
            upstream,
            downstream,
        }))
    }

    async fn request(
        &self,
        registration: &PluginRegistration,
    ) -> Result<PeerConnectionInformation, PluginError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(PluginError::Closed(format!(
                "cancelled while registering {}/{}",
                registration.id, registration.kind
            ))),
            peer = self.manager.request_config(registration) => peer,
        }
    }

    async fn resolved(&mut self) -> Result<ConnectionInformation, PluginError> {
        match &self.connection_info {
            Some(info) => Ok(info.clone()),
            None => Ok(self.resolve_topology().await?.clone()),
        }
    }

    /// Opens the data plane for a stage of the given role.
    pub async fn open_channels(&self, role: StageRole) -> Result<ConnectionPair, PluginError> {
        let info = self.connection_info.as_ref().ok_or_else(|| {
            PluginError::Configuration(
                "Cannot run plugin without connection information".to_string(),
            )
        })?;
        role.validate(&self.config.id, info)?;
        ConnectionPair::open(info, self.config.buffer_size, &self.token).await
    }

    /// Runs a transforming or sink stage until the upstream ends, the token is
    /// cancelled or the data plane fails.
    pub async fn run<P: PipelinePlugin>(mut self, mut plugin: P) -> Result<(), PluginError> {
        self.resolved().await?;
        let role = plugin.role();
        let channels = self.open_channels(role).await?;
        let Some(mut inbound) = channels.inbound else {
            return Err(PluginError::Topology {
                id: self.config.id.clone(),
                reason: format!("a {role} stage needs an upstream"),
            });
        };
        let mut outbound = channels.outbound;

        let scope = self.token.child_token();
        let periodic = spawn_periodic(&self.periodic, &scope);
        info!(id = %self.config.id, %role, "stage running");
        let result = run_loop(&mut plugin, &mut inbound, outbound.as_mut(), &scope).await;
        scope.cancel();
        join_all(periodic).await;

        let processed = result?;
        info!(id = %self.config.id, processed, "stage stopped");
        Ok(())
    }

    /// Runs a source stage until the source is exhausted or the token is cancelled.
    pub async fn run_source<S: SourcePlugin>(mut self, mut source: S) -> Result<u64, PluginError> {
        self.resolved().await?;
        let channels = self.open_channels(StageRole::Source).await?;
        let Some(mut outbound) = channels.outbound else {
            return Err(PluginError::Topology {
                id: self.config.id.clone(),
                reason: "a source needs a downstream stage".into(),
            });
        };

        let scope = self.token.child_token();
        let periodic = spawn_periodic(&self.periodic, &scope);
        info!(id = %self.config.id, "source running");
        let result = run_source_loop(&mut source, &mut outbound, &scope).await;
        scope.cancel();
        join_all(periodic).await;

        let sent = result?;
        info!(id = %self.config.id, sent, "source stopped");
        Ok(sent)
    }
}

// -----------------------------------------------------------------------------
// Loops
// -----------------------------------------------------------------------------

/// Pulls, processes and forwards one message at a time. A processing error
/// drops the message; a data plane error ends the loop. Returns the number of
/// messages processed.
pub async fn run_loop<P, I, O>(
    plugin: &mut P,
    inbound: &mut I,
    mut outbound: Option<&mut O>,
    token: &CancellationToken,
) -> Result<u64, PluginError>
where
    P: PipelinePlugin + ?Sized,
    I: Inbound + ?Sized,
    O: Outbound + ?Sized,
{
    let mut processed = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = inbound.pull() => next?,
        };
        let Some(message) = next else {
            info!("upstream finished");
            break;
        };
        let output = match plugin.process(message).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "failed to process message, dropping it");
                continue;
            }
        };
        processed += 1;
        if let (Some(output), Some(out)) = (output, outbound.as_deref_mut()) {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                pushed = out.push(output) => pushed?,
            }
        }
    }
    Ok(processed)
}

pub async fn run_source_loop<S, O>(
    source: &mut S,
    outbound: &mut O,
    token: &CancellationToken,
) -> Result<u64, PluginError>
where
    S: SourcePlugin + ?Sized,
    O: Outbound + ?Sized,
{
    let mut sent = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = source.next_message() => next?,
        };
        let Some(message) = next else {
            info!(sent, "source exhausted");
            break;
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            pushed = outbound.push(message) => pushed?,
        }
        sent += 1;
    }
    Ok(sent)
}

fn spawn_periodic(
    tasks: &[Arc<dyn PeriodicTask>],
    token: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    tasks
        .iter()
        .cloned()
        .map(|task| {
            let token = token.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(task.period());
                // the first tick completes immediately
                interval.tick().await;
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = interval.tick() => task.tick().await,
                    }
                }
            })
        })
        .collect()
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "periodic task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::PeerConnectionInformation,
        plugin_test_util::{FakePluginManager, UppercasePlugin},
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::mpsc;

    fn config() -> PipelinePluginConfiguration {
        PipelinePluginConfiguration::new("upper", "127.0.0.1:1")
    }

    #[tokio::test]
    async fn resolves_pull_then_push_once() {
        let manager = Arc::new(FakePluginManager::new(
            PeerConnectionInformation::connect("127.0.0.1:7001"),
            PeerConnectionInformation::bind("127.0.0.1:7002"),
        ));
        let mut runtime = PluginRuntime::with_manager(config(), manager.clone());

        let info = runtime.resolve_topology().await.unwrap().clone();
        assert_eq!(info.upstream.address.as_deref(), Some("127.0.0.1:7001"));
        assert!(info.downstream.is_bind);

        let kinds: Vec<_> = manager.requests().into_iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![ConnectionType::Pull, ConnectionType::Push]);

        let again = runtime.resolve_topology().await.unwrap_err();
        assert!(matches!(again, PluginError::AlreadyResolved(id) if id == "upper"));
    }

    #[tokio::test]
    async fn channels_need_resolved_topology() {
        let manager = Arc::new(FakePluginManager::new(
            PeerConnectionInformation::connect("127.0.0.1:7001"),
            PeerConnectionInformation::bind("127.0.0.1:7002"),
        ));
        let runtime = PluginRuntime::with_manager(config(), manager);
        let err = runtime.open_channels(StageRole::Transform).await.err().unwrap();
        assert!(err.to_string().contains("without connection information"));
    }

    #[tokio::test]
    async fn rejected_registration_is_fatal() {
        let manager = Arc::new(FakePluginManager::rejecting("unknown plugin `upper`"));
        let runtime = PluginRuntime::with_manager(config(), manager);
        let err = runtime.run(UppercasePlugin).await.unwrap_err();
        assert!(matches!(err, PluginError::Registration(_)));
        assert!(err.is_startup_error());
    }

    #[tokio::test]
    async fn transform_in_last_position_is_rejected() {
        let manager = Arc::new(FakePluginManager::new(
            PeerConnectionInformation::connect("127.0.0.1:7001"),
            PeerConnectionInformation::absent(true),
        ));
        let runtime = PluginRuntime::with_manager(config(), manager);
        let err = runtime.run(UppercasePlugin).await.unwrap_err();
        assert!(matches!(err, PluginError::Topology { .. }));
    }

    struct Flaky;

    #[async_trait]
    impl PipelinePlugin for Flaky {
        async fn process(&mut self, input: String) -> anyhow::Result<Option<String>> {
            match input.as_str() {
                "boom" => anyhow::bail!("cannot handle {input}"),
                "skip" => Ok(None),
                _ => Ok(Some(input)),
            }
        }
    }

    #[tokio::test]
    async fn loop_drops_failed_and_filtered_messages() {
        let (in_tx, mut in_rx) = mpsc::channel(8);
        let (mut out_tx, mut out_rx) = mpsc::channel(8);
        for message in ["a", "boom", "skip", "b"] {
            in_tx.send(message.to_string()).await.unwrap();
        }
        drop(in_tx);

        let token = CancellationToken::new();
        let processed = run_loop(&mut Flaky, &mut in_rx, Some(&mut out_tx), &token)
            .await
            .unwrap();
        drop(out_tx);

        assert_eq!(processed, 3);
        assert_eq!(out_rx.recv().await.as_deref(), Some("a"));
        assert_eq!(out_rx.recv().await.as_deref(), Some("b"));
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test]
    async fn loop_stops_on_cancellation() {
        let (_in_tx, mut in_rx) = mpsc::channel::<String>(8);
        let token = CancellationToken::new();
        token.cancel();
        let processed = run_loop::<_, _, mpsc::Sender<String>>(&mut Flaky, &mut in_rx, None, &token)
            .await
            .unwrap();
        assert_eq!(processed, 0);
    }

    struct Ticker(AtomicU64);

    #[async_trait]
    impl PeriodicTask for Ticker {
        fn period(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn tick(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn periodic_tasks_stop_with_the_stage() {
        let ticker = Arc::new(Ticker(AtomicU64::new(0)));
        let token = CancellationToken::new();
        let tasks: Vec<Arc<dyn PeriodicTask>> = vec![ticker.clone()];
        let handles = spawn_periodic(&tasks, &token);
        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
        join_all(handles).await;

        let ticks = ticker.0.load(Ordering::SeqCst);
        assert!(ticks >= 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ticker.0.load(Ordering::SeqCst), ticks);
    }
}
