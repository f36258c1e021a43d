//! The plugin manager: one actor task owns the [`Topology`]; every registration
//! connection talks to it through a [`PluginManagerHandle`].

use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use pipeline_plugin::{
    ConnectionType, PluginRegistration, RegistrationResponse,
    connection::bind,
    registration::{Registrar, serve_registrations},
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{config::PluginManagerConfiguration, topology::Topology};

// -----------------------------------------------------------------------------
// Commands for the actor
// -----------------------------------------------------------------------------

#[derive(Debug)]
enum Command {
    Register(PluginRegistration, oneshot::Sender<RegistrationResponse>),
    RegistrationOrder(oneshot::Sender<Vec<(String, ConnectionType)>>),
}

#[derive(Clone, Debug)]
pub struct PluginManagerHandle {
    tx: mpsc::Sender<Command>,
}

impl PluginManagerHandle {
    /// Spawns the actor owning `topology`. It stops when `token` is cancelled
    /// or every handle is dropped.
    pub fn spawn(topology: Topology, token: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(topology_actor(topology, rx, token));
        Self { tx }
    }

    pub async fn registration_order(&self) -> Result<Vec<(String, ConnectionType)>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::RegistrationOrder(tx))
            .await
            .map_err(|_| anyhow!("plugin manager is stopped"))?;
        rx.await
            .map_err(|_| anyhow!("plugin manager dropped the request"))
    }
}

#[async_trait]
impl Registrar for PluginManagerHandle {
    async fn register(&self, request: PluginRegistration) -> RegistrationResponse {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Register(request, tx)).await.is_err() {
            return RegistrationResponse::rejected("plugin manager is stopped");
        }
        rx.await
            .unwrap_or_else(|_| RegistrationResponse::rejected("plugin manager dropped the request"))
    }
}

async fn topology_actor(
    mut topology: Topology,
    mut rx: mpsc::Receiver<Command>,
    token: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        match command {
            Command::Register(request, reply) => {
                let response = match topology.register(&request) {
                    Ok(accepted) => RegistrationResponse::Accepted(accepted),
                    Err(e) => {
                        warn!(error = %e, "registration rejected");
                        RegistrationResponse::rejected(e.to_string())
                    }
                };
                let _ = reply.send(response);
            }
            Command::RegistrationOrder(reply) => {
                let _ = reply.send(topology.registration_order().to_vec());
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Manager
// -----------------------------------------------------------------------------

pub struct PluginManager {
    config: PluginManagerConfiguration,
    token: CancellationToken,
}

impl PluginManager {
    pub fn new(config: PluginManagerConfiguration) -> Self {
        Self {
            config,
            token: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Binds the registration endpoint and answers requests until cancelled.
    pub async fn launch_listener(self) -> Result<()> {
        self.config.verify()?;
        let listener = bind(&self.config.host).await?;
        self.serve(listener).await
    }

    /// Like [`launch_listener`](Self::launch_listener) on an already bound listener.
    pub async fn serve(self, listener: tokio::net::TcpListener) -> Result<()> {
        info!(
            host = %self.config.host,
            plugins = self.config.plugins.len(),
            "plugin manager starting"
        );
        let handle = PluginManagerHandle::spawn(
            Topology::new(self.config.plugins.clone()),
            self.token.clone(),
        );
        serve_registrations(listener, Arc::new(handle), self.token.clone()).await?;
        info!("plugin manager stopped");
        Ok(())
    }
}
