use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

use crate::{
    connection::normalize_address,
    message::{PeerConnectionInformation, PluginRegistration, RegistrationResponse},
    plugin::PluginError,
};

/// How a stage asks the plugin manager where its neighbours are.
#[async_trait]
pub trait PluginManagerConnection: Send + Sync {
    async fn request_config(
        &self,
        registration: &PluginRegistration,
    ) -> Result<PeerConnectionInformation, PluginError>;
}

/// Bound on one registration round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TcpPluginManagerConnection {
    address: String,
    retries: u32,
    backoff: Duration,
    request_timeout: Duration,
}

impl TcpPluginManagerConnection {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            retries: 0,
            backoff: Duration::from_millis(500),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    async fn round_trip(
        &self,
        registration: &PluginRegistration,
    ) -> Result<RegistrationResponse, PluginError> {
        let stream = TcpStream::connect(normalize_address(&self.address)).await?;
        let mut framed = Framed::new(stream, LinesCodec::new());
        framed.send(serde_json::to_string(registration)?).await?;
        let line = framed.next().await.ok_or_else(|| {
            PluginError::Closed(format!("{} closed before replying", self.address))
        })??;
        Ok(serde_json::from_str(&line)?)
    }

    /// A manager that accepts but never answers counts as a transport failure.
    async fn bounded_round_trip(
        &self,
        registration: &PluginRegistration,
    ) -> Result<RegistrationResponse, PluginError> {
        timeout(self.request_timeout, self.round_trip(registration))
            .await
            .map_err(|_| PluginError::Timeout(self.request_timeout.as_millis() as u64))?
    }
}

#[async_trait]
impl PluginManagerConnection for TcpPluginManagerConnection {
    async fn request_config(
        &self,
        registration: &PluginRegistration,
    ) -> Result<PeerConnectionInformation, PluginError> {
        let mut attempt = 0;
        loop {
            match self.bounded_round_trip(registration).await {
                Ok(RegistrationResponse::Accepted(reply)) => {
                    if reply.id != registration.id || reply.kind != registration.kind {
                        return Err(PluginError::Protocol(format!(
                            "asked about {}/{} but got a reply for {}/{}",
                            registration.id, registration.kind, reply.id, reply.kind
                        )));
                    }
                    debug!(id = %reply.id, kind = %reply.kind, address = ?reply.peer.address, "registered");
                    return Ok(reply.peer);
                }
                Ok(RegistrationResponse::Rejected { error }) => {
                    return Err(PluginError::Registration(error));
                }
                Err(e) if attempt < self.retries && !matches!(e, PluginError::Json(_)) => {
                    attempt += 1;
                    warn!(
                        address = %self.address,
                        attempt,
                        error = %e,
                        "plugin manager not reachable, retrying"
                    );
                    sleep(self.backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
