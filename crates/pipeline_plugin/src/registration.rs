//! Line based JSON endpoint where stages ask for their connection information.
//!
//! Served by the plugin manager and by the load balancer's worker manager.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{
    message::{PluginRegistration, RegistrationResponse},
    plugin::PluginError,
};

const MAX_REQUEST_LENGTH: usize = 64 * 1024;

#[async_trait]
pub trait Registrar: Send + Sync + 'static {
    async fn register(&self, request: PluginRegistration) -> RegistrationResponse;
}

/// Answers registration requests on `listener` until `token` is cancelled.
/// Every well framed request line gets exactly one reply line.
pub async fn serve_registrations<R: Registrar>(
    listener: TcpListener,
    registrar: Arc<R>,
    token: CancellationToken,
) -> Result<(), PluginError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "registration endpoint listening");
    }
    loop {
        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "registration connection");
                tokio::spawn(handle_connection(stream, registrar.clone(), token.clone()));
            }
            Err(e) => warn!(error = %e, "failed to accept registration connection"),
        }
    }
    info!("registration endpoint stopped");
    Ok(())
}

async fn handle_connection<R: Registrar>(
    stream: TcpStream,
    registrar: Arc<R>,
    token: CancellationToken,
) {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_REQUEST_LENGTH));
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = framed.next() => next,
        };
        let line = match next {
            None => break,
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(error = %e, "dropping registration connection");
                break;
            }
        };
        let response = match serde_json::from_str::<PluginRegistration>(&line) {
            Ok(request) => registrar.register(request).await,
            Err(e) => {
                warn!(error = %e, "invalid registration request");
                RegistrationResponse::rejected(format!("Invalid Request: {e}"))
            }
        };
        let reply = match serde_json::to_string(&response) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "failed to encode registration reply");
                break;
            }
        };
        if let Err(e) = framed.send(reply).await {
            warn!(error = %e, "failed to send registration reply");
            break;
        }
    }
}
