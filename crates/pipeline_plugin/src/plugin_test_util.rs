//! Helpers for testing stages without a running plugin manager.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    manager_client::PluginManagerConnection,
    message::{ConnectionType, PeerConnectionInformation, PluginRegistration},
    plugin::{PipelinePlugin, PluginError},
};

/// Answers registrations from a fixed pair of replies and records every request.
pub struct FakePluginManager {
    upstream: PeerConnectionInformation,
    downstream: PeerConnectionInformation,
    reject: Option<String>,
    requests: Mutex<Vec<PluginRegistration>>,
}

impl FakePluginManager {
    pub fn new(upstream: PeerConnectionInformation, downstream: PeerConnectionInformation) -> Self {
        Self {
            upstream,
            downstream,
            reject: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(error: impl Into<String>) -> Self {
        Self {
            reject: Some(error.into()),
            ..Self::new(
                PeerConnectionInformation::absent(false),
                PeerConnectionInformation::absent(true),
            )
        }
    }

    pub fn requests(&self) -> Vec<PluginRegistration> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PluginManagerConnection for FakePluginManager {
    async fn request_config(
        &self,
        registration: &PluginRegistration,
    ) -> Result<PeerConnectionInformation, PluginError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(registration.clone());
        }
        if let Some(error) = &self.reject {
            return Err(PluginError::Registration(error.clone()));
        }
        Ok(match registration.kind {
            ConnectionType::Pull => self.upstream.clone(),
            ConnectionType::Push => self.downstream.clone(),
        })
    }
}

/// A transforming stage that upper-cases every message.
pub struct UppercasePlugin;

#[async_trait]
impl PipelinePlugin for UppercasePlugin {
    async fn process(&mut self, input: String) -> anyhow::Result<Option<String>> {
        Ok(Some(input.to_uppercase()))
    }
}

/// A loopback address with a port nobody listens on right now.
pub fn free_local_address() -> String {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "127.0.0.1:0".to_string())
}
