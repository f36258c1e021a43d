use std::time::Duration;

use async_trait::async_trait;
use strum_macros::Display;
use thiserror::Error;
use tokio_util::codec::LinesCodecError;

use crate::message::ConnectionInformation;

// -----------------------------------------------------------------------------
// Errors
// -----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid topology for `{id}`: {reason}")]
    Topology { id: String, reason: String },

    #[error("connection information for `{0}` was already resolved")]
    AlreadyResolved(String),

    #[error("registration rejected: {0}")]
    Registration(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("channel closed: {0}")]
    Closed(String),

    #[error("no acknowledgement after {0} ms")]
    Timeout(u64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Plugin(#[from] anyhow::Error),
}

impl PluginError {
    /// Errors that stop a stage before any message has flowed.
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            PluginError::Configuration(_)
                | PluginError::Topology { .. }
                | PluginError::AlreadyResolved(_)
                | PluginError::Registration(_)
        )
    }
}

impl From<LinesCodecError> for PluginError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::Io(io) => PluginError::Transport(io),
            LinesCodecError::MaxLineLengthExceeded => {
                PluginError::Protocol("line exceeds the maximum length".into())
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Roles
// -----------------------------------------------------------------------------

/// Position a stage is allowed to take in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StageRole {
    /// Produces messages, never consumes. Must be first.
    Source,
    /// Needs both an upstream and a downstream.
    Transform,
    /// Needs an upstream; forwards downstream only when there is one.
    Sink,
}

impl StageRole {
    pub fn validate(&self, id: &str, info: &ConnectionInformation) -> Result<(), PluginError> {
        let has_upstream = info.upstream.is_present();
        let has_downstream = info.downstream.is_present();
        let reason = match self {
            StageRole::Source if has_upstream => Some("a source must be the first stage"),
            StageRole::Source if !has_downstream => Some("a source needs a downstream stage"),
            StageRole::Transform if !has_upstream || !has_downstream => {
                Some("a transforming stage needs both an upstream and a downstream")
            }
            StageRole::Sink if !has_upstream => Some("a sink needs an upstream stage"),
            _ => None,
        };
        match reason {
            Some(reason) => Err(PluginError::Topology {
                id: id.to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

// -----------------------------------------------------------------------------
// Plugin traits
// -----------------------------------------------------------------------------

/// A stage that turns one inbound message into at most one outbound message.
#[async_trait]
pub trait PipelinePlugin: Send + 'static {
    /// Returning `Ok(None)` drops the message. An error drops it as well and is logged.
    async fn process(&mut self, input: String) -> anyhow::Result<Option<String>>;

    fn role(&self) -> StageRole {
        StageRole::Transform
    }
}

/// A stage that originates messages.
#[async_trait]
pub trait SourcePlugin: Send + 'static {
    /// `Ok(None)` once the source is exhausted.
    async fn next_message(&mut self) -> anyhow::Result<Option<String>>;
}

/// Work run on a fixed period next to the message loop, cancelled with it.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn period(&self) -> Duration;

    async fn tick(&self);
}
