use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Which side of a stage a registration request is about.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionType {
    /// Downstream side, where the stage sends its output.
    Push,
    /// Upstream side, where the stage receives its input.
    Pull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRegistration {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConnectionType,
}

impl PluginRegistration {
    pub fn new(id: impl Into<String>, kind: ConnectionType) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Where one side of a stage lives and whether the stage binds or connects there.
///
/// An absent `address` means the side does not exist: no upstream for the
/// first stage, no downstream for the last one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConnectionInformation {
    #[serde(default)]
    pub address: Option<String>,
    pub is_bind: bool,
}

impl PeerConnectionInformation {
    pub fn bind(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            is_bind: true,
        }
    }

    pub fn connect(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            is_bind: false,
        }
    }

    pub fn absent(is_bind: bool) -> Self {
        Self {
            address: None,
            is_bind,
        }
    }

    pub fn is_present(&self) -> bool {
        self.address.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationReply {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConnectionType,
    #[serde(flatten)]
    pub peer: PeerConnectionInformation,
}

/// One line on the registration endpoint, sent back for every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegistrationResponse {
    Accepted(RegistrationReply),
    Rejected { error: String },
}

impl RegistrationResponse {
    pub fn rejected(error: impl Into<String>) -> Self {
        RegistrationResponse::Rejected {
            error: error.into(),
        }
    }
}

/// Both sides of a stage, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInformation {
    pub upstream: PeerConnectionInformation,
    pub downstream: PeerConnectionInformation,
}
