pub mod config;
pub mod connection;
pub mod logger;
pub mod manager_client;
pub mod message;
pub mod plugin;
pub mod plugin_helpers;
pub mod plugin_runtime;
pub mod registration;

#[cfg(any(test, feature = "test-utils"))]
pub mod plugin_test_util;

pub use config::{HasPipelineConfig, PipelinePluginConfiguration, StageConfiguration};
pub use message::{
    ConnectionInformation, ConnectionType, PeerConnectionInformation, PluginRegistration,
    RegistrationReply, RegistrationResponse,
};
pub use plugin::{PeriodicTask, PipelinePlugin, PluginError, SourcePlugin, StageRole};
pub use plugin_runtime::PluginRuntime;
