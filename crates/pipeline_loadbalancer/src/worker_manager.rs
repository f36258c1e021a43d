use async_trait::async_trait;
use dashmap::DashSet;
use pipeline_plugin::{
    ConnectionType, PeerConnectionInformation, PluginRegistration, RegistrationReply,
    RegistrationResponse, registration::Registrar,
};
use tracing::{debug, info};

/// Registration endpoint for workers. Every worker pulls from the dispatch
/// address and pushes to the sink address; both are connect-side.
pub struct WorkerRegistrar {
    dispatch: String,
    sink: Option<String>,
    workers: DashSet<String>,
}

impl WorkerRegistrar {
    pub fn new(dispatch: impl Into<String>, sink: Option<String>) -> Self {
        Self {
            dispatch: dispatch.into(),
            sink,
            workers: DashSet::new(),
        }
    }

    /// Distinct worker ids seen so far.
    pub fn known_workers(&self) -> usize {
        self.workers.len()
    }
}

#[async_trait]
impl Registrar for WorkerRegistrar {
    async fn register(&self, request: PluginRegistration) -> RegistrationResponse {
        if self.workers.insert(request.id.clone()) {
            info!(worker = %request.id, "worker registered");
        } else {
            debug!(worker = %request.id, kind = %request.kind, "worker asked again");
        }
        let peer = match request.kind {
            ConnectionType::Pull => PeerConnectionInformation::connect(self.dispatch.clone()),
            ConnectionType::Push => match &self.sink {
                Some(sink) => PeerConnectionInformation::connect(sink.clone()),
                None => PeerConnectionInformation::absent(false),
            },
        };
        RegistrationResponse::Accepted(RegistrationReply {
            id: request.id,
            kind: request.kind,
            peer,
        })
    }
}
