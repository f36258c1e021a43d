use std::collections::{HashMap, HashSet};

use pipeline_plugin::{ConnectionType, PeerConnectionInformation, PluginRegistration, RegistrationReply};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PipelineStage;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("unknown plugin `{0}`")]
    UnknownPlugin(String),
}

/// The ordered pipeline and what has registered against it so far.
///
/// Stage `i` binds its downstream side on its own host; stage `i + 1`
/// connects to that host for its upstream side.
#[derive(Debug)]
pub struct Topology {
    stages: Vec<PipelineStage>,
    positions: HashMap<String, usize>,
    registered: HashSet<(String, ConnectionType)>,
    registration_order: Vec<(String, ConnectionType)>,
}

impl Topology {
    pub fn new(stages: Vec<PipelineStage>) -> Self {
        let positions = stages
            .iter()
            .enumerate()
            .map(|(index, stage)| (stage.id.clone(), index))
            .collect();
        Self {
            stages,
            positions,
            registered: HashSet::new(),
            registration_order: Vec::new(),
        }
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Registrations in the order they first arrived.
    pub fn registration_order(&self) -> &[(String, ConnectionType)] {
        &self.registration_order
    }

    /// True once every stage asked for both of its sides.
    pub fn is_complete(&self) -> bool {
        self.registered.len() == self.stages.len() * 2
    }

    pub fn register(
        &mut self,
        request: &PluginRegistration,
    ) -> Result<RegistrationReply, RegistrationError> {
        let position = self
            .position(&request.id)
            .ok_or_else(|| RegistrationError::UnknownPlugin(request.id.clone()))?;

        let key = (request.id.clone(), request.kind);
        if self.registered.insert(key.clone()) {
            self.registration_order.push(key);
            info!(id = %request.id, kind = %request.kind, position, "plugin registered");
            if self.is_complete() {
                info!(stages = self.stages.len(), "all plugins registered");
            }
        } else {
            warn!(id = %request.id, kind = %request.kind, "duplicate registration");
        }

        let peer = match request.kind {
            ConnectionType::Push => {
                if position + 1 == self.stages.len() {
                    PeerConnectionInformation::absent(true)
                } else {
                    PeerConnectionInformation::bind(self.stages[position].host.clone())
                }
            }
            ConnectionType::Pull => match position.checked_sub(1) {
                Some(previous) => {
                    PeerConnectionInformation::connect(self.stages[previous].host.clone())
                }
                None => PeerConnectionInformation::absent(false),
            },
        };

        Ok(RegistrationReply {
            id: request.id.clone(),
            kind: request.kind,
            peer,
        })
    }
}
