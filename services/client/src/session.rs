//! Session Facade
//!
//! The entry point for a presentation layer: `connect`, `disconnect`, and
//! `send_text`, plus a watch receiver for the reconciled state.

use crate::{
    config::Config,
    controller::SessionController,
    error::SessionError,
    media::{AudioSink, CaptureDevice, MediaPipeline},
    state::{ConnectionStatus, SessionSnapshot},
    token::{HttpTokenClient, TokenClient},
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use voice_agent_core::{agent::AgentDescriptor, transport::RoomConnector};

pub struct VoiceSession {
    controller: SessionController,
    default_agent_id: Option<String>,
}

impl VoiceSession {
    pub fn new(
        tokens: Arc<dyn TokenClient>,
        connector: Arc<dyn RoomConnector>,
        media: MediaPipeline,
    ) -> Self {
        Self {
            controller: SessionController::new(tokens, connector, media),
            default_agent_id: None,
        }
    }

    /// Wires an HTTP token client and the configured capture constraints.
    pub fn from_config(
        config: &Config,
        connector: Arc<dyn RoomConnector>,
        device: Arc<dyn CaptureDevice>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        let tokens = Arc::new(HttpTokenClient::new(config.token_url.clone()));
        let media = MediaPipeline::new(device, sink, config.capture);
        Self {
            default_agent_id: config.default_agent_id.clone(),
            ..Self::new(tokens, connector, media)
        }
    }

    /// Connects to `agent`. An agent with an empty id falls back to the
    /// configured default, and to the endpoint's own default after that.
    pub async fn connect(&self, agent: &AgentDescriptor) -> Result<ConnectionStatus, SessionError> {
        let agent_id = Some(agent.id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_agent_id.clone());
        info!(agent = %agent.name, "Starting voice session");
        self.controller.connect(agent_id).await
    }

    pub async fn disconnect(&self) {
        self.controller.disconnect().await
    }

    pub async fn send_text(&self, body: &str) -> Result<(), SessionError> {
        self.controller.send_text(body).await
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.controller.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.controller.snapshot()
    }
}
