//! Observable Session State
//!
//! The presentation layer never reaches into the controller. It watches a
//! `SessionSnapshot` that is republished after every state change.

use serde::Serialize;
use voice_agent_core::message::Message;

/// Lifecycle of the room connection.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

/// Everything the presentation layer renders.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    /// User-facing description of the last failed connect attempt.
    pub error: Option<String>,
    pub messages: Vec<Message>,
    pub agent_speaking: bool,
    pub user_speaking: bool,
    /// The transport is re-establishing the same session.
    pub reconnecting: bool,
    pub remote_participants: usize,
}
