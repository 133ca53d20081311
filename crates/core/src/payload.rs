//! Defines the JSON payloads carried over the room's custom data channel.
//!
//! Agents that cannot use the native chat or transcription features fall back
//! to publishing these objects as raw bytes.

use crate::message::MessageRole;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Malformed channel-data payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A structured message published on the data channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelPayload {
    /// Voice-derived text, committed as soon as it arrives.
    Transcript {
        text: String,
        #[serde(default, alias = "role", skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Typed or generated chat text, possibly delivered as a stream of updates.
    Chat {
        #[serde(default)]
        text: String,
        #[serde(default, alias = "turn_id", skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        streaming: bool,
        #[serde(default, alias = "role", skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    AgentSpeaking {
        #[serde(default = "speaking_default")]
        speaking: bool,
    },
    UserSpeaking {
        #[serde(default = "speaking_default")]
        speaking: bool,
    },
    /// Any `type` this client does not understand.
    #[serde(other)]
    Unknown,
}

fn speaking_default() -> bool {
    true
}

impl ChannelPayload {
    /// Builds the fallback payload for a line the local user typed.
    pub fn user_chat(text: impl Into<String>) -> Self {
        ChannelPayload::Chat {
            text: text.into(),
            id: None,
            streaming: false,
            sender: Some(MessageRole::User.to_string()),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, PayloadError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode(&self) -> Result<Bytes, PayloadError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Maps a free-form sender label from a payload onto a log role.
pub fn parse_role(label: &str) -> Option<MessageRole> {
    match label.trim().to_lowercase().as_str() {
        "user" | "human" => Some(MessageRole::User),
        "agent" | "assistant" | "ai" | "bot" => Some(MessageRole::Agent),
        "system" => Some(MessageRole::System),
        _ => None,
    }
}
