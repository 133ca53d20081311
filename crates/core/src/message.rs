//! Conversation Log Entries
//!
//! This module defines the `Message` type committed to the conversation log
//! and the small enums describing who said it and which channel reported it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The author of a log entry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Agent => write!(f, "agent"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// The channel through which a message reached the log.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// The room's structured chat protocol, including optimistic local sends.
    Native,
    /// A final speech-to-text segment.
    Transcript,
    /// The custom data-channel fallback path.
    ChannelData,
}

/// A single entry in the conversation log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Source-supplied identifier used for exact de-duplication, when one exists.
    pub key: Option<String>,
    pub provenance: Provenance,
    /// Set while an agent reply is still arriving in pieces.
    pub streaming: bool,
}

impl Message {
    pub fn new(
        role: MessageRole,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
        provenance: Provenance,
    ) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp,
            key: None,
            provenance,
            streaming: false,
        }
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    /// True when the locally generated provisional key marks this as an optimistic send.
    pub fn is_provisional(&self) -> bool {
        self.key
            .as_deref()
            .is_some_and(|k| k.starts_with(crate::reconciler::PROVISIONAL_KEY_PREFIX))
    }
}
