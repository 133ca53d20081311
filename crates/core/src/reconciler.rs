//! Message Reconciler
//!
//! Up to three independent channels can report the same utterance: the room's
//! native chat protocol, final transcription segments, and the custom
//! data-channel fallback. They arrive in any order relative to each other. The
//! reconciler merges them into one ordered log in which no utterance appears
//! twice.
//!
//! Two entries are the same utterance when their source keys match exactly, or
//! when they share a role and trimmed text and their timestamps fall within
//! [`DEDUP_WINDOW_MS`] of each other. The time-window rule is a known
//! approximation: two genuinely distinct identical lines sent in quick
//! succession collapse into one.

use crate::{
    message::{Message, MessageRole, Provenance},
    payload::{ChannelPayload, PayloadError, parse_role},
    transport::TranscriptionSegment,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Width of the same-text de-duplication window, inclusive.
///
/// Every inbound entry is stamped with the local receive time, never with a
/// server-supplied clock, so the window compares like with like. Local sends
/// use the local clock at the moment of sending.
pub const DEDUP_WINDOW_MS: i64 = 2_000;

/// Prefix of keys generated for optimistic local sends.
pub const PROVISIONAL_KEY_PREFIX: &str = "local-";

/// Live voice-activity flags driven by `agent_speaking` / `user_speaking` payloads.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceActivity {
    pub agent_speaking: bool,
    pub user_speaking: bool,
}

/// What a single ingest call did to the reconciler's observable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// A new entry was committed.
    Appended,
    /// An in-flight streaming entry changed or was finalized.
    Updated,
    /// A finalized streaming entry was withdrawn because it repeated another.
    Retracted,
    /// The input repeated an utterance already in the log.
    Duplicate,
    /// A voice-activity flag flipped.
    ActivityChanged,
    /// Nothing observable happened.
    Ignored,
}

impl Ingest {
    pub fn changed(self) -> bool {
        matches!(
            self,
            Ingest::Appended | Ingest::Updated | Ingest::Retracted | Ingest::ActivityChanged
        )
    }
}

/// Returns true when `a` and `b` describe the same utterance.
pub fn same_utterance(a: &Message, b: &Message) -> bool {
    if keys_match(a, b) {
        return true;
    }
    a.role == b.role
        && a.text.trim() == b.text.trim()
        && (a.timestamp - b.timestamp).num_milliseconds().abs() <= DEDUP_WINDOW_MS
}

fn keys_match(a: &Message, b: &Message) -> bool {
    matches!((&a.key, &b.key), (Some(x), Some(y)) if x == y)
}

type Turn = (MessageRole, String);

/// The ordered, de-duplicated conversation log for one session.
#[derive(Debug, Default)]
pub struct MessageReconciler {
    log: Vec<Message>,
    local_identity: Option<String>,
    /// (role, turn id) -> index of its in-flight streaming entry. Turns without
    /// an id use "", so each role has at most one anonymous stream.
    in_flight: HashMap<Turn, usize>,
    activity: VoiceActivity,
}

impl MessageReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the local participant's identity, used to tell user from agent.
    pub fn set_local_identity(&mut self, identity: impl Into<String>) {
        self.local_identity = Some(identity.into());
    }

    pub fn messages(&self) -> &[Message] {
        &self.log
    }

    pub fn activity(&self) -> VoiceActivity {
        self.activity
    }

    /// Clears everything, ready for a fresh session.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_duplicate(&self, candidate: &Message) -> bool {
        self.log.iter().any(|existing| same_utterance(existing, candidate))
    }

    /// Appends a line the local user just sent, before the room echoes it back.
    pub fn push_local(&mut self, text: &str, now: DateTime<Utc>) -> Ingest {
        let key = format!("{PROVISIONAL_KEY_PREFIX}{}", Uuid::new_v4());
        let msg = Message::new(MessageRole::User, text, now, Provenance::Native).with_key(Some(key));
        self.commit(msg)
    }

    /// Appends an informational entry such as a disconnect notice.
    pub fn push_system(&mut self, text: &str, now: DateTime<Utc>) -> Ingest {
        self.commit(Message::new(
            MessageRole::System,
            text,
            now,
            Provenance::Native,
        ))
    }

    /// Merges a message from the room's native chat protocol, received at `now`.
    pub fn ingest_chat(
        &mut self,
        id: Option<String>,
        sender: Option<&str>,
        text: &str,
        now: DateTime<Utc>,
    ) -> Ingest {
        if text.trim().is_empty() {
            return Ingest::Ignored;
        }
        let role = self.resolve_role(sender);
        let msg = Message::new(role, text, now, Provenance::Native).with_key(id);
        self.commit(msg)
    }

    /// Merges transcription segments. Only final segments reach the log.
    pub fn ingest_transcription(
        &mut self,
        participant: Option<&str>,
        segments: &[TranscriptionSegment],
        now: DateTime<Utc>,
    ) -> Ingest {
        let role = self.resolve_role(participant);
        let mut outcome = Ingest::Ignored;
        for segment in segments.iter().filter(|s| s.is_final) {
            if segment.text.trim().is_empty() {
                continue;
            }
            let msg = Message::new(role, segment.text.as_str(), now, Provenance::Transcript)
                .with_key(Some(segment.id.clone()));
            match self.commit(msg) {
                Ingest::Appended => outcome = Ingest::Appended,
                Ingest::Duplicate if outcome == Ingest::Ignored => outcome = Ingest::Duplicate,
                _ => {}
            }
        }
        outcome
    }

    /// Merges one raw data-channel payload.
    pub fn ingest_data(
        &mut self,
        participant: Option<&str>,
        data: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Ingest, PayloadError> {
        let outcome = match ChannelPayload::decode(data)? {
            ChannelPayload::Transcript { text, sender, id } => {
                if text.trim().is_empty() {
                    return Ok(Ingest::Ignored);
                }
                let role = self.payload_role(sender.as_deref(), participant);
                self.commit(Message::new(role, text, now, Provenance::ChannelData).with_key(id))
            }
            ChannelPayload::Chat {
                text,
                id,
                streaming,
                sender,
            } => {
                let role = self.payload_role(sender.as_deref(), participant);
                self.ingest_channel_chat(role, text, id, streaming, now)
            }
            ChannelPayload::AgentSpeaking { speaking } => {
                Self::flip(&mut self.activity.agent_speaking, speaking)
            }
            ChannelPayload::UserSpeaking { speaking } => {
                Self::flip(&mut self.activity.user_speaking, speaking)
            }
            ChannelPayload::Unknown => {
                debug!("Ignoring channel-data payload of unknown type");
                Ingest::Ignored
            }
        };
        Ok(outcome)
    }

    /// Finalizes every in-flight stream and clears voice activity, e.g. on teardown.
    pub fn close_streams(&mut self) {
        let mut turns: Vec<(Turn, usize)> = self.in_flight.drain().collect();
        // Highest index first so earlier removals never shift a pending one.
        turns.sort_by(|a, b| b.1.cmp(&a.1));
        for (turn, idx) in turns {
            self.in_flight.insert(turn.clone(), idx);
            self.finalize(&turn, idx);
        }
        self.activity = VoiceActivity::default();
    }

    fn ingest_channel_chat(
        &mut self,
        role: MessageRole,
        text: String,
        id: Option<String>,
        streaming: bool,
        now: DateTime<Utc>,
    ) -> Ingest {
        let turn = (role, id.clone().unwrap_or_default());
        match (streaming, self.in_flight.get(&turn).copied()) {
            (true, Some(idx)) => {
                self.log[idx].text = text;
                Ingest::Updated
            }
            (true, None) => {
                let mut msg = Message::new(role, text, now, Provenance::ChannelData).with_key(id);
                msg.streaming = true;
                // Partial text is not comparable yet; only an exact key can match.
                if self.log.iter().any(|m| keys_match(m, &msg)) {
                    return Ingest::Duplicate;
                }
                self.log.push(msg);
                self.in_flight.insert(turn, self.log.len() - 1);
                Ingest::Appended
            }
            (false, Some(idx)) => {
                let closes_stream = text.trim().is_empty()
                    || id.is_some()
                    || text.trim().starts_with(self.log[idx].text.trim());
                if closes_stream {
                    if !text.trim().is_empty() {
                        self.log[idx].text = text;
                    }
                    return self.finalize(&turn, idx);
                }
                // An anonymous line that does not continue the open stream is a
                // separate message; the stream ends where it was.
                let closed = self.finalize(&turn, idx);
                match self.commit(Message::new(role, text, now, Provenance::ChannelData)) {
                    Ingest::Appended => Ingest::Appended,
                    _ => closed,
                }
            }
            (false, None) => {
                if text.trim().is_empty() {
                    return Ingest::Ignored;
                }
                self.commit(Message::new(role, text, now, Provenance::ChannelData).with_key(id))
            }
        }
    }

    /// Closes a streaming entry with whatever text it holds.
    fn finalize(&mut self, turn: &Turn, idx: usize) -> Ingest {
        self.in_flight.remove(turn);
        let mut msg = self.log.remove(idx);
        msg.streaming = false;
        if msg.text.trim().is_empty() || self.is_duplicate(&msg) {
            debug!(role = %turn.0, turn = %turn.1, "Dropping finalized stream that repeats an existing entry");
            for slot in self.in_flight.values_mut() {
                if *slot > idx {
                    *slot -= 1;
                }
            }
            return Ingest::Retracted;
        }
        self.log.insert(idx, msg);
        Ingest::Updated
    }

    fn commit(&mut self, msg: Message) -> Ingest {
        if self.is_duplicate(&msg) {
            debug!(role = %msg.role, provenance = ?msg.provenance, "Suppressing duplicate message");
            return Ingest::Duplicate;
        }
        self.log.push(msg);
        Ingest::Appended
    }

    fn resolve_role(&self, participant: Option<&str>) -> MessageRole {
        match (participant, self.local_identity.as_deref()) {
            (Some(p), Some(local)) if p == local => MessageRole::User,
            _ => MessageRole::Agent,
        }
    }

    fn payload_role(&self, label: Option<&str>, participant: Option<&str>) -> MessageRole {
        label
            .and_then(parse_role)
            .unwrap_or_else(|| self.resolve_role(participant))
    }

    fn flip(flag: &mut bool, value: bool) -> Ingest {
        if *flag == value {
            Ingest::Ignored
        } else {
            *flag = value;
            Ingest::ActivityChanged
        }
    }
}
