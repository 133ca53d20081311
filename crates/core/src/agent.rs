//! Agent Selection and Widget State
//!
//! The page shell decides which agent persona the user talks to and whether the
//! chat widget is shown. That state lives in an explicit, injectable object
//! rather than in globals, and observers follow it through a watch channel.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// A selectable agent persona. Immutable for the lifetime of a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
}

impl AgentDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            system_prompt: system_prompt.into(),
        }
    }
}

/// Visibility and selection state of the chat widget.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct WidgetState {
    pub selected_agent: Option<AgentDescriptor>,
    pub visible: bool,
    pub minimized: bool,
}

/// A cloneable handle to the widget state shared between the shell and the widget.
#[derive(Clone, Debug)]
pub struct SharedWidgetState {
    tx: Arc<watch::Sender<WidgetState>>,
}

impl Default for SharedWidgetState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedWidgetState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(WidgetState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Shows the widget for `agent`, restoring it if it was minimized.
    pub fn open(&self, agent: AgentDescriptor) {
        debug!(agent_id = %agent.id, "Opening voice widget");
        self.tx.send_modify(|state| {
            state.selected_agent = Some(agent);
            state.visible = true;
            state.minimized = false;
        });
    }

    /// Hides the widget and forgets the selection.
    pub fn close(&self) {
        self.tx.send_modify(|state| *state = WidgetState::default());
    }

    /// Toggles the minimized flag. Has no effect while the widget is hidden.
    pub fn toggle_minimize(&self) {
        self.tx.send_if_modified(|state| {
            if !state.visible {
                return false;
            }
            state.minimized = !state.minimized;
            true
        });
    }

    pub fn snapshot(&self) -> WidgetState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WidgetState> {
        self.tx.subscribe()
    }
}
