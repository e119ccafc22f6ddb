//! Input-mode stack.
//!
//! The host tracks which input mode the UI is in so embedders agree on
//! who owns a keypress: the page (passthrough modes) or the chrome.
//! Modes stack — entering `Hint` over `Normal` and leaving it lands
//! back on `Normal`. The bottom of the stack is always `Normal` and
//! cannot be left.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::events::EventBroadcaster;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    Normal,
    Hint,
    Command,
    Insert,
    Passthrough,
    Prompt,
}

impl InputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputMode::Normal => "normal",
            InputMode::Hint => "hint",
            InputMode::Command => "command",
            InputMode::Insert => "insert",
            InputMode::Passthrough => "passthrough",
            InputMode::Prompt => "prompt",
        }
    }
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModeError {
    #[error("mode {0} is not on the mode stack")]
    NotActive(InputMode),
    #[error("cannot leave normal mode")]
    CannotLeaveNormal,
}

/// Manager for the input-mode stack.
pub struct ModeManager {
    /// Active modes, the current one on the right. `stack[0]` is
    /// always `Normal`.
    stack: Vec<InputMode>,
    /// Modes whose unhandled input is forwarded to the page instead of
    /// being swallowed by the chrome.
    passthrough: HashSet<InputMode>,
    bus: EventBroadcaster,
}

impl ModeManager {
    pub fn new(bus: EventBroadcaster) -> Self {
        let passthrough = [InputMode::Insert, InputMode::Passthrough, InputMode::Command]
            .into_iter()
            .collect();
        Self {
            stack: vec![InputMode::Normal],
            passthrough,
            bus,
        }
    }

    /// The current mode (top of the stack).
    pub fn current(&self) -> InputMode {
        *self.stack.last().expect("mode stack is never empty")
    }

    /// Enter a mode. Entering the mode already on top is a no-op.
    pub fn enter(&mut self, mode: InputMode) {
        if self.current() == mode {
            tracing::debug!(mode = %mode, "already in mode — nothing to do");
            return;
        }
        self.stack.push(mode);
        tracing::debug!(mode = %mode, stack = ?self.stack, "mode entered");
        self.bus.publish(
            "mode.entered",
            serde_json::json!({ "mode": mode.as_str() }),
        );
    }

    /// Leave a mode wherever it sits on the stack (the most recent
    /// entry of it). The bottom `Normal` cannot be removed.
    pub fn leave(&mut self, mode: InputMode) -> Result<(), ModeError> {
        let pos = self
            .stack
            .iter()
            .rposition(|m| *m == mode)
            .ok_or(ModeError::NotActive(mode))?;
        if pos == 0 {
            return Err(ModeError::CannotLeaveNormal);
        }
        self.stack.remove(pos);
        tracing::debug!(mode = %mode, stack = ?self.stack, "mode left");
        self.bus
            .publish("mode.left", serde_json::json!({ "mode": mode.as_str() }));
        Ok(())
    }

    /// Leave whatever mode is current.
    pub fn leave_current(&mut self) -> Result<(), ModeError> {
        let current = self.current();
        if current == InputMode::Normal {
            return Err(ModeError::CannotLeaveNormal);
        }
        self.leave(current)
    }

    /// Whether unhandled input in the current mode goes to the page.
    pub fn is_passthrough(&self) -> bool {
        self.passthrough.contains(&self.current())
    }

    pub fn stack(&self) -> &[InputMode] {
        &self.stack
    }
}
