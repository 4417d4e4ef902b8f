//! Bridge message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};

use crate::events::StateEvent;
use crate::speech::CaptureStrategy;
use crate::state::Mode;

/// Requests from the orb window to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Ping to check connectivity
    Ping,

    /// Request current daemon status
    GetStatus,

    /// Subscribe to push notifications
    Subscribe,

    /// Activation gesture went down
    Press,

    /// Activation gesture came up
    Release,

    /// Pointer entered or left the orb
    SetHover { hovered: bool },

    /// The orb was clicked; ask the shell to show the chat window
    OpenChat,
}

/// Responses from daemon to the orb window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Pong response to ping
    Pong,

    /// Current daemon status
    Status(DaemonStatus),

    /// Subscription confirmed
    Subscribed,

    /// Request accepted
    Ack,

    /// Error response
    Error { code: String, message: String },
}

impl Response {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Push notification from daemon to subscribed clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Mode has changed
    ModeChanged { mode: Mode, previous: Mode },

    /// Whether the orb window should let pointer events through
    ClickThrough { enabled: bool },

    /// Show the chat window
    OpenChat,

    /// Engine event, forwarded as-is
    StateEvent { event: StateEvent },
}

/// Full daemon status snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Current mode
    pub mode: Mode,

    /// Active capture strategy
    pub strategy: CaptureStrategy,

    /// Whether the activation gesture is held
    pub hold: bool,

    /// Whether the orb currently ignores the pointer
    pub click_through: bool,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl DaemonStatus {
    pub fn new(strategy: CaptureStrategy) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            mode: Mode::Idle,
            strategy,
            hold: false,
            click_through: true,
            uptime_secs: 0,
        }
    }
}
