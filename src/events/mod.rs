//! Events module for engine notifications
//!
//! Structured events broadcast by the voice engine on every mode change and
//! at the notable points of a turn (wake word, transcript, reply).

use serde::{Deserialize, Serialize};

use crate::speech::CaptureStrategy;
use crate::state::Mode;

/// Events emitted by the voice engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// Mode changed
    ModeChanged {
        mode: Mode,
        previous: Mode,
        /// Time spent in the previous mode
        duration_ms: u64,
    },

    /// A trigger phrase was heard while idle
    WakeWordDetected { phrase: String },

    /// The microphone was opened for a turn
    AudioCaptureStarted,

    /// The microphone was released
    AudioCaptureStopped { bytes: usize },

    /// Speech was turned into text
    Transcript { text: String },

    /// The backend answered
    Reply { text: String },

    /// Local recognition failed over to remote audio
    StrategyEscalated { strategy: CaptureStrategy },

    /// A turn ended without a reply
    TurnAbandoned { reason: String },
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateEvent::ModeChanged { mode, previous, .. } => {
                write!(f, "MODE_CHANGED ({} -> {})", previous, mode)
            }
            StateEvent::WakeWordDetected { phrase } => write!(f, "WAKE_WORD_DETECTED ({})", phrase),
            StateEvent::AudioCaptureStarted => write!(f, "AUDIO_CAPTURE_STARTED"),
            StateEvent::AudioCaptureStopped { bytes } => {
                write!(f, "AUDIO_CAPTURE_STOPPED ({} bytes)", bytes)
            }
            StateEvent::Transcript { .. } => write!(f, "TRANSCRIPT"),
            StateEvent::Reply { .. } => write!(f, "REPLY"),
            StateEvent::StrategyEscalated { strategy } => {
                write!(f, "STRATEGY_ESCALATED ({})", strategy)
            }
            StateEvent::TurnAbandoned { reason } => write!(f, "TURN_ABANDONED ({})", reason),
        }
    }
}
