//! Speech-to-text
//!
//! Two mutually exclusive strategies turn speech into a transcript:
//! - Local recognition through a [`Recognizer`] that streams results
//! - Remote transcription of a recorded [`AudioBlob`](crate::capture::AudioBlob)
//!
//! [`probe`] picks the initial strategy; [`SpeechSource`] carries the
//! per-turn state of whichever one is active.

mod command;
mod probe;
mod source;

pub use command::CommandRecognizer;
pub use probe::{probe, Capabilities};
pub use source::{SourceOutcome, SpeechSource};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// How speech becomes text for a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureStrategy {
    LocalRecognition,
    RemoteAudio,
}

impl std::fmt::Display for CaptureStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureStrategy::LocalRecognition => write!(f, "local-recognition"),
            CaptureStrategy::RemoteAudio => write!(f, "remote-audio"),
        }
    }
}

/// Whether a recognition session keeps listening after its first result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionMode {
    Continuous,
    SingleShot,
}

/// Events delivered by a running recognizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Alternatives of the newest result, best first
    Result { alternatives: Vec<String> },
    Error(RecognitionError),
    /// The recognizer stopped. No further events follow.
    End,
}

impl RecognitionEvent {
    /// Shorthand for a single-alternative result
    pub fn result(text: impl Into<String>) -> Self {
        RecognitionEvent::Result {
            alternatives: vec![text.into()],
        }
    }
}

/// Errors raised by a recognizer, mirroring the usual recognition error codes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecognitionError {
    #[error("recognition service unreachable")]
    Network,

    #[error("microphone access not allowed")]
    NotAllowed,

    #[error("no speech detected")]
    NoSpeech,

    #[error("recognition aborted")]
    Aborted,

    #[error("speech recognition unsupported: {0}")]
    Unsupported(String),

    #[error("recognition failed: {0}")]
    Other(String),
}

impl RecognitionError {
    /// Network-class failures escalate the capture strategy
    pub fn is_network(&self) -> bool {
        matches!(self, RecognitionError::Network)
    }

    /// Parse a recognizer error code such as `network` or `not-allowed`
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "network" => RecognitionError::Network,
            "not-allowed" | "service-not-allowed" => RecognitionError::NotAllowed,
            "no-speech" => RecognitionError::NoSpeech,
            "aborted" => RecognitionError::Aborted,
            other => RecognitionError::Other(other.to_string()),
        }
    }
}

/// Control handle for a running recognition session
pub trait RecognitionControl: Send {
    /// Finish gracefully: pending results are still delivered, then `End`
    fn stop(&mut self);
    /// Stop immediately, discarding pending results
    fn abort(&mut self);
}

/// A started recognition session
pub struct RecognitionStream {
    pub events: mpsc::UnboundedReceiver<RecognitionEvent>,
    pub control: Box<dyn RecognitionControl>,
}

/// In-process speech recognition capability
pub trait Recognizer: Send + Sync {
    fn start(&self, mode: RecognitionMode) -> Result<RecognitionStream, RecognitionError>;
}

/// Trim `text` and keep it only if it meets the minimum length
pub fn accept_transcript(text: &str, min_chars: usize) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.chars().count() < min_chars {
        None
    } else {
        Some(trimmed.to_string())
    }
}
