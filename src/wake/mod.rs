//! Wake-word loop
//!
//! Keeps one continuous recognition session open while the engine is idle
//! and scans each result for a trigger phrase. The underlying recognizer
//! ends on silence, so the engine restarts the loop whenever it reports
//! [`WakeOutcome::Ended`].

use tracing::{debug, info, warn};

use crate::speech::{RecognitionControl, RecognitionError, RecognitionEvent};

/// What a recognizer event meant for the loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeOutcome {
    /// Not for the current session, or no trigger phrase
    Ignored,
    /// A trigger phrase was heard; the loop has stopped
    Matched(String),
    /// The session ended and should be restarted
    Ended,
    /// The recognizer hit a network failure; the loop is disabled
    Escalate,
    /// The recognizer cannot be used; the loop is disabled
    Disabled,
}

struct Listener {
    session: u64,
    control: Box<dyn RecognitionControl>,
}

/// Trigger-phrase listener state
pub struct WakeWordLoop {
    phrases: Vec<String>,
    listener: Option<Listener>,
    disabled: bool,
}

impl WakeWordLoop {
    pub fn new(phrases: &[String]) -> Self {
        let phrases: Vec<String> = phrases
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self {
            disabled: phrases.is_empty(),
            phrases,
            listener: None,
        }
    }

    /// Whether the loop may be started at all
    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_some()
    }

    pub fn session(&self) -> Option<u64> {
        self.listener.as_ref().map(|l| l.session)
    }

    /// First trigger phrase contained in `transcript`
    pub fn find_trigger(&self, transcript: &str) -> Option<&str> {
        let heard = transcript.to_lowercase();
        self.phrases
            .iter()
            .find(|phrase| heard.contains(phrase.as_str()))
            .map(String::as_str)
    }

    /// Track a freshly started recognition session
    pub fn attach(&mut self, session: u64, control: Box<dyn RecognitionControl>) {
        self.stop();
        debug!(session, "wake-word listener started");
        self.listener = Some(Listener { session, control });
    }

    /// Stop listening. Safe to call when not running.
    pub fn stop(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            debug!(session = listener.session, "wake-word listener stopped");
            listener.control.abort();
        }
    }

    /// Stop and never start again this session
    pub fn disable(&mut self) {
        self.stop();
        self.disabled = true;
    }

    /// Feed a recognizer event belonging to `session`
    pub fn on_event(&mut self, session: u64, event: RecognitionEvent) -> WakeOutcome {
        if self.session() != Some(session) {
            return WakeOutcome::Ignored;
        }

        match event {
            RecognitionEvent::Result { alternatives } => {
                let latest = alternatives.first().map(String::as_str).unwrap_or("");
                match self.find_trigger(latest).map(str::to_string) {
                    Some(phrase) => {
                        info!(heard = latest, %phrase, "wake phrase detected");
                        self.stop();
                        WakeOutcome::Matched(phrase)
                    }
                    None => {
                        debug!(heard = latest, "no wake phrase");
                        WakeOutcome::Ignored
                    }
                }
            }
            RecognitionEvent::Error(e) if e.is_network() => {
                warn!(error = %e, "wake-word recognizer lost the network, disabling loop");
                self.disable();
                WakeOutcome::Escalate
            }
            RecognitionEvent::Error(e @ (RecognitionError::NotAllowed | RecognitionError::Unsupported(_))) => {
                warn!(error = %e, "wake-word recognizer unusable, disabling loop");
                self.disable();
                WakeOutcome::Disabled
            }
            RecognitionEvent::Error(e) => {
                debug!(error = %e, "wake-word recognizer error");
                self.stop();
                WakeOutcome::Ended
            }
            RecognitionEvent::End => {
                self.listener = None;
                WakeOutcome::Ended
            }
        }
    }
}
