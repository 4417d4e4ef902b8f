//! Speech output
//!
//! [`PlaybackController`] tags each utterance with an id. Cancelling bumps
//! the current utterance, so a completion that arrives afterwards no longer
//! matches and is ignored.

mod command;

pub use command::CommandSynthesizer;

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Errors starting speech synthesis
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SynthesisError {
    #[error("speech synthesis unsupported")]
    Unsupported,

    #[error("speech synthesis failed: {0}")]
    Failed(String),
}

/// Text-to-speech output device
pub trait Synthesizer: Send + Sync {
    /// Start speaking `text`. The receiver resolves (or closes) when playback ends.
    fn speak(&self, text: &str) -> Result<oneshot::Receiver<()>, SynthesisError>;

    /// Stop anything queued or playing
    fn cancel(&self);
}

/// Why an utterance is being spoken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceKind {
    /// Wake-word acknowledgement; completion has no side effect
    Acknowledgement,
    /// Backend reply; completion drives the post-speech transition
    Reply,
}

/// Result of asking the controller to speak
#[derive(Debug)]
pub enum PlaybackStart {
    Started {
        utterance: u64,
        done: oneshot::Receiver<()>,
    },
    /// Nothing to say
    Skipped,
    Failed(SynthesisError),
}

pub struct PlaybackController {
    synthesizer: Option<Arc<dyn Synthesizer>>,
    next_utterance: u64,
    current: Option<(u64, UtteranceKind)>,
}

impl PlaybackController {
    pub fn new(synthesizer: Option<Arc<dyn Synthesizer>>) -> Self {
        Self {
            synthesizer,
            next_utterance: 0,
            current: None,
        }
    }

    /// Cancel whatever is playing, then speak `text`
    pub fn speak(&mut self, text: &str, kind: UtteranceKind) -> PlaybackStart {
        self.cancel();

        let text = text.trim();
        if text.is_empty() {
            debug!("nothing to speak");
            return PlaybackStart::Skipped;
        }

        let Some(synthesizer) = &self.synthesizer else {
            return PlaybackStart::Failed(SynthesisError::Unsupported);
        };

        match synthesizer.speak(text) {
            Ok(done) => {
                self.next_utterance += 1;
                let utterance = self.next_utterance;
                self.current = Some((utterance, kind));
                info!(utterance, ?kind, chars = text.len(), "speaking");
                PlaybackStart::Started { utterance, done }
            }
            Err(e) => {
                warn!(error = %e, "speech synthesis failed");
                PlaybackStart::Failed(e)
            }
        }
    }

    /// Stop playback immediately. Returns whether anything was playing.
    pub fn cancel(&mut self) -> bool {
        if let Some(synthesizer) = &self.synthesizer {
            synthesizer.cancel();
        }
        match self.current.take() {
            Some((utterance, kind)) => {
                debug!(utterance, ?kind, "playback cancelled");
                true
            }
            None => false,
        }
    }

    /// Record that `utterance` finished. Returns its kind if it was current.
    pub fn finish(&mut self, utterance: u64) -> Option<UtteranceKind> {
        match self.current {
            Some((current, kind)) if current == utterance => {
                self.current = None;
                Some(kind)
            }
            _ => {
                debug!(utterance, "ignoring completion of a cancelled utterance");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeSynth {
        spoken: Mutex<Vec<String>>,
        cancels: Mutex<usize>,
    }

    impl Synthesizer for FakeSynth {
        fn speak(&self, text: &str) -> Result<oneshot::Receiver<()>, SynthesisError> {
            self.spoken.lock().unwrap().push(text.to_string());
            let (_tx, rx) = oneshot::channel();
            Ok(rx)
        }

        fn cancel(&self) {
            *self.cancels.lock().unwrap() += 1;
        }
    }

    fn controller() -> (PlaybackController, Arc<FakeSynth>) {
        let synth = Arc::new(FakeSynth::default());
        (PlaybackController::new(Some(synth.clone())), synth)
    }

    #[test]
    fn test_speak_cancels_previous() {
        let (mut playback, synth) = controller();

        let PlaybackStart::Started { utterance: first, .. } =
            playback.speak("Yes?", UtteranceKind::Acknowledgement)
        else {
            panic!("expected playback to start");
        };
        let PlaybackStart::Started { utterance: second, .. } =
            playback.speak("Lights off", UtteranceKind::Reply)
        else {
            panic!("expected playback to start");
        };

        assert_ne!(first, second);
        assert_eq!(*synth.cancels.lock().unwrap(), 2);
        assert_eq!(playback.finish(first), None);
        assert_eq!(playback.finish(second), Some(UtteranceKind::Reply));
        assert!(!playback.cancel());
    }

    #[test]
    fn test_whitespace_is_skipped() {
        let (mut playback, synth) = controller();
        assert!(matches!(
            playback.speak("   ", UtteranceKind::Reply),
            PlaybackStart::Skipped
        ));
        assert!(synth.spoken.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_completion_is_ignored() {
        let (mut playback, _) = controller();
        let PlaybackStart::Started { utterance, .. } = playback.speak("Lights off", UtteranceKind::Reply)
        else {
            panic!("expected playback to start");
        };

        assert!(playback.cancel());
        assert_eq!(playback.finish(utterance), None);
        assert!(!playback.cancel());
    }

    #[test]
    fn test_missing_synthesizer_is_unsupported() {
        let mut playback = PlaybackController::new(None);
        assert!(matches!(
            playback.speak("hello", UtteranceKind::Reply),
            PlaybackStart::Failed(SynthesisError::Unsupported)
        ));
        assert!(!playback.cancel());
    }
}
