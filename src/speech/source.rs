//! Per-turn speech source
//!
//! Both variants share one contract: results are fed in as they arrive,
//! `stop` ends capture, and each call reports a [`SourceOutcome`] for the
//! mode controller to act on.

use tracing::{debug, warn};

use super::{accept_transcript, CaptureStrategy, RecognitionControl, RecognitionEvent};
use crate::capture::AudioCaptureSession;

/// What a speech source produced
#[derive(Debug)]
pub enum SourceOutcome {
    /// Keep waiting
    Pending,
    /// Recognized text, ready for dispatch
    Transcript(String),
    /// Capture ended; the session still has to be drained into a blob
    Finish(AudioCaptureSession),
    /// Nothing usable was captured
    Empty,
    /// The local recognizer hit a network failure
    Escalate,
}

/// Lifecycle of a remote capture within a turn
pub enum RemotePhase {
    /// Waiting for the microphone (permission prompt, device open)
    Opening,
    Recording(AudioCaptureSession),
    /// Capture ended; the recording is being drained and transcribed
    Uploading,
}

/// The active speech source for a turn
pub enum SpeechSource {
    Local {
        session: u64,
        control: Box<dyn RecognitionControl>,
    },
    Remote {
        phase: RemotePhase,
    },
}

impl SpeechSource {
    pub fn local(session: u64, control: Box<dyn RecognitionControl>) -> Self {
        SpeechSource::Local { session, control }
    }

    pub fn remote() -> Self {
        SpeechSource::Remote {
            phase: RemotePhase::Opening,
        }
    }

    pub fn strategy(&self) -> CaptureStrategy {
        match self {
            SpeechSource::Local { .. } => CaptureStrategy::LocalRecognition,
            SpeechSource::Remote { .. } => CaptureStrategy::RemoteAudio,
        }
    }

    /// Recognition session id, for the local variant
    pub fn recognition_session(&self) -> Option<u64> {
        match self {
            SpeechSource::Local { session, .. } => Some(*session),
            SpeechSource::Remote { .. } => None,
        }
    }

    pub fn has_live_capture(&self) -> bool {
        matches!(
            self,
            SpeechSource::Remote {
                phase: RemotePhase::Recording(_)
            }
        )
    }

    /// Feed a recognizer event to the local variant
    pub fn on_recognition(&mut self, event: RecognitionEvent, min_chars: usize) -> SourceOutcome {
        let SpeechSource::Local { control, .. } = self else {
            return SourceOutcome::Pending;
        };

        match event {
            RecognitionEvent::Result { alternatives } => {
                control.abort();
                let latest = alternatives.first().map(String::as_str).unwrap_or("");
                match accept_transcript(latest, min_chars) {
                    Some(text) => SourceOutcome::Transcript(text),
                    None => {
                        debug!(heard = latest, "discarding short transcript");
                        SourceOutcome::Empty
                    }
                }
            }
            RecognitionEvent::Error(e) if e.is_network() => {
                warn!(error = %e, "local recognition failed with a network error");
                control.abort();
                SourceOutcome::Escalate
            }
            RecognitionEvent::Error(e) => {
                warn!(error = %e, "local recognition failed");
                control.abort();
                SourceOutcome::Empty
            }
            RecognitionEvent::End => SourceOutcome::Empty,
        }
    }

    /// Hand an opened capture session to the remote variant.
    ///
    /// Returns the session back if this source is not waiting for one.
    pub fn on_capture_opened(
        &mut self,
        session: AudioCaptureSession,
    ) -> Result<(), AudioCaptureSession> {
        match self {
            SpeechSource::Remote { phase } if matches!(phase, RemotePhase::Opening) => {
                *phase = RemotePhase::Recording(session);
                Ok(())
            }
            _ => Err(session),
        }
    }

    /// End capture.
    ///
    /// Local recognition finishes gracefully and reports later. A remote
    /// capture that is still opening ends empty; one that is recording
    /// hands its session back to be finished. An upload in flight is left
    /// alone.
    pub fn stop(&mut self) -> SourceOutcome {
        match self {
            SpeechSource::Local { control, .. } => {
                control.stop();
                SourceOutcome::Pending
            }
            SpeechSource::Remote { phase } => match std::mem::replace(phase, RemotePhase::Uploading) {
                RemotePhase::Opening => SourceOutcome::Empty,
                RemotePhase::Recording(session) => SourceOutcome::Finish(session),
                RemotePhase::Uploading => SourceOutcome::Pending,
            },
        }
    }

    /// Release everything the source holds. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        match self {
            SpeechSource::Local { control, .. } => control.abort(),
            SpeechSource::Remote { phase } => {
                if let RemotePhase::Recording(mut session) =
                    std::mem::replace(phase, RemotePhase::Uploading)
                {
                    session.stop();
                }
            }
        }
    }
}

impl Drop for SpeechSource {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::capture::{CaptureConstraints, CaptureError, InputStream, InputTrack, Microphone};
    use crate::speech::RecognitionError;

    #[derive(Default)]
    struct Calls {
        stops: usize,
        aborts: usize,
    }

    struct RecordingControl(Arc<Mutex<Calls>>);

    impl RecognitionControl for RecordingControl {
        fn stop(&mut self) {
            self.0.lock().unwrap().stops += 1;
        }
        fn abort(&mut self) {
            self.0.lock().unwrap().aborts += 1;
        }
    }

    fn local() -> (SpeechSource, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let source = SpeechSource::local(7, Box::new(RecordingControl(Arc::clone(&calls))));
        (source, calls)
    }

    #[test]
    fn test_local_result_yields_transcript() {
        let (mut source, calls) = local();
        let outcome = source.on_recognition(RecognitionEvent::result(" turn off the lights "), 2);
        assert!(matches!(outcome, SourceOutcome::Transcript(text) if text == "turn off the lights"));
        assert_eq!(calls.lock().unwrap().aborts, 1);
    }

    #[test]
    fn test_local_uses_best_alternative() {
        let (mut source, _) = local();
        let event = RecognitionEvent::Result {
            alternatives: vec!["lights off".to_string(), "lice off".to_string()],
        };
        assert!(matches!(
            source.on_recognition(event, 2),
            SourceOutcome::Transcript(text) if text == "lights off"
        ));
    }

    #[test]
    fn test_local_network_error_escalates() {
        let (mut source, _) = local();
        let outcome = source.on_recognition(RecognitionEvent::Error(RecognitionError::Network), 2);
        assert!(matches!(outcome, SourceOutcome::Escalate));
    }

    #[test]
    fn test_local_other_error_is_empty() {
        let (mut source, _) = local();
        let outcome = source.on_recognition(RecognitionEvent::Error(RecognitionError::NoSpeech), 2);
        assert!(matches!(outcome, SourceOutcome::Empty));
        assert!(matches!(
            source.on_recognition(RecognitionEvent::End, 2),
            SourceOutcome::Empty
        ));
    }

    #[test]
    fn test_local_stop_waits_for_result() {
        let (mut source, calls) = local();
        assert!(matches!(source.stop(), SourceOutcome::Pending));
        assert_eq!(calls.lock().unwrap().stops, 1);
        assert_eq!(calls.lock().unwrap().aborts, 0);
    }

    #[test]
    fn test_drop_aborts_local() {
        let (source, calls) = local();
        drop(source);
        assert_eq!(calls.lock().unwrap().aborts, 1);
    }

    #[test]
    fn test_remote_stop_while_opening_is_empty() {
        let mut source = SpeechSource::remote();
        assert!(matches!(source.stop(), SourceOutcome::Empty));
        // The phase moved on, so a second stop does nothing new
        assert!(matches!(source.stop(), SourceOutcome::Pending));
    }

    #[test]
    fn test_remote_ignores_recognition_events() {
        let mut source = SpeechSource::remote();
        assert!(matches!(
            source.on_recognition(RecognitionEvent::result("hello"), 2),
            SourceOutcome::Pending
        ));
        assert_eq!(source.strategy(), CaptureStrategy::RemoteAudio);
        assert_eq!(source.recognition_session(), None);
    }

    struct IdleTrack;

    impl InputTrack for IdleTrack {
        fn stop(&mut self) {}
    }

    /// Delivers one chunk, then ends the stream
    struct OneChunkMic;

    #[async_trait]
    impl Microphone for OneChunkMic {
        async fn open(&self, _: &CaptureConstraints) -> Result<InputStream, CaptureError> {
            let (tx, rx) = mpsc::unbounded_channel();
            tx.send(vec![0u8; 4]).unwrap();
            Ok(InputStream {
                chunks: rx,
                track: Box::new(IdleTrack),
                mime: "audio/wav".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_remote_stop_while_recording_hands_back_the_session() {
        let mut source = SpeechSource::remote();
        let session = AudioCaptureSession::start(&OneChunkMic, &CaptureConstraints::voice(16_000, 1))
            .await
            .unwrap();
        assert!(source.on_capture_opened(session).is_ok());
        assert!(source.has_live_capture());

        let SourceOutcome::Finish(session) = source.stop() else {
            panic!("recording session should be handed back");
        };
        assert!(!source.has_live_capture());
        assert!(matches!(source.stop(), SourceOutcome::Pending));

        let blob = session.finish(Duration::from_secs(1)).await.unwrap();
        assert_eq!(blob.len(), 4);
    }
}
