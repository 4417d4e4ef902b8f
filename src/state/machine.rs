//! Core voice engine state machine
//!
//! Every input and every collaborator completion arrives as an [`Event`] on
//! one queue and is applied by [`Engine::handle`], which is the only code
//! that mutates the mode, the hold intent, the pending-dispatch guard, the
//! capture strategy and the active speech source. Completions carry the turn,
//! recognition session or utterance they belong to; anything superseded is
//! dropped on arrival.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::{AudioBlob, AudioCaptureSession, CaptureConstraints, CaptureError, Microphone};
use crate::config::VoiceSettings;
use crate::dispatch::{BackendError, DispatchClient};
use crate::events::StateEvent;
use crate::playback::{PlaybackController, PlaybackStart, Synthesizer, UtteranceKind};
use crate::speech::{
    accept_transcript, CaptureStrategy, RecognitionError, RecognitionEvent, RecognitionMode,
    Recognizer, SourceOutcome, SpeechSource,
};
use crate::wake::{WakeOutcome, WakeWordLoop};

/// The four externally observable modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Waiting for the wake phrase or a press
    #[default]
    Idle,
    /// Capturing speech for a turn
    Listening,
    /// Transcribing and waiting for the backend
    Thinking,
    /// Speaking the reply
    Speaking,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Idle => write!(f, "idle"),
            Mode::Listening => write!(f, "listening"),
            Mode::Thinking => write!(f, "thinking"),
            Mode::Speaking => write!(f, "speaking"),
        }
    }
}

/// Everything the engine reacts to
#[derive(Debug)]
pub enum Event {
    /// The activation gesture went down
    HoldPressed,
    /// The activation gesture came up
    HoldReleased,
    /// Stop everything and exit the run loop
    Shutdown,

    Recognition {
        session: u64,
        event: RecognitionEvent,
    },
    CaptureOpened {
        turn: u64,
        result: Result<AudioCaptureSession, CaptureError>,
    },
    CaptureTimeout {
        turn: u64,
    },
    CaptureFinished {
        turn: u64,
        blob: Option<AudioBlob>,
    },
    TranscriptionSettled {
        turn: u64,
        result: Result<String, BackendError>,
    },
    DispatchSettled {
        dispatch: u64,
        result: Result<String, BackendError>,
    },
    SpeechFinished {
        utterance: u64,
    },
    WakeRestartDue,
    CommandCaptureDue {
        turn: u64,
    },
}

/// External collaborators the engine drives
pub struct Collaborators {
    pub recognizer: Option<Arc<dyn Recognizer>>,
    pub microphone: Option<Arc<dyn Microphone>>,
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
    pub dispatch: DispatchClient,
}

/// Cloneable sender for engine inputs
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Event>,
    mode: watch::Receiver<Mode>,
}

impl EngineHandle {
    /// The engine's current mode, independent of the event stream
    pub fn mode(&self) -> Mode {
        *self.mode.borrow()
    }

    /// Queue an event. Returns false once the engine has exited.
    pub fn send(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn press(&self) -> bool {
        self.send(Event::HoldPressed)
    }

    pub fn release(&self) -> bool {
        self.send(Event::HoldReleased)
    }

    pub fn shutdown(&self) -> bool {
        self.send(Event::Shutdown)
    }
}

#[cfg(test)]
impl EngineHandle {
    /// A handle with no engine behind it; events land in the receiver
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_, mode) = watch::channel(Mode::Idle);
        (Self { tx, mode }, rx)
    }
}

/// A transcript in flight to the backend
#[derive(Debug, Clone, Copy)]
struct PendingDispatch {
    id: u64,
    /// Turn whose reply this is; re-pointed when a later turn joins it
    turn: u64,
}

/// The voice engine (mode controller)
pub struct Engine {
    mode: Mode,
    mode_entered_at: Instant,
    mode_tx: watch::Sender<Mode>,
    strategy: CaptureStrategy,
    /// Activation gesture is physically held
    hold: bool,
    pending_dispatch: Option<PendingDispatch>,
    turn: u64,
    next_session: u64,
    next_dispatch: u64,
    source: Option<SpeechSource>,
    wake: WakeWordLoop,
    playback: PlaybackController,
    recognizer: Option<Arc<dyn Recognizer>>,
    microphone: Option<Arc<dyn Microphone>>,
    dispatch: DispatchClient,
    settings: VoiceSettings,
    constraints: CaptureConstraints,
    tasks: Vec<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    event_tx: broadcast::Sender<StateEvent>,
}

impl Engine {
    /// Create an engine in `Idle` with the probed capture strategy
    pub fn new(
        collaborators: Collaborators,
        settings: VoiceSettings,
        strategy: CaptureStrategy,
        event_tx: broadcast::Sender<StateEvent>,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (mode_tx, mode_rx) = watch::channel(Mode::Idle);
        let handle = EngineHandle {
            tx: tx.clone(),
            mode: mode_rx,
        };

        let engine = Self {
            mode: Mode::Idle,
            mode_entered_at: Instant::now(),
            mode_tx,
            strategy,
            hold: false,
            pending_dispatch: None,
            turn: 0,
            next_session: 0,
            next_dispatch: 0,
            source: None,
            wake: WakeWordLoop::new(&settings.wake_phrases),
            playback: PlaybackController::new(collaborators.synthesizer),
            recognizer: collaborators.recognizer,
            microphone: collaborators.microphone,
            dispatch: collaborators.dispatch,
            constraints: CaptureConstraints::voice(settings.sample_rate, settings.channels),
            settings,
            tasks: Vec::new(),
            tx,
            rx,
            event_tx,
        };
        (engine, handle)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn strategy(&self) -> CaptureStrategy {
        self.strategy
    }

    pub fn hold(&self) -> bool {
        self.hold
    }

    pub fn pending_dispatch(&self) -> bool {
        self.pending_dispatch.is_some()
    }

    pub fn wake_listening(&self) -> bool {
        self.wake.is_running()
    }

    pub fn has_live_capture(&self) -> bool {
        self.source.as_ref().is_some_and(SpeechSource::has_live_capture)
    }

    /// Begin waiting in `Idle`: arms the wake-word loop when available
    pub fn start(&mut self) {
        info!(strategy = %self.strategy, "voice engine started in idle mode");
        self.start_wake_loop();
    }

    /// Run until a `Shutdown` event, then release everything
    pub async fn run(mut self) {
        self.start();

        while let Some(event) = self.rx.recv().await {
            if !self.handle(event) {
                break;
            }
        }

        self.teardown();
        info!("voice engine stopped");
    }

    /// Apply one event. Returns false when the engine should stop.
    pub fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::HoldPressed => self.on_press(),
            Event::HoldReleased => self.on_release(),
            Event::Shutdown => {
                self.teardown();
                return false;
            }
            Event::Recognition { session, event } => self.on_recognition(session, event),
            Event::CaptureOpened { turn, result } => self.on_capture_opened(turn, result),
            Event::CaptureTimeout { turn } => self.on_capture_timeout(turn),
            Event::CaptureFinished { turn, blob } => self.on_capture_finished(turn, blob),
            Event::TranscriptionSettled { turn, result } => self.on_transcription(turn, result),
            Event::DispatchSettled { dispatch, result } => self.on_dispatch_settled(dispatch, result),
            Event::SpeechFinished { utterance } => self.on_speech_finished(utterance),
            Event::WakeRestartDue => self.start_wake_loop(),
            Event::CommandCaptureDue { turn } => {
                if turn == self.turn && self.mode == Mode::Listening && self.source.is_none() {
                    self.start_speech_source();
                }
            }
        }
        true
    }

    /// Apply every event already queued, without waiting
    #[cfg(test)]
    pub fn drain_queued(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.rx.try_recv() {
            applied += 1;
            if !self.handle(event) {
                break;
            }
        }
        applied
    }

    // ── Inputs ──────────────────────────────────────────────────────

    fn on_press(&mut self) {
        if self.mode == Mode::Listening && self.hold {
            debug!("hold already active");
            return;
        }
        self.hold = true;

        // Barge-in: speech output stops before any new capture begins
        if self.mode == Mode::Speaking {
            self.playback.cancel();
            info!("barge-in, playback cancelled");
            self.set_mode(Mode::Idle);
        }
        if self.mode == Mode::Thinking {
            info!(turn = self.turn, "superseding in-flight turn");
        }

        self.begin_turn();
    }

    fn on_release(&mut self) {
        if !self.hold {
            debug!("release without an active hold");
            return;
        }
        self.hold = false;

        if self.mode == Mode::Listening {
            self.stop_source();
        }
    }

    // ── Turn lifecycle ──────────────────────────────────────────────

    /// Enter `Listening` for a new turn and start capturing
    fn begin_turn(&mut self) {
        self.wake.stop();
        self.turn += 1;
        self.set_mode(Mode::Listening);
        self.start_speech_source();
    }

    fn start_speech_source(&mut self) {
        self.playback.cancel();
        if let Some(mut previous) = self.source.take() {
            debug!("tearing down previous speech source");
            previous.teardown();
        }

        match self.strategy {
            CaptureStrategy::LocalRecognition => self.start_local(),
            CaptureStrategy::RemoteAudio => self.start_remote(),
        }
    }

    fn start_local(&mut self) {
        let Some(recognizer) = self.recognizer.clone() else {
            warn!("no recognizer available, switching to remote audio");
            self.escalate();
            self.start_remote();
            return;
        };

        match recognizer.start(RecognitionMode::SingleShot) {
            Ok(stream) => {
                let session = self.next_session();
                self.forward_recognition(session, stream.events);
                self.source = Some(SpeechSource::local(session, stream.control));
                debug!(turn = self.turn, session, "local recognition started");
            }
            Err(e) if e.is_network() => {
                warn!(error = %e, "local recognition unreachable");
                self.escalate();
                self.start_remote();
            }
            Err(e) => {
                warn!(error = %e, "local recognition failed to start");
                self.abandon_turn("recognizer failed to start");
            }
        }
    }

    fn start_remote(&mut self) {
        let Some(microphone) = self.microphone.clone() else {
            warn!("no microphone configured");
            self.abandon_turn("microphone unavailable");
            return;
        };

        self.source = Some(SpeechSource::remote());
        let turn = self.turn;
        let constraints = self.constraints;
        let tx = self.tx.clone();
        self.spawn(async move {
            let result = AudioCaptureSession::start(microphone.as_ref(), &constraints).await;
            // If the engine is gone the session drops here and releases the device
            let _ = tx.send(Event::CaptureOpened { turn, result });
        });
    }

    /// End capture on the active source and act on what it produced
    fn stop_source(&mut self) {
        let Some(source) = self.source.as_mut() else {
            return;
        };
        let outcome = source.stop();
        self.apply_source_outcome(outcome);
    }

    fn apply_source_outcome(&mut self, outcome: SourceOutcome) {
        match outcome {
            SourceOutcome::Pending => {}
            SourceOutcome::Transcript(text) => {
                self.source = None;
                self.emit(StateEvent::Transcript { text: text.clone() });
                self.set_mode(Mode::Thinking);
                self.dispatch(text);
            }
            SourceOutcome::Finish(session) => {
                self.set_mode(Mode::Thinking);
                self.finish_capture(session);
            }
            SourceOutcome::Empty => self.abandon_turn("no speech captured"),
            SourceOutcome::Escalate => {
                self.source = None;
                self.escalate();
                self.start_remote();
            }
        }
    }

    /// Drain the recorder off the event loop; the blob comes back as `CaptureFinished`
    fn finish_capture(&mut self, session: AudioCaptureSession) {
        let grace = self.settings.stop_grace();
        let turn = self.turn;
        let tx = self.tx.clone();
        self.spawn(async move {
            let blob = session.finish(grace).await;
            let _ = tx.send(Event::CaptureFinished { turn, blob });
        });
    }

    fn upload(&mut self, blob: AudioBlob) {
        let dispatch = self.dispatch.clone();
        let turn = self.turn;
        let tx = self.tx.clone();
        self.spawn(async move {
            let result = dispatch.transcribe(&blob).await;
            let _ = tx.send(Event::TranscriptionSettled { turn, result });
        });
    }

    fn dispatch(&mut self, transcript: String) {
        if let Some(pending) = self.pending_dispatch.as_mut() {
            // One backend call at a time: this turn waits on the earlier reply
            warn!(
                turn = self.turn,
                joined = pending.turn,
                "dispatch already in flight, dropping transcript"
            );
            pending.turn = self.turn;
            return;
        }

        self.next_dispatch += 1;
        let id = self.next_dispatch;
        self.pending_dispatch = Some(PendingDispatch { id, turn: self.turn });

        let dispatch = self.dispatch.clone();
        let tx = self.tx.clone();
        self.spawn(async move {
            let result = dispatch.send(&transcript).await;
            let _ = tx.send(Event::DispatchSettled { dispatch: id, result });
        });
    }

    fn speak_reply(&mut self, reply: &str) {
        match self.playback.speak(reply, UtteranceKind::Reply) {
            PlaybackStart::Started { utterance, done } => {
                self.set_mode(Mode::Speaking);
                self.await_speech(utterance, done);
            }
            PlaybackStart::Skipped => self.enter_idle(),
            PlaybackStart::Failed(e) => {
                debug!(error = %e, "reply not spoken");
                self.enter_idle();
            }
        }
    }

    /// Abandon the current turn and go back to waiting
    fn abandon_turn(&mut self, reason: &str) {
        info!(turn = self.turn, reason, "turn abandoned");
        self.emit(StateEvent::TurnAbandoned {
            reason: reason.to_string(),
        });
        self.enter_idle();
    }

    fn enter_idle(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.teardown();
        }
        // Anything still in flight now belongs to a finished turn
        self.turn += 1;
        self.set_mode(Mode::Idle);
        self.start_wake_loop();
    }

    fn escalate(&mut self) {
        if self.strategy == CaptureStrategy::RemoteAudio {
            return;
        }
        self.strategy = CaptureStrategy::RemoteAudio;
        self.wake.disable();
        warn!(strategy = %self.strategy, "capture strategy escalated");
        self.emit(StateEvent::StrategyEscalated {
            strategy: self.strategy,
        });
    }

    // ── Completions ─────────────────────────────────────────────────

    fn on_recognition(&mut self, session: u64, event: RecognitionEvent) {
        if self.wake.session() == Some(session) {
            match self.wake.on_event(session, event) {
                WakeOutcome::Ignored | WakeOutcome::Disabled => {}
                WakeOutcome::Matched(phrase) => self.on_wake_phrase(phrase),
                WakeOutcome::Ended => {
                    if self.mode == Mode::Idle {
                        self.schedule(self.settings.wake_restart_delay(), Event::WakeRestartDue);
                    }
                }
                WakeOutcome::Escalate => self.escalate(),
            }
            return;
        }

        let min_chars = self.settings.min_transcript_chars;
        if let Some(source) = self.source.as_mut() {
            if source.recognition_session() == Some(session) {
                let outcome = source.on_recognition(event, min_chars);
                self.apply_source_outcome(outcome);
                return;
            }
        }
        debug!(session, ?event, "ignoring event from a finished recognition session");
    }

    fn on_wake_phrase(&mut self, phrase: String) {
        if self.mode != Mode::Idle {
            return;
        }
        self.emit(StateEvent::WakeWordDetected { phrase });

        self.turn += 1;
        self.set_mode(Mode::Listening);

        let acknowledgement = self.settings.acknowledgement.clone();
        if let PlaybackStart::Started { utterance, done } =
            self.playback.speak(&acknowledgement, UtteranceKind::Acknowledgement)
        {
            self.await_speech(utterance, done);
        }
        self.schedule(
            self.settings.acknowledgement_delay(),
            Event::CommandCaptureDue { turn: self.turn },
        );
    }

    fn on_capture_opened(&mut self, turn: u64, result: Result<AudioCaptureSession, CaptureError>) {
        if turn != self.turn {
            // Dropping the session releases the microphone
            debug!(turn, "discarding capture opened for a finished turn");
            return;
        }

        match result {
            Ok(session) => {
                let Some(source) = self.source.as_mut() else {
                    return;
                };
                if source.on_capture_opened(session).is_ok() {
                    self.emit(StateEvent::AudioCaptureStarted);
                    self.schedule(self.settings.max_capture(), Event::CaptureTimeout { turn });
                }
            }
            Err(e) => {
                warn!(error = %e, "microphone unavailable");
                self.abandon_turn("microphone unavailable");
            }
        }
    }

    fn on_capture_timeout(&mut self, turn: u64) {
        if turn != self.turn || self.mode != Mode::Listening || !self.has_live_capture() {
            return;
        }
        info!(turn, "maximum capture duration reached");
        self.stop_source();
    }

    fn on_capture_finished(&mut self, turn: u64, blob: Option<AudioBlob>) {
        if turn != self.turn || self.mode != Mode::Thinking {
            debug!(turn, "discarding capture of a superseded turn");
            return;
        }
        let bytes = blob.as_ref().map_or(0, AudioBlob::len);
        self.emit(StateEvent::AudioCaptureStopped { bytes });

        let noise_floor = self.settings.noise_floor_bytes;
        match blob {
            Some(blob) if !blob.is_noise(noise_floor) => self.upload(blob),
            _ => {
                debug!(bytes, noise_floor, "discarding capture below noise floor");
                self.abandon_turn("no speech captured");
            }
        }
    }

    fn on_transcription(&mut self, turn: u64, result: Result<String, BackendError>) {
        if turn != self.turn || self.mode != Mode::Thinking {
            info!(turn, "discarding transcription of a superseded turn");
            return;
        }
        self.source = None;

        match result {
            Ok(text) => match accept_transcript(&text, self.settings.min_transcript_chars) {
                Some(text) => {
                    self.emit(StateEvent::Transcript { text: text.clone() });
                    self.dispatch(text);
                }
                None => self.abandon_turn("empty transcript"),
            },
            Err(e) => {
                warn!(error = %e, "transcription failed");
                self.abandon_turn("transcription failed");
            }
        }
    }

    fn on_dispatch_settled(&mut self, dispatch: u64, result: Result<String, BackendError>) {
        let Some(pending) = self.pending_dispatch.filter(|p| p.id == dispatch) else {
            debug!(dispatch, "ignoring reply to a cleared dispatch");
            return;
        };
        self.pending_dispatch = None;
        if pending.turn != self.turn || self.mode != Mode::Thinking {
            info!(turn = pending.turn, "discarding reply for a superseded turn");
            return;
        }

        match result {
            Ok(reply) => {
                self.emit(StateEvent::Reply { text: reply.clone() });
                self.speak_reply(&reply);
            }
            Err(e) => {
                warn!(error = %e, "dispatch failed");
                self.abandon_turn("dispatch failed");
            }
        }
    }

    fn on_speech_finished(&mut self, utterance: u64) {
        let Some(kind) = self.playback.finish(utterance) else {
            return;
        };
        if kind != UtteranceKind::Reply || self.mode != Mode::Speaking {
            return;
        }

        if self.hold {
            debug!("hold still active, listening again");
            self.begin_turn();
        } else {
            self.enter_idle();
        }
    }

    // ── Wake-word loop ──────────────────────────────────────────────

    fn start_wake_loop(&mut self) {
        if self.mode != Mode::Idle
            || self.strategy != CaptureStrategy::LocalRecognition
            || !self.wake.is_enabled()
            || self.wake.is_running()
        {
            return;
        }
        let Some(recognizer) = self.recognizer.clone() else {
            return;
        };

        match recognizer.start(RecognitionMode::Continuous) {
            Ok(stream) => {
                let session = self.next_session();
                self.forward_recognition(session, stream.events);
                self.wake.attach(session, stream.control);
            }
            Err(e) if e.is_network() => {
                warn!(error = %e, "wake-word recognizer unreachable");
                self.escalate();
            }
            Err(e @ (RecognitionError::NotAllowed | RecognitionError::Unsupported(_))) => {
                warn!(error = %e, "wake-word recognizer unusable, disabling loop");
                self.wake.disable();
            }
            Err(e) => {
                debug!(error = %e, "wake-word recognizer failed to start, retrying");
                self.schedule(self.settings.wake_restart_delay(), Event::WakeRestartDue);
            }
        }
    }

    // ── Plumbing ────────────────────────────────────────────────────

    fn next_session(&mut self) -> u64 {
        self.next_session += 1;
        self.next_session
    }

    fn set_mode(&mut self, mode: Mode) {
        if mode == self.mode {
            return;
        }
        let previous = self.mode;
        let duration_ms = self.mode_entered_at.elapsed().as_millis() as u64;

        info!(from = %previous, to = %mode, duration_ms, "mode transition");

        self.mode = mode;
        self.mode_entered_at = Instant::now();
        self.mode_tx.send_replace(mode);
        self.emit(StateEvent::ModeChanged {
            mode,
            previous,
            duration_ms,
        });
    }

    fn emit(&self, event: StateEvent) {
        debug!(%event, "emitting state event");
        let _ = self.event_tx.send(event);
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(tokio::spawn(task));
    }

    fn schedule(&mut self, delay: Duration, event: Event) {
        if delay.is_zero() {
            let _ = self.tx.send(event);
            return;
        }
        let tx = self.tx.clone();
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    fn forward_recognition(
        &mut self,
        session: u64,
        mut events: mpsc::UnboundedReceiver<RecognitionEvent>,
    ) {
        let tx = self.tx.clone();
        self.spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(Event::Recognition { session, event }).is_err() {
                    break;
                }
            }
        });
    }

    fn await_speech(&mut self, utterance: u64, done: oneshot::Receiver<()>) {
        let tx = self.tx.clone();
        self.spawn(async move {
            // A dropped sender also means playback is over
            let _ = done.await;
            let _ = tx.send(Event::SpeechFinished { utterance });
        });
    }

    /// Release every resource regardless of mode
    fn teardown(&mut self) {
        info!(mode = %self.mode, "tearing down voice engine");
        self.wake.stop();
        if let Some(mut source) = self.source.take() {
            source.teardown();
        }
        self.playback.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.hold = false;
        self.pending_dispatch = None;
        self.set_mode(Mode::Idle);
    }
}
