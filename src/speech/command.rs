//! Recognizer backed by an external process
//!
//! The process prints one transcript per stdout line. A line of the form
//! `error:<code>` reports a recognition error (`error:network`,
//! `error:no-speech`, ...). The process exiting ends the session.
//!
//! Stopping a session closes the process's stdin: it should print its final
//! transcript and exit. One that is still running after the stop grace is
//! killed. Aborting kills it straight away.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    RecognitionControl, RecognitionError, RecognitionEvent, RecognitionMode, RecognitionStream,
    Recognizer,
};

#[derive(Debug, Clone, Copy)]
enum Signal {
    Stop,
    Abort,
}

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Spawns the configured recognizer program per session
#[derive(Debug, Clone)]
pub struct CommandRecognizer {
    program: String,
    args: Vec<String>,
    stop_grace: Duration,
}

impl CommandRecognizer {
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            stop_grace: DEFAULT_STOP_GRACE,
        })
    }

    /// How long a stopped session may keep running to flush its result
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Whether the recognizer program resolves on `PATH`
    pub fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }
}

struct CommandControl {
    signal_tx: mpsc::UnboundedSender<Signal>,
}

impl RecognitionControl for CommandControl {
    fn stop(&mut self) {
        let _ = self.signal_tx.send(Signal::Stop);
    }

    fn abort(&mut self) {
        let _ = self.signal_tx.send(Signal::Abort);
    }
}

/// Turn one line of recognizer output into an event
fn parse_line(line: &str) -> Option<RecognitionEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match line.strip_prefix("error:") {
        Some(code) => Some(RecognitionEvent::Error(RecognitionError::from_code(code))),
        None => Some(RecognitionEvent::result(line)),
    }
}

impl Recognizer for CommandRecognizer {
    fn start(&self, mode: RecognitionMode) -> Result<RecognitionStream, RecognitionError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    RecognitionError::Unsupported(format!("`{}` not found", self.program))
                }
                std::io::ErrorKind::PermissionDenied => RecognitionError::NotAllowed,
                _ => RecognitionError::Other(e.to_string()),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RecognitionError::Other("recognizer stdout unavailable".to_string()))?;
        let mut stdin = child.stdin.take();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let stop_grace = self.stop_grace;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut stopping = false;
            // Set while a stopped process is being given time to flush
            let mut deadline: Option<Instant> = None;

            loop {
                tokio::select! {
                    signal = signal_rx.recv() => match signal {
                        Some(Signal::Stop) => {
                            if !stopping {
                                drop(stdin.take());
                                stopping = true;
                                deadline = Some(Instant::now() + stop_grace);
                            }
                        }
                        // Aborted or every handle dropped: nothing more to report
                        Some(Signal::Abort) | None => {
                            let _ = child.start_kill();
                            return;
                        }
                    },
                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        debug!("recognizer still running after stop, killing it");
                        let _ = child.start_kill();
                        deadline = None;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let Some(event) = parse_line(&line) else { continue };
                            let is_result = matches!(event, RecognitionEvent::Result { .. });
                            if event_tx.send(event).is_err() {
                                let _ = child.start_kill();
                                return;
                            }
                            if is_result && mode == RecognitionMode::SingleShot {
                                // One result is all a single-shot session delivers
                                let _ = child.start_kill();
                                stopping = true;
                                deadline = None;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "recognizer output unreadable");
                            let _ = event_tx.send(RecognitionEvent::Error(
                                RecognitionError::Other(e.to_string()),
                            ));
                            break;
                        }
                    }
                }
            }

            match child.wait().await {
                Ok(status) if !status.success() && !stopping => {
                    debug!(?status, "recognizer exited with failure");
                    let _ = event_tx.send(RecognitionEvent::Error(RecognitionError::Other(
                        format!("recognizer exited with {status}"),
                    )));
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "recognizer wait failed"),
            }
            let _ = event_tx.send(RecognitionEvent::End);
        });

        Ok(RecognitionStream {
            events: event_rx,
            control: Box::new(CommandControl { signal_tx }),
        })
    }
}
