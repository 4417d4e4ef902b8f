//! Microphone backed by an external recorder process
//!
//! The recorder writes encoded audio to stdout; each read is forwarded as
//! one chunk. Input-processing flags are exported to the process as
//! `JARVIS_*` environment variables for recorders (or wrapper scripts) that
//! can apply them.
//!
//! Finishing a capture closes the recorder's stdin and sends it `SIGINT`,
//! which `arecord` and most wrapper scripts treat as "flush and exit".
//! The reader keeps forwarding output until the recorder closes stdout.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{CaptureConstraints, CaptureError, InputStream, InputTrack, Microphone};

const READ_CHUNK_BYTES: usize = 4096;

/// Spawns a recorder command per capture session
#[derive(Debug, Clone)]
pub struct CommandMicrophone {
    program: String,
    args: Vec<String>,
    mime: String,
}

impl CommandMicrophone {
    /// `command[0]` is the program; `{rate}` and `{channels}` in the
    /// remaining arguments are replaced at open time.
    pub fn new(command: &[String], mime: impl Into<String>) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            mime: mime.into(),
        })
    }

    /// Whether the recorder program resolves on `PATH`
    pub fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    fn render_args(&self, constraints: &CaptureConstraints) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{rate}", &constraints.sample_rate.to_string())
                    .replace("{channels}", &constraints.channels.to_string())
            })
            .collect()
    }
}

struct RecorderTrack {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl RecorderTrack {
    fn interrupt(&self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        let sent = Command::new("kill")
            .arg("-INT")
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = sent {
            debug!(error = %e, pid, "failed to interrupt recorder");
        }
    }
}

impl InputTrack for RecorderTrack {
    fn finish(&mut self) {
        // EOF on stdin is the first request to stop
        drop(self.stdin.take());
        self.interrupt();
    }

    fn stop(&mut self) {
        self.stdin = None;
        if let Err(e) = self.child.start_kill() {
            // Already exited
            debug!(error = %e, "recorder kill failed");
        }
    }
}

#[async_trait]
impl Microphone for CommandMicrophone {
    async fn open(&self, constraints: &CaptureConstraints) -> Result<InputStream, CaptureError> {
        let flag = |on: bool| if on { "1" } else { "0" };

        let mut child = Command::new(&self.program)
            .args(self.render_args(constraints))
            .env("JARVIS_ECHO_CANCELLATION", flag(constraints.echo_cancellation))
            .env("JARVIS_NOISE_SUPPRESSION", flag(constraints.noise_suppression))
            .env("JARVIS_AUTO_GAIN_CONTROL", flag(constraints.auto_gain_control))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    CaptureError::DeviceUnavailable(format!("recorder `{}` not found", self.program))
                }
                std::io::ErrorKind::PermissionDenied => CaptureError::PermissionDenied,
                _ => CaptureError::Recorder(e.to_string()),
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Recorder("recorder stdout unavailable".to_string()))?;

        let stdin = child.stdin.take();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "recorder read failed");
                        break;
                    }
                }
            }
            debug!("recorder output closed");
        });

        Ok(InputStream {
            chunks: rx,
            track: Box::new(RecorderTrack { child, stdin }),
            mime: self.mime.clone(),
        })
    }
}
