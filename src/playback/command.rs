//! Synthesizer backed by an external TTS program (espeak-ng, say, spd-say -w)

use std::process::Stdio;
use std::sync::Mutex;

use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{SynthesisError, Synthesizer};

/// Maximum text passed to the synthesizer in one utterance
const MAX_UTTERANCE_BYTES: usize = 16 * 1024;

/// Runs `program args.. -- <text>` per utterance; playback ends when it exits.
///
/// The `--` keeps replies that start with `-` from being read as options.
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl CommandSynthesizer {
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            cancel_tx: Mutex::new(None),
        })
    }

    /// Whether the synthesizer program resolves on `PATH`
    pub fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }
}

/// Cut `text` to at most `max` bytes on a char boundary
fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

impl Synthesizer for CommandSynthesizer {
    fn speak(&self, text: &str) -> Result<oneshot::Receiver<()>, SynthesisError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--")
            .arg(truncate(text, MAX_UTTERANCE_BYTES))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SynthesisError::Unsupported,
                _ => SynthesisError::Failed(e.to_string()),
            })?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        if let Ok(mut slot) = self.cancel_tx.lock() {
            // A previous utterance still running is cut off
            if let Some(previous) = slot.replace(cancel_tx) {
                let _ = previous.send(());
            }
        }

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if !status.success() => warn!(?status, "synthesizer exited with failure"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "synthesizer wait failed"),
                },
                _ = cancel_rx => {
                    debug!("synthesizer cancelled");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
            let _ = done_tx.send(());
        });

        Ok(done_rx)
    }

    fn cancel(&self) {
        if let Ok(mut slot) = self.cancel_tx.lock() {
            if let Some(cancel) = slot.take() {
                let _ = cancel.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("héllo", 2), "h");
    }

    #[tokio::test]
    async fn test_missing_program_is_unsupported() {
        let synth = CommandSynthesizer::new(&["/nonexistent/tts-xyz".to_string()]).unwrap();
        assert_eq!(synth.speak("hi").unwrap_err(), SynthesisError::Unsupported);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_completion_resolves_when_program_exits() {
        let synth = CommandSynthesizer::new(&["true".to_string()]).unwrap();
        let done = synth.speak("hello").unwrap();
        tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .expect("synthesizer should finish")
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_stops_long_utterance() {
        let synth =
            CommandSynthesizer::new(&["sh".to_string(), "-c".to_string(), "sleep 30".to_string()])
                .unwrap();
        let done = synth.speak("a long utterance").unwrap();
        synth.cancel();
        tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .expect("cancel should end playback")
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reply_starting_with_dash_is_spoken_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("argv");
        // Records the arguments it was given, one per line
        let synth = CommandSynthesizer::new(&[
            "sh".to_string(),
            "-c".to_string(),
            "printf '%s\\n' \"$@\" > \"$0\"".to_string(),
            out.to_string_lossy().into_owned(),
        ])
        .unwrap();

        let done = synth.speak("-5 degrees outside").unwrap();
        tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .expect("synthesizer should finish")
            .unwrap();

        let argv = std::fs::read_to_string(&out).unwrap();
        assert_eq!(argv, "--\n-5 degrees outside\n");
    }
}
