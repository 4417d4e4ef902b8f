//! Configuration loading and management
//!
//! Defaults are derived from `$HOME`, then overlaid by an optional
//! `config.json` in the data directory, then by `JARVIS_*` environment
//! variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Base URL of the assistant backend.
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for the shell bridge
    pub socket_path: PathBuf,

    /// Directory for runtime data (socket, config.json, identity.json)
    pub data_dir: PathBuf,

    /// Base URL of the assistant backend
    pub backend_url: String,

    /// Running inside the desktop shell. Disables local recognition.
    pub hosted_in_shell: bool,

    /// Voice engine tunables
    pub voice: VoiceSettings,
}

/// Tunables for the voice engine, read from `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub sample_rate: u32,
    pub channels: u16,
    /// Blobs shorter than this many bytes are treated as silence.
    pub noise_floor_bytes: usize,
    /// Transcripts shorter than this many characters after trimming are dropped.
    pub min_transcript_chars: usize,
    pub wake_phrases: Vec<String>,
    pub acknowledgement: String,
    pub wake_restart_delay_ms: u64,
    pub acknowledgement_delay_ms: u64,
    pub max_capture_ms: u64,
    pub request_timeout_ms: u64,
    /// How long a recorder or recognizer may take to flush after being asked to stop.
    pub stop_grace_ms: u64,
    /// Recorder program and args; `{rate}` and `{channels}` are substituted.
    pub recorder_command: Vec<String>,
    /// Recognizer program printing one transcript per line. Empty disables it.
    pub recognizer_command: Vec<String>,
    /// Synthesizer program; the text follows a `--` after these arguments.
    pub synthesizer_command: Vec<String>,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            noise_floor_bytes: 2000,
            min_transcript_chars: 2,
            wake_phrases: vec!["jarvis".to_string(), "hey jarvis".to_string()],
            acknowledgement: "Yes?".to_string(),
            wake_restart_delay_ms: 500,
            acknowledgement_delay_ms: 700,
            max_capture_ms: 8_000,
            request_timeout_ms: 30_000,
            stop_grace_ms: 2_000,
            recorder_command: [
                "arecord", "-q", "-f", "S16_LE", "-r", "{rate}", "-c", "{channels}", "-t", "wav",
                "-",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            recognizer_command: Vec::new(),
            synthesizer_command: vec!["espeak-ng".to_string()],
        }
    }
}

impl VoiceSettings {
    pub fn wake_restart_delay(&self) -> Duration {
        Duration::from_millis(self.wake_restart_delay_ms)
    }

    pub fn acknowledgement_delay(&self) -> Duration {
        Duration::from_millis(self.acknowledgement_delay_ms)
    }

    pub fn max_capture(&self) -> Duration {
        Duration::from_millis(self.max_capture_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Shape of `config.json`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    backend_url: Option<String>,
    hosted_in_shell: Option<bool>,
    voice: Option<VoiceSettings>,
}

impl Config {
    /// Load configuration from defaults, `config.json` and the environment
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("jarvis-orb");

        let mut config = Self::with_data_dir(data_dir);
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Build a configuration rooted at `data_dir`, reading `config.json` if present
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        let socket_path = data_dir.join("daemon.sock");
        let file = read_file_config(&data_dir.join("config.json")).unwrap_or_default();

        Self {
            socket_path,
            backend_url: file
                .backend_url
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            hosted_in_shell: file.hosted_in_shell.unwrap_or(false),
            voice: file.voice.unwrap_or_default(),
            data_dir,
        }
    }

    /// Overlay `JARVIS_*` variables looked up through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("JARVIS_BACKEND_URL").filter(|u| !u.trim().is_empty()) {
            self.backend_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(flag) = lookup("JARVIS_DESKTOP_SHELL") {
            self.hosted_in_shell = matches!(flag.trim(), "1" | "true" | "yes");
        }
        if let Some(socket) = lookup("JARVIS_SOCKET").filter(|s| !s.is_empty()) {
            self.socket_path = PathBuf::from(socket);
        }
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        Ok(())
    }

    /// Path of the identity file written by the shell after login
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }
}

fn read_file_config(path: &Path) -> Option<FileConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring malformed config file");
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to read config file");
            }
            None
        }
    }
}
