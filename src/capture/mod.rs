//! Microphone capture
//!
//! An [`AudioCaptureSession`] owns one live input stream for the duration of
//! a single turn. Finishing a session lets the device flush its tail before
//! the blob is built; stopping or dropping it releases the device at once.

mod command;
mod session;

pub use command::CommandMicrophone;
pub use session::AudioCaptureSession;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Parameters requested from the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl CaptureConstraints {
    /// Voice capture with all input processing flags enabled
    pub fn voice(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// A finished recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlob {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl AudioBlob {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the blob is too small to hold speech
    pub fn is_noise(&self, noise_floor: usize) -> bool {
        self.len() < noise_floor
    }

    /// Upload file name derived from the MIME type
    pub fn file_name(&self) -> String {
        let ext = match self.mime.split(';').next().unwrap_or("").trim() {
            "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
            "audio/ogg" => "ogg",
            "audio/mpeg" => "mp3",
            _ => "webm",
        };
        format!("recording.{ext}")
    }
}

/// Hardware side of an open input stream
pub trait InputTrack: Send {
    /// Ask the device to flush and end the stream. Chunks keep arriving
    /// until the stream's sender closes.
    fn finish(&mut self) {
        self.stop();
    }

    /// Stop the track and release the device. Must tolerate repeated calls.
    fn stop(&mut self);
}

/// An open microphone stream: encoded chunks arrive in recording order
pub struct InputStream {
    pub chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    pub track: Box<dyn InputTrack>,
    pub mime: String,
}

/// Source of exclusive microphone streams
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Acquire the device. Suspends while a permission prompt is pending.
    async fn open(&self, constraints: &CaptureConstraints) -> Result<InputStream, CaptureError>;
}

/// Errors acquiring the microphone
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("no input device available: {0}")]
    DeviceUnavailable(String),

    #[error("failed to start recorder: {0}")]
    Recorder(String),
}
