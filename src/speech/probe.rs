//! Startup capability probe

use tracing::info;

use super::CaptureStrategy;

/// What the host environment offers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// A usable in-process recognizer exists
    pub recognizer: bool,
    /// Running inside the desktop shell, whose context lacks reliable
    /// local recognition
    pub hosted_in_shell: bool,
}

/// Pick the initial capture strategy
pub fn probe(caps: Capabilities) -> CaptureStrategy {
    let strategy = if caps.recognizer && !caps.hosted_in_shell {
        CaptureStrategy::LocalRecognition
    } else {
        CaptureStrategy::RemoteAudio
    };

    info!(
        recognizer = caps.recognizer,
        hosted_in_shell = caps.hosted_in_shell,
        %strategy,
        "capture strategy selected"
    );
    strategy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_when_recognizer_available() {
        let caps = Capabilities {
            recognizer: true,
            hosted_in_shell: false,
        };
        assert_eq!(probe(caps), CaptureStrategy::LocalRecognition);
    }

    #[test]
    fn test_remote_without_recognizer() {
        assert_eq!(probe(Capabilities::default()), CaptureStrategy::RemoteAudio);
    }

    #[test]
    fn test_shell_hosting_forces_remote() {
        let caps = Capabilities {
            recognizer: true,
            hosted_in_shell: true,
        };
        assert_eq!(probe(caps), CaptureStrategy::RemoteAudio);
    }
}
