//! Single-turn capture session

use std::time::Duration;

use tracing::{debug, info, warn};

use super::{AudioBlob, CaptureConstraints, CaptureError, InputStream, Microphone};

/// One live microphone stream plus the chunks recorded from it
pub struct AudioCaptureSession {
    stream: Option<InputStream>,
    chunks: Vec<Vec<u8>>,
}

impl AudioCaptureSession {
    /// Acquire the microphone and begin recording
    pub async fn start(
        microphone: &dyn Microphone,
        constraints: &CaptureConstraints,
    ) -> Result<Self, CaptureError> {
        let stream = microphone.open(constraints).await?;
        info!(
            sample_rate = constraints.sample_rate,
            mime = %stream.mime,
            "audio capture started"
        );
        Ok(Self {
            stream: Some(stream),
            chunks: Vec::new(),
        })
    }

    /// Whether the stream is still open
    pub fn is_recording(&self) -> bool {
        self.stream.is_some()
    }

    /// Let the device flush, collect everything it recorded and release it.
    ///
    /// Chunks are read until the stream ends. If it has not ended within
    /// `grace` the device is stopped and whatever arrived is kept.
    /// Returns `None` if the session was already stopped.
    pub async fn finish(mut self, grace: Duration) -> Option<AudioBlob> {
        let mut stream = self.stream.take()?;
        stream.track.finish();

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            match tokio::time::timeout_at(deadline, stream.chunks.recv()).await {
                Ok(Some(chunk)) => self.chunks.push(chunk),
                Ok(None) => break,
                Err(_) => {
                    warn!(grace_ms = grace.as_millis() as u64, "capture did not end in time");
                    break;
                }
            }
        }
        stream.track.stop();
        while let Ok(chunk) = stream.chunks.try_recv() {
            self.chunks.push(chunk);
        }

        Some(self.take_blob(stream.mime))
    }

    /// Stop recording at once, release the device and return what was
    /// already delivered.
    ///
    /// Returns `None` if the session was already stopped.
    pub fn stop(&mut self) -> Option<AudioBlob> {
        let mut stream = self.stream.take()?;
        stream.track.stop();

        while let Ok(chunk) = stream.chunks.try_recv() {
            self.chunks.push(chunk);
        }
        Some(self.take_blob(stream.mime))
    }

    fn take_blob(&mut self, mime: String) -> AudioBlob {
        let bytes: Vec<u8> = self.chunks.drain(..).flatten().collect();
        info!(bytes = bytes.len(), "audio capture stopped");
        AudioBlob { bytes, mime }
    }
}

impl std::fmt::Debug for AudioCaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCaptureSession")
            .field("recording", &self.is_recording())
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

impl Drop for AudioCaptureSession {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            debug!("releasing microphone from dropped capture session");
            stream.track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::capture::InputTrack;

    struct CountingTrack(Arc<AtomicUsize>);

    impl InputTrack for CountingTrack {
        fn stop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedMic {
        chunks: Vec<Vec<u8>>,
        stops: Arc<AtomicUsize>,
        deny: bool,
    }

    #[async_trait]
    impl Microphone for ScriptedMic {
        async fn open(&self, _: &CaptureConstraints) -> Result<InputStream, CaptureError> {
            if self.deny {
                return Err(CaptureError::PermissionDenied);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            for chunk in &self.chunks {
                tx.send(chunk.clone()).unwrap();
            }
            Ok(InputStream {
                chunks: rx,
                track: Box::new(CountingTrack(Arc::clone(&self.stops))),
                mime: "audio/wav".to_string(),
            })
        }
    }

    fn mic(chunks: Vec<Vec<u8>>) -> ScriptedMic {
        ScriptedMic {
            chunks,
            stops: Arc::new(AtomicUsize::new(0)),
            deny: false,
        }
    }

    /// A device that keeps delivering its buffered tail after `finish`
    struct FlushingTrack {
        tail: Option<mpsc::UnboundedSender<Vec<u8>>>,
        stops: Arc<AtomicUsize>,
    }

    impl InputTrack for FlushingTrack {
        fn finish(&mut self) {
            if let Some(tx) = self.tail.take() {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    tx.send(vec![9, 9]).unwrap();
                });
            }
        }

        fn stop(&mut self) {
            self.tail = None;
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FlushingMic {
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Microphone for FlushingMic {
        async fn open(&self, _: &CaptureConstraints) -> Result<InputStream, CaptureError> {
            let (tx, rx) = mpsc::unbounded_channel();
            tx.send(vec![1, 2]).unwrap();
            Ok(InputStream {
                chunks: rx,
                track: Box::new(FlushingTrack {
                    tail: Some(tx),
                    stops: Arc::clone(&self.stops),
                }),
                mime: "audio/wav".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_stop_concatenates_in_order() {
        let mic = mic(vec![vec![1, 2], vec![3], vec![4, 5, 6]]);
        let constraints = CaptureConstraints::voice(16_000, 1);

        let mut session = AudioCaptureSession::start(&mic, &constraints).await.unwrap();
        assert!(session.is_recording());

        let blob = session.stop().unwrap();
        assert_eq!(blob.bytes, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(blob.mime, "audio/wav");
        assert_eq!(mic.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mic = mic(vec![vec![0; 10]]);
        let constraints = CaptureConstraints::voice(16_000, 1);

        let mut session = AudioCaptureSession::start(&mic, &constraints).await.unwrap();
        assert!(session.stop().is_some());
        assert!(session.stop().is_none());
        assert!(!session.is_recording());
        assert_eq!(mic.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_keeps_audio_flushed_after_the_request() {
        let mic = FlushingMic {
            stops: Arc::new(AtomicUsize::new(0)),
        };
        let constraints = CaptureConstraints::voice(16_000, 1);

        let session = AudioCaptureSession::start(&mic, &constraints).await.unwrap();
        let blob = session.finish(Duration::from_secs(2)).await.unwrap();
        assert_eq!(blob.bytes, vec![1, 2, 9, 9]);
        assert_eq!(mic.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_stops_a_stream_that_never_ends() {
        // The scripted stream's sender lives in the track, so it never closes
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(vec![7u8; 3]).unwrap();
        let stops = Arc::new(AtomicUsize::new(0));
        struct Stuck(mpsc::UnboundedSender<Vec<u8>>, Arc<AtomicUsize>);
        impl InputTrack for Stuck {
            fn finish(&mut self) {}
            fn stop(&mut self) {
                let _ = self.0.send(vec![8]);
                self.1.fetch_add(1, Ordering::SeqCst);
            }
        }
        struct StuckMic(std::sync::Mutex<Option<InputStream>>);
        #[async_trait]
        impl Microphone for StuckMic {
            async fn open(&self, _: &CaptureConstraints) -> Result<InputStream, CaptureError> {
                Ok(self.0.lock().unwrap().take().unwrap())
            }
        }
        let mic = StuckMic(std::sync::Mutex::new(Some(InputStream {
            chunks: rx,
            track: Box::new(Stuck(tx, Arc::clone(&stops))),
            mime: "audio/wav".to_string(),
        })));

        let session = AudioCaptureSession::start(&mic, &CaptureConstraints::voice(16_000, 1))
            .await
            .unwrap();
        let blob = session.finish(Duration::from_millis(500)).await.unwrap();
        assert_eq!(blob.bytes, vec![7, 7, 7, 8]);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_track() {
        let mic = mic(Vec::new());
        let constraints = CaptureConstraints::voice(16_000, 1);

        let session = AudioCaptureSession::start(&mic, &constraints).await.unwrap();
        drop(session);
        assert_eq!(mic.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_fails_fast() {
        let mut mic = mic(Vec::new());
        mic.deny = true;
        let constraints = CaptureConstraints::voice(16_000, 1);

        let result = AudioCaptureSession::start(&mic, &constraints).await;
        assert!(matches!(result, Err(CaptureError::PermissionDenied)));
        assert_eq!(mic.stops.load(Ordering::SeqCst), 0);
    }
}
