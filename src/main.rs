//! jarvis-orb-daemon: voice engine behind the Jarvis floating orb
//!
//! This daemon runs beside the orb window and provides:
//! - Wake-word listening and hold-to-talk speech capture
//! - Transcript dispatch to the assistant backend
//! - Spoken replies that the user can interrupt
//! - A Unix-socket bridge the orb window drives and observes

mod capture;
mod config;
mod dispatch;
mod events;
mod ipc;
mod lifecycle;
mod playback;
mod speech;
mod state;
mod wake;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::capture::{CommandMicrophone, Microphone};
use crate::config::{Config, VoiceSettings};
use crate::dispatch::{DispatchClient, HttpBackend, IdentityFile};
use crate::events::StateEvent;
use crate::ipc::Server;
use crate::lifecycle::ShutdownSignal;
use crate::playback::{CommandSynthesizer, Synthesizer};
use crate::speech::{Capabilities, CommandRecognizer, Recognizer};
use crate::state::{Collaborators, Engine};

/// MIME type of what the default recorder writes
const RECORDER_MIME: &str = "audio/wav";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "jarvis-orb-daemon starting");

    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(
        socket_path = ?config.socket_path,
        backend = %config.backend_url,
        hosted_in_shell = config.hosted_in_shell,
        "configuration loaded"
    );

    let mut shutdown = ShutdownSignal::new().context("failed to register signal handlers")?;

    let backend = HttpBackend::new(&config.backend_url, config.voice.request_timeout())
        .context("failed to build backend client")?;
    let identity = IdentityFile::new(config.identity_path()).with_env(|key| std::env::var(key).ok());
    let dispatch = DispatchClient::new(Arc::new(backend), Arc::new(identity));

    let recognizer = build_recognizer(&config.voice);
    let strategy = speech::probe(Capabilities {
        recognizer: recognizer.is_some(),
        hosted_in_shell: config.hosted_in_shell,
    });

    let collaborators = Collaborators {
        recognizer,
        microphone: build_microphone(&config.voice),
        synthesizer: build_synthesizer(&config.voice),
        dispatch,
    };

    // Engine -> bridge (mode changes and turn events)
    let (event_tx, _) = broadcast::channel::<StateEvent>(64);
    let mut bridge_events = event_tx.subscribe();

    let (engine, handle) = Engine::new(collaborators, config.voice.clone(), strategy, event_tx);
    let server = Server::new(&config.socket_path, handle.clone(), strategy)?;
    let mut engine_task = tokio::spawn(engine.run());

    info!("daemon initialized, entering main loop");

    let engine_exited = tokio::select! {
        result = &mut engine_task => {
            if let Err(e) = result {
                error!(?e, "voice engine task failed");
            }
            true
        }

        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "bridge error");
            }
            false
        }

        // Keep the bridge's view of the engine current
        _ = async {
            loop {
                match bridge_events.recv().await {
                    Ok(event) => server.apply_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "state event receiver lagged");
                        // A skipped ModeChanged would leave the bridge's view stale
                        server.sync_mode(handle.mode()).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        } => {
            info!("state event handler exited");
            false
        }

        signal = shutdown.wait() => {
            info!(signal, "shutdown signal received");
            false
        }
    };

    info!("shutting down...");

    if !engine_exited {
        handle.shutdown();
        if let Err(e) = engine_task.await {
            warn!(?e, "voice engine did not stop cleanly");
        }
    }
    server.shutdown().await;

    info!("jarvis-orb-daemon stopped");

    Ok(())
}

fn build_recognizer(voice: &VoiceSettings) -> Option<Arc<dyn Recognizer>> {
    let Some(recognizer) = CommandRecognizer::new(&voice.recognizer_command) else {
        debug!("no recognizer command configured");
        return None;
    };
    if !recognizer.is_available() {
        warn!(command = ?voice.recognizer_command, "recognizer not found, local recognition unavailable");
        return None;
    }
    Some(Arc::new(recognizer.with_stop_grace(voice.stop_grace())))
}

fn build_microphone(voice: &VoiceSettings) -> Option<Arc<dyn Microphone>> {
    let microphone = CommandMicrophone::new(&voice.recorder_command, RECORDER_MIME)?;
    if !microphone.is_available() {
        warn!(command = ?voice.recorder_command, "recorder not found, audio capture unavailable");
        return None;
    }
    Some(Arc::new(microphone))
}

fn build_synthesizer(voice: &VoiceSettings) -> Option<Arc<dyn Synthesizer>> {
    let synthesizer = CommandSynthesizer::new(&voice.synthesizer_command)?;
    if !synthesizer.is_available() {
        warn!(command = ?voice.synthesizer_command, "synthesizer not found, replies will not be spoken");
        return None;
    }
    Some(Arc::new(synthesizer))
}
