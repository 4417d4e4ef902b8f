//! Voice engine state machine
//!
//! Four externally observable modes:
//! - Idle: waiting, wake-word loop running when available
//! - Listening: capturing speech for a turn
//! - Thinking: transcribing and waiting on the backend
//! - Speaking: playing the reply

mod machine;


pub use machine::{Collaborators, Engine, EngineHandle, Event, Mode};
