//! Transports connecting a user to a bot session
//!
//! - [`websocket`]: network clients streaming PCM over `/ws`
//! - [`local`]: the default microphone and speaker

mod capture;
pub mod local;
mod playback;
pub mod websocket;

pub use capture::{AudioCapture, MicrophoneFeed};
pub use local::run_local;
pub use playback::{AudioPlayback, SpeakerSink};
pub use websocket::{ClientMessage, HealthResponse, router, serve, serve_on};
