//! Hearsay - conversational voice pipeline over local services
//!
//! Wires three network services into one real-time conversation loop:
//! - speech recognition: a Vosk WebSocket server
//! - language model: an OpenAI-compatible chat completions endpoint
//! - speech synthesis: a Pocket TTS HTTP server
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Transports                        │
//! │        WebSocket clients  │  microphone / speaker     │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ frames
//! ┌────────────────────▼─────────────────────────────────┐
//! │                  Frame pipeline                       │
//! │  VAD ─► STT ─► context ─► LLM ─► TTS ─► output        │
//! └────────────────────┬─────────────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────────────┐
//! │                 Local services                        │
//! │     Vosk :2700  │  LM Studio :1234  │  Pocket TTS :8000│
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod bot;
pub mod config;
pub mod error;
pub mod frames;
pub mod pipeline;
pub mod processors;
pub mod services;
pub mod transport;
pub mod vad;

pub use bot::{BotSession, build_pipeline, run_session};
pub use config::Config;
pub use error::{Error, Result};
pub use frames::{Frame, FrameDirection};
pub use pipeline::{
    FrameProcessor, FrameSink, Pipeline, PipelineParams, PipelineRunner, PipelineTask, TaskEvent,
    TaskHandle, TaskOutcome,
};
pub use vad::{VadAnalyzer, VadParams};
