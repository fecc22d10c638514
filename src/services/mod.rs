//! Adapters for the external speech and language services
//!
//! - [`vosk`]: streaming speech recognition over a WebSocket
//! - [`openai`]: OpenAI-compatible chat completions with SSE streaming
//! - [`pocket_tts`]: speech synthesis over HTTP returning WAV

mod metrics;
pub mod openai;
pub mod pocket_tts;
pub mod retry;
pub mod vosk;
pub mod wav;

pub use openai::{OpenAiLlmParams, OpenAiLlmService};
pub use pocket_tts::{PocketTtsParams, PocketTtsService};
pub use retry::RetryPolicy;
pub use vosk::{VoskSttParams, VoskSttService};
pub use wav::WavStreamDecoder;
