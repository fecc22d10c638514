//! Frames flowing through the voice pipeline
//!
//! Everything that moves between processors is a [`Frame`]. System frames
//! (start, cancel, errors, interruptions, speaking events, metrics) are
//! delivered ahead of queued data frames; data and control frames keep
//! their order.

use std::fmt;
use std::time::Duration;

pub use axum::body::Bytes;
use serde::{Deserialize, Serialize};

/// Direction a frame travels through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    /// From the transport input towards the transport output
    Downstream,
    /// Back towards the transport input
    Upstream,
}

/// Raw PCM audio: signed 16-bit little-endian, interleaved
#[derive(Clone, PartialEq, Eq)]
pub struct AudioRaw {
    pub audio: Bytes,
    pub sample_rate: u32,
    pub num_channels: u16,
}

impl AudioRaw {
    /// Create a new audio buffer
    #[must_use]
    pub fn new(audio: impl Into<Bytes>, sample_rate: u32, num_channels: u16) -> Self {
        Self {
            audio: audio.into(),
            sample_rate,
            num_channels,
        }
    }

    /// Number of sample frames (samples per channel)
    #[must_use]
    pub fn num_frames(&self) -> usize {
        let channels = usize::from(self.num_channels.max(1));
        self.audio.len() / (2 * channels)
    }

    /// Playback duration of this buffer
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        #[allow(clippy::cast_precision_loss)]
        let secs = self.num_frames() as f64 / f64::from(self.sample_rate);
        Duration::from_secs_f64(secs)
    }
}

impl fmt::Debug for AudioRaw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioRaw")
            .field("bytes", &self.audio.len())
            .field("sample_rate", &self.sample_rate)
            .field("num_channels", &self.num_channels)
            .finish()
    }
}

/// A transcription result (interim or final)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transcription {
    pub text: String,
    pub user_id: String,
    /// ISO-8601 timestamp of when the result was received
    pub timestamp: String,
    pub language: String,
}

impl Transcription {
    /// Create a transcription stamped with the current time
    #[must_use]
    pub fn now(text: impl Into<String>, user_id: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_id: user_id.into(),
            timestamp: time_now_iso8601(),
            language: language.into(),
        }
    }
}

/// Current UTC time formatted as ISO-8601 with millisecond precision
#[must_use]
pub fn time_now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message in OpenAI shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Conversation history sent to the language model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmContext {
    pub messages: Vec<Message>,
}

impl LlmContext {
    #[must_use]
    pub const fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }
}

/// Parameters carried by the start frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartParams {
    pub enable_metrics: bool,
    pub enable_usage_metrics: bool,
    pub allow_interruptions: bool,
    pub audio_in_sample_rate: u32,
    pub audio_out_sample_rate: u32,
}

impl Default for StartParams {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            enable_usage_metrics: false,
            allow_interruptions: true,
            audio_in_sample_rate: 16_000,
            audio_out_sample_rate: 24_000,
        }
    }
}

/// An error reported by a processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorFrame {
    pub message: String,
    /// Fatal errors cancel the whole pipeline task
    pub fatal: bool,
}

/// What a metrics frame measured
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricsKind {
    /// Time to first byte of a service response
    Ttfb { value: Duration },
    /// Total processing time of a service call
    Processing { value: Duration },
    /// Token usage reported by the language model
    LlmUsage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// Characters sent to speech synthesis
    TtsUsage { characters: usize },
}

/// A single metrics measurement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsData {
    pub processor: String,
    #[serde(flatten)]
    pub kind: MetricsKind,
}

/// Unit of data exchanged between processors
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    // -- system frames --------------------------------------------------------
    /// First frame of every pipeline run
    Start(StartParams),
    /// Stop immediately, dropping queued work
    Cancel,
    /// Error report, normally travelling upstream
    Error(ErrorFrame),
    /// The user barged in; drop pending bot output
    Interruption,
    UserStartedSpeaking,
    UserStoppedSpeaking,
    BotStartedSpeaking,
    BotStoppedSpeaking,
    Metrics(MetricsData),

    // -- data and control frames ----------------------------------------------
    /// Graceful end of stream; processors flush before forwarding it
    End,
    /// Audio captured from the user
    InputAudio(AudioRaw),
    /// Audio to play back to the user
    OutputAudio(AudioRaw),
    InterimTranscription(Transcription),
    Transcription(Transcription),
    /// Run the language model on the current context without adding to it
    LlmRun,
    /// Append messages to the shared context, optionally running the model
    LlmMessagesAppend { messages: Vec<Message>, run_llm: bool },
    /// Context snapshot to complete
    LlmContext(LlmContext),
    LlmResponseStart,
    LlmText(String),
    LlmResponseEnd,
    /// Speak this text verbatim
    TtsSpeak(String),
    TtsStarted,
    TtsStopped,
}

impl Frame {
    /// System frames bypass queued data frames
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(
            self,
            Self::Start(_)
                | Self::Cancel
                | Self::Error(_)
                | Self::Interruption
                | Self::UserStartedSpeaking
                | Self::UserStoppedSpeaking
                | Self::BotStartedSpeaking
                | Self::BotStoppedSpeaking
                | Self::Metrics(_)
        )
    }

    /// Frames discarded from processor queues when the user interrupts
    ///
    /// Response and synthesis markers are kept so every start still reaches
    /// the client with its matching stop.
    #[must_use]
    pub const fn is_interruptible(&self) -> bool {
        matches!(
            self,
            Self::OutputAudio(_) | Self::LlmContext(_) | Self::LlmText(_) | Self::TtsSpeak(_)
        )
    }

    /// Short name used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "Start",
            Self::Cancel => "Cancel",
            Self::Error(_) => "Error",
            Self::Interruption => "Interruption",
            Self::UserStartedSpeaking => "UserStartedSpeaking",
            Self::UserStoppedSpeaking => "UserStoppedSpeaking",
            Self::BotStartedSpeaking => "BotStartedSpeaking",
            Self::BotStoppedSpeaking => "BotStoppedSpeaking",
            Self::Metrics(_) => "Metrics",
            Self::End => "End",
            Self::InputAudio(_) => "InputAudio",
            Self::OutputAudio(_) => "OutputAudio",
            Self::InterimTranscription(_) => "InterimTranscription",
            Self::Transcription(_) => "Transcription",
            Self::LlmRun => "LlmRun",
            Self::LlmMessagesAppend { .. } => "LlmMessagesAppend",
            Self::LlmContext(_) => "LlmContext",
            Self::LlmResponseStart => "LlmResponseStart",
            Self::LlmText(_) => "LlmText",
            Self::LlmResponseEnd => "LlmResponseEnd",
            Self::TtsSpeak(_) => "TtsSpeak",
            Self::TtsStarted => "TtsStarted",
            Self::TtsStopped => "TtsStopped",
        }
    }

    /// Build a non-fatal error frame
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorFrame {
            message: message.into(),
            fatal: false,
        })
    }
}
