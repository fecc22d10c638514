//! Conversation events for the connected client
//!
//! A reporter passes every frame through unchanged and translates the ones
//! its role cares about into [`ClientEvent`]s. One reporter on the user side
//! (after speech recognition) and one on the bot side (after the output
//! transport) cover the whole conversation without reporting a frame twice.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::frames::{Frame, FrameDirection, MetricsKind};
use crate::pipeline::{FrameProcessor, FrameSink};
use crate::Result;

/// Event sent to the client as JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Session established
    Connected {
        session_id: String,
        input_sample_rate: u32,
        output_sample_rate: u32,
    },
    UserTranscription {
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
        timestamp: String,
    },
    UserStartedSpeaking,
    UserStoppedSpeaking,
    BotLlmStarted,
    BotText { text: String },
    BotLlmStopped,
    BotTtsStarted,
    BotTtsStopped,
    BotStartedSpeaking,
    BotStoppedSpeaking,
    Metrics {
        processor: String,
        metric: String,
        value: u64,
    },
    Error { message: String, fatal: bool },
    Pong,
}

/// Which half of the conversation a reporter covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterRole {
    User,
    Bot,
}

/// Forwards frames and reports them to the client
pub struct ClientEventReporter {
    role: ReporterRole,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientEventReporter {
    #[must_use]
    pub const fn user(events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self {
            role: ReporterRole::User,
            events,
        }
    }

    #[must_use]
    pub const fn bot(events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self {
            role: ReporterRole::Bot,
            events,
        }
    }

    fn translate(&self, frame: &Frame) -> Option<ClientEvent> {
        match (self.role, frame) {
            (ReporterRole::User, Frame::Transcription(t)) => Some(ClientEvent::UserTranscription {
                text: t.text.clone(),
                is_final: true,
                timestamp: t.timestamp.clone(),
            }),
            (ReporterRole::User, Frame::InterimTranscription(t)) => {
                Some(ClientEvent::UserTranscription {
                    text: t.text.clone(),
                    is_final: false,
                    timestamp: t.timestamp.clone(),
                })
            }
            (ReporterRole::User, Frame::UserStartedSpeaking) => Some(ClientEvent::UserStartedSpeaking),
            (ReporterRole::User, Frame::UserStoppedSpeaking) => Some(ClientEvent::UserStoppedSpeaking),
            (ReporterRole::Bot, Frame::LlmResponseStart) => Some(ClientEvent::BotLlmStarted),
            (ReporterRole::Bot, Frame::LlmText(text)) => Some(ClientEvent::BotText { text: text.clone() }),
            (ReporterRole::Bot, Frame::LlmResponseEnd) => Some(ClientEvent::BotLlmStopped),
            (ReporterRole::Bot, Frame::TtsStarted) => Some(ClientEvent::BotTtsStarted),
            (ReporterRole::Bot, Frame::TtsStopped) => Some(ClientEvent::BotTtsStopped),
            (ReporterRole::Bot, Frame::BotStartedSpeaking) => Some(ClientEvent::BotStartedSpeaking),
            (ReporterRole::Bot, Frame::BotStoppedSpeaking) => Some(ClientEvent::BotStoppedSpeaking),
            (ReporterRole::Bot, Frame::Metrics(data)) => {
                let (metric, value) = match &data.kind {
                    MetricsKind::Ttfb { value } => ("ttfb_ms", millis(*value)),
                    MetricsKind::Processing { value } => ("processing_ms", millis(*value)),
                    MetricsKind::LlmUsage {
                        prompt_tokens,
                        completion_tokens,
                    } => (
                        "llm_tokens",
                        u64::from(*prompt_tokens) + u64::from(*completion_tokens),
                    ),
                    MetricsKind::TtsUsage { characters } => ("tts_characters", *characters as u64),
                };
                Some(ClientEvent::Metrics {
                    processor: data.processor.clone(),
                    metric: metric.to_string(),
                    value,
                })
            }
            _ => None,
        }
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl FrameProcessor for ClientEventReporter {
    fn name(&self) -> &'static str {
        match self.role {
            ReporterRole::User => "user-events",
            ReporterRole::Bot => "bot-events",
        }
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        sink: &FrameSink,
    ) -> Result<()> {
        if let Some(event) = self.translate(&frame) {
            // The client may already be gone; the pipeline will be cancelled
            let _ = self.events.send(event);
        }
        sink.push(frame, direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::Transcription;

    #[test]
    fn roles_split_the_conversation() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let user = ClientEventReporter::user(tx.clone());
        let bot = ClientEventReporter::bot(tx);

        let transcript = Frame::Transcription(Transcription::now("hi", "u1", "en"));
        assert!(user.translate(&transcript).is_some());
        assert!(bot.translate(&transcript).is_none());

        let text = Frame::LlmText("hello".to_string());
        assert!(user.translate(&text).is_none());
        assert_eq!(
            bot.translate(&text),
            Some(ClientEvent::BotText {
                text: "hello".to_string()
            })
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = ClientEvent::UserTranscription {
            text: "hi".to_string(),
            is_final: true,
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "user_transcription");
        assert_eq!(json["final"], true);

        let json = serde_json::to_value(ClientEvent::BotStartedSpeaking).unwrap();
        assert_eq!(json, serde_json::json!({"type": "bot_started_speaking"}));
    }
}
