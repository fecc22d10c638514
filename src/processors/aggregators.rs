//! Conversation context aggregation
//!
//! The user aggregator sits before the language model and turns final
//! transcriptions into user turns. The assistant aggregator sits at the end
//! of the pipeline and records what the bot said. Both share one context.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::frames::{Frame, FrameDirection, LlmContext, Message};
use crate::pipeline::{FrameProcessor, FrameSink};
use crate::Result;

/// Conversation context shared between the aggregators
pub type SharedContext = Arc<Mutex<LlmContext>>;

/// Create a user/assistant aggregator pair over one context
#[must_use]
pub fn context_aggregator_pair(
    context: LlmContext,
) -> (UserContextAggregator, AssistantContextAggregator) {
    let shared = Arc::new(Mutex::new(context));
    (
        UserContextAggregator::new(Arc::clone(&shared)),
        AssistantContextAggregator::new(shared),
    )
}

/// Collects user transcriptions into turns for the language model
pub struct UserContextAggregator {
    context: SharedContext,
    aggregation: Vec<String>,
    user_speaking: bool,
}

impl UserContextAggregator {
    #[must_use]
    pub const fn new(context: SharedContext) -> Self {
        Self {
            context,
            aggregation: Vec::new(),
            user_speaking: false,
        }
    }

    #[must_use]
    pub fn context(&self) -> SharedContext {
        Arc::clone(&self.context)
    }

    /// Append the pending user turn and ask the model to respond
    async fn flush(&mut self, sink: &FrameSink) -> Result<()> {
        if self.aggregation.is_empty() {
            return Ok(());
        }
        let text = std::mem::take(&mut self.aggregation).join(" ");
        tracing::debug!(text = %text, "user turn complete");

        let snapshot = {
            let mut context = self.context.lock().await;
            context.push(Message::user(text));
            context.clone()
        };
        sink.push_downstream(Frame::LlmContext(snapshot))
    }
}

#[async_trait]
impl FrameProcessor for UserContextAggregator {
    fn name(&self) -> &'static str {
        "user-aggregator"
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        sink: &FrameSink,
    ) -> Result<()> {
        match frame {
            Frame::UserStartedSpeaking => {
                self.user_speaking = true;
                sink.push(frame, direction)
            }
            Frame::UserStoppedSpeaking => {
                self.user_speaking = false;
                sink.push(frame, direction)?;
                self.flush(sink).await
            }
            Frame::Transcription(transcription) => {
                let text = transcription.text.trim();
                if !text.is_empty() {
                    self.aggregation.push(text.to_string());
                }
                // Without voice activity the final result marks the end of the turn
                if self.user_speaking {
                    Ok(())
                } else {
                    self.flush(sink).await
                }
            }
            Frame::InterimTranscription(_) => Ok(()),
            Frame::LlmRun => {
                let snapshot = self.context.lock().await.clone();
                sink.push_downstream(Frame::LlmContext(snapshot))
            }
            Frame::LlmMessagesAppend { messages, run_llm } => {
                let snapshot = {
                    let mut context = self.context.lock().await;
                    context.extend(messages);
                    context.clone()
                };
                if run_llm {
                    sink.push_downstream(Frame::LlmContext(snapshot))?;
                }
                Ok(())
            }
            other => sink.push(other, direction),
        }
    }

    async fn stop(&mut self, sink: &FrameSink) -> Result<()> {
        self.flush(sink).await
    }
}

/// Records the bot's responses in the shared context
pub struct AssistantContextAggregator {
    context: SharedContext,
    aggregation: String,
    in_response: bool,
}

impl AssistantContextAggregator {
    #[must_use]
    pub const fn new(context: SharedContext) -> Self {
        Self {
            context,
            aggregation: String::new(),
            in_response: false,
        }
    }

    #[must_use]
    pub fn context(&self) -> SharedContext {
        Arc::clone(&self.context)
    }

    async fn commit(&mut self) {
        self.in_response = false;
        let text = std::mem::take(&mut self.aggregation);
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        tracing::debug!(text, "assistant turn recorded");
        self.context.lock().await.push(Message::assistant(text));
    }
}

#[async_trait]
impl FrameProcessor for AssistantContextAggregator {
    fn name(&self) -> &'static str {
        "assistant-aggregator"
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        sink: &FrameSink,
    ) -> Result<()> {
        match frame {
            Frame::LlmResponseStart => {
                // A response that never saw its end still counts
                if self.in_response {
                    self.commit().await;
                }
                self.aggregation.clear();
                self.in_response = true;
                Ok(())
            }
            Frame::LlmText(text) => {
                if self.in_response {
                    self.aggregation.push_str(&text);
                }
                Ok(())
            }
            Frame::LlmResponseEnd => {
                self.commit().await;
                Ok(())
            }
            Frame::Interruption => {
                // Keep what was generated before the user barged in
                self.commit().await;
                sink.push(frame, direction)
            }
            other => sink.push(other, direction),
        }
    }

    async fn stop(&mut self, _sink: &FrameSink) -> Result<()> {
        self.commit().await;
        Ok(())
    }
}
