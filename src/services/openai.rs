//! OpenAI-compatible chat completions with server-sent event streaming
//!
//! Works with any local server exposing `/v1/chat/completions` (LM Studio,
//! llama.cpp, vLLM, Ollama's OpenAI endpoint).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::metrics::ServiceMetrics;
use crate::frames::{Frame, FrameDirection, LlmContext, Message, MetricsKind, StartParams};
use crate::pipeline::{FrameProcessor, FrameSink};
use crate::{Error, Result};

/// Default local endpoint (LM Studio)
pub const DEFAULT_BASE_URL: &str = "http://localhost:1234/v1";

/// Default model identifier
pub const DEFAULT_MODEL: &str = "liquid/lfm2.5-1.2b";

/// LLM service settings
#[derive(Debug)]
pub struct OpenAiLlmParams {
    pub base_url: String,
    pub model: String,
    /// Local servers accept any key
    pub api_key: SecretString,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for OpenAiLlmParams {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: SecretString::from("not-needed"),
            temperature: None,
            max_tokens: None,
        }
    }
}

impl Clone for OpenAiLlmParams {
    fn clone(&self) -> Self {
        Self {
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            api_key: SecretString::from(self.api_key.expose_secret()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Something the model streamed back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Text(String),
    Usage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
}

/// A decoded server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    /// The `[DONE]` sentinel
    Done,
}

/// Incremental server-sent events decoder
///
/// Bytes may be split anywhere, including inside a UTF-8 sequence; only
/// complete lines are decoded.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every event they completed
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        events
    }

    /// Dispatch a trailing event not followed by a blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let rest = String::from_utf8_lossy(&rest);
            if let Some(value) = rest.trim_end().strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        if data.trim() == "[DONE]" {
            Some(SseEvent::Done)
        } else {
            Some(SseEvent::Data(data))
        }
    }
}

/// Parse one streamed chunk into events
fn parse_chunk(data: &str) -> Vec<StreamEvent> {
    let chunk: ChatChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::warn!(error = %e, "skipping unparseable completion chunk");
            return Vec::new();
        }
    };

    let mut events: Vec<StreamEvent> = chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map(StreamEvent::Text)
        .collect();

    if let Some(usage) = chunk.usage {
        events.push(StreamEvent::Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        });
    }
    events
}

/// Streaming chat completions client
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    params: OpenAiLlmParams,
}

impl OpenAiClient {
    #[must_use]
    pub fn new(params: OpenAiLlmParams) -> Self {
        Self {
            http: reqwest::Client::new(),
            params,
        }
    }

    #[must_use]
    pub const fn params(&self) -> &OpenAiLlmParams {
        &self.params
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.params.base_url.trim_end_matches('/'))
    }

    /// Stream a completion, calling `on_event` for every text delta and usage report
    ///
    /// # Errors
    ///
    /// Returns error if the request fails, the server answers with a non-2xx
    /// status, or `on_event` fails
    pub async fn stream_chat<F>(&self, messages: &[Message], mut on_event: F) -> Result<()>
    where
        F: FnMut(StreamEvent) -> Result<()> + Send,
    {
        let request = ChatRequest {
            model: &self.params.model,
            messages,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            temperature: self.params.temperature,
            max_tokens: self.params.max_tokens,
        };

        tracing::debug!(
            model = %self.params.model,
            messages = messages.len(),
            "requesting chat completion"
        );

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(self.params.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("{status}: {body}")));
        }

        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            for event in decoder.push(&chunk?) {
                match event {
                    SseEvent::Done => return Ok(()),
                    SseEvent::Data(data) => {
                        for event in parse_chunk(&data) {
                            on_event(event)?;
                        }
                    }
                }
            }
        }

        if let Some(SseEvent::Data(data)) = decoder.finish() {
            for event in parse_chunk(&data) {
                on_event(event)?;
            }
        }
        Ok(())
    }

    /// Stream a completion to `on_text` and return the full response
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn complete<F>(&self, messages: &[Message], mut on_text: F) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        let mut response = String::new();
        self.stream_chat(messages, |event| {
            if let StreamEvent::Text(text) = event {
                on_text(&text);
                response.push_str(&text);
            }
            Ok(())
        })
        .await?;
        Ok(response)
    }
}

/// Runs the language model on every context it receives
///
/// Generation happens in a background task so an interruption or a newer
/// context can abort it mid-stream.
pub struct OpenAiLlmService {
    client: OpenAiClient,
    metrics: ServiceMetrics,
    generation: Option<Generation>,
}

struct Generation {
    task: JoinHandle<()>,
    /// Set between `LlmResponseStart` and `LlmResponseEnd`
    responding: Arc<AtomicBool>,
}

impl OpenAiLlmService {
    #[must_use]
    pub fn new(params: OpenAiLlmParams) -> Self {
        Self {
            client: OpenAiClient::new(params),
            metrics: ServiceMetrics::new("openai-llm"),
            generation: None,
        }
    }

    #[must_use]
    pub const fn client(&self) -> &OpenAiClient {
        &self.client
    }

    /// Abort the in-flight generation and wait for its task to finish
    ///
    /// Returns true when a response was cut off before its end marker.
    async fn abort_generation(&mut self) -> bool {
        let Some(Generation { task, responding }) = self.generation.take() else {
            return false;
        };
        if !task.is_finished() {
            tracing::debug!("aborting in-flight generation");
        }
        task.abort();
        if let Some(e) = task.await.err().filter(|e| !e.is_cancelled()) {
            tracing::warn!(error = %e, "generation task failed");
        }
        responding.swap(false, Ordering::SeqCst)
    }

    fn spawn_generation(&mut self, context: LlmContext, sink: &FrameSink) {
        let responding = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(generate(
            self.client.clone(),
            context,
            sink.clone(),
            self.metrics.clone(),
            Arc::clone(&responding),
        ));
        self.generation = Some(Generation { task, responding });
    }
}

#[async_trait]
impl FrameProcessor for OpenAiLlmService {
    fn name(&self) -> &'static str {
        "openai-llm"
    }

    async fn start(&mut self, params: &StartParams, _sink: &FrameSink) -> Result<()> {
        self.metrics.configure(params);
        Ok(())
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        sink: &FrameSink,
    ) -> Result<()> {
        match frame {
            Frame::LlmContext(context) => {
                // Close the superseded response before the new one starts
                if self.abort_generation().await {
                    sink.push_downstream(Frame::LlmResponseEnd)?;
                }
                self.spawn_generation(context, sink);
                Ok(())
            }
            Frame::Interruption => {
                let cut_off = self.abort_generation().await;
                sink.push(frame, direction)?;
                if cut_off {
                    sink.push_downstream(Frame::LlmResponseEnd)?;
                }
                Ok(())
            }
            other => sink.push(other, direction),
        }
    }

    async fn stop(&mut self, _sink: &FrameSink) -> Result<()> {
        if let Some(generation) = self.generation.take() {
            let _ = generation.task.await;
        }
        Ok(())
    }

    async fn cancel(&mut self) {
        self.abort_generation().await;
    }
}

impl Drop for OpenAiLlmService {
    fn drop(&mut self) {
        if let Some(generation) = &self.generation {
            generation.task.abort();
        }
    }
}

async fn generate(
    client: OpenAiClient,
    context: LlmContext,
    sink: FrameSink,
    mut metrics: ServiceMetrics,
    responding: Arc<AtomicBool>,
) {
    if sink.push_downstream(Frame::LlmResponseStart).is_err() {
        return;
    }
    responding.store(true, Ordering::SeqCst);
    metrics.start();

    let result = client
        .stream_chat(&context.messages, |event| match event {
            StreamEvent::Text(text) => {
                if let Some(frame) = metrics.first_byte() {
                    sink.push_downstream(frame)?;
                }
                sink.push_downstream(Frame::LlmText(text))
            }
            StreamEvent::Usage {
                prompt_tokens,
                completion_tokens,
            } => {
                tracing::debug!(prompt_tokens, completion_tokens, "token usage");
                if let Some(frame) = metrics.usage(MetricsKind::LlmUsage {
                    prompt_tokens,
                    completion_tokens,
                }) {
                    sink.push_downstream(frame)?;
                }
                Ok(())
            }
        })
        .await;

    match result {
        Ok(()) => {}
        Err(Error::PipelineClosed) => {
            responding.store(false, Ordering::SeqCst);
            return;
        }
        Err(e) => sink.push_error(format!("OpenAI LLM error: {e}"), false),
    }

    if let Some(frame) = metrics.finish() {
        let _ = sink.push_downstream(frame);
    }
    let _ = sink.push_downstream(Frame::LlmResponseEnd);
    responding.store(false, Ordering::SeqCst);
}
