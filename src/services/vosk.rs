//! Vosk speech recognition over a WebSocket
//!
//! Protocol: the client sends `{"config": {"sample_rate": N}}`, then raw
//! s16le audio as binary messages and finally `{"eof": 1}`. The server
//! answers every chunk with `{"partial": "..."}` or, at the end of an
//! utterance, `{"text": "...", "result": [...]}`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::metrics::ServiceMetrics;
use super::retry::RetryPolicy;
use crate::frames::{Bytes, Frame, FrameDirection, StartParams, Transcription};
use crate::pipeline::{FrameProcessor, FrameSink};
use crate::{Error, Result};

/// Default Vosk server address
pub const DEFAULT_URI: &str = "ws://localhost:2700";

/// How long to wait before reconnecting after the retries ran out
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// A recognition result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoskResult {
    /// End of an utterance
    Final(String),
    /// Hypothesis for the utterance in progress
    Partial(String),
}

#[derive(Debug, Deserialize)]
struct VoskMessage {
    text: Option<String>,
    partial: Option<String>,
}

/// Parse a server message; empty results yield `None`
///
/// # Errors
///
/// Returns error if the message is not valid JSON
pub fn parse_result(message: &str) -> Result<Option<VoskResult>> {
    let message: VoskMessage = serde_json::from_str(message)?;

    let result = match (message.text, message.partial) {
        (Some(text), _) => Some(VoskResult::Final(text)),
        (None, Some(partial)) => Some(VoskResult::Partial(partial)),
        (None, None) => None,
    };

    Ok(result.filter(|r| match r {
        VoskResult::Final(text) | VoskResult::Partial(text) => !text.is_empty(),
    }))
}

/// A single recognition session with a Vosk server
pub struct VoskConnection {
    stream: WsStream,
}

impl VoskConnection {
    /// Connect and send the audio configuration
    ///
    /// # Errors
    ///
    /// Returns error if the connection or the configuration message fails
    pub async fn connect(uri: &str, sample_rate: u32) -> Result<Self> {
        tracing::debug!(uri, sample_rate, "connecting to Vosk");
        let (mut stream, _) = tokio_tungstenite::connect_async(uri).await?;

        let config = serde_json::json!({ "config": { "sample_rate": sample_rate } });
        stream.send(Message::text(config.to_string())).await?;

        tracing::info!(uri, "connected to Vosk");
        Ok(Self { stream })
    }

    /// Send one chunk of s16le audio
    ///
    /// # Errors
    ///
    /// Returns error if the socket is closed
    pub async fn send_audio(&mut self, pcm: Bytes) -> Result<()> {
        self.stream.send(Message::Binary(pcm)).await?;
        Ok(())
    }

    /// Tell the server the stream is over; it answers with the final result
    ///
    /// # Errors
    ///
    /// Returns error if the socket is closed
    pub async fn send_eof(&mut self) -> Result<()> {
        self.stream.send(Message::text(EOF_MESSAGE)).await?;
        Ok(())
    }

    /// Next non-empty result, or `None` once the server closes
    ///
    /// # Errors
    ///
    /// Returns error if reading from the socket fails
    pub async fn next_result(&mut self) -> Result<Option<VoskResult>> {
        while let Some(message) = self.stream.next().await {
            match message? {
                Message::Text(text) => match parse_result(text.as_str()) {
                    Ok(Some(result)) => return Ok(Some(result)),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "skipping unparseable Vosk message"),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    fn split(self) -> (WsWriter, WsReader) {
        self.stream.split()
    }
}

const EOF_MESSAGE: &str = r#"{"eof": 1}"#;

/// Vosk STT service settings
#[derive(Debug, Clone)]
pub struct VoskSttParams {
    pub uri: String,
    pub sample_rate: u32,
    pub language: String,
    /// Stamped on every transcription
    pub user_id: String,
    /// Forward input audio downstream after sending it
    pub audio_passthrough: bool,
    pub retry: RetryPolicy,
    /// How long to wait for the final result at end of stream
    pub final_timeout: Duration,
}

impl Default for VoskSttParams {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            sample_rate: 16_000,
            language: "en".to_string(),
            user_id: String::new(),
            audio_passthrough: true,
            retry: RetryPolicy::default(),
            final_timeout: Duration::from_secs(2),
        }
    }
}

struct Connection {
    writer: WsWriter,
    reader: JoinHandle<()>,
}

/// Streams user audio to Vosk and pushes transcriptions downstream
pub struct VoskSttService {
    params: VoskSttParams,
    connection: Option<Connection>,
    reconnect_at: Option<Instant>,
    metrics: Arc<Mutex<ServiceMetrics>>,
}

impl VoskSttService {
    #[must_use]
    pub fn new(params: VoskSttParams) -> Self {
        Self {
            params,
            connection: None,
            reconnect_at: None,
            metrics: Arc::new(Mutex::new(ServiceMetrics::new("vosk-stt"))),
        }
    }

    #[must_use]
    pub const fn params(&self) -> &VoskSttParams {
        &self.params
    }

    async fn connect(&mut self, sink: &FrameSink) -> Result<()> {
        let uri = self.params.uri.clone();
        let sample_rate = self.params.sample_rate;
        let connection = self
            .params
            .retry
            .retry("vosk connect", || VoskConnection::connect(&uri, sample_rate))
            .await?;

        let (writer, reader) = connection.split();
        let reader = tokio::spawn(receive_loop(
            reader,
            sink.clone(),
            self.params.user_id.clone(),
            self.params.language.clone(),
            Arc::clone(&self.metrics),
        ));
        self.connection = Some(Connection { writer, reader });
        self.reconnect_at = None;
        Ok(())
    }

    async fn ensure_connected(&mut self, sink: &FrameSink) -> bool {
        if self.connection.is_some() {
            return true;
        }
        if self.reconnect_at.is_some_and(|at| Instant::now() < at) {
            return false;
        }
        if let Err(e) = self.connect(sink).await {
            self.reconnect_at = Some(Instant::now() + RECONNECT_COOLDOWN);
            sink.push_error(format!("Vosk STT error: {e}"), false);
            return false;
        }
        true
    }

    async fn send_audio(&mut self, pcm: Bytes, sink: &FrameSink) {
        if !self.ensure_connected(sink).await {
            return;
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if let Err(e) = connection.writer.send(Message::Binary(pcm)).await {
            sink.push_error(format!("Vosk STT error: {e}"), false);
            self.disconnect();
        }
    }

    fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.reader.abort();
            tracing::debug!("disconnected from Vosk");
        }
    }
}

#[async_trait]
impl FrameProcessor for VoskSttService {
    fn name(&self) -> &'static str {
        "vosk-stt"
    }

    async fn start(&mut self, params: &StartParams, sink: &FrameSink) -> Result<()> {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.configure(params);
        }
        if let Err(e) = self.connect(sink).await {
            self.reconnect_at = Some(Instant::now() + RECONNECT_COOLDOWN);
            return Err(Error::Stt(format!("Vosk STT error: {e}")));
        }
        Ok(())
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        sink: &FrameSink,
    ) -> Result<()> {
        match frame {
            Frame::InputAudio(audio) => {
                self.send_audio(audio.audio.clone(), sink).await;
                if self.params.audio_passthrough {
                    sink.push(Frame::InputAudio(audio), direction)?;
                }
                Ok(())
            }
            Frame::UserStoppedSpeaking => {
                if let Ok(mut metrics) = self.metrics.lock() {
                    metrics.start();
                }
                sink.push(frame, direction)
            }
            other => sink.push(other, direction),
        }
    }

    async fn stop(&mut self, _sink: &FrameSink) -> Result<()> {
        let Some(mut connection) = self.connection.take() else {
            return Ok(());
        };

        if connection.writer.send(Message::text(EOF_MESSAGE)).await.is_ok() {
            // The receive task exits once the server sends the final result and closes
            if tokio::time::timeout(self.params.final_timeout, &mut connection.reader)
                .await
                .is_err()
            {
                tracing::debug!("timed out waiting for final Vosk result");
            }
        }

        let _ = connection.writer.close().await;
        connection.reader.abort();
        Ok(())
    }

    async fn cancel(&mut self) {
        self.disconnect();
    }
}

impl Drop for VoskSttService {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn receive_loop(
    mut reader: WsReader,
    sink: FrameSink,
    user_id: String,
    language: String,
    metrics: Arc<Mutex<ServiceMetrics>>,
) {
    while let Some(message) = reader.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                sink.push_error(format!("Vosk STT error: {e}"), false);
                break;
            }
        };

        let result = match parse_result(text.as_str()) {
            Ok(Some(result)) => result,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparseable Vosk message");
                continue;
            }
        };

        let frame = match result {
            VoskResult::Final(text) => {
                tracing::debug!(text = %text, "final transcription");
                if let Ok(mut metrics) = metrics.lock() {
                    for frame in [metrics.first_byte(), metrics.finish()].into_iter().flatten() {
                        let _ = sink.push_downstream(frame);
                    }
                }
                Frame::Transcription(Transcription::now(text, &user_id, &language))
            }
            VoskResult::Partial(text) => {
                tracing::trace!(text = %text, "interim transcription");
                Frame::InterimTranscription(Transcription::now(text, &user_id, &language))
            }
        };

        if sink.push_downstream(frame).is_err() {
            break;
        }
    }
    tracing::debug!("Vosk receive loop finished");
}
