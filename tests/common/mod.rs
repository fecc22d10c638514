//! Shared test utilities: in-process mock services and a frame collector
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::{
        Multipart, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use hearsay::audio::pcm16_to_wav;
use hearsay::frames::{Frame, FrameDirection};
use hearsay::pipeline::{FrameProcessor, FrameSink};
use hearsay::{Config, Result};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;

/// Serve `router` on an ephemeral local port
pub async fn spawn_router(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().expect("listener has no address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

/// Stream `pieces` as a response body, sleeping `delay` before each one
fn delayed_body(pieces: Vec<Vec<u8>>, delay: Duration) -> Body {
    let stream = futures::stream::iter(pieces).then(move |piece| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, std::convert::Infallible>(piece)
    });
    Body::from_stream(stream)
}

/// Poll `condition` until it holds, panicking after `timeout`
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// -- Vosk ----------------------------------------------------------------------

/// Mock Vosk server
///
/// Answers every audio message with a partial result, sends `final_text` as
/// a final result once `final_after` bytes have arrived, and answers
/// `{"eof": 1}` with whatever final result is still pending before closing.
#[derive(Clone)]
pub struct MockVosk {
    pub final_text: String,
    pub final_after: usize,
    pub audio_bytes: Arc<AtomicUsize>,
    pub configs: Arc<Mutex<Vec<Value>>>,
}

impl MockVosk {
    pub fn new(final_text: &str, final_after: usize) -> Self {
        Self {
            final_text: final_text.to_string(),
            final_after,
            audio_bytes: Arc::new(AtomicUsize::new(0)),
            configs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn spawn(&self) -> String {
        let router = Router::new()
            .route("/", get(vosk_upgrade))
            .with_state(self.clone());
        format!("ws://{}", spawn_router(router).await)
    }

    pub fn received(&self) -> usize {
        self.audio_bytes.load(Ordering::SeqCst)
    }
}

async fn vosk_upgrade(State(mock): State<MockVosk>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| vosk_session(socket, mock))
}

async fn vosk_session(mut socket: WebSocket, mock: MockVosk) {
    let mut received = 0usize;
    let mut final_sent = false;

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            WsMessage::Text(text) => {
                let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                if value.get("eof").is_some() {
                    let text = if final_sent { "" } else { mock.final_text.as_str() };
                    let reply = json!({ "text": text }).to_string();
                    let _ = socket.send(WsMessage::Text(reply.into())).await;
                    let _ = socket.send(WsMessage::Close(None)).await;
                    break;
                }
                mock.configs.lock().unwrap().push(value);
            }
            WsMessage::Binary(audio) => {
                received += audio.len();
                mock.audio_bytes.fetch_add(audio.len(), Ordering::SeqCst);

                let reply = if !final_sent && received >= mock.final_after {
                    final_sent = true;
                    json!({ "result": [], "text": mock.final_text })
                } else {
                    json!({ "partial": "hel" })
                };
                if socket
                    .send(WsMessage::Text(reply.to_string().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
}

// -- OpenAI-compatible LLM --------------------------------------------------------

/// Mock chat completions endpoint streaming fixed deltas
#[derive(Clone)]
pub struct MockLlm {
    pub chunks: Vec<String>,
    /// Pause before each streamed event
    pub delay: Duration,
    pub fail_status: Option<StatusCode>,
    pub requests: Arc<Mutex<Vec<Value>>>,
}

impl MockLlm {
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| (*c).to_string()).collect(),
            delay: Duration::ZERO,
            fail_status: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(status: StatusCode) -> Self {
        Self {
            fail_status: Some(status),
            ..Self::new(&[])
        }
    }

    /// Spawn the server and return its base URL (with `/v1`)
    pub async fn spawn(&self) -> String {
        let router = Router::new()
            .route("/v1/chat/completions", post(chat_completions))
            .with_state(self.clone());
        format!("http://{}/v1", spawn_router(router).await)
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

async fn chat_completions(State(mock): State<MockLlm>, Json(body): Json<Value>) -> Response {
    mock.requests.lock().unwrap().push(body);

    if let Some(status) = mock.fail_status {
        return (status, "model not loaded").into_response();
    }

    let mut events: Vec<Vec<u8>> = mock
        .chunks
        .iter()
        .map(|chunk| {
            let data = json!({ "choices": [{ "index": 0, "delta": { "content": chunk } }] });
            format!("data: {data}\n\n").into_bytes()
        })
        .collect();
    let usage = json!({ "choices": [], "usage": { "prompt_tokens": 12, "completion_tokens": 5 } });
    events.push(format!("data: {usage}\n\n").into_bytes());
    events.push(b"data: [DONE]\n\n".to_vec());

    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        delayed_body(events, mock.delay),
    )
        .into_response()
}

// -- Pocket TTS -------------------------------------------------------------------

/// Mock Pocket TTS server answering with a WAV of silence
#[derive(Clone)]
pub struct MockTts {
    pub pcm_bytes: usize,
    pub sample_rate: u32,
    /// Pause before each 4800 byte piece of the response
    pub delay: Duration,
    pub fail_status: Option<StatusCode>,
    pub texts: Arc<Mutex<Vec<String>>>,
    pub voices: Arc<Mutex<Vec<String>>>,
}

impl MockTts {
    pub fn new(pcm_bytes: usize) -> Self {
        Self {
            pcm_bytes,
            sample_rate: 24_000,
            delay: Duration::ZERO,
            fail_status: None,
            texts: Arc::new(Mutex::new(Vec::new())),
            voices: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(status: StatusCode) -> Self {
        Self {
            fail_status: Some(status),
            ..Self::new(0)
        }
    }

    pub async fn spawn(&self) -> String {
        let router = Router::new()
            .route("/tts", post(synthesize))
            .with_state(self.clone());
        format!("http://{}", spawn_router(router).await)
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

async fn synthesize(State(mock): State<MockTts>, mut multipart: Multipart) -> Response {
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().map(str::to_string);
        let value = field.text().await.unwrap_or_default();
        match name.as_deref() {
            Some("text") => mock.texts.lock().unwrap().push(value),
            Some("voice_url") => mock.voices.lock().unwrap().push(value),
            _ => {}
        }
    }

    if let Some(status) = mock.fail_status {
        return (status, "synthesis failed").into_response();
    }

    let wav = pcm16_to_wav(&vec![0u8; mock.pcm_bytes], mock.sample_rate, 1)
        .expect("failed to build wav");
    let pieces = wav.chunks(4800).map(<[u8]>::to_vec).collect();
    (
        [(header::CONTENT_TYPE, "audio/wav")],
        delayed_body(pieces, mock.delay),
    )
        .into_response()
}

// -- Pipeline helpers ---------------------------------------------------------------

/// Records every frame it sees and passes it on
#[derive(Clone, Default)]
pub struct Collector {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    /// Frame names, skipping metrics
    pub fn names(&self) -> Vec<&'static str> {
        self.frames()
            .iter()
            .filter(|f| !matches!(f, Frame::Metrics(_)))
            .map(Frame::name)
            .collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::LlmText(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn boxed(&self) -> Box<dyn FrameProcessor> {
        Box::new(self.clone())
    }
}

#[async_trait]
impl FrameProcessor for Collector {
    fn name(&self) -> &str {
        "collector"
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        sink: &FrameSink,
    ) -> Result<()> {
        self.frames.lock().unwrap().push(frame.clone());
        sink.push(frame, direction)
    }
}

/// Configuration pointing at mock services, without a greeting
pub fn test_config(stt_uri: &str, llm_url: &str, tts_url: &str) -> Config {
    let mut config = Config::default();
    config.stt.uri = stt_uri.to_string();
    config.llm.base_url = llm_url.to_string();
    config.tts.base_url = tts_url.to_string();
    config.llm.greeting = None;
    config.server.port = 0;
    config
}
