//! Kyutai Pocket TTS over HTTP
//!
//! `POST {base_url}/tts` with a multipart form (`text`, optional
//! `voice_url`) returns a WAV file, streamed. The header is stripped and the
//! PCM is pushed downstream in fixed-size chunks as it arrives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::metrics::ServiceMetrics;
use super::wav::WavStreamDecoder;
use crate::frames::{AudioRaw, Frame, FrameDirection, MetricsKind, StartParams};
use crate::pipeline::{FrameProcessor, FrameSink};
use crate::processors::SentenceAggregator;
use crate::{Error, Result};

/// Default Pocket TTS server address
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Pocket TTS settings
#[derive(Debug, Clone)]
pub struct PocketTtsParams {
    pub base_url: String,
    /// Voice prompt passed as `voice_url` (a built-in voice name or audio URL)
    pub voice: Option<String>,
    /// Assumed when the response is raw PCM without a header
    pub sample_rate: u32,
    /// Bytes per output audio frame
    pub chunk_size: usize,
}

impl Default for PocketTtsParams {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            voice: None,
            sample_rate: 24_000,
            // 100ms of 24kHz mono s16le
            chunk_size: 4800,
        }
    }
}

/// Splits a PCM stream into sample-aligned chunks
struct Chunker {
    buffer: Vec<u8>,
    chunk_size: usize,
}

impl Chunker {
    fn new(chunk_size: usize, channels: u16) -> Self {
        let frame = 2 * usize::from(channels.max(1));
        let chunk_size = (chunk_size / frame).max(1) * frame;
        Self {
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
        }
    }

    fn push(&mut self, pcm: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(pcm);
        let mut chunks = Vec::new();
        while self.buffer.len() >= self.chunk_size {
            let rest = self.buffer.split_off(self.chunk_size);
            chunks.push(std::mem::replace(&mut self.buffer, rest));
        }
        chunks
    }

    fn finish(&mut self) -> Option<Vec<u8>> {
        (!self.buffer.is_empty()).then(|| std::mem::take(&mut self.buffer))
    }
}

/// HTTP client for a Pocket TTS server
#[derive(Debug, Clone)]
pub struct PocketTtsClient {
    http: reqwest::Client,
    params: PocketTtsParams,
}

impl PocketTtsClient {
    #[must_use]
    pub fn new(params: PocketTtsParams) -> Self {
        Self {
            http: reqwest::Client::new(),
            params,
        }
    }

    #[must_use]
    pub const fn params(&self) -> &PocketTtsParams {
        &self.params
    }

    fn endpoint(&self) -> String {
        format!("{}/tts", self.params.base_url.trim_end_matches('/'))
    }

    /// Start a synthesis request
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tts`] with `"Pocket TTS error: {status}"` for non-200
    /// responses, or the transport error if the request fails
    pub async fn request(&self, text: &str) -> Result<reqwest::Response> {
        tracing::debug!(text, "generating speech with Pocket TTS");

        let mut form = reqwest::multipart::Form::new().text("text", text.to_string());
        if let Some(voice) = &self.params.voice {
            form = form.text("voice_url", voice.clone());
        }

        let response = self.http.post(self.endpoint()).multipart(form).send().await?;

        if response.status() != reqwest::StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, body = %body, "Pocket TTS request failed");
            return Err(Error::Tts(format!("Pocket TTS error: {}", status.as_u16())));
        }
        Ok(response)
    }

    /// Stream the audio of an accepted request as chunked frames
    ///
    /// # Errors
    ///
    /// Returns error if reading the body or decoding the WAV fails, or if
    /// `on_audio` fails
    pub async fn stream_audio<F>(&self, response: reqwest::Response, mut on_audio: F) -> Result<()>
    where
        F: FnMut(AudioRaw) -> Result<()> + Send,
    {
        let mut decoder = WavStreamDecoder::new();
        let mut chunker: Option<Chunker> = None;
        let mut stream = response.bytes_stream();

        while let Some(bytes) = stream.next().await {
            let pcm = decoder.push(&bytes?)?;
            if pcm.is_empty() {
                continue;
            }
            let (sample_rate, channels) = self.output_format(&decoder);
            let chunker =
                chunker.get_or_insert_with(|| Chunker::new(self.params.chunk_size, channels));
            for chunk in chunker.push(&pcm) {
                on_audio(AudioRaw::new(chunk, sample_rate, channels))?;
            }
        }

        if let Some(rest) = chunker.as_mut().and_then(Chunker::finish) {
            let (sample_rate, channels) = self.output_format(&decoder);
            on_audio(AudioRaw::new(rest, sample_rate, channels))?;
        }
        Ok(())
    }

    /// Synthesize `text` into a single buffer
    ///
    /// # Errors
    ///
    /// Returns error if the request or decoding fails
    pub async fn synthesize(&self, text: &str) -> Result<AudioRaw> {
        let response = self.request(text).await?;
        let mut pcm = Vec::new();
        let mut format = (self.params.sample_rate, 1);
        self.stream_audio(response, |audio| {
            format = (audio.sample_rate, audio.num_channels);
            pcm.extend_from_slice(&audio.audio);
            Ok(())
        })
        .await?;
        Ok(AudioRaw::new(pcm, format.0, format.1))
    }

    fn output_format(&self, decoder: &WavStreamDecoder) -> (u32, u16) {
        decoder
            .format()
            .map_or((self.params.sample_rate, 1), |f| (f.sample_rate, f.channels))
    }
}

struct Worker {
    sentences: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
    /// Set between `TtsStarted` and `TtsStopped`
    in_flight: Arc<AtomicBool>,
}

/// Speaks model output sentence by sentence
///
/// Streamed `LlmText` is split into sentences, which a worker task
/// synthesizes strictly in order. Text frames keep travelling downstream so
/// the assistant side can record them.
pub struct PocketTtsService {
    client: PocketTtsClient,
    aggregator: SentenceAggregator,
    metrics: ServiceMetrics,
    worker: Option<Worker>,
    /// Kept from start so a cancelled sentence can still be closed
    sink: Option<FrameSink>,
}

impl PocketTtsService {
    #[must_use]
    pub fn new(params: PocketTtsParams) -> Self {
        Self {
            client: PocketTtsClient::new(params),
            aggregator: SentenceAggregator::new(),
            metrics: ServiceMetrics::new("pocket-tts"),
            worker: None,
            sink: None,
        }
    }

    #[must_use]
    pub const fn client(&self) -> &PocketTtsClient {
        &self.client
    }

    fn speak(&mut self, text: String, sink: &FrameSink) {
        if self.worker.as_ref().is_none_or(|w| w.task.is_finished()) {
            let (tx, rx) = mpsc::unbounded_channel();
            let in_flight = Arc::new(AtomicBool::new(false));
            let task = tokio::spawn(synthesis_loop(
                rx,
                self.client.clone(),
                sink.clone(),
                self.metrics.clone(),
                Arc::clone(&in_flight),
            ));
            self.worker = Some(Worker {
                sentences: tx,
                task,
                in_flight,
            });
        }
        if let Some(worker) = &self.worker {
            if worker.sentences.send(text).is_err() {
                tracing::warn!("synthesis worker gone, dropping sentence");
            }
        }
    }

    /// Abort the worker and wait for its task to finish
    ///
    /// Returns true when a sentence was cut off after `TtsStarted`.
    async fn abort_worker(&mut self) -> bool {
        let Some(Worker {
            task, in_flight, ..
        }) = self.worker.take()
        else {
            return false;
        };
        task.abort();
        if let Some(e) = task.await.err().filter(|e| !e.is_cancelled()) {
            tracing::warn!(error = %e, "synthesis task failed");
        }
        in_flight.swap(false, Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameProcessor for PocketTtsService {
    fn name(&self) -> &'static str {
        "pocket-tts"
    }

    async fn start(&mut self, params: &StartParams, sink: &FrameSink) -> Result<()> {
        self.metrics.configure(params);
        self.sink = Some(sink.clone());
        Ok(())
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        sink: &FrameSink,
    ) -> Result<()> {
        match frame {
            Frame::LlmResponseStart => {
                self.aggregator.clear();
                sink.push(frame, direction)
            }
            Frame::LlmText(text) => {
                for sentence in self.aggregator.push(&text) {
                    self.speak(sentence, sink);
                }
                sink.push(Frame::LlmText(text), direction)
            }
            Frame::LlmResponseEnd => {
                if let Some(rest) = self.aggregator.flush() {
                    self.speak(rest, sink);
                }
                sink.push(frame, direction)
            }
            Frame::TtsSpeak(text) => {
                if !text.trim().is_empty() {
                    self.speak(text, sink);
                }
                Ok(())
            }
            Frame::Interruption => {
                self.aggregator.clear();
                let cut_off = self.abort_worker().await;
                sink.push(frame, direction)?;
                if cut_off {
                    sink.push_downstream(Frame::TtsStopped)?;
                }
                Ok(())
            }
            other => sink.push(other, direction),
        }
    }

    async fn stop(&mut self, sink: &FrameSink) -> Result<()> {
        if let Some(rest) = self.aggregator.flush() {
            self.speak(rest, sink);
        }
        if let Some(Worker {
            sentences, task, ..
        }) = self.worker.take()
        {
            // Closing the queue lets the worker finish what is already queued
            drop(sentences);
            let _ = task.await;
        }
        Ok(())
    }

    async fn cancel(&mut self) {
        self.aggregator.clear();
        let cut_off = self.abort_worker().await;
        if let Some(sink) = self.sink.take().filter(|_| cut_off) {
            let _ = sink.push_downstream(Frame::TtsStopped);
        }
    }
}

impl Drop for PocketTtsService {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.task.abort();
        }
    }
}

async fn synthesis_loop(
    mut sentences: mpsc::UnboundedReceiver<String>,
    client: PocketTtsClient,
    sink: FrameSink,
    mut metrics: ServiceMetrics,
    in_flight: Arc<AtomicBool>,
) {
    while let Some(text) = sentences.recv().await {
        if matches!(
            synthesize(&client, &text, &sink, &mut metrics, &in_flight).await,
            Err(Error::PipelineClosed)
        ) {
            break;
        }
    }
}

/// Speak one sentence; `TtsStopped` is pushed even when synthesis fails
async fn synthesize(
    client: &PocketTtsClient,
    text: &str,
    sink: &FrameSink,
    metrics: &mut ServiceMetrics,
    in_flight: &AtomicBool,
) -> Result<()> {
    metrics.start();

    let result = async {
        let response = client.request(text).await?;

        if let Some(frame) = metrics.usage(MetricsKind::TtsUsage {
            characters: text.chars().count(),
        }) {
            sink.push_downstream(frame)?;
        }
        sink.push_downstream(Frame::TtsStarted)?;
        in_flight.store(true, Ordering::SeqCst);

        client
            .stream_audio(response, |audio| {
                if let Some(frame) = metrics.first_byte() {
                    sink.push_downstream(frame)?;
                }
                sink.push_downstream(Frame::OutputAudio(audio))
            })
            .await
    }
    .await;

    match &result {
        Ok(()) | Err(Error::PipelineClosed) => {}
        Err(Error::Tts(message)) => sink.push_error(message.clone(), false),
        Err(e) => sink.push_error(format!("Pocket TTS exception: {e}"), false),
    }

    if let Some(frame) = metrics.finish() {
        let _ = sink.push_downstream(frame);
    }
    metrics.reset();
    in_flight.store(false, Ordering::SeqCst);
    sink.push_downstream(Frame::TtsStopped)?;
    result.or_else(|e| match e {
        Error::PipelineClosed => Err(e),
        _ => Ok(()),
    })
}
