//! Transport output: paced audio playback and bot speaking events

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::frames::{AudioRaw, Frame, FrameDirection, StartParams};
use crate::pipeline::{FrameProcessor, FrameSink};
use crate::Result;

/// Silence after the last chunk before the bot counts as done speaking,
/// when no `TtsStopped` marks the end of the utterance
const BOT_STOP_DELAY: Duration = Duration::from_millis(350);

/// How far ahead of real time audio is handed to the sink
const PLAYBACK_LEAD: Duration = Duration::from_millis(100);

/// Destination for bot audio (a client socket, a speaker)
#[async_trait]
pub trait AudioSink: Send + Sync + 'static {
    /// Write one chunk of audio
    async fn write(&self, audio: &AudioRaw) -> Result<()>;

    /// Drop audio buffered but not yet played
    async fn clear(&self) {}

    /// Write out audio the sink holds back between chunks
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Sink that forwards audio into a channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AudioRaw>,
}

impl ChannelSink {
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<AudioRaw>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl AudioSink for ChannelSink {
    async fn write(&self, audio: &AudioRaw) -> Result<()> {
        self.tx
            .send(audio.clone())
            .map_err(|_| crate::Error::Transport("audio channel closed".to_string()))
    }
}

enum Command {
    Audio(AudioRaw),
    /// The utterance is complete once the queued audio has played
    UtteranceEnd,
    /// Reply once everything queued before it has played
    Drain(oneshot::Sender<()>),
}

struct Writer {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Last processor before the bot-side reporters
///
/// `OutputAudio` is written to the sink at playback speed by a writer task,
/// so an interruption only has to drop what has not been written yet.
pub struct AudioOutput {
    sink: Arc<dyn AudioSink>,
    writer: Option<Writer>,
    speaking: Arc<AtomicBool>,
}

impl AudioOutput {
    #[must_use]
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self {
            sink,
            writer: None,
            speaking: Arc::new(AtomicBool::new(false)),
        }
    }

    fn spawn_writer(&mut self, frames: &FrameSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(
            rx,
            Arc::clone(&self.sink),
            frames.clone(),
            Arc::clone(&self.speaking),
        ));
        self.writer = Some(Writer { commands: tx, task });
    }

    fn stop_writer(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.task.abort();
        }
    }

    fn enqueue(&mut self, command: Command, sink: &FrameSink) {
        if self.writer.is_none() {
            self.spawn_writer(sink);
        }
        if let Some(writer) = &self.writer {
            if writer.commands.send(command).is_err() {
                tracing::warn!("audio writer gone, dropping command");
            }
        }
    }

    async fn interrupt(&mut self, sink: &FrameSink) -> Result<()> {
        self.stop_writer();
        self.sink.clear().await;
        if self.speaking.swap(false, Ordering::SeqCst) {
            sink.push_downstream(Frame::BotStoppedSpeaking)?;
        }
        self.spawn_writer(sink);
        Ok(())
    }
}

#[async_trait]
impl FrameProcessor for AudioOutput {
    fn name(&self) -> &'static str {
        "audio-output"
    }

    async fn start(&mut self, _params: &StartParams, sink: &FrameSink) -> Result<()> {
        self.spawn_writer(sink);
        Ok(())
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        sink: &FrameSink,
    ) -> Result<()> {
        match frame {
            Frame::OutputAudio(audio) if direction == FrameDirection::Downstream => {
                self.enqueue(Command::Audio(audio), sink);
                Ok(())
            }
            Frame::TtsStopped if direction == FrameDirection::Downstream => {
                self.enqueue(Command::UtteranceEnd, sink);
                sink.push(frame, direction)
            }
            Frame::Interruption => {
                self.interrupt(sink).await?;
                sink.push(frame, direction)
            }
            other => sink.push(other, direction),
        }
    }

    async fn stop(&mut self, _sink: &FrameSink) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let (done_tx, done_rx) = oneshot::channel();
        if writer.commands.send(Command::Drain(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        writer.task.abort();
        Ok(())
    }

    async fn cancel(&mut self) {
        self.stop_writer();
        self.sink.clear().await;
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop_writer();
    }
}

async fn write_loop(
    mut commands: mpsc::UnboundedReceiver<Command>,
    sink: Arc<dyn AudioSink>,
    frames: FrameSink,
    speaking: Arc<AtomicBool>,
) {
    let mut clock = Instant::now();
    let mut utterance_done = false;

    loop {
        let command = if speaking.load(Ordering::SeqCst) {
            let mut idle = clock.saturating_duration_since(Instant::now());
            if !utterance_done {
                idle += BOT_STOP_DELAY;
            }
            if let Ok(command) = tokio::time::timeout(idle, commands.recv()).await {
                command
            } else {
                utterance_done = false;
                set_stopped(&speaking, &frames);
                continue;
            }
        } else {
            commands.recv().await
        };

        let Some(command) = command else {
            break;
        };

        match command {
            Command::Audio(audio) => {
                utterance_done = false;
                if !speaking.swap(true, Ordering::SeqCst) {
                    tracing::debug!("bot started speaking");
                    let _ = frames.push_downstream(Frame::BotStartedSpeaking);
                }
                if let Err(e) = sink.write(&audio).await {
                    frames.push_error(format!("audio output failed: {e}"), false);
                }
                clock = clock.max(Instant::now()) + audio.duration();
                if let Some(wake) = clock.checked_sub(PLAYBACK_LEAD) {
                    tokio::time::sleep_until(wake).await;
                }
            }
            Command::UtteranceEnd => {
                flush(sink.as_ref(), &frames).await;
                utterance_done = true;
            }
            Command::Drain(done) => {
                flush(sink.as_ref(), &frames).await;
                tokio::time::sleep_until(clock).await;
                set_stopped(&speaking, &frames);
                let _ = done.send(());
            }
        }
    }
}

async fn flush(sink: &dyn AudioSink, frames: &FrameSink) {
    if let Err(e) = sink.flush().await {
        frames.push_error(format!("audio output failed: {e}"), false);
    }
}

fn set_stopped(speaking: &AtomicBool, frames: &FrameSink) {
    if speaking.swap(false, Ordering::SeqCst) {
        tracing::debug!("bot stopped speaking");
        let _ = frames.push_downstream(Frame::BotStoppedSpeaking);
    }
}
