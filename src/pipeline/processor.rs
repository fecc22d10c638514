//! Frame processors and the plumbing that connects them

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::observer::{FramePushed, Observer};
use crate::frames::{Frame, FrameDirection, StartParams};
use crate::{Error, Result};

/// A stage of the pipeline
///
/// The runtime owns the lifecycle frames: `Start`, `End` and `Cancel` are
/// turned into calls to [`start`](Self::start), [`stop`](Self::stop) and
/// [`cancel`](Self::cancel) and forwarded automatically afterwards. Every
/// other frame is handed to [`process_frame`](Self::process_frame), which
/// must push it on if it should keep travelling.
#[async_trait]
pub trait FrameProcessor: Send {
    /// Name used in logs, metrics and observer callbacks
    fn name(&self) -> &str;

    /// Called when the start frame arrives, before it is forwarded
    async fn start(&mut self, _params: &StartParams, _sink: &FrameSink) -> Result<()> {
        Ok(())
    }

    /// Handle a single frame
    async fn process_frame(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        sink: &FrameSink,
    ) -> Result<()>;

    /// Flush pending work; called before the end frame is forwarded
    async fn stop(&mut self, _sink: &FrameSink) -> Result<()> {
        Ok(())
    }

    /// Drop pending work; called before the cancel frame is forwarded
    async fn cancel(&mut self) {}
}

type Envelope = (Frame, FrameDirection);

/// Sending half of a processor mailbox
#[derive(Clone)]
pub(crate) struct Port {
    system: mpsc::UnboundedSender<Envelope>,
    data: mpsc::UnboundedSender<Envelope>,
}

impl Port {
    pub(crate) fn send(&self, frame: Frame, direction: FrameDirection) -> Result<()> {
        let channel = if frame.is_system() {
            &self.system
        } else {
            &self.data
        };
        channel
            .send((frame, direction))
            .map_err(|_| Error::PipelineClosed)
    }
}

/// Receiving half of a processor mailbox
///
/// System frames are always delivered before queued data frames.
pub(crate) struct Mailbox {
    system: mpsc::UnboundedReceiver<Envelope>,
    data: mpsc::UnboundedReceiver<Envelope>,
    /// Data frames that survived an interruption, in arrival order
    retained: VecDeque<Envelope>,
}

/// Create a connected port/mailbox pair
pub(crate) fn mailbox() -> (Port, Mailbox) {
    let (system_tx, system_rx) = mpsc::unbounded_channel();
    let (data_tx, data_rx) = mpsc::unbounded_channel();
    (
        Port {
            system: system_tx,
            data: data_tx,
        },
        Mailbox {
            system: system_rx,
            data: data_rx,
            retained: VecDeque::new(),
        },
    )
}

impl Mailbox {
    /// Receive the next frame; `None` once every sender is gone
    pub(crate) async fn recv(&mut self) -> Option<Envelope> {
        if let Ok(envelope) = self.system.try_recv() {
            return Some(envelope);
        }
        if let Some(envelope) = self.retained.pop_front() {
            return Some(envelope);
        }

        tokio::select! {
            biased;
            Some(envelope) = self.system.recv() => Some(envelope),
            Some(envelope) = self.data.recv() => Some(envelope),
            else => None,
        }
    }

    /// Drop queued interruptible data frames, keeping the rest in order
    pub(crate) fn discard_interruptible(&mut self) -> usize {
        let mut dropped = 0;
        let mut kept: VecDeque<Envelope> = std::mem::take(&mut self.retained)
            .into_iter()
            .filter(|(frame, _)| {
                let keep = !frame.is_interruptible();
                dropped += usize::from(!keep);
                keep
            })
            .collect();

        while let Ok(envelope) = self.data.try_recv() {
            if envelope.0.is_interruptible() {
                dropped += 1;
            } else {
                kept.push_back(envelope);
            }
        }

        self.retained = kept;
        dropped
    }
}

/// Handle a processor uses to push frames to its neighbours
///
/// Cloneable so background tasks spawned by a processor can keep pushing
/// frames after `process_frame` returns.
#[derive(Clone)]
pub struct FrameSink {
    name: Arc<str>,
    downstream: Port,
    upstream: Port,
    observers: Arc<[Arc<dyn Observer>]>,
}

impl FrameSink {
    pub(crate) fn new(
        name: &str,
        downstream: Port,
        upstream: Port,
        observers: Arc<[Arc<dyn Observer>]>,
    ) -> Self {
        Self {
            name: Arc::from(name),
            downstream,
            upstream,
            observers,
        }
    }

    /// Name of the processor owning this sink
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Push a frame to the next (downstream) or previous (upstream) processor
    ///
    /// # Errors
    ///
    /// Returns [`Error::PipelineClosed`] if the neighbour has shut down
    pub fn push(&self, frame: Frame, direction: FrameDirection) -> Result<()> {
        for observer in self.observers.iter() {
            observer.on_push_frame(&FramePushed {
                source: &self.name,
                frame: &frame,
                direction,
            });
        }

        match direction {
            FrameDirection::Downstream => self.downstream.send(frame, direction),
            FrameDirection::Upstream => self.upstream.send(frame, direction),
        }
    }

    /// Push a frame downstream
    ///
    /// # Errors
    ///
    /// Returns [`Error::PipelineClosed`] if the next processor has shut down
    pub fn push_downstream(&self, frame: Frame) -> Result<()> {
        self.push(frame, FrameDirection::Downstream)
    }

    /// Report an error upstream
    pub fn push_error(&self, message: impl Into<String>, fatal: bool) {
        let message = message.into();
        tracing::warn!(processor = %self.name, fatal, error = %message, "processor error");
        let frame = Frame::Error(crate::frames::ErrorFrame { message, fatal });
        if self.push(frame, FrameDirection::Upstream).is_err() {
            tracing::debug!(processor = %self.name, "error dropped, pipeline closed");
        }
    }
}

/// Drive one processor until its lifecycle ends
pub(crate) async fn run_processor(
    mut processor: Box<dyn FrameProcessor>,
    mut mailbox: Mailbox,
    sink: FrameSink,
) {
    let name = processor.name().to_string();
    tracing::trace!(processor = %name, "processor task started");

    while let Some((frame, direction)) = mailbox.recv().await {
        match frame {
            Frame::Start(params) => {
                if let Err(e) = processor.start(&params, &sink).await {
                    sink.push_error(format!("{name} failed to start: {e}"), false);
                }
                if sink.push(Frame::Start(params), direction).is_err() {
                    break;
                }
            }
            Frame::End => {
                if let Err(e) = processor.stop(&sink).await {
                    sink.push_error(format!("{name} failed to stop: {e}"), false);
                }
                let _ = sink.push(Frame::End, direction);
                break;
            }
            Frame::Cancel => {
                processor.cancel().await;
                let _ = sink.push(Frame::Cancel, direction);
                break;
            }
            Frame::Interruption => {
                let dropped = mailbox.discard_interruptible();
                if dropped > 0 {
                    tracing::debug!(processor = %name, dropped, "discarded frames on interruption");
                }
                dispatch(processor.as_mut(), Frame::Interruption, direction, &sink).await;
            }
            other => dispatch(processor.as_mut(), other, direction, &sink).await,
        }
    }

    tracing::trace!(processor = %name, "processor task finished");
}

async fn dispatch(
    processor: &mut dyn FrameProcessor,
    frame: Frame,
    direction: FrameDirection,
    sink: &FrameSink,
) {
    let frame_name = frame.name();
    let result = processor.process_frame(frame, direction, sink).await;
    match result {
        Ok(()) | Err(Error::PipelineClosed) => {}
        Err(e) => sink.push_error(format!("{}: {e}", processor.name()), false),
    }
    tracing::trace!(processor = %processor.name(), frame = frame_name, "frame processed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::AudioRaw;

    #[tokio::test]
    async fn system_frames_jump_the_queue() {
        let (port, mut mailbox) = mailbox();
        port.send(Frame::LlmText("a".to_string()), FrameDirection::Downstream)
            .unwrap();
        port.send(Frame::UserStartedSpeaking, FrameDirection::Downstream)
            .unwrap();

        let (first, _) = mailbox.recv().await.unwrap();
        assert_eq!(first, Frame::UserStartedSpeaking);
        let (second, _) = mailbox.recv().await.unwrap();
        assert_eq!(second, Frame::LlmText("a".to_string()));
    }

    #[tokio::test]
    async fn interruption_keeps_uninterruptible_frames_in_order() {
        let (port, mut mailbox) = mailbox();
        let audio = AudioRaw::new(vec![0u8; 4], 16_000, 1);
        port.send(Frame::LlmText("stale".to_string()), FrameDirection::Downstream)
            .unwrap();
        port.send(Frame::InputAudio(audio.clone()), FrameDirection::Downstream)
            .unwrap();
        port.send(Frame::OutputAudio(audio.clone()), FrameDirection::Downstream)
            .unwrap();
        port.send(Frame::End, FrameDirection::Downstream).unwrap();

        assert_eq!(mailbox.discard_interruptible(), 2);

        let (first, _) = mailbox.recv().await.unwrap();
        assert_eq!(first, Frame::InputAudio(audio));
        let (second, _) = mailbox.recv().await.unwrap();
        assert_eq!(second, Frame::End);
    }

    #[tokio::test]
    async fn recv_ends_when_senders_are_dropped() {
        let (port, mut mailbox) = mailbox();
        drop(port);
        assert!(mailbox.recv().await.is_none());
    }
}
