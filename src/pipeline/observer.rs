//! Observers watch frames as processors push them

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::frames::{Frame, FrameDirection};

/// A frame being pushed from one processor to a neighbour
#[derive(Debug)]
pub struct FramePushed<'a> {
    /// Processor that pushed the frame
    pub source: &'a str,
    pub frame: &'a Frame,
    pub direction: FrameDirection,
}

/// Receives a callback for every frame pushed anywhere in the pipeline
///
/// Callbacks run inline on the processor task, so they must be cheap.
pub trait Observer: Send + Sync {
    fn on_push_frame(&self, event: &FramePushed<'_>);
}

/// Logs every non-audio frame at trace level
#[derive(Debug, Default)]
pub struct FrameLogObserver;

impl Observer for FrameLogObserver {
    fn on_push_frame(&self, event: &FramePushed<'_>) {
        if matches!(event.frame, Frame::InputAudio(_) | Frame::OutputAudio(_)) {
            return;
        }
        tracing::trace!(
            source = event.source,
            frame = event.frame.name(),
            direction = ?event.direction,
            "frame pushed"
        );
    }
}

/// Measures the time between the user going quiet and the bot starting to speak
///
/// The same frame is observed once per hop, so only state transitions count.
#[derive(Debug, Default)]
pub struct TurnLatencyObserver {
    user_stopped_at: Mutex<Option<Instant>>,
    last: Mutex<Option<Duration>>,
}

impl TurnLatencyObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latency of the most recent completed turn
    #[must_use]
    pub fn last_latency(&self) -> Option<Duration> {
        self.last.lock().ok().and_then(|last| *last)
    }
}

impl Observer for TurnLatencyObserver {
    fn on_push_frame(&self, event: &FramePushed<'_>) {
        let Ok(mut stopped_at) = self.user_stopped_at.lock() else {
            return;
        };

        match event.frame {
            Frame::UserStartedSpeaking => *stopped_at = None,
            Frame::UserStoppedSpeaking => {
                if stopped_at.is_none() {
                    *stopped_at = Some(Instant::now());
                }
            }
            Frame::BotStartedSpeaking => {
                if let Some(start) = stopped_at.take() {
                    let latency = start.elapsed();
                    tracing::info!(latency_ms = latency.as_millis(), "user to bot latency");
                    if let Ok(mut last) = self.last.lock() {
                        *last = Some(latency);
                    }
                }
            }
            _ => {}
        }
    }
}
