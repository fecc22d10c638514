//! Transport input: voice activity and user turn boundaries

use async_trait::async_trait;

use crate::frames::{Frame, FrameDirection, StartParams};
use crate::pipeline::{FrameProcessor, FrameSink};
use crate::vad::{VadAnalyzer, VadParams};
use crate::Result;

/// First processor of a pipeline; receives audio from the transport
///
/// With VAD enabled, pushes `UserStartedSpeaking` (followed by
/// `Interruption` when interruptions are allowed) and `UserStoppedSpeaking`
/// around each utterance. Audio is always forwarded.
pub struct AudioInput {
    vad: Option<VadAnalyzer>,
    allow_interruptions: bool,
    user_speaking: bool,
}

impl AudioInput {
    #[must_use]
    pub fn new(vad: Option<VadParams>) -> Self {
        Self {
            vad: vad.map(|params| VadAnalyzer::new(params, StartParams::default().audio_in_sample_rate)),
            allow_interruptions: true,
            user_speaking: false,
        }
    }

    fn analyze(&mut self, pcm: &[u8], sink: &FrameSink) -> Result<()> {
        let Some(vad) = self.vad.as_mut() else {
            return Ok(());
        };
        vad.analyze(pcm);
        let speaking = vad.is_speaking();

        if speaking && !self.user_speaking {
            tracing::debug!("user started speaking");
            sink.push_downstream(Frame::UserStartedSpeaking)?;
            if self.allow_interruptions {
                sink.push_downstream(Frame::Interruption)?;
            }
        } else if !speaking && self.user_speaking {
            tracing::debug!("user stopped speaking");
            sink.push_downstream(Frame::UserStoppedSpeaking)?;
        }
        self.user_speaking = speaking;
        Ok(())
    }
}

#[async_trait]
impl FrameProcessor for AudioInput {
    fn name(&self) -> &'static str {
        "audio-input"
    }

    async fn start(&mut self, params: &StartParams, _sink: &FrameSink) -> Result<()> {
        self.allow_interruptions = params.allow_interruptions;
        if let Some(vad) = self.vad.as_mut() {
            vad.set_sample_rate(params.audio_in_sample_rate);
            vad.reset();
        }
        Ok(())
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        sink: &FrameSink,
    ) -> Result<()> {
        if let Frame::InputAudio(audio) = &frame {
            self.analyze(&audio.audio, sink)?;
        }
        sink.push(frame, direction)
    }

    async fn stop(&mut self, sink: &FrameSink) -> Result<()> {
        if self.user_speaking {
            self.user_speaking = false;
            sink.push_downstream(Frame::UserStoppedSpeaking)?;
        }
        Ok(())
    }
}
