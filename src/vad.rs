//! Voice activity detection
//!
//! Energy based: a chunk counts as speech when its RMS exceeds the
//! threshold. The detector only changes between quiet and speaking after
//! `start_secs` of continuous speech or `stop_secs` of continuous silence.

use serde::Deserialize;

use crate::audio::pcm16_rms;

/// Voice activity detection parameters
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct VadParams {
    /// Minimum RMS energy (0.0 - 1.0) to consider a chunk speech
    pub threshold: f32,
    /// Continuous speech needed before the user counts as speaking
    pub start_secs: f32,
    /// Continuous silence needed before the user counts as done
    pub stop_secs: f32,
}

impl Default for VadParams {
    fn default() -> Self {
        Self {
            threshold: 0.03,
            start_secs: 0.2,
            stop_secs: 0.8,
        }
    }
}

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No speech
    Quiet,
    /// Speech detected, not yet long enough to count
    Starting,
    /// The user is speaking
    Speaking,
    /// Silence after speech, not yet long enough to count
    Stopping,
}

/// Tracks voice activity over a stream of s16le mono chunks
#[derive(Debug, Clone)]
pub struct VadAnalyzer {
    params: VadParams,
    sample_rate: u32,
    state: VadState,
    /// Samples of continuous speech (while starting) or silence (while stopping)
    run_samples: usize,
}

impl VadAnalyzer {
    #[must_use]
    pub fn new(params: VadParams, sample_rate: u32) -> Self {
        tracing::debug!(?params, sample_rate, "VAD initialized");
        Self {
            params,
            sample_rate,
            state: VadState::Quiet,
            run_samples: 0,
        }
    }

    pub const fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    /// Feed a chunk of audio and return the new state
    pub fn analyze(&mut self, pcm: &[u8]) -> VadState {
        let samples = pcm.len() / 2;
        let energy = pcm16_rms(pcm);
        let is_speech = energy > self.params.threshold;

        let start_samples = self.samples_for(self.params.start_secs);
        let stop_samples = self.samples_for(self.params.stop_secs);

        self.state = match (self.state, is_speech) {
            (VadState::Quiet, true) => {
                self.run_samples = samples;
                if self.run_samples >= start_samples {
                    VadState::Speaking
                } else {
                    VadState::Starting
                }
            }
            (VadState::Starting, true) => {
                self.run_samples += samples;
                if self.run_samples >= start_samples {
                    VadState::Speaking
                } else {
                    VadState::Starting
                }
            }
            (VadState::Quiet | VadState::Starting, false) => {
                self.run_samples = 0;
                VadState::Quiet
            }
            (VadState::Speaking | VadState::Stopping, true) => {
                self.run_samples = 0;
                VadState::Speaking
            }
            (VadState::Speaking, false) => {
                self.run_samples = samples;
                if self.run_samples >= stop_samples {
                    VadState::Quiet
                } else {
                    VadState::Stopping
                }
            }
            (VadState::Stopping, false) => {
                self.run_samples += samples;
                if self.run_samples >= stop_samples {
                    self.run_samples = 0;
                    VadState::Quiet
                } else {
                    VadState::Stopping
                }
            }
        };

        tracing::trace!(energy, is_speech, state = ?self.state, "vad");
        self.state
    }

    /// Whether the detector considers the user to be speaking
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        matches!(self.state, VadState::Speaking | VadState::Stopping)
    }

    pub const fn reset(&mut self) {
        self.state = VadState::Quiet;
        self.run_samples = 0;
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn samples_for(&self, secs: f32) -> usize {
        (secs.max(0.0) * self.sample_rate as f32) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::f32_to_pcm16;

    const RATE: u32 = 16_000;

    /// 100ms of a 440Hz tone
    fn tone() -> Vec<u8> {
        #[allow(clippy::cast_precision_loss)]
        let samples: Vec<f32> = (0..1600)
            .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / RATE as f32).sin())
            .collect();
        f32_to_pcm16(&samples)
    }

    /// 100ms of silence
    fn silence() -> Vec<u8> {
        vec![0u8; 3200]
    }

    #[test]
    fn short_noise_does_not_start_speech() {
        let mut vad = VadAnalyzer::new(VadParams::default(), RATE);
        assert_eq!(vad.analyze(&tone()), VadState::Starting);
        assert_eq!(vad.analyze(&silence()), VadState::Quiet);
        assert!(!vad.is_speaking());
    }

    #[test]
    fn speech_then_silence_cycles_back_to_quiet() {
        let mut vad = VadAnalyzer::new(VadParams::default(), RATE);
        vad.analyze(&tone());
        assert_eq!(vad.analyze(&tone()), VadState::Speaking);

        // 0.7s of silence is not enough with the default 0.8s stop
        for _ in 0..7 {
            assert_eq!(vad.analyze(&silence()), VadState::Stopping);
        }
        assert!(vad.is_speaking());
        assert_eq!(vad.analyze(&silence()), VadState::Quiet);
    }

    #[test]
    fn speech_during_stopping_resumes_speaking() {
        let mut vad = VadAnalyzer::new(VadParams::default(), RATE);
        vad.analyze(&tone());
        vad.analyze(&tone());
        vad.analyze(&silence());
        assert_eq!(vad.analyze(&tone()), VadState::Speaking);
    }

    #[test]
    fn zero_start_secs_starts_immediately() {
        let params = VadParams {
            start_secs: 0.0,
            ..VadParams::default()
        };
        let mut vad = VadAnalyzer::new(params, RATE);
        assert_eq!(vad.analyze(&tone()), VadState::Speaking);
    }
}
