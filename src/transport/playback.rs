//! Audio playback to speakers

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, StreamConfig};

use crate::audio::{StreamResampler, downmix_to_mono, pcm16_to_f32};
use crate::frames::AudioRaw;
use crate::processors::AudioSink;
use crate::{Error, Result};

/// Find an output config at `sample_rate`, preferring mono
fn output_config(sample_rate: u32) -> Result<(Device, StreamConfig)> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels
            && c.min_sample_rate() <= SampleRate(sample_rate)
            && c.max_sample_rate() >= SampleRate(sample_rate)
    };

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| supports(c, 1))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports(c, 2))
        })
        .ok_or_else(|| Error::Audio(format!("no output config at {sample_rate} Hz")))?;

    let config = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels = config.channels,
        "audio playback initialized"
    );

    Ok((device, config))
}

/// Fill an interleaved output buffer from a mono queue, padding with silence
fn fill_frames(data: &mut [f32], channels: usize, queue: &mut VecDeque<f32>) -> bool {
    let mut drained = false;
    for frame in data.chunks_mut(channels.max(1)) {
        let sample = queue.pop_front().unwrap_or_else(|| {
            drained = true;
            0.0
        });
        frame.fill(sample);
    }
    drained
}

/// Plays complete clips to the default output device
pub struct AudioPlayback {
    device: Device,
    config: StreamConfig,
    sample_rate: u32,
}

impl AudioPlayback {
    /// Open the default output device at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new(sample_rate: u32) -> Result<Self> {
        let (device, config) = output_config(sample_rate)?;
        Ok(Self {
            device,
            config,
            sample_rate,
        })
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Play mono f32 samples, blocking until they have been heard
    ///
    /// # Errors
    ///
    /// Returns error if playback fails
    pub fn play(&self, samples: Vec<f32>) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let sample_count = samples.len();
        let channels = usize::from(self.config.channels);
        let queue = Arc::new(Mutex::new(VecDeque::from(samples)));
        let finished = Arc::new(AtomicBool::new(false));

        let stream_queue = Arc::clone(&queue);
        let stream_finished = Arc::clone(&finished);
        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if let Ok(mut queue) = stream_queue.lock() {
                        if fill_frames(data, channels, &mut queue) {
                            stream_finished.store(true, Ordering::Relaxed);
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let duration_ms = (sample_count as u64 * 1000) / u64::from(self.sample_rate.max(1));
        let timeout = Duration::from_millis(duration_ms + 500);
        let start = Instant::now();

        while !finished.load(Ordering::Relaxed) && start.elapsed() < timeout {
            std::thread::sleep(Duration::from_millis(50));
        }

        // Let the device drain its own buffer
        std::thread::sleep(Duration::from_millis(100));

        drop(stream);
        tracing::debug!(samples = sample_count, "playback complete");
        Ok(())
    }
}

/// Streams bot audio to the speaker for the local transport
///
/// The cpal stream runs on its own thread and pulls from a shared queue;
/// writes append to the queue and `clear` empties it on interruption.
pub struct SpeakerSink {
    queue: Arc<Mutex<VecDeque<f32>>>,
    sample_rate: u32,
    /// Converts bot audio to the device rate across writes
    resampler: Mutex<Option<StreamResampler>>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SpeakerSink {
    /// Open the default output device at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened or started
    pub fn new(sample_rate: u32) -> Result<Self> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let stream_queue = Arc::clone(&queue);
        let flag = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("hearsay-speaker".to_string())
            .spawn(move || {
                let stream = output_config(sample_rate).and_then(|(device, config)| {
                    let channels = usize::from(config.channels);
                    let stream = device
                        .build_output_stream(
                            &config,
                            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                                if let Ok(mut queue) = stream_queue.lock() {
                                    fill_frames(data, channels, &mut queue);
                                }
                            },
                            |err| {
                                tracing::error!(error = %err, "audio playback error");
                            },
                            None,
                        )
                        .map_err(|e| Error::Audio(e.to_string()))?;
                    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
                    Ok(stream)
                });

                let stream = match stream {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while flag.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue,
                sample_rate,
                resampler: Mutex::new(None),
                running,
                thread: Mutex::new(Some(thread)),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(Error::Audio("speaker thread exited".to_string())),
        }
    }

    fn resample(&self, samples: &[f32], from_rate: u32) -> Result<Vec<f32>> {
        let mut resampler = self
            .resampler
            .lock()
            .map_err(|_| Error::Audio("speaker resampler poisoned".to_string()))?;
        if resampler.as_ref().is_none_or(|r| r.from_rate() != from_rate) {
            *resampler = Some(StreamResampler::new(from_rate, self.sample_rate)?);
        }
        resampler
            .as_mut()
            .map_or_else(|| Ok(samples.to_vec()), |r| r.process(samples))
    }

    fn enqueue(&self, samples: Vec<f32>) -> Result<()> {
        self.queue
            .lock()
            .map(|mut queue| queue.extend(samples))
            .map_err(|_| Error::Audio("speaker queue poisoned".to_string()))
    }

    /// Stop the output stream
    pub fn close(&self) {
        self.running.store(false, Ordering::Relaxed);
        let thread = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

#[async_trait]
impl AudioSink for SpeakerSink {
    async fn write(&self, audio: &AudioRaw) -> Result<()> {
        let samples = downmix_to_mono(&pcm16_to_f32(&audio.audio), audio.num_channels);
        let samples = self.resample(&samples, audio.sample_rate)?;
        self.enqueue(samples)
    }

    async fn clear(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
        let Ok(mut resampler) = self.resampler.lock() else {
            return;
        };
        if let Some(resampler) = resampler.as_mut() {
            resampler.reset();
        }
    }

    async fn flush(&self) -> Result<()> {
        let tail = match self.resampler.lock() {
            Ok(mut resampler) => match resampler.as_mut() {
                Some(resampler) => resampler.flush()?,
                None => return Ok(()),
            },
            Err(_) => return Err(Error::Audio("speaker resampler poisoned".to_string())),
        };
        self.enqueue(tail)
    }
}

impl Drop for SpeakerSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_duplicates_mono_across_channels_and_pads() {
        let mut queue = VecDeque::from(vec![0.5, -0.5]);
        let mut data = [1.0f32; 6];

        let drained = fill_frames(&mut data, 2, &mut queue);

        assert!(drained);
        assert_eq!(data, [0.5, 0.5, -0.5, -0.5, 0.0, 0.0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn fill_leaves_the_rest_queued() {
        let mut queue = VecDeque::from(vec![0.1, 0.2, 0.3]);
        let mut data = [0.0f32; 2];

        assert!(!fill_frames(&mut data, 1, &mut queue));
        assert_eq!(queue.len(), 1);
    }
}
