//! Audio capture from microphone

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use crate::audio::f32_to_pcm16;
use crate::frames::{AudioRaw, Frame};
use crate::pipeline::TaskHandle;
use crate::{Error, Result};

/// How often captured audio is handed to the pipeline
const FEED_INTERVAL: Duration = Duration::from_millis(20);

/// Captures mono audio from the default input device
pub struct AudioCapture {
    config: StreamConfig,
    sample_rate: u32,
    buffer: Arc<Mutex<Vec<f32>>>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default input device at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if no input device supports mono at that rate
    pub fn new(sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
            .ok_or_else(|| {
                Error::Audio(format!("no mono input config at {sample_rate} Hz"))
            })?;

        let config = supported_config
            .with_sample_rate(SampleRate(sample_rate))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            config,
            sample_rate,
            buffer: Arc::new(Mutex::new(Vec::new())),
            stream: None,
        })
    }

    /// Start capturing audio
    ///
    /// # Errors
    ///
    /// Returns error if capture fails
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = Arc::clone(&self.buffer);
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device".to_string()))?;

        let stream = device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(data);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("audio capture stopped");
        }
    }

    /// Samples captured since the last call
    #[must_use]
    pub fn take_buffer(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    /// Samples captured so far, without clearing
    #[must_use]
    pub fn peek_buffer(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default()
    }

    pub fn clear_buffer(&self) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Feeds microphone audio into a running pipeline
///
/// cpal streams are not `Send`, so the capture lives on its own thread and
/// queues `InputAudio` frames through the task handle.
pub struct MicrophoneFeed {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneFeed {
    /// Open the microphone and start feeding `handle`
    ///
    /// # Errors
    ///
    /// Returns error if the input device cannot be opened or started
    pub fn start(sample_rate: u32, handle: TaskHandle) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let flag = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("hearsay-mic".to_string())
            .spawn(move || {
                let capture = AudioCapture::new(sample_rate).and_then(|mut capture| {
                    capture.start()?;
                    Ok(capture)
                });
                let capture = match capture {
                    Ok(capture) => {
                        let _ = ready_tx.send(Ok(()));
                        capture
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while flag.load(Ordering::Relaxed) {
                    std::thread::sleep(FEED_INTERVAL);
                    let samples = capture.take_buffer();
                    if samples.is_empty() {
                        continue;
                    }
                    let audio = AudioRaw::new(f32_to_pcm16(&samples), sample_rate, 1);
                    if handle.queue_frame(Frame::InputAudio(audio)).is_err() {
                        tracing::debug!("pipeline closed, stopping microphone feed");
                        break;
                    }
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                running,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(Error::Audio("microphone thread exited".to_string())),
        }
    }

    /// Stop capturing and wait for the thread
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MicrophoneFeed {
    fn drop(&mut self) {
        self.stop();
    }
}
