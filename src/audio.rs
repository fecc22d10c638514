//! PCM helpers shared by transports and services

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Convert f32 samples in [-1.0, 1.0] to s16le bytes
#[must_use]
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Convert s16le bytes to f32 samples; a trailing odd byte is ignored
#[must_use]
pub fn pcm16_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect()
}

/// RMS energy of s16le audio, normalised to [0.0, 1.0]
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn pcm16_rms(pcm: &[u8]) -> f32 {
    let count = pcm.len() / 2;
    if count == 0 {
        return 0.0;
    }

    let sum_squares: f64 = pcm
        .chunks_exact(2)
        .map(|b| {
            let s = f64::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0;
            s * s
        })
        .sum();

    #[allow(clippy::cast_possible_truncation)]
    let rms = (sum_squares / count as f64).sqrt() as f32;
    rms
}

/// Calculate RMS energy of f32 samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Average interleaved channels into mono
#[must_use]
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(usize::from(channels))
        .map(|frame| frame.iter().sum::<f32>() / f32::from(channels))
        .collect()
}

/// Input frames per resampler chunk
const RESAMPLE_CHUNK: usize = 1024;

/// Streaming sample rate conversion for mono audio
///
/// Input is buffered until the resampler has a full chunk, so audio pushed
/// in arbitrary pieces comes out as one continuous signal. Rates that match
/// pass straight through.
pub struct StreamResampler {
    resampler: Option<FftFixedIn<f64>>,
    from_rate: u32,
    pending: Vec<f64>,
    primed: bool,
}

impl StreamResampler {
    /// Create a converter from `from_rate` to `to_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the resampler cannot be built for these rates
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let resampler = if from_rate == to_rate {
            None
        } else {
            let resampler = FftFixedIn::<f64>::new(
                from_rate as usize,
                to_rate as usize,
                RESAMPLE_CHUNK,
                2,
                1,
            )
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;
            Some(resampler)
        };

        Ok(Self {
            resampler,
            from_rate,
            pending: Vec::new(),
            primed: false,
        })
    }

    /// Input sample rate
    #[must_use]
    pub const fn from_rate(&self) -> u32 {
        self.from_rate
    }

    /// Resample every full chunk available, keeping the remainder for later
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend(samples.iter().map(|&s| f64::from(s)));

        let mut out = Vec::new();
        while self.pending.len() >= resampler.input_frames_next() {
            let chunk: Vec<f64> = self.pending.drain(..resampler.input_frames_next()).collect();
            let result = resampler
                .process(&[chunk], None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            extend_f32(&mut out, &result[0]);
            self.primed = true;
        }
        Ok(out)
    }

    /// Resample the buffered remainder and the filter tail, then start over
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() && !self.primed {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let rest = [std::mem::take(&mut self.pending)];
        if !rest[0].is_empty() {
            let result = resampler
                .process_partial(Some(&rest[..]), None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            extend_f32(&mut out, &result[0]);
        }
        let tail = resampler
            .process_partial::<Vec<f64>>(None, None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        extend_f32(&mut out, &tail[0]);

        resampler.reset();
        self.primed = false;
        Ok(out)
    }

    /// Drop buffered input
    pub fn reset(&mut self) {
        self.pending.clear();
        self.primed = false;
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn extend_f32(out: &mut Vec<f32>, samples: &[f64]) {
    out.extend(samples.iter().map(|&s| s as f32));
}

/// Wrap s16le PCM in a WAV container
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for chunk in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Read a WAV file into s16le PCM, returning `(pcm, sample_rate, channels)`
///
/// # Errors
///
/// Returns error if the file cannot be read or is not 16-bit integer PCM
pub fn read_wav_pcm16(path: &std::path::Path) -> Result<(Vec<u8>, u32, u16)> {
    let mut reader = hound::WavReader::open(path).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(Error::Audio(format!(
            "{}: expected 16-bit PCM, got {} bit {:?}",
            path.display(),
            spec.bits_per_sample,
            spec.sample_format
        )));
    }

    let mut pcm = Vec::with_capacity(reader.len() as usize * 2);
    for sample in reader.samples::<i16>() {
        let sample = sample.map_err(|e| Error::Audio(e.to_string()))?;
        pcm.extend_from_slice(&sample.to_le_bytes());
    }

    Ok((pcm, spec.sample_rate, spec.channels))
}
