//! Incremental WAV decoding for streamed synthesis responses

use crate::{Error, Result};

/// Sample encoding declared in the `fmt ` chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// Signed 16-bit integer PCM
    Pcm16,
    /// 32-bit IEEE float, converted to 16-bit on the way out
    Float32,
}

impl SampleEncoding {
    const fn bytes_per_sample(self) -> usize {
        match self {
            Self::Pcm16 => 2,
            Self::Float32 => 4,
        }
    }
}

/// Audio format of a decoded stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
}

#[derive(Debug)]
enum State {
    /// Waiting for enough bytes to parse the next header
    Header { offset: usize },
    /// Inside the `data` chunk; `None` when the size is unknown (streamed)
    Data { remaining: Option<u64> },
    /// Not a RIFF file; bytes are passed through as s16le
    Raw,
}

/// Strips the WAV container from a byte stream, yielding s16le PCM
///
/// The header may arrive split across any number of chunks. Bodies that do
/// not start with `RIFF` are treated as raw s16le PCM.
#[derive(Debug)]
pub struct WavStreamDecoder {
    state: State,
    header: Vec<u8>,
    format: Option<WavFormat>,
    /// Partial sample carried over to the next push
    carry: Vec<u8>,
}

impl Default for WavStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl WavStreamDecoder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: State::Header { offset: 0 },
            header: Vec::new(),
            format: None,
            carry: Vec::new(),
        }
    }

    /// Format from the `fmt ` chunk, once seen
    #[must_use]
    pub const fn format(&self) -> Option<WavFormat> {
        self.format
    }

    /// Whether the stream turned out not to be a WAV file
    #[must_use]
    pub const fn is_raw(&self) -> bool {
        matches!(self.state, State::Raw)
    }

    /// Feed bytes and return the PCM they completed
    ///
    /// # Errors
    ///
    /// Returns error if the header declares an unsupported format
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        match self.state {
            State::Header { .. } => {
                self.header.extend_from_slice(bytes);
                self.parse_header()
            }
            State::Data { .. } | State::Raw => Ok(self.samples(bytes)),
        }
    }

    fn parse_header(&mut self) -> Result<Vec<u8>> {
        loop {
            let State::Header { offset } = self.state else {
                return Ok(Vec::new());
            };

            if offset == 0 {
                if self.header.len() < 12 {
                    // Decide early for short non-RIFF bodies
                    if self.header.len() >= 4 && &self.header[..4] != b"RIFF" {
                        return Ok(self.switch_to_raw());
                    }
                    return Ok(Vec::new());
                }
                if &self.header[..4] != b"RIFF" || &self.header[8..12] != b"WAVE" {
                    return Ok(self.switch_to_raw());
                }
                self.state = State::Header { offset: 12 };
                continue;
            }

            let Some(chunk) = self.header.get(offset..offset + 8) else {
                return Ok(Vec::new());
            };
            let id: [u8; 4] = [chunk[0], chunk[1], chunk[2], chunk[3]];
            let size = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            let body = offset + 8;

            match &id {
                b"data" => {
                    if self.format.is_none() {
                        return Err(Error::Audio("WAV data chunk before fmt chunk".to_string()));
                    }
                    // Streaming servers write 0 or u32::MAX when the length is unknown
                    let remaining = (size != 0 && size != u32::MAX).then_some(u64::from(size));
                    self.state = State::Data { remaining };
                    let rest = self.header.split_off(body);
                    self.header.clear();
                    return Ok(self.samples(&rest));
                }
                b"fmt " => {
                    let Some(fmt) = self.header.get(body..body + 16) else {
                        return Ok(Vec::new());
                    };
                    self.format = Some(parse_fmt(fmt)?);
                    tracing::trace!(format = ?self.format, "WAV format");
                }
                _ => {}
            }

            // Chunks are padded to an even length
            let size = usize::try_from(size).unwrap_or(usize::MAX);
            let next = body.saturating_add(size).saturating_add(size % 2);
            self.state = State::Header { offset: next };
            if self.header.len() < next {
                return Ok(Vec::new());
            }
        }
    }

    fn switch_to_raw(&mut self) -> Vec<u8> {
        tracing::debug!("response is not a WAV file, treating it as raw PCM");
        self.state = State::Raw;
        let bytes = std::mem::take(&mut self.header);
        self.samples(&bytes)
    }

    /// Whole samples from `bytes` (plus the carry), converted to s16le
    fn samples(&mut self, bytes: &[u8]) -> Vec<u8> {
        let bytes = match &mut self.state {
            State::Data {
                remaining: Some(remaining),
            } => {
                let take = usize::try_from(*remaining).map_or(bytes.len(), |r| r.min(bytes.len()));
                *remaining -= take as u64;
                &bytes[..take]
            }
            _ => bytes,
        };

        let encoding = match self.state {
            State::Raw => SampleEncoding::Pcm16,
            _ => self.format.map_or(SampleEncoding::Pcm16, |f| f.encoding),
        };
        let width = encoding.bytes_per_sample();

        self.carry.extend_from_slice(bytes);
        let whole = self.carry.len() - self.carry.len() % width;
        let data: Vec<u8> = self.carry.drain(..whole).collect();

        match encoding {
            SampleEncoding::Pcm16 => data,
            SampleEncoding::Float32 => {
                let samples: Vec<f32> = data
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                crate::audio::f32_to_pcm16(&samples)
            }
        }
    }
}

fn parse_fmt(fmt: &[u8]) -> Result<WavFormat> {
    let audio_format = u16::from_le_bytes([fmt[0], fmt[1]]);
    let channels = u16::from_le_bytes([fmt[2], fmt[3]]);
    let sample_rate = u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]);
    let bits = u16::from_le_bytes([fmt[14], fmt[15]]);

    // WAVE_FORMAT_EXTENSIBLE (0xFFFE) carries the real format in a GUID; trust the bit depth
    let encoding = match (audio_format, bits) {
        (1 | 0xFFFE, 16) => SampleEncoding::Pcm16,
        (3 | 0xFFFE, 32) => SampleEncoding::Float32,
        _ => {
            return Err(Error::Audio(format!(
                "unsupported WAV format {audio_format} with {bits} bits per sample"
            )));
        }
    };

    Ok(WavFormat {
        sample_rate,
        channels,
        encoding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm16_to_wav;

    fn pcm() -> Vec<u8> {
        (0..100u8).collect()
    }

    #[test]
    fn strips_header_in_one_push() {
        let wav = pcm16_to_wav(&pcm(), 24_000, 1).unwrap();
        let mut decoder = WavStreamDecoder::new();

        assert_eq!(decoder.push(&wav).unwrap(), pcm());
        let format = decoder.format().unwrap();
        assert_eq!(format.sample_rate, 24_000);
        assert_eq!(format.channels, 1);
        assert_eq!(format.encoding, SampleEncoding::Pcm16);
    }

    #[test]
    fn strips_header_split_byte_by_byte() {
        let wav = pcm16_to_wav(&pcm(), 16_000, 1).unwrap();
        let mut decoder = WavStreamDecoder::new();

        let mut out = Vec::new();
        for byte in &wav {
            out.extend(decoder.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(out, pcm());
    }

    #[test]
    fn skips_unknown_chunks() {
        let wav = pcm16_to_wav(&pcm(), 24_000, 1).unwrap();
        // Insert a LIST chunk with an odd size (padded) between fmt and data
        let mut with_list = wav[..36].to_vec();
        with_list.extend_from_slice(b"LIST");
        with_list.extend_from_slice(&3u32.to_le_bytes());
        with_list.extend_from_slice(&[1, 2, 3, 0]);
        with_list.extend_from_slice(&wav[36..]);

        let mut decoder = WavStreamDecoder::new();
        assert_eq!(decoder.push(&with_list).unwrap(), pcm());
    }

    #[test]
    fn unknown_data_size_streams_until_the_end() {
        let mut wav = pcm16_to_wav(&pcm(), 24_000, 1).unwrap();
        wav[40..44].copy_from_slice(&u32::MAX.to_le_bytes());
        wav.extend_from_slice(&[7, 7]);

        let mut decoder = WavStreamDecoder::new();
        let out = decoder.push(&wav).unwrap();
        assert_eq!(out.len(), pcm().len() + 2);
    }

    #[test]
    fn raw_pcm_passes_through_with_sample_alignment() {
        let mut decoder = WavStreamDecoder::new();
        assert_eq!(decoder.push(&[1, 2, 3, 4, 5]).unwrap(), vec![1, 2, 3, 4]);
        assert!(decoder.is_raw());
        assert_eq!(decoder.push(&[6]).unwrap(), vec![5, 6]);
    }

    #[test]
    fn float_samples_are_converted() {
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&0u32.to_le_bytes());
        wav.extend_from_slice(b"WAVEfmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&3u16.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&24_000u32.to_le_bytes());
        wav.extend_from_slice(&96_000u32.to_le_bytes());
        wav.extend_from_slice(&4u16.to_le_bytes());
        wav.extend_from_slice(&32u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&8u32.to_le_bytes());
        wav.extend_from_slice(&0.5f32.to_le_bytes());
        wav.extend_from_slice(&(-1.0f32).to_le_bytes());

        let mut decoder = WavStreamDecoder::new();
        let out = decoder.push(&wav).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(i16::from_le_bytes([out[0], out[1]]), 16383);
        assert_eq!(i16::from_le_bytes([out[2], out[3]]), -32767);
    }

    #[test]
    fn unsupported_bit_depth_is_an_error() {
        let mut wav = pcm16_to_wav(&pcm(), 24_000, 1).unwrap();
        wav[34..36].copy_from_slice(&8u16.to_le_bytes());
        assert!(WavStreamDecoder::new().push(&wav).is_err());
    }
}
