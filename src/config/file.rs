//! TOML configuration file loading
//!
//! Supports `~/.config/hearsay/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HearsayConfigFile {
    #[serde(default)]
    pub stt: SttFileConfig,

    #[serde(default)]
    pub llm: LlmFileConfig,

    #[serde(default)]
    pub tts: TtsFileConfig,

    #[serde(default)]
    pub vad: VadFileConfig,

    #[serde(default)]
    pub server: ServerFileConfig,

    #[serde(default)]
    pub pipeline: PipelineFileConfig,
}

/// Vosk speech recognition
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// WebSocket address (e.g. "ws://localhost:2700")
    pub uri: Option<String>,
    /// Sample rate of the audio sent to Vosk
    pub sample_rate: Option<u32>,
    /// Language tag stamped on transcriptions
    pub language: Option<String>,
    /// Keep forwarding input audio after recognition
    pub audio_passthrough: Option<bool>,
}

/// OpenAI-compatible language model
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// API base URL including the version (e.g. "http://localhost:1234/v1")
    pub base_url: Option<String>,
    /// Model identifier
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    /// Instruction appended when a client connects; empty disables the greeting
    pub greeting: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Pocket TTS
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// Server address (e.g. "http://localhost:8000")
    pub base_url: Option<String>,
    /// Voice name or voice prompt URL
    pub voice: Option<String>,
    pub sample_rate: Option<u32>,
    /// Bytes per output audio frame
    pub chunk_size: Option<usize>,
}

/// Voice activity detection
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub enabled: Option<bool>,
    pub threshold: Option<f32>,
    pub start_secs: Option<f32>,
    pub stop_secs: Option<f32>,
}

/// WebSocket server
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Pipeline behaviour
#[derive(Debug, Default, Deserialize)]
pub struct PipelineFileConfig {
    pub enable_metrics: Option<bool>,
    pub enable_usage_metrics: Option<bool>,
    pub allow_interruptions: Option<bool>,
}

/// Load the TOML config file
///
/// With an explicit `path` the file must exist and parse. Otherwise the
/// standard path is tried and any problem falls back to defaults.
///
/// # Errors
///
/// Returns error if an explicitly given file cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<HearsayConfigFile> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = parse_config(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(HearsayConfigFile::default());
    };

    if !path.exists() {
        return Ok(HearsayConfigFile::default());
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                Ok(HearsayConfigFile::default())
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            Ok(HearsayConfigFile::default())
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error on invalid TOML or unknown sections
pub fn parse_config(content: &str) -> Result<HearsayConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/hearsay/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("hearsay").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_leaves_other_sections_empty() {
        let config = parse_config(
            r#"
            [stt]
            uri = "ws://vosk:2700"

            [vad]
            stop_secs = 1.2
            "#,
        )
        .unwrap();

        assert_eq!(config.stt.uri.as_deref(), Some("ws://vosk:2700"));
        assert_eq!(config.vad.stop_secs, Some(1.2));
        assert!(config.llm.model.is_none());
        assert!(config.server.port.is_none());
    }

    #[test]
    fn unknown_sections_are_rejected() {
        assert!(parse_config("[telephony]\nenabled = true\n").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(load_config_file(Some(&missing)).is_err());
    }
}
