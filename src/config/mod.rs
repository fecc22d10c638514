//! Configuration management for hearsay
//!
//! Layered: environment variables override the TOML file, which overrides
//! the built-in defaults. The defaults match a stock local setup: Vosk on
//! port 2700, LM Studio on port 1234 and Pocket TTS on port 8000.

pub mod file;

use std::path::Path;

use secrecy::{ExposeSecret, SecretString};

use crate::pipeline::PipelineParams;
use crate::services::openai::{self, OpenAiLlmParams};
use crate::services::pocket_tts::{self, PocketTtsParams};
use crate::services::vosk::{self, VoskSttParams};
use crate::vad::VadParams;
use crate::{Error, Result};

pub use file::HearsayConfigFile;

/// System prompt of the assistant
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly AI assistant running locally. \
     Respond naturally and keep your answers conversational.";

/// Instruction appended when a client connects
pub const DEFAULT_GREETING: &str =
    "Say hello and briefly introduce yourself as a local AI assistant.";

/// hearsay configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub vad: VadConfig,
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
}

/// Vosk speech recognition
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub uri: String,
    pub sample_rate: u32,
    pub language: String,
    pub audio_passthrough: bool,
}

/// OpenAI-compatible language model
#[derive(Debug)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: SecretString,
    pub system_prompt: String,
    /// `None` disables the greeting on connect
    pub greeting: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Clone for LlmConfig {
    fn clone(&self) -> Self {
        Self {
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            api_key: SecretString::from(self.api_key.expose_secret()),
            system_prompt: self.system_prompt.clone(),
            greeting: self.greeting.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// Pocket TTS
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub base_url: String,
    pub voice: Option<String>,
    pub sample_rate: u32,
    pub chunk_size: usize,
}

/// Voice activity detection
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    pub enabled: bool,
    pub params: VadParams,
}

/// WebSocket transport server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Pipeline behaviour
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub enable_metrics: bool,
    pub enable_usage_metrics: bool,
    pub allow_interruptions: bool,
}

impl Default for Config {
    fn default() -> Self {
        let stt = VoskSttParams::default();
        let tts = PocketTtsParams::default();
        Self {
            stt: SttConfig {
                uri: vosk::DEFAULT_URI.to_string(),
                sample_rate: stt.sample_rate,
                language: stt.language,
                audio_passthrough: stt.audio_passthrough,
            },
            llm: LlmConfig {
                base_url: openai::DEFAULT_BASE_URL.to_string(),
                model: openai::DEFAULT_MODEL.to_string(),
                api_key: SecretString::from("not-needed"),
                system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
                greeting: Some(DEFAULT_GREETING.to_string()),
                temperature: None,
                max_tokens: None,
            },
            tts: TtsConfig {
                base_url: pocket_tts::DEFAULT_BASE_URL.to_string(),
                voice: None,
                sample_rate: tts.sample_rate,
                chunk_size: tts.chunk_size,
            },
            vad: VadConfig {
                enabled: true,
                params: VadParams::default(),
            },
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8765,
            },
            pipeline: PipelineConfig {
                enable_metrics: true,
                enable_usage_metrics: true,
                allow_interruptions: true,
            },
        }
    }
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if the config file given explicitly is invalid, an
    /// environment override cannot be parsed, or validation fails
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = file::load_config_file(path)?;
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if an environment override cannot be parsed or
    /// validation fails
    pub fn from_sources(
        file: HearsayConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let stt = SttConfig {
            uri: env("HEARSAY_STT_URI")
                .or(file.stt.uri)
                .unwrap_or(defaults.stt.uri),
            sample_rate: file.stt.sample_rate.unwrap_or(defaults.stt.sample_rate),
            language: file.stt.language.unwrap_or(defaults.stt.language),
            audio_passthrough: file
                .stt
                .audio_passthrough
                .unwrap_or(defaults.stt.audio_passthrough),
        };

        let api_key = env("HEARSAY_LLM_API_KEY")
            .or_else(|| env("OPENAI_API_KEY"))
            .or(file.llm.api_key)
            .map_or(defaults.llm.api_key, SecretString::from);

        let llm = LlmConfig {
            base_url: env("HEARSAY_LLM_BASE_URL")
                .or(file.llm.base_url)
                .unwrap_or(defaults.llm.base_url),
            model: env("HEARSAY_LLM_MODEL")
                .or(file.llm.model)
                .unwrap_or(defaults.llm.model),
            api_key,
            system_prompt: file
                .llm
                .system_prompt
                .unwrap_or(defaults.llm.system_prompt),
            greeting: match file.llm.greeting {
                Some(greeting) if greeting.trim().is_empty() => None,
                Some(greeting) => Some(greeting),
                None => defaults.llm.greeting,
            },
            temperature: file.llm.temperature,
            max_tokens: file.llm.max_tokens,
        };

        let tts = TtsConfig {
            base_url: env("HEARSAY_TTS_BASE_URL")
                .or(file.tts.base_url)
                .unwrap_or(defaults.tts.base_url),
            voice: env("HEARSAY_TTS_VOICE").or(file.tts.voice),
            sample_rate: file.tts.sample_rate.unwrap_or(defaults.tts.sample_rate),
            chunk_size: file.tts.chunk_size.unwrap_or(defaults.tts.chunk_size),
        };

        let vad_defaults = defaults.vad.params;
        let vad = VadConfig {
            enabled: file.vad.enabled.unwrap_or(defaults.vad.enabled),
            params: VadParams {
                threshold: file.vad.threshold.unwrap_or(vad_defaults.threshold),
                start_secs: file.vad.start_secs.unwrap_or(vad_defaults.start_secs),
                stop_secs: file.vad.stop_secs.unwrap_or(vad_defaults.stop_secs),
            },
        };

        let port = match env("HEARSAY_PORT") {
            Some(port) => port
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid HEARSAY_PORT {port:?}: {e}")))?,
            None => file.server.port.unwrap_or(defaults.server.port),
        };
        let server = ServerConfig {
            host: env("HEARSAY_HOST")
                .or(file.server.host)
                .unwrap_or(defaults.server.host),
            port,
        };

        let pipeline = PipelineConfig {
            enable_metrics: file
                .pipeline
                .enable_metrics
                .unwrap_or(defaults.pipeline.enable_metrics),
            enable_usage_metrics: file
                .pipeline
                .enable_usage_metrics
                .unwrap_or(defaults.pipeline.enable_usage_metrics),
            allow_interruptions: file
                .pipeline
                .allow_interruptions
                .unwrap_or(defaults.pipeline.allow_interruptions),
        };

        let config = Self {
            stt,
            llm,
            tts,
            vad,
            server,
            pipeline,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check service addresses and audio settings
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        check_url("stt.uri", &self.stt.uri, &["ws", "wss"])?;
        check_url("llm.base_url", &self.llm.base_url, &["http", "https"])?;
        check_url("tts.base_url", &self.tts.base_url, &["http", "https"])?;

        if self.stt.sample_rate == 0 || self.tts.sample_rate == 0 {
            return Err(Error::Config("sample rates must be non-zero".to_string()));
        }
        if self.tts.chunk_size < 2 {
            return Err(Error::Config(
                "tts.chunk_size must hold at least one sample".to_string(),
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(Error::Config("llm.model must not be empty".to_string()));
        }
        let vad = &self.vad.params;
        if !(0.0..=1.0).contains(&vad.threshold) || vad.start_secs < 0.0 || vad.stop_secs < 0.0 {
            return Err(Error::Config(
                "vad.threshold must be within 0-1 and durations non-negative".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn stt_params(&self) -> VoskSttParams {
        VoskSttParams {
            uri: self.stt.uri.clone(),
            sample_rate: self.stt.sample_rate,
            language: self.stt.language.clone(),
            audio_passthrough: self.stt.audio_passthrough,
            ..VoskSttParams::default()
        }
    }

    #[must_use]
    pub fn llm_params(&self) -> OpenAiLlmParams {
        OpenAiLlmParams {
            base_url: self.llm.base_url.clone(),
            model: self.llm.model.clone(),
            api_key: SecretString::from(self.llm.api_key.expose_secret()),
            temperature: self.llm.temperature,
            max_tokens: self.llm.max_tokens,
        }
    }

    #[must_use]
    pub fn tts_params(&self) -> PocketTtsParams {
        PocketTtsParams {
            base_url: self.tts.base_url.clone(),
            voice: self.tts.voice.clone(),
            sample_rate: self.tts.sample_rate,
            chunk_size: self.tts.chunk_size,
        }
    }

    /// VAD parameters, or `None` when detection is disabled
    #[must_use]
    pub const fn vad_params(&self) -> Option<VadParams> {
        if self.vad.enabled {
            Some(self.vad.params)
        } else {
            None
        }
    }

    #[must_use]
    pub fn pipeline_params(&self) -> PipelineParams {
        PipelineParams {
            enable_metrics: self.pipeline.enable_metrics,
            enable_usage_metrics: self.pipeline.enable_usage_metrics,
            allow_interruptions: self.pipeline.allow_interruptions,
            audio_in_sample_rate: self.stt.sample_rate,
            audio_out_sample_rate: self.tts.sample_rate,
            ..PipelineParams::default()
        }
    }
}

fn check_url(field: &str, value: &str, schemes: &[&str]) -> Result<()> {
    let url = url::Url::parse(value)
        .map_err(|e| Error::Config(format!("{field}: invalid url {value:?}: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(Error::Config(format!(
            "{field}: expected {} url, got {value:?}",
            schemes.join("/")
        )));
    }
    Ok(())
}
