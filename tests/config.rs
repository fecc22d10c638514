//! Configuration loading from files on disk

use std::io::Write;

use hearsay::config::file::load_config_file;
use hearsay::{Config, Error};
use secrecy::ExposeSecret;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn file_settings_reach_the_service_params() {
    let file = write_config(
        r#"
        [stt]
        uri = "ws://vosk.lan:2700"
        sample_rate = 8000
        language = "fr"

        [llm]
        base_url = "http://models.lan:1234/v1"
        model = "qwen3"
        api_key = "sk-local"
        greeting = ""
        temperature = 0.4

        [tts]
        base_url = "http://tts.lan:8000"
        voice = "marius"
        chunk_size = 1920

        [vad]
        enabled = false

        [pipeline]
        enable_metrics = false
        allow_interruptions = false
        "#,
    );

    let parsed = tokio_test::assert_ok!(load_config_file(Some(file.path())));
    let config = Config::from_sources(parsed, |_| None).unwrap();

    let stt = config.stt_params();
    assert_eq!(stt.uri, "ws://vosk.lan:2700");
    assert_eq!(stt.sample_rate, 8000);
    assert_eq!(stt.language, "fr");

    let llm = config.llm_params();
    assert_eq!(llm.base_url, "http://models.lan:1234/v1");
    assert_eq!(llm.model, "qwen3");
    assert_eq!(llm.api_key.expose_secret(), "sk-local");
    assert_eq!(llm.temperature, Some(0.4));
    assert!(config.llm.greeting.is_none());

    let tts = config.tts_params();
    assert_eq!(tts.voice.as_deref(), Some("marius"));
    assert_eq!(tts.chunk_size, 1920);

    assert!(config.vad_params().is_none());

    let params = config.pipeline_params();
    assert!(!params.enable_metrics);
    assert!(!params.allow_interruptions);
    assert_eq!(params.audio_in_sample_rate, 8000);
    assert_eq!(params.audio_out_sample_rate, 24_000);
}

#[test]
fn explicit_file_with_bad_values_fails_validation() {
    let file = write_config("[tts]\nbase_url = \"ws://tts.lan:8000\"\n");

    let err = tokio_test::assert_err!(Config::load(Some(file.path())));
    assert!(matches!(err, Error::Config(ref message) if message.contains("tts.base_url")));
}

#[test]
fn explicit_file_with_unknown_keys_is_rejected() {
    let file = write_config("[stt]\nmodel = \"small-en\"\n");

    tokio_test::assert_err!(load_config_file(Some(file.path())));
}

#[test]
fn vad_settings_are_validated() {
    let file = write_config("[vad]\nthreshold = 1.5\n");
    let parsed = load_config_file(Some(file.path())).unwrap();

    let err = tokio_test::assert_err!(Config::from_sources(parsed, |_| None));
    assert!(matches!(err, Error::Config(_)));
}
