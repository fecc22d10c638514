//! Service adapters against in-process mock servers

use std::time::Duration;

use axum::http::StatusCode;
use hearsay::frames::{AudioRaw, Frame, LlmContext, Message, MetricsKind};
use hearsay::pipeline::{Pipeline, PipelineParams, PipelineTask, TaskEvent, TaskOutcome};
use hearsay::processors::context_aggregator_pair;
use hearsay::services::openai::{OpenAiClient, StreamEvent};
use hearsay::services::pocket_tts::PocketTtsClient;
use hearsay::services::vosk::{VoskConnection, VoskResult};
use hearsay::services::{
    OpenAiLlmParams, OpenAiLlmService, PocketTtsParams, PocketTtsService, RetryPolicy,
    VoskSttParams, VoskSttService,
};
use hearsay::{Error, FrameProcessor};

mod common;
use common::{Collector, MockLlm, MockTts, MockVosk, wait_until};

fn llm_params(base_url: &str) -> OpenAiLlmParams {
    OpenAiLlmParams {
        base_url: base_url.to_string(),
        model: "test-model".to_string(),
        ..OpenAiLlmParams::default()
    }
}

fn tts_params(base_url: &str) -> PocketTtsParams {
    PocketTtsParams {
        base_url: base_url.to_string(),
        voice: Some("alba".to_string()),
        ..PocketTtsParams::default()
    }
}

async fn run_with(
    service: Box<dyn FrameProcessor>,
    params: PipelineParams,
    frames: Vec<Frame>,
) -> (Collector, Vec<TaskEvent>) {
    let collector = Collector::new();
    let task = PipelineTask::new(Pipeline::new(vec![service, collector.boxed()]), params);
    let mut events = task.events();
    let handle = task.handle();

    handle.queue_frames(frames).unwrap();
    handle.stop_when_done().unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(15), task.run())
        .await
        .expect("pipeline did not finish")
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Completed);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    (collector, seen)
}

fn count(names: &[&str], name: &str) -> usize {
    names.iter().filter(|n| **n == name).count()
}

async fn finish(running: tokio::task::JoinHandle<hearsay::Result<TaskOutcome>>) {
    let outcome = tokio::time::timeout(Duration::from_secs(15), running)
        .await
        .expect("pipeline did not finish")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Completed);
}

// -- language model ----------------------------------------------------------------

#[tokio::test]
async fn completion_streams_deltas_and_usage() {
    let mock = MockLlm::new(&["Hello", " there", "!"]);
    let client = OpenAiClient::new(llm_params(&mock.spawn().await));

    let mut events = Vec::new();
    tokio_test::assert_ok!(
        client
            .stream_chat(&[Message::user("hi")], |event| {
                events.push(event);
                Ok(())
            })
            .await
    );

    assert_eq!(events.len(), 4);
    assert_eq!(events[0], StreamEvent::Text("Hello".to_string()));
    assert_eq!(
        events[3],
        StreamEvent::Usage {
            prompt_tokens: 12,
            completion_tokens: 5
        }
    );

    let requests = mock.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["model"], "test-model");
    assert_eq!(requests[0]["stream"], true);
    assert_eq!(requests[0]["messages"][0]["role"], "user");
    assert_eq!(requests[0]["messages"][0]["content"], "hi");
}

#[tokio::test]
async fn complete_returns_the_full_response() {
    let mock = MockLlm::new(&["Four", " score"]);
    let client = OpenAiClient::new(llm_params(&mock.spawn().await));

    let mut streamed = Vec::new();
    let text = client
        .complete(&[Message::user("go")], |delta| streamed.push(delta.to_string()))
        .await
        .unwrap();

    assert_eq!(text, "Four score");
    assert_eq!(streamed, vec!["Four", " score"]);
}

#[tokio::test]
async fn server_errors_surface_as_llm_errors() {
    let mock = MockLlm::failing(StatusCode::SERVICE_UNAVAILABLE);
    let client = OpenAiClient::new(llm_params(&mock.spawn().await));

    let err = tokio_test::assert_err!(client.complete(&[Message::user("hi")], |_| {}).await);
    assert!(matches!(err, Error::Llm(ref message) if message.contains("503")));
}

#[tokio::test]
async fn llm_service_brackets_responses() {
    let mock = MockLlm::new(&["Hi", " there."]);
    let service = OpenAiLlmService::new(llm_params(&mock.spawn().await));
    let context = LlmContext::new(vec![Message::system("be brief"), Message::user("hello")]);

    let (collector, _) = run_with(
        Box::new(service),
        PipelineParams::default(),
        vec![Frame::LlmContext(context)],
    )
    .await;

    assert_eq!(
        collector.names(),
        vec!["LlmResponseStart", "LlmText", "LlmText", "LlmResponseEnd"]
    );
    assert_eq!(collector.texts(), vec!["Hi", " there."]);
    assert_eq!(mock.requests()[0]["messages"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn newer_context_closes_the_superseded_response() {
    let mock = MockLlm::new(&["Hello ", "world."]).with_delay(Duration::from_millis(300));
    let service = OpenAiLlmService::new(llm_params(&mock.spawn().await));
    let (_user, assistant) = context_aggregator_pair(LlmContext::default());
    let context = assistant.context();
    let collector = Collector::new();
    let params = PipelineParams {
        allow_interruptions: false,
        ..PipelineParams::default()
    };
    let task = PipelineTask::new(
        Pipeline::new(vec![Box::new(service), collector.boxed(), Box::new(assistant)]),
        params,
    );
    let handle = task.handle();
    let running = tokio::spawn(task.run());

    handle
        .queue_frame(Frame::LlmContext(LlmContext::new(vec![Message::user("first")])))
        .unwrap();
    wait_until(Duration::from_secs(5), || collector.texts().len() == 1).await;
    handle
        .queue_frame(Frame::LlmContext(LlmContext::new(vec![Message::user("second")])))
        .unwrap();
    handle.stop_when_done().unwrap();
    finish(running).await;

    assert_eq!(
        collector.names(),
        vec![
            "LlmResponseStart",
            "LlmText",
            "LlmResponseEnd",
            "LlmResponseStart",
            "LlmText",
            "LlmText",
            "LlmResponseEnd",
        ]
    );
    assert_eq!(
        context.lock().await.messages,
        vec![Message::assistant("Hello"), Message::assistant("Hello world.")]
    );
    assert_eq!(mock.requests().len(), 2);
}

#[tokio::test]
async fn interruption_stops_generation_before_it_is_forwarded() {
    let mock = MockLlm::new(&["One. ", "Two. ", "Three."]).with_delay(Duration::from_millis(200));
    let service = OpenAiLlmService::new(llm_params(&mock.spawn().await));
    let collector = Collector::new();
    let task = PipelineTask::new(
        Pipeline::new(vec![Box::new(service), collector.boxed()]),
        PipelineParams::default(),
    );
    let handle = task.handle();
    let running = tokio::spawn(task.run());

    handle
        .queue_frame(Frame::LlmContext(LlmContext::new(vec![Message::user("count")])))
        .unwrap();
    wait_until(Duration::from_secs(5), || !collector.texts().is_empty()).await;
    handle.queue_frame(Frame::Interruption).unwrap();
    // Long enough for the rest of the stream to have arrived
    tokio::time::sleep(Duration::from_millis(700)).await;
    handle.stop_when_done().unwrap();
    finish(running).await;

    assert_eq!(
        collector.names(),
        vec!["LlmResponseStart", "LlmText", "Interruption", "LlmResponseEnd"]
    );
    assert_eq!(collector.texts(), vec!["One. "]);
}

#[tokio::test]
async fn llm_service_reports_usage_when_enabled() {
    let mock = MockLlm::new(&["ok"]);
    let service = OpenAiLlmService::new(llm_params(&mock.spawn().await));
    let params = PipelineParams {
        enable_metrics: true,
        enable_usage_metrics: true,
        ..PipelineParams::default()
    };

    let (collector, _) = run_with(
        Box::new(service),
        params,
        vec![Frame::LlmContext(LlmContext::new(vec![Message::user("hi")]))],
    )
    .await;

    let kinds: Vec<MetricsKind> = collector
        .frames()
        .into_iter()
        .filter_map(|f| match f {
            Frame::Metrics(data) => Some(data.kind),
            _ => None,
        })
        .collect();
    assert!(kinds.contains(&MetricsKind::LlmUsage {
        prompt_tokens: 12,
        completion_tokens: 5
    }));
    assert!(kinds.iter().any(|k| matches!(k, MetricsKind::Ttfb { .. })));
    assert!(kinds.iter().any(|k| matches!(k, MetricsKind::Processing { .. })));
}

#[tokio::test]
async fn llm_failure_is_a_non_fatal_error() {
    let mock = MockLlm::failing(StatusCode::INTERNAL_SERVER_ERROR);
    let service = OpenAiLlmService::new(llm_params(&mock.spawn().await));

    let (collector, events) = run_with(
        Box::new(service),
        PipelineParams::default(),
        vec![Frame::LlmContext(LlmContext::new(vec![Message::user("hi")]))],
    )
    .await;

    assert_eq!(collector.names(), vec!["LlmResponseStart", "LlmResponseEnd"]);
    assert!(events.iter().any(|e| matches!(
        e,
        TaskEvent::Error(error) if !error.fatal && error.message.starts_with("OpenAI LLM error")
    )));
}

// -- speech synthesis --------------------------------------------------------------

#[tokio::test]
async fn synthesize_strips_the_wav_header() {
    let mock = MockTts::new(9600);
    let client = PocketTtsClient::new(tts_params(&mock.spawn().await));

    let audio = tokio_test::assert_ok!(client.synthesize("Hello.").await);

    assert_eq!(audio.audio.len(), 9600);
    assert_eq!(audio.sample_rate, 24_000);
    assert_eq!(audio.num_channels, 1);
    assert_eq!(mock.texts(), vec!["Hello."]);
    assert_eq!(*mock.voices.lock().unwrap(), vec!["alba".to_string()]);
}

#[tokio::test]
async fn synthesis_failure_reports_the_status() {
    let mock = MockTts::failing(StatusCode::INTERNAL_SERVER_ERROR);
    let client = PocketTtsClient::new(tts_params(&mock.spawn().await));

    let err = tokio_test::assert_err!(client.synthesize("Hello.").await);
    assert!(matches!(err, Error::Tts(ref message) if message == "Pocket TTS error: 500"));
}

#[tokio::test]
async fn tts_service_speaks_each_sentence() {
    let mock = MockTts::new(9600);
    let service = PocketTtsService::new(tts_params(&mock.spawn().await));

    let (collector, _) = run_with(
        Box::new(service),
        PipelineParams::default(),
        vec![
            Frame::LlmResponseStart,
            Frame::LlmText("Hello there. How".to_string()),
            Frame::LlmText(" are you?".to_string()),
            Frame::LlmResponseEnd,
        ],
    )
    .await;

    assert_eq!(mock.texts(), vec!["Hello there.", "How are you?"]);

    let names = collector.names();
    assert_eq!(count(&names, "TtsStarted"), 2);
    assert_eq!(count(&names, "TtsStopped"), 2);
    // Model text keeps flowing for the assistant side
    assert_eq!(collector.texts(), vec!["Hello there. How", " are you?"]);

    let audio: Vec<AudioRaw> = collector
        .frames()
        .into_iter()
        .filter_map(|f| match f {
            Frame::OutputAudio(audio) => Some(audio),
            _ => None,
        })
        .collect();
    // 9600 bytes per sentence in 4800 byte frames
    assert_eq!(audio.len(), 4);
    assert!(audio.iter().all(|a| a.audio.len() == 4800 && a.sample_rate == 24_000));
}

#[tokio::test]
async fn tts_service_speaks_direct_requests() {
    let mock = MockTts::new(4800);
    let service = PocketTtsService::new(tts_params(&mock.spawn().await));

    let (collector, _) = run_with(
        Box::new(service),
        PipelineParams::default(),
        vec![
            Frame::TtsSpeak("Welcome back".to_string()),
            Frame::TtsSpeak("  ".to_string()),
        ],
    )
    .await;

    assert_eq!(mock.texts(), vec!["Welcome back"]);
    assert_eq!(
        collector.names(),
        vec!["TtsStarted", "OutputAudio", "TtsStopped"]
    );
}

#[tokio::test]
async fn interrupted_sentence_is_still_closed() {
    // 800ms of audio arriving 100ms at a time
    let mock = MockTts::new(38_400).with_delay(Duration::from_millis(50));
    let service = PocketTtsService::new(tts_params(&mock.spawn().await));
    let collector = Collector::new();
    let task = PipelineTask::new(
        Pipeline::new(vec![Box::new(service), collector.boxed()]),
        PipelineParams::default(),
    );
    let handle = task.handle();
    let running = tokio::spawn(task.run());

    handle
        .queue_frame(Frame::TtsSpeak("Hello there.".to_string()))
        .unwrap();
    wait_until(Duration::from_secs(5), || {
        collector.names().contains(&"OutputAudio")
    })
    .await;
    handle.queue_frame(Frame::Interruption).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.stop_when_done().unwrap();
    finish(running).await;

    let names = collector.names();
    assert_eq!(count(&names, "TtsStarted"), 1);
    assert_eq!(count(&names, "TtsStopped"), 1);
    assert!(count(&names, "OutputAudio") < 8);

    let interruption = names.iter().position(|n| *n == "Interruption").unwrap();
    assert_eq!(names.last(), Some(&"TtsStopped"));
    assert!(!names[interruption..].contains(&"OutputAudio"));
}

#[tokio::test]
async fn tts_failure_still_closes_the_utterance() {
    let mock = MockTts::failing(StatusCode::INTERNAL_SERVER_ERROR);
    let service = PocketTtsService::new(tts_params(&mock.spawn().await));

    let (collector, events) = run_with(
        Box::new(service),
        PipelineParams::default(),
        vec![Frame::TtsSpeak("Hello.".to_string())],
    )
    .await;

    assert_eq!(collector.names(), vec!["TtsStopped"]);
    assert!(events.iter().any(|e| matches!(
        e,
        TaskEvent::Error(error) if error.message == "Pocket TTS error: 500"
    )));
}

// -- speech recognition ------------------------------------------------------------

#[tokio::test]
async fn vosk_connection_round_trip() {
    let mock = MockVosk::new("hello world", 6400);
    let uri = mock.spawn().await;

    let mut connection = tokio_test::assert_ok!(VoskConnection::connect(&uri, 16_000).await);
    connection.send_audio(vec![0u8; 3200].into()).await.unwrap();
    assert_eq!(
        connection.next_result().await.unwrap(),
        Some(VoskResult::Partial("hel".to_string()))
    );

    connection.send_audio(vec![0u8; 3200].into()).await.unwrap();
    assert_eq!(
        connection.next_result().await.unwrap(),
        Some(VoskResult::Final("hello world".to_string()))
    );

    // Nothing pending: the empty final result is skipped and the server closes
    connection.send_eof().await.unwrap();
    assert_eq!(connection.next_result().await.unwrap(), None);

    assert_eq!(mock.received(), 6400);
    let configs = mock.configs.lock().unwrap().clone();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0]["config"]["sample_rate"], 16_000);
}

#[tokio::test]
async fn vosk_service_pushes_interim_and_final_transcriptions() {
    let mock = MockVosk::new("turn on the lights", 6400);
    let service = VoskSttService::new(VoskSttParams {
        uri: mock.spawn().await,
        audio_passthrough: false,
        user_id: "caller".to_string(),
        ..VoskSttParams::default()
    });

    let chunks = (0..4)
        .map(|_| Frame::InputAudio(AudioRaw::new(vec![0u8; 3200], 16_000, 1)))
        .collect();
    let (collector, _) = run_with(Box::new(service), PipelineParams::default(), chunks).await;

    let names = collector.names();
    assert_eq!(count(&names, "InputAudio"), 0);
    assert_eq!(count(&names, "InterimTranscription"), 3);

    let finals: Vec<_> = collector
        .frames()
        .into_iter()
        .filter_map(|f| match f {
            Frame::Transcription(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].text, "turn on the lights");
    assert_eq!(finals[0].user_id, "caller");
    assert_eq!(finals[0].language, "en");
    assert_eq!(mock.received(), 12_800);
}

#[tokio::test]
async fn vosk_service_flushes_the_last_utterance_on_end() {
    let mock = MockVosk::new("goodbye", usize::MAX);
    let service = VoskSttService::new(VoskSttParams {
        uri: mock.spawn().await,
        ..VoskSttParams::default()
    });

    let (collector, _) = run_with(
        Box::new(service),
        PipelineParams::default(),
        vec![Frame::InputAudio(AudioRaw::new(vec![0u8; 3200], 16_000, 1))],
    )
    .await;

    let names = collector.names();
    // Passthrough is on by default
    assert_eq!(count(&names, "InputAudio"), 1);
    assert_eq!(count(&names, "Transcription"), 1);
}

#[tokio::test]
async fn unreachable_vosk_is_a_non_fatal_start_error() {
    // Bind then drop to get a port nobody listens on
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let service = VoskSttService::new(VoskSttParams {
        uri: format!("ws://{addr}"),
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        },
        ..VoskSttParams::default()
    });

    let (_, events) = run_with(Box::new(service), PipelineParams::default(), Vec::new()).await;

    assert!(events.iter().any(|e| matches!(
        e,
        TaskEvent::Error(error) if !error.fatal && error.message.contains("failed to start")
    )));
}
