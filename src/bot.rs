//! Bot assembly: the canonical voice pipeline for one conversation

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::frames::{Frame, LlmContext, Message};
use crate::pipeline::{
    FrameLogObserver, FrameProcessor, Observer, Pipeline, PipelineRunner, PipelineTask, TaskHandle,
    TaskOutcome, TurnLatencyObserver,
};
use crate::processors::{
    AudioInput, AudioOutput, AudioSink, ClientEvent, ClientEventReporter, SharedContext,
    context_aggregator_pair,
};
use crate::services::{OpenAiLlmService, PocketTtsService, VoskSttService};
use crate::Result;

/// A pipeline ready to run, with the handles a transport needs
pub struct BotSession {
    pub task: PipelineTask,
    /// Conversation so far, shared by both aggregators
    pub context: SharedContext,
    pub latency: Arc<TurnLatencyObserver>,
    greeting: Option<String>,
}

impl BotSession {
    /// Handle for feeding input audio and typed turns
    #[must_use]
    pub fn handle(&self) -> TaskHandle {
        self.task.handle()
    }
}

/// Assemble the pipeline for one conversation
///
/// ```text
/// input ─► stt ─► user events ─► user context ─► llm ─► tts ─► output ─► bot events ─► assistant context
/// ```
///
/// Input audio is queued through the task handle; bot audio goes to `output`
/// and conversation events to `events`.
#[must_use]
pub fn build_pipeline(
    config: &Config,
    output: Arc<dyn AudioSink>,
    events: mpsc::UnboundedSender<ClientEvent>,
) -> BotSession {
    let context = LlmContext::new(vec![Message::system(config.llm.system_prompt.clone())]);
    let (user_aggregator, assistant_aggregator) = context_aggregator_pair(context);
    let shared = user_aggregator.context();

    let processors: Vec<Box<dyn FrameProcessor>> = vec![
        Box::new(AudioInput::new(config.vad_params())),
        Box::new(VoskSttService::new(config.stt_params())),
        Box::new(ClientEventReporter::user(events.clone())),
        Box::new(user_aggregator),
        Box::new(OpenAiLlmService::new(config.llm_params())),
        Box::new(PocketTtsService::new(config.tts_params())),
        Box::new(AudioOutput::new(output)),
        Box::new(ClientEventReporter::bot(events)),
        Box::new(assistant_aggregator),
    ];
    let pipeline = Pipeline::new(processors);
    tracing::debug!(processors = ?pipeline.processor_names(), "pipeline assembled");

    let latency = Arc::new(TurnLatencyObserver::new());
    let mut params = config.pipeline_params();
    params.observers = vec![
        Arc::new(FrameLogObserver) as Arc<dyn Observer>,
        Arc::clone(&latency) as Arc<dyn Observer>,
    ];

    BotSession {
        task: PipelineTask::new(pipeline, params),
        context: shared,
        latency,
        greeting: config.llm.greeting.clone(),
    }
}

/// Ask the model to open the conversation
///
/// # Errors
///
/// Returns [`crate::Error::PipelineClosed`] if the task is no longer running
pub fn greet(handle: &TaskHandle, instruction: &str) -> Result<()> {
    tracing::debug!("queueing greeting");
    handle.queue_frame(Frame::LlmMessagesAppend {
        messages: vec![Message::system(instruction)],
        run_llm: true,
    })
}

/// Queue a typed user turn, optionally interrupting the bot first
///
/// # Errors
///
/// Returns [`crate::Error::PipelineClosed`] if the task is no longer running
pub fn send_text(handle: &TaskHandle, text: &str, interrupt: bool) -> Result<()> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }
    if interrupt {
        handle.queue_frame(Frame::Interruption)?;
    }
    handle.queue_frame(Frame::LlmMessagesAppend {
        messages: vec![Message::user(text)],
        run_llm: true,
    })
}

/// Greet, then run the session until it ends or is cancelled
///
/// # Errors
///
/// Propagates errors from the pipeline task
pub async fn run_session(session: BotSession, runner: PipelineRunner) -> Result<TaskOutcome> {
    let BotSession {
        task,
        latency,
        greeting,
        ..
    } = session;

    if let Some(greeting) = greeting.as_deref() {
        greet(&task.handle(), greeting)?;
    }

    let outcome = runner.run(task).await?;
    if let Some(last) = latency.last_latency() {
        tracing::debug!(latency_ms = last.as_millis(), "last turn latency");
    }
    Ok(outcome)
}
