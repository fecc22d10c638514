//! Frame pipeline runtime
//!
//! A [`Pipeline`] is an ordered list of [`FrameProcessor`]s. Running it in a
//! [`PipelineTask`] spawns one task per processor, connected by mailboxes in
//! both directions:
//!
//! ```text
//!  TaskHandle ──► p0 ──► p1 ──► ... ──► pN ──► tail (End / Cancel detection)
//!  head (errors) ◄── p0 ◄── p1 ◄── ... ◄── pN
//! ```

mod observer;
mod processor;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;

pub use observer::{FrameLogObserver, FramePushed, Observer, TurnLatencyObserver};
pub use processor::{FrameProcessor, FrameSink};

use processor::{Mailbox, Port, mailbox, run_processor};

use crate::frames::{ErrorFrame, Frame, FrameDirection, StartParams};
use crate::Result;

/// Default time to wait for a cancel frame to drain before aborting
const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// An ordered list of processors
pub struct Pipeline {
    processors: Vec<Box<dyn FrameProcessor>>,
}

impl Pipeline {
    #[must_use]
    pub fn new(processors: Vec<Box<dyn FrameProcessor>>) -> Self {
        Self { processors }
    }

    /// Names of the processors in order
    #[must_use]
    pub fn processor_names(&self) -> Vec<String> {
        self.processors.iter().map(|p| p.name().to_string()).collect()
    }
}

/// Options for a pipeline run
#[derive(Clone)]
pub struct PipelineParams {
    pub enable_metrics: bool,
    pub enable_usage_metrics: bool,
    pub allow_interruptions: bool,
    pub audio_in_sample_rate: u32,
    pub audio_out_sample_rate: u32,
    pub observers: Vec<Arc<dyn Observer>>,
    /// How long a cancel may take before processor tasks are aborted
    pub cancel_timeout: Duration,
}

impl Default for PipelineParams {
    fn default() -> Self {
        let start = StartParams::default();
        Self {
            enable_metrics: start.enable_metrics,
            enable_usage_metrics: start.enable_usage_metrics,
            allow_interruptions: start.allow_interruptions,
            audio_in_sample_rate: start.audio_in_sample_rate,
            audio_out_sample_rate: start.audio_out_sample_rate,
            observers: Vec::new(),
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
        }
    }
}

impl PipelineParams {
    #[must_use]
    pub const fn start_params(&self) -> StartParams {
        StartParams {
            enable_metrics: self.enable_metrics,
            enable_usage_metrics: self.enable_usage_metrics,
            allow_interruptions: self.allow_interruptions,
            audio_in_sample_rate: self.audio_in_sample_rate,
            audio_out_sample_rate: self.audio_out_sample_rate,
        }
    }
}

/// How a pipeline run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The end frame reached the tail
    Completed,
    /// The run was cancelled (by a handle or a fatal error)
    Cancelled,
}

/// Events published while a task runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// An error frame reached the head of the pipeline
    Error(ErrorFrame),
    Finished(TaskOutcome),
}

/// Cloneable handle for feeding and controlling a running task
#[derive(Clone)]
pub struct TaskHandle {
    head: Port,
    cancel: Arc<watch::Sender<bool>>,
}

impl TaskHandle {
    /// Queue a frame at the head of the pipeline
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PipelineClosed`] once the first processor is gone
    pub fn queue_frame(&self, frame: Frame) -> Result<()> {
        self.head.send(frame, FrameDirection::Downstream)
    }

    /// Queue several frames in order
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PipelineClosed`] once the first processor is gone
    pub fn queue_frames(&self, frames: impl IntoIterator<Item = Frame>) -> Result<()> {
        frames.into_iter().try_for_each(|frame| self.queue_frame(frame))
    }

    /// Finish gracefully once everything queued so far has been processed
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PipelineClosed`] once the first processor is gone
    pub fn stop_when_done(&self) -> Result<()> {
        self.queue_frame(Frame::End)
    }

    /// Stop as soon as possible, dropping queued work
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }
}

/// A pipeline bound to its parameters, ready to run
pub struct PipelineTask {
    processors: Vec<Box<dyn FrameProcessor>>,
    mailboxes: Vec<Mailbox>,
    ports: Vec<Port>,
    head_up: (Port, Mailbox),
    tail: (Port, Mailbox),
    params: PipelineParams,
    handle: TaskHandle,
    cancel_rx: watch::Receiver<bool>,
    events: broadcast::Sender<TaskEvent>,
}

impl PipelineTask {
    /// Wire up a pipeline; the start frame is queued immediately so it
    /// always precedes anything queued through a handle
    #[must_use]
    pub fn new(pipeline: Pipeline, params: PipelineParams) -> Self {
        let (ports, mailboxes): (Vec<_>, Vec<_>) =
            pipeline.processors.iter().map(|_| mailbox()).unzip();
        let head_up = mailbox();
        let tail = mailbox();

        let head = ports.first().cloned().unwrap_or_else(|| tail.0.clone());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = TaskHandle {
            head,
            cancel: Arc::new(cancel_tx),
        };
        let (events, _) = broadcast::channel(64);

        let _ = handle.queue_frame(Frame::Start(params.start_params()));

        Self {
            processors: pipeline.processors,
            mailboxes,
            ports,
            head_up,
            tail,
            params,
            handle,
            cancel_rx,
            events,
        }
    }

    /// Handle for queueing frames and cancelling
    #[must_use]
    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    /// Subscribe to task events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Run until the end frame reaches the tail or the task is cancelled
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for parity with service calls
    pub async fn run(self) -> Result<TaskOutcome> {
        let Self {
            processors,
            mailboxes,
            ports,
            head_up: (head_up_port, mut head_up),
            tail: (tail_port, mut tail),
            params,
            handle,
            mut cancel_rx,
            events,
        } = self;

        let observers: Arc<[Arc<dyn Observer>]> = params.observers.clone().into();
        let count = processors.len();
        let mut tasks = JoinSet::new();

        for (index, (processor, mailbox)) in processors.into_iter().zip(mailboxes).enumerate() {
            let downstream = ports
                .get(index + 1)
                .cloned()
                .unwrap_or_else(|| tail_port.clone());
            let upstream = if index == 0 {
                head_up_port.clone()
            } else {
                ports[index - 1].clone()
            };
            let sink = FrameSink::new(processor.name(), downstream, upstream, Arc::clone(&observers));
            tasks.spawn(run_processor(processor, mailbox, sink));
        }
        drop(ports);
        drop(head_up_port);
        drop(tail_port);

        tracing::info!(processors = count, "pipeline task started");

        let mut outcome = loop {
            tokio::select! {
                item = tail.recv() => match item {
                    Some((Frame::End, _)) | None => break TaskOutcome::Completed,
                    Some((Frame::Cancel, _)) => break TaskOutcome::Cancelled,
                    Some((Frame::Error(error), _)) => {
                        if report_error(&events, error) {
                            break cancel_requested(&handle);
                        }
                    }
                    Some(_) => {}
                },
                Some((frame, _)) = head_up.recv() => {
                    if let Frame::Error(error) = frame {
                        if report_error(&events, error) {
                            break cancel_requested(&handle);
                        }
                    }
                }
                Ok(()) = cancel_rx.changed() => {
                    if *cancel_rx.borrow_and_update() {
                        break cancel_requested(&handle);
                    }
                }
            }
        };

        if outcome == TaskOutcome::Cancelled {
            let drained = tokio::time::timeout(params.cancel_timeout, async {
                while let Some((frame, _)) = tail.recv().await {
                    if matches!(frame, Frame::Cancel | Frame::End) {
                        break;
                    }
                }
            })
            .await;
            if drained.is_err() {
                tracing::warn!("cancel timed out, aborting processors");
                tasks.abort_all();
            }
        }

        if tokio::time::timeout(params.cancel_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            tracing::warn!("processors did not exit, aborting");
            tasks.abort_all();
            outcome = TaskOutcome::Cancelled;
        }

        tracing::info!(?outcome, "pipeline task finished");
        let _ = events.send(TaskEvent::Finished(outcome));
        Ok(outcome)
    }
}

/// Publish an error; returns true when it should cancel the task
fn report_error(events: &broadcast::Sender<TaskEvent>, error: ErrorFrame) -> bool {
    let fatal = error.fatal;
    if fatal {
        tracing::error!(error = %error.message, "fatal pipeline error");
    } else {
        tracing::warn!(error = %error.message, "pipeline error");
    }
    let _ = events.send(TaskEvent::Error(error));
    fatal
}

fn cancel_requested(handle: &TaskHandle) -> TaskOutcome {
    tracing::info!("cancelling pipeline task");
    let _ = handle.queue_frame(Frame::Cancel);
    TaskOutcome::Cancelled
}

/// Runs a task, cancelling it on Ctrl-C
#[derive(Debug, Clone, Copy)]
pub struct PipelineRunner {
    handle_sigint: bool,
}

impl Default for PipelineRunner {
    fn default() -> Self {
        Self { handle_sigint: true }
    }
}

impl PipelineRunner {
    #[must_use]
    pub const fn new(handle_sigint: bool) -> Self {
        Self { handle_sigint }
    }

    /// Run the task to completion
    ///
    /// # Errors
    ///
    /// Propagates errors from [`PipelineTask::run`]
    pub async fn run(&self, task: PipelineTask) -> Result<TaskOutcome> {
        let signal = self.handle_sigint.then(|| {
            let handle = task.handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received");
                    handle.cancel();
                }
            })
        });

        let outcome = task.run().await;

        if let Some(signal) = signal {
            signal.abort();
        }
        outcome
    }
}
