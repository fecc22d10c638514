//! Local transport: microphone in, speaker out

use std::io::Write;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::capture::MicrophoneFeed;
use super::playback::SpeakerSink;
use crate::bot::{self, BotSession};
use crate::config::Config;
use crate::pipeline::{PipelineRunner, TaskOutcome};
use crate::processors::ClientEvent;
use crate::Result;

/// Talk to the bot through the default audio devices until Ctrl-C
///
/// # Errors
///
/// Returns error if an audio device cannot be opened or the pipeline fails
pub async fn run_local(config: &Config) -> Result<TaskOutcome> {
    let speaker = Arc::new(SpeakerSink::new(config.tts.sample_rate)?);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let session: BotSession = bot::build_pipeline(config, speaker.clone(), events_tx);
    let mut microphone = MicrophoneFeed::start(config.stt.sample_rate, session.handle())?;
    let printer = tokio::spawn(print_events(events_rx));

    tracing::info!("local session started, press Ctrl-C to stop");
    let outcome = bot::run_session(session, PipelineRunner::default()).await;

    microphone.stop();
    speaker.close();
    printer.abort();
    outcome
}

/// Show the conversation in the terminal
async fn print_events(mut events: mpsc::UnboundedReceiver<ClientEvent>) {
    let mut bot_line = false;
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::UserTranscription {
                text,
                is_final: true,
                ..
            } => println!("you: {text}"),
            ClientEvent::BotText { text } => {
                if !bot_line {
                    print!("bot: ");
                    bot_line = true;
                }
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            ClientEvent::BotLlmStopped => {
                if bot_line {
                    println!();
                    bot_line = false;
                }
            }
            _ => {}
        }
    }
}
