//! Frame processors shared by every transport
//!
//! - [`AudioInput`] / [`AudioOutput`]: transport edges (VAD, paced playback)
//! - [`UserContextAggregator`] / [`AssistantContextAggregator`]: conversation context
//! - [`ClientEventReporter`]: conversation events for the client
//! - [`SentenceAggregator`]: sentence splitting for speech synthesis

mod aggregators;
mod client_events;
mod input;
mod output;
mod sentence;

pub use aggregators::{
    AssistantContextAggregator, SharedContext, UserContextAggregator, context_aggregator_pair,
};
pub use client_events::{ClientEvent, ClientEventReporter, ReporterRole};
pub use input::AudioInput;
pub use output::{AudioOutput, AudioSink, ChannelSink};
pub use sentence::SentenceAggregator;
