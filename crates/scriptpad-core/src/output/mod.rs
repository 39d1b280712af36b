//! Output pipeline.
//!
//! An [`OutputHub`] belongs to one environment and holds its subscribers.
//! Every run gets a fresh [`OutputPipeline`] with its own per-channel
//! sequence counters; starting a run closes the previous pipeline.

mod event;
mod pipeline;

pub use event::{FormatHint, OutputChannel, OutputEvent, OutputPayload};
pub(crate) use event::now_ms;
pub use pipeline::{OutputHub, OutputPipeline, OutputSubscription};
