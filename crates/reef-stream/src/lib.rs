//! Client-side realtime core: pipelines, extended channels, and stream
//! lifecycle management.
//!
//! Responsibilities:
//! - running ordered transform pipelines over inbound messages
//! - replaying the last known value to late subscribers
//! - owning one logical stream's lifecycle across start/stop/restart
//! - pausing and resuming subscriptions with page visibility

mod channel;
mod error;
mod immutable;
mod pipeline;
mod scope;
mod session;
mod stream;
mod visibility;

pub use channel::{ApplyFn, DataHandler, ExtendedChannel};
pub use error::{tracing_sink, ExceptionSink, StreamError};
pub use immutable::ImmutableStream;
pub use pipeline::{run_pipeline, Pipe};
pub use scope::Scope;
pub use session::Session;
pub use stream::{BeforeStreamingHook, Stream, StreamConfig};
pub use visibility::PageVisibility;

/// Apply boundary that invokes the callback directly, for callers without
/// a UI binding context.
pub fn direct_apply() -> ApplyFn {
    std::sync::Arc::new(|callback| callback())
}
