//! Channel abstraction over one physical connection.
//!
//! A [`Transport`] multiplexes many named logical channels over a single
//! wire. Each [`ChannelHandle`] carries its own listener registry and an
//! acknowledgement primitive; nothing here knows about pipelines, streams,
//! or routing — that lives in `reef-stream` and `reef-relay`.

use std::sync::Arc;

use reef_proto::{ChannelEvent, Frame};
use thiserror::Error;

mod channel;
mod local;

pub use channel::{Ack, AckCallback, ChannelHandle, Listener, ListenerId, Off};
pub use local::LocalTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport error: {0}")]
    Wire(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

pub type ReconnectListener = Arc<dyn Fn() + Send + Sync>;

/// One physical connection exposing named logical channels.
///
/// Opening the same name twice on the same transport returns the same
/// handle, so independent callers cooperate on delivery rather than
/// fighting over it.
pub trait Transport: Send + Sync {
    fn channel(&self, name: &str) -> Arc<ChannelHandle>;

    /// Fires after connectivity loss and recovery.
    fn on_reconnect(&self, listener: ReconnectListener) -> ListenerId;

    fn remove_reconnect_listener(&self, id: ListenerId);
}

/// Server side of an in-process transport: receives everything the client
/// half `send`s.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, channel: &str, event: ChannelEvent, frame: Frame, ack: Option<Arc<Ack>>);
}
