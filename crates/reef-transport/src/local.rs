use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::channel::{ChannelHandle, ListenerId};
use crate::{MessageSink, ReconnectListener, Transport};

/// In-memory transport for tests and in-process relays.
///
/// The production websocket transport lives outside this workspace; this
/// implementation provides the same channel-identity and reconnect-event
/// contract without a wire.
#[derive(Default)]
pub struct LocalTransport {
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, Arc<ChannelHandle>>>,
    reconnect: Mutex<Vec<(ListenerId, ReconnectListener)>>,
    sink: Mutex<Option<Arc<dyn MessageSink>>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            ..Self::default()
        })
    }

    /// Wires the server half in. Channels opened before or after the sink
    /// attaches both route their sends through it.
    pub fn attach_sink(&self, sink: Arc<dyn MessageSink>) {
        for channel in self.channels.lock().values() {
            channel.attach_outbound(sink.clone());
        }
        *self.sink.lock() = Some(sink);
    }

    /// Simulates connectivity loss and recovery; fires every reconnect
    /// listener in registration order.
    pub fn trigger_reconnect(&self) {
        let snapshot: Vec<ReconnectListener> = self
            .reconnect
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        debug!(target: "reef.channel", listeners = snapshot.len(), "reconnected");
        for listener in snapshot {
            listener();
        }
    }

    pub fn reconnect_listener_count(&self) -> usize {
        self.reconnect.lock().len()
    }
}

impl Transport for LocalTransport {
    fn channel(&self, name: &str) -> Arc<ChannelHandle> {
        let mut channels = self.channels.lock();
        if let Some(existing) = channels.get(name) {
            return existing.clone();
        }
        let channel = ChannelHandle::new(name);
        if let Some(sink) = self.sink.lock().clone() {
            channel.attach_outbound(sink);
        }
        channels.insert(name.to_string(), channel.clone());
        channel
    }

    fn on_reconnect(&self, listener: ReconnectListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.reconnect.lock().push((id, listener));
        id
    }

    fn remove_reconnect_listener(&self, id: ListenerId) {
        self.reconnect
            .lock()
            .retain(|(registered, _)| *registered != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_proto::{ChannelEvent, Envelope, Frame};

    #[test]
    fn same_name_returns_same_handle() {
        let transport = LocalTransport::new();
        let first = transport.channel("host");
        let second = transport.channel("host");
        let other = transport.channel("target");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn channels_do_not_leak_listeners_across_names() {
        let transport = LocalTransport::new();
        let host = transport.channel("host");
        let target = transport.channel("target");

        let hits = Arc::new(Mutex::new(0u32));
        let host_hits = hits.clone();
        host.on(
            ChannelEvent::Data,
            Arc::new(move |_, _| *host_hits.lock() += 1),
        );

        target.emit(
            ChannelEvent::Data,
            &Frame::Data(Envelope::ok(serde_json::json!({}))),
        );
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn reconnect_listeners_register_and_remove() {
        let transport = LocalTransport::new();
        let fired = Arc::new(Mutex::new(0u32));

        let first = fired.clone();
        let id = transport.on_reconnect(Arc::new(move || *first.lock() += 1));
        transport.trigger_reconnect();
        assert_eq!(*fired.lock(), 1);

        transport.remove_reconnect_listener(id);
        transport.trigger_reconnect();
        assert_eq!(*fired.lock(), 1);
        assert_eq!(transport.reconnect_listener_count(), 0);
    }

    #[test]
    fn sends_route_through_attached_sink() {
        struct Recorder(Mutex<Vec<(String, ChannelEvent)>>);
        impl MessageSink for Recorder {
            fn deliver(
                &self,
                channel: &str,
                event: ChannelEvent,
                _frame: Frame,
                _ack: Option<Arc<crate::Ack>>,
            ) {
                self.0.lock().push((channel.to_string(), event));
            }
        }

        let transport = LocalTransport::new();
        let early = transport.channel("early");
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        transport.attach_sink(recorder.clone());
        let late = transport.channel("late");

        early
            .send(ChannelEvent::Request, Frame::Stop, None)
            .expect("send ok");
        late.send(ChannelEvent::Request, Frame::Stop, None)
            .expect("send ok");

        let seen = recorder.0.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "early");
        assert_eq!(seen[1].0, "late");
    }
}
