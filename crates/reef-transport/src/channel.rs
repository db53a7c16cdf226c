use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use reef_proto::{AckFrame, ChannelEvent, Frame};
use tracing::debug;

use crate::{MessageSink, TransportResult};

/// Callback invoked on a frame arriving for a subscribed event. The ack,
/// when present, lets the listener answer a request/response-style emit.
pub type Listener = Arc<dyn Fn(&Frame, Option<&Arc<Ack>>) + Send + Sync>;

pub type AckCallback = Box<dyn FnOnce(Frame) + Send>;

/// Identifies one registration on one channel. Removal with a stale or
/// foreign id is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Single-use acknowledgement. The first `respond` wins; later calls are
/// dropped with a debug log.
pub struct Ack {
    callback: Mutex<Option<AckCallback>>,
}

impl Ack {
    pub fn new(callback: AckCallback) -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(Some(callback)),
        })
    }

    /// Returns true if this call consumed the acknowledgement.
    pub fn respond(&self, frame: Frame) -> bool {
        match self.callback.lock().take() {
            Some(callback) => {
                callback(frame);
                true
            }
            None => {
                debug!(target: "reef.channel", "ack already consumed, dropping response");
                false
            }
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.callback.lock().is_none()
    }
}

/// Deregistration handle returned by subscription helpers. Calling `off`
/// more than once has no additional effect.
pub struct Off {
    channel: Arc<ChannelHandle>,
    event: ChannelEvent,
    id: Mutex<Option<ListenerId>>,
}

impl Off {
    pub fn new(channel: Arc<ChannelHandle>, event: ChannelEvent, id: ListenerId) -> Self {
        Self {
            channel,
            event,
            id: Mutex::new(Some(id)),
        }
    }

    pub fn off(&self) {
        if let Some(id) = self.id.lock().take() {
            self.channel.remove_listener(self.event, id);
        }
    }
}

/// One named logical channel of the shared transport.
///
/// Listener fan-out preserves registration order; listeners run outside
/// the registry lock so a handler may subscribe or unsubscribe reentrantly.
pub struct ChannelHandle {
    name: String,
    next_id: AtomicU64,
    listeners: Mutex<HashMap<ChannelEvent, Vec<(ListenerId, Listener)>>>,
    outbound: Mutex<Option<Arc<dyn MessageSink>>>,
}

impl ChannelHandle {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn on(&self, event: ChannelEvent, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(event)
            .or_default()
            .push((id, listener));
        id
    }

    /// Removes exactly the registration `id` names. Returns whether a
    /// listener was actually removed.
    pub fn remove_listener(&self, event: ChannelEvent, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        match listeners.get_mut(&event) {
            Some(registered) => {
                let before = registered.len();
                registered.retain(|(registered_id, _)| *registered_id != id);
                before != registered.len()
            }
            None => false,
        }
    }

    pub fn remove_all_listeners(&self) {
        self.listeners.lock().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().values().map(Vec::len).sum()
    }

    /// Local fan-out to subscribed listeners, in registration order.
    pub fn emit(&self, event: ChannelEvent, frame: &Frame) {
        self.fan_out(event, frame, None);
    }

    /// Fan-out carrying an acknowledgement the listeners may answer.
    pub fn emit_with_ack(&self, event: ChannelEvent, frame: &Frame, ack: &Arc<Ack>) {
        self.fan_out(event, frame, Some(ack));
    }

    fn fan_out(&self, event: ChannelEvent, frame: &Frame, ack: Option<&Arc<Ack>>) {
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.lock();
            listeners
                .get(&event)
                .map(|registered| registered.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };
        for listener in snapshot {
            listener(frame, ack);
        }
    }

    /// Transmit toward the remote side of the transport. With no sink
    /// attached (client half running without a server, as in tests) the
    /// acknowledgement resolves immediately so callers awaiting it cannot
    /// hang.
    pub fn send(
        &self,
        event: ChannelEvent,
        frame: Frame,
        ack: Option<AckCallback>,
    ) -> TransportResult<()> {
        let sink = self.outbound.lock().clone();
        let ack = ack.map(Ack::new);
        match sink {
            Some(sink) => sink.deliver(&self.name, event, frame, ack),
            None => {
                debug!(
                    target: "reef.channel",
                    channel = %self.name,
                    event = ?event,
                    "no sink attached, dropping outbound frame"
                );
                if let Some(ack) = ack {
                    ack.respond(Frame::Ack(AckFrame { id: None }));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn attach_outbound(&self, sink: Arc<dyn MessageSink>) {
        *self.outbound.lock() = Some(sink);
    }
}
