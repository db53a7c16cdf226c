use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use reef_proto::{AckFrame, ChannelEvent, Envelope, Frame};
use reef_transport::{Ack, ChannelHandle, LocalTransport, MessageSink, Transport};
use tracing::{debug, warn};

use crate::router::SocketRouter;

/// Server half of an in-process transport: feeds inbound request frames
/// through the socket router and answers transport-internal control
/// frames so client-side acknowledgements always resolve.
pub struct RelayDispatcher {
    router: RwLock<SocketRouter>,
    transport: Weak<LocalTransport>,
}

impl RelayDispatcher {
    /// Builds the dispatcher and wires it in as the transport's sink.
    pub fn attach(transport: &Arc<LocalTransport>, router: SocketRouter) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            router: RwLock::new(router),
            transport: Arc::downgrade(transport),
        });
        transport.attach_sink(dispatcher.clone());
        dispatcher
    }

    pub fn with_router<R>(&self, f: impl FnOnce(&mut SocketRouter) -> R) -> R {
        f(&mut self.router.write())
    }

    fn channel(&self, name: &str) -> Option<Arc<ChannelHandle>> {
        Some(self.transport.upgrade()?.channel(name))
    }
}

impl MessageSink for RelayDispatcher {
    fn deliver(&self, channel: &str, event: ChannelEvent, frame: Frame, ack: Option<Arc<Ack>>) {
        let Some(handle) = self.channel(channel) else {
            debug!(target: "reef.relay", %channel, "transport gone, dropping frame");
            return;
        };

        let Frame::Request(request) = frame else {
            // Control traffic (streaming stop/start the relay does not
            // model, acknowledgements) gets a plain receipt so senders
            // awaiting an ack never hang.
            debug!(target: "reef.relay", %channel, event = ?event, "acknowledging non-request frame");
            if let Some(ack) = ack {
                ack.respond(Frame::Ack(AckFrame { id: None }));
            }
            return;
        };

        let result = self.router.read().go(
            &request.path,
            request.verb,
            handle.clone(),
            request.data,
            ack.clone(),
        );
        if let Err(err) = result {
            warn!(
                target: "reef.relay",
                %channel,
                path = %request.path,
                verb = %request.verb,
                error = %err,
                "request did not route"
            );
            let envelope = Envelope::error(err.status_code(), err.to_string());
            let frame = Frame::Data(envelope);
            match ack {
                Some(ack) => {
                    ack.respond(frame);
                }
                None => handle.emit(ChannelEvent::Data, &frame),
            }
        }
    }
}
