use std::sync::Arc;

use parking_lot::Mutex;
use reef_proto::{ChannelEvent, Envelope, Frame};
use reef_transport::{AckCallback, ChannelHandle, Listener, ListenerId, Off, Transport};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ExceptionSink, StreamError};
use crate::pipeline::{run_pipeline, Pipe};
use crate::session::Session;

/// Change-detection boundary handlers are invoked inside. The UI side
/// supplies one per scope; `direct_apply` invokes callbacks as-is.
pub type ApplyFn = Arc<dyn Fn(&(dyn Fn())) + Send + Sync>;

pub type DataHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Default)]
struct ChannelState {
    live: bool,
    last_data: Option<Envelope>,
    pipes: Vec<Pipe>,
    tap: Option<mpsc::UnboundedSender<Envelope>>,
    last_send: Option<(ChannelEvent, Frame)>,
}

/// A channel handle extended with replay-last-value and pipeline
/// semantics.
///
/// Wraps the underlying [`ChannelHandle`] by composition: raw listener
/// registration stays on the handle, while this layer buffers the latest
/// payload, derives `pipeline` events from `data`, and augments outbound
/// requests with session auth headers.
pub struct ExtendedChannel {
    transport: Arc<dyn Transport>,
    inner: Arc<ChannelHandle>,
    session: Session,
    apply: ApplyFn,
    sink: ExceptionSink,
    state: Arc<Mutex<ChannelState>>,
    reconnect: Mutex<Option<ListenerId>>,
}

impl ExtendedChannel {
    pub fn open(
        transport: Arc<dyn Transport>,
        name: &str,
        session: Session,
        apply: ApplyFn,
        sink: ExceptionSink,
    ) -> Arc<Self> {
        let inner = transport.channel(name);
        let channel = Arc::new(Self {
            transport: transport.clone(),
            inner: inner.clone(),
            session,
            apply,
            sink,
            state: Arc::new(Mutex::new(ChannelState {
                live: true,
                ..ChannelState::default()
            })),
            reconnect: Mutex::new(None),
        });

        // After the wire comes back, re-send the last request so the
        // server side re-establishes state for this channel.
        let weak = Arc::downgrade(&channel);
        let reconnect_id = transport.on_reconnect(Arc::new(move || {
            if let Some(channel) = weak.upgrade() {
                channel.resend_last();
            }
        }));
        *channel.reconnect.lock() = Some(reconnect_id);

        // Server-driven teardown.
        let weak = Arc::downgrade(&channel);
        inner.on(
            ChannelEvent::End,
            Arc::new(move |_, _| {
                if let Some(channel) = weak.upgrade() {
                    channel.end();
                }
            }),
        );

        channel
    }

    pub fn raw(&self) -> &Arc<ChannelHandle> {
        &self.inner
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().live
    }

    pub fn last_data(&self) -> Option<Envelope> {
        self.state.lock().last_data.clone()
    }

    /// Seeds the replay buffer without a message having arrived.
    pub fn set_last_data(&self, envelope: Envelope) {
        self.state.lock().last_data = Some(envelope);
    }

    /// Subscribes `handler` to data frames of `event`, wrapped in the
    /// apply boundary. Control frames are skipped; `data` arrivals refresh
    /// the replay buffer. The returned [`Off`] removes exactly this
    /// registration and tolerates repeated calls.
    pub fn on(&self, event: ChannelEvent, handler: DataHandler) -> Off {
        let state = self.state.clone();
        let apply = self.apply.clone();
        let listener: Listener = Arc::new(move |frame, _ack| {
            if frame.is_control() {
                return;
            }
            if let Frame::Data(envelope) = frame {
                if event == ChannelEvent::Data {
                    state.lock().last_data = Some(envelope.clone());
                }
                let envelope = envelope.clone();
                let handler = handler.clone();
                apply(&move || handler(&envelope));
            }
        });
        let id = self.inner.on(event, listener);
        Off::new(self.inner.clone(), event, id)
    }

    /// [`ExtendedChannel::on`] plus replay: a populated buffer fires the
    /// handler once immediately, raw for `data` and piped for `pipeline`.
    /// Other events see no replay.
    pub async fn on_value(&self, event: ChannelEvent, handler: DataHandler) -> Off {
        let off = self.on(event, handler.clone());

        let (last, pipes) = {
            let state = self.state.lock();
            (state.last_data.clone(), state.pipes.clone())
        };
        if let Some(envelope) = last {
            match event {
                ChannelEvent::Data => (self.apply)(&move || handler(&envelope)),
                ChannelEvent::Pipeline => match run_pipeline(&pipes, envelope).await {
                    Ok(piped) => (self.apply)(&move || handler(&piped)),
                    Err(err) => (self.sink)(&err),
                },
                _ => {}
            }
        }
        off
    }

    /// Appends `pipe` to this channel's pipe list. The first call taps the
    /// raw `data` event and spawns a worker that runs every non-control
    /// frame through the full pipe list, in arrival order with one message
    /// in flight, re-emitting the result under `pipeline`.
    pub fn add_pipe(&self, pipe: Pipe) -> &Self {
        let mut state = self.state.lock();
        state.pipes.push(pipe);
        if state.tap.is_some() {
            return self;
        }

        let (feed, mut intake) = mpsc::unbounded_channel::<Envelope>();
        let tap_state = self.state.clone();
        let tap_feed = feed.clone();
        let listener: Listener = Arc::new(move |frame, _ack| {
            if frame.is_control() {
                return;
            }
            if let Frame::Data(envelope) = frame {
                tap_state.lock().last_data = Some(envelope.clone());
                let _ = tap_feed.send(envelope.clone());
            }
        });
        self.inner.on(ChannelEvent::Data, listener);
        state.tap = Some(feed);
        drop(state);

        let worker_state = self.state.clone();
        let inner = self.inner.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            while let Some(envelope) = intake.recv().await {
                let (live, pipes) = {
                    let state = worker_state.lock();
                    (state.live, state.pipes.clone())
                };
                if !live {
                    break;
                }
                match run_pipeline(&pipes, envelope).await {
                    Ok(piped) => {
                        // A teardown racing the pipeline drops the result.
                        if worker_state.lock().live {
                            inner.emit(ChannelEvent::Pipeline, &Frame::Data(piped));
                        }
                    }
                    Err(err) => sink(&err),
                }
            }
        });

        self
    }

    /// Forwards to the underlying handle's send with session auth headers
    /// merged into a copy of the frame's request options. The caller's
    /// frame is consumed, never mutated behind its back.
    pub fn send(&self, event: ChannelEvent, frame: Frame, ack: Option<AckCallback>) -> &Self {
        let frame = self.with_auth_headers(frame);
        if matches!(frame, Frame::Request(_) | Frame::Start(_)) {
            self.state.lock().last_send = Some((event, frame.clone()));
        }
        if let Err(err) = self.inner.send(event, frame, ack) {
            (self.sink)(&StreamError::Transport(err));
        }
        self
    }

    fn with_auth_headers(&self, frame: Frame) -> Frame {
        let auth = self.session.auth_headers();
        match frame {
            Frame::Request(mut request) => {
                request.options.headers.extend(auth);
                Frame::Request(request)
            }
            Frame::Start(mut start) => {
                start.options.headers.extend(auth);
                Frame::Start(start)
            }
            other => other,
        }
    }

    fn resend_last(&self) {
        let last = self.state.lock().last_send.clone();
        if let Some((event, frame)) = last {
            debug!(
                target: "reef.channel",
                channel = %self.inner.name(),
                event = ?event,
                "re-sending last request after reconnect"
            );
            if let Err(err) = self.inner.send(event, frame, None) {
                (self.sink)(&StreamError::Transport(err));
            }
        }
    }

    /// Tears the channel down: reconnect listener removed, pipe worker
    /// stopped, every listener cleared, retained state dropped. Safe to
    /// call any number of times; late deliveries after the first call are
    /// dropped.
    pub fn end(&self) {
        let tap = {
            let mut state = self.state.lock();
            if !state.live {
                return;
            }
            state.live = false;
            state.last_data = None;
            state.pipes.clear();
            state.last_send = None;
            state.tap.take()
        };
        drop(tap);
        if let Some(id) = self.reconnect.lock().take() {
            self.transport.remove_reconnect_listener(id);
        }
        self.inner.remove_all_listeners();
        debug!(target: "reef.channel", channel = %self.inner.name(), "channel ended");
    }
}
