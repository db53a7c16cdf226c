use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reef_proto::{ChannelEvent, Envelope, Frame, RequestOptions, StreamStart};
use reef_transport::{Listener, ListenerId, Transport};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::channel::ExtendedChannel;
use crate::error::{ExceptionSink, StreamError};
use crate::pipeline::{run_pipeline, Pipe};
use crate::scope::Scope;
use crate::session::Session;
use crate::visibility::PageVisibility;

/// Pre-request hook: given the stream method and the merged parameters,
/// returns the parameters to actually transmit. The default passes them
/// through unchanged.
pub type BeforeStreamingHook =
    Arc<dyn Fn(&str, RequestOptions) -> RequestOptions + Send + Sync>;

const STOP_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Static description of one stream kind: which channel it rides on, the
/// default server method, parameter template, and transform defaults.
#[derive(Clone)]
pub struct StreamConfig {
    pub channel_name: String,
    pub default_method: String,
    pub default_params: RequestOptions,
    pub transformers: Vec<Pipe>,
    pub before_streaming: Option<BeforeStreamingHook>,
}

impl StreamConfig {
    pub fn new(channel_name: impl Into<String>, default_method: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            default_method: default_method.into(),
            default_params: RequestOptions::default(),
            transformers: Vec::new(),
            before_streaming: None,
        }
    }

    pub fn with_params(mut self, params: RequestOptions) -> Self {
        self.default_params = params;
        self
    }

    pub fn with_transformers(mut self, transformers: Vec<Pipe>) -> Self {
        self.transformers = transformers;
        self
    }

    pub fn with_before_streaming(mut self, hook: BeforeStreamingHook) -> Self {
        self.before_streaming = Some(hook);
        self
    }
}

struct Active {
    method: String,
    params: RequestOptions,
    listeners: Vec<(ChannelEvent, ListenerId)>,
    reconnect: ListenerId,
    visibility: u64,
    feed: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct StreamState {
    live: bool,
    destroy_hook: Option<u64>,
    active: Option<Active>,
}

struct StreamInner {
    config: StreamConfig,
    expression: String,
    scope: Scope,
    transport: Arc<dyn Transport>,
    channel: Arc<ExtendedChannel>,
    session: Session,
    visibility: PageVisibility,
    sink: ExceptionSink,
    state: Mutex<StreamState>,
}

/// Owns the lifecycle of one extended channel across start/stop/restart
/// cycles, bound to a scope expression the transformed data is written to.
///
/// A stream never has more than one live subscription: starting while
/// streaming stops the previous subscription first.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub fn setup(
        config: StreamConfig,
        expression: impl Into<String>,
        scope: Scope,
        transport: Arc<dyn Transport>,
        session: Session,
        visibility: PageVisibility,
        sink: ExceptionSink,
    ) -> Self {
        let channel = ExtendedChannel::open(
            transport.clone(),
            &config.channel_name,
            session.clone(),
            scope.apply_fn(),
            sink.clone(),
        );
        let inner = Arc::new(StreamInner {
            config,
            expression: expression.into(),
            scope: scope.clone(),
            transport,
            channel,
            session,
            visibility,
            sink,
            state: Mutex::new(StreamState {
                live: true,
                ..StreamState::default()
            }),
        });

        let weak = Arc::downgrade(&inner);
        let hook = scope.on_destroy(move || {
            if let Some(inner) = weak.upgrade() {
                inner.shutdown();
            }
        });
        inner.state.lock().destroy_hook = Some(hook);

        Stream { inner }
    }

    pub fn channel(&self) -> &Arc<ExtendedChannel> {
        &self.inner.channel
    }

    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    pub fn default_params(&self) -> &RequestOptions {
        &self.inner.config.default_params
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.state.lock().active.is_some()
    }

    /// Merges `params` over the config defaults, installs the server-event
    /// handlers, registers the reconnect and page-visibility hooks, and
    /// transmits the opening `startStreaming` control message.
    pub async fn start_streaming(
        &self,
        params: RequestOptions,
        method: Option<String>,
        transformers: Vec<Pipe>,
    ) {
        if self.is_streaming() {
            self.stop_streaming().await;
        }
        if !self.inner.state.lock().live {
            return;
        }

        let inner = &self.inner;
        let merged = params.merged_over(&inner.config.default_params);
        let method = method.unwrap_or_else(|| inner.config.default_method.clone());
        let transformers = if transformers.is_empty() {
            inner.config.transformers.clone()
        } else {
            transformers
        };

        // Transformed stream data flows through one worker so deliveries
        // stay in arrival order with a single message in flight.
        let (feed, mut intake) = mpsc::unbounded_channel::<Envelope>();
        {
            let scope = inner.scope.clone();
            let expression = inner.expression.clone();
            let sink = inner.sink.clone();
            tokio::spawn(async move {
                while let Some(envelope) = intake.recv().await {
                    match run_pipeline(&transformers, envelope).await {
                        Ok(out) => scope.set(&expression, out.body),
                        Err(err) => sink(&err),
                    }
                }
            });
        }

        let raw = inner.channel.raw().clone();

        let stream_feed = feed.clone();
        let stream_listener: Listener = Arc::new(move |frame, _ack| {
            if let Frame::Data(envelope) = frame {
                let _ = stream_feed.send(envelope.clone());
            }
        });
        let stream_id = raw.on(ChannelEvent::Stream, stream_listener);

        // A streaming error is terminal for this stream instance.
        let weak = Arc::downgrade(inner);
        let error_listener: Listener = Arc::new(move |frame, _ack| {
            if let Some(inner) = weak.upgrade() {
                if let Frame::Data(envelope) = frame {
                    (inner.sink)(&StreamError::Streaming {
                        status_code: envelope.status_code,
                        message: envelope.body.to_string(),
                    });
                }
                inner.shutdown();
            }
        });
        let error_id = raw.on(ChannelEvent::StreamingError, error_listener);

        // The server may re-ask for the start message; answer through the
        // acknowledgement with the current method and parameters.
        let weak = Arc::downgrade(inner);
        let before_listener: Listener = Arc::new(move |_frame, ack| {
            if let (Some(inner), Some(ack)) = (weak.upgrade(), ack) {
                if let Some(start) = inner.start_frame() {
                    ack.respond(Frame::Start(start));
                }
            }
        });
        let before_id = raw.on(ChannelEvent::BeforeStreaming, before_listener);

        let weak = Arc::downgrade(inner);
        let reconnect = inner.transport.on_reconnect(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.transmit_start();
            }
        }));

        // Backgrounded tabs pause the stream without losing the
        // subscription.
        let weak = Arc::downgrade(inner);
        let visibility = inner.visibility.on_change(move |hidden| {
            if let Some(inner) = weak.upgrade() {
                if hidden {
                    inner
                        .channel
                        .send(ChannelEvent::StopStreaming, Frame::Stop, None);
                } else {
                    inner.transmit_start();
                }
            }
        });

        inner.state.lock().active = Some(Active {
            method,
            params: merged,
            listeners: vec![
                (ChannelEvent::Stream, stream_id),
                (ChannelEvent::StreamingError, error_id),
                (ChannelEvent::BeforeStreaming, before_id),
            ],
            reconnect,
            visibility,
            feed,
        });

        inner.transmit_start();
    }

    /// Sends `stopStreaming`, removes the three server-event handlers and
    /// both side-registrations, and waits for the stop acknowledgement.
    pub async fn stop_streaming(&self) {
        let Some(active) = self.inner.state.lock().active.take() else {
            return;
        };
        self.inner.teardown_active(active);

        let (tx, rx) = oneshot::channel();
        self.inner.channel.send(
            ChannelEvent::StopStreaming,
            Frame::Stop,
            Some(Box::new(move |_| {
                let _ = tx.send(());
            })),
        );
        if tokio::time::timeout(STOP_ACK_TIMEOUT, rx).await.is_err() {
            debug!(
                target: "reef.stream",
                channel = %self.inner.channel.name(),
                "stop acknowledgement timed out"
            );
        }
    }

    /// Stop, then start with `params` merged over the defaults. The stop
    /// acknowledgement gates the restart, so no two subscriptions for the
    /// same stream ever overlap.
    pub async fn update_params(&self, params: RequestOptions) {
        self.stop_streaming().await;
        self.start_streaming(params, None, Vec::new()).await;
    }

    /// Stop and start again with the current parameters.
    pub async fn restart(&self) {
        let params = self
            .inner
            .state
            .lock()
            .active
            .as_ref()
            .map(|active| active.params.clone())
            .unwrap_or_default();
        self.stop_streaming().await;
        self.start_streaming(params, None, Vec::new()).await;
    }

    /// Tears everything down: subscription, channel, scope-destroy hook.
    /// Safe to call repeatedly.
    pub fn end(&self) {
        self.inner.shutdown();
    }
}

impl StreamInner {
    fn start_frame(&self) -> Option<StreamStart> {
        let (method, mut options) = {
            let state = self.state.lock();
            let active = state.active.as_ref()?;
            (active.method.clone(), active.params.clone())
        };
        if !self.session.cookie.is_empty() {
            options
                .headers
                .insert("Cookie".to_string(), self.session.cookie.clone());
        }
        let options = match &self.config.before_streaming {
            Some(hook) => hook(&method, options),
            None => options,
        };
        Some(StreamStart { method, options })
    }

    fn transmit_start(&self) {
        if let Some(start) = self.start_frame() {
            self.channel
                .send(ChannelEvent::StartStreaming, Frame::Start(start), None);
        }
    }

    fn teardown_active(&self, active: Active) {
        let raw = self.channel.raw();
        for (event, id) in &active.listeners {
            raw.remove_listener(*event, *id);
        }
        self.transport.remove_reconnect_listener(active.reconnect);
        self.visibility.remove_listener(active.visibility);
        // stops the transform worker
        drop(active.feed);
    }

    fn shutdown(&self) {
        let (active, hook) = {
            let mut state = self.state.lock();
            if !state.live {
                return;
            }
            state.live = false;
            (state.active.take(), state.destroy_hook.take())
        };
        if let Some(active) = active {
            self.teardown_active(active);
            self.channel
                .send(ChannelEvent::StopStreaming, Frame::Stop, None);
        }
        if let Some(hook) = hook {
            self.scope.remove_destroy_hook(hook);
        }
        self.channel.end();
        debug!(
            target: "reef.stream",
            channel = %self.channel.name(),
            "stream ended"
        );
    }
}
