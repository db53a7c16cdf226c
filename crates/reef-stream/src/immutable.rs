use std::sync::Arc;

use parking_lot::Mutex;
use reef_proto::RequestOptions;
use reef_transport::Transport;

use crate::error::ExceptionSink;
use crate::scope::Scope;
use crate::session::Session;
use crate::stream::{Stream, StreamConfig};
use crate::visibility::PageVisibility;

/// Stricter stream lifecycle: parameter changes never mutate a live
/// channel. Each `start` ends whatever is running and opens a brand-new
/// stream and subscription, trading reuse for immunity to stale
/// subscriptions seeing new parameters.
pub struct ImmutableStream {
    config: StreamConfig,
    expression: String,
    scope: Scope,
    transport: Arc<dyn Transport>,
    session: Session,
    visibility: PageVisibility,
    sink: ExceptionSink,
    current: Mutex<Option<Stream>>,
}

impl ImmutableStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: StreamConfig,
        expression: impl Into<String>,
        scope: Scope,
        transport: Arc<dyn Transport>,
        session: Session,
        visibility: PageVisibility,
        sink: ExceptionSink,
    ) -> Self {
        Self {
            config,
            expression: expression.into(),
            scope,
            transport,
            session,
            visibility,
            sink,
            current: Mutex::new(None),
        }
    }

    /// Ends any live instance unconditionally, then constructs and starts
    /// a fresh one with `params`.
    pub async fn start(&self, params: RequestOptions) {
        if let Some(previous) = self.current.lock().take() {
            previous.end();
        }
        let stream = Stream::setup(
            self.config.clone(),
            self.expression.clone(),
            self.scope.clone(),
            self.transport.clone(),
            self.session.clone(),
            self.visibility.clone(),
            self.sink.clone(),
        );
        stream.start_streaming(params, None, Vec::new()).await;
        *self.current.lock() = Some(stream);
    }

    pub fn current(&self) -> Option<Stream> {
        self.current.lock().clone()
    }

    /// Ends the current instance, if any, and clears the reference.
    pub fn end(&self) {
        if let Some(stream) = self.current.lock().take() {
            stream.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::tracing_sink;
    use reef_transport::LocalTransport;

    fn wrapper(transport: &Arc<LocalTransport>) -> ImmutableStream {
        ImmutableStream::new(
            StreamConfig::new("target-stream", "httpGetList"),
            "data",
            Scope::new(),
            transport.clone() as Arc<dyn Transport>,
            Session::default(),
            PageVisibility::new(),
            tracing_sink(),
        )
    }

    #[tokio::test]
    async fn start_replaces_the_live_instance() {
        let transport = LocalTransport::new();
        let immutable = wrapper(&transport);

        immutable.start(RequestOptions::default()).await;
        let first = immutable.current().expect("first instance");
        assert!(first.is_streaming());

        let mut params = RequestOptions::default();
        params.qs.insert("id".into(), "3".into());
        immutable.start(params).await;

        let second = immutable.current().expect("second instance");
        assert!(!first.is_streaming(), "old instance must be ended");
        assert!(second.is_streaming());
        assert!(!Arc::ptr_eq(first.channel(), second.channel()));
    }

    #[tokio::test]
    async fn end_clears_the_reference_and_tolerates_repeats() {
        let transport = LocalTransport::new();
        let immutable = wrapper(&transport);

        immutable.start(RequestOptions::default()).await;
        immutable.end();
        immutable.end();

        assert!(immutable.current().is_none());
    }
}
