use std::sync::Arc;

use reef_transport::TransportError;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("pipe failed: {0}")]
    Pipe(String),
    #[error("streaming error ({status_code}): {message}")]
    Streaming { status_code: u16, message: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Destination for errors raised inside listeners and pipes. A failing
/// pipe must never take the host process down; it lands here instead.
pub type ExceptionSink = Arc<dyn Fn(&StreamError) + Send + Sync>;

/// Default sink: structured error log.
pub fn tracing_sink() -> ExceptionSink {
    Arc::new(|err| {
        error!(target: "reef.stream", error = %err, "unhandled stream error");
    })
}
