use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use reef_proto::Envelope;

use crate::error::StreamError;

type PipeResult = Result<Envelope, StreamError>;
type BoxPipeFuture = Pin<Box<dyn Future<Output = PipeResult> + Send>>;

/// One transform step over an inbound message.
///
/// Synchronous pipes return the transformed envelope; asynchronous pipes
/// return a future resolving to it. Either form may fail, which ends the
/// pipeline for that message only.
#[derive(Clone)]
pub enum Pipe {
    Sync(Arc<dyn Fn(Envelope) -> PipeResult + Send + Sync>),
    Async(Arc<dyn Fn(Envelope) -> BoxPipeFuture + Send + Sync>),
}

impl Pipe {
    pub fn sync<F>(pipe: F) -> Self
    where
        F: Fn(Envelope) -> PipeResult + Send + Sync + 'static,
    {
        Pipe::Sync(Arc::new(pipe))
    }

    pub fn asynchronous<F, Fut>(pipe: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PipeResult> + Send + 'static,
    {
        Pipe::Async(Arc::new(move |envelope| Box::pin(pipe(envelope))))
    }

    async fn apply(&self, envelope: Envelope) -> PipeResult {
        match self {
            Pipe::Sync(pipe) => pipe(envelope),
            Pipe::Async(pipe) => pipe(envelope).await,
        }
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pipe::Sync(_) => f.write_str("Pipe::Sync"),
            Pipe::Async(_) => f.write_str("Pipe::Async"),
        }
    }
}

/// Folds `envelope` through `pipes` in registration order. Each pipe
/// observes the effects of all earlier pipes; the first failure
/// short-circuits and is returned to the caller.
pub async fn run_pipeline(pipes: &[Pipe], envelope: Envelope) -> PipeResult {
    let mut current = envelope;
    for pipe in pipes {
        current = pipe.apply(current).await?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn number(envelope: &Envelope) -> i64 {
        envelope.body.as_i64().unwrap_or_default()
    }

    fn with_number(n: i64) -> Envelope {
        Envelope::ok(json!(n))
    }

    #[tokio::test]
    async fn pipes_run_in_order_and_deterministically() {
        // p1(x) = x + 1, p2(x, next) = next(x * 2): 3 -> 4 -> 8
        let pipes = vec![
            Pipe::sync(|envelope| Ok(with_number(number(&envelope) + 1))),
            Pipe::asynchronous(|envelope| async move { Ok(with_number(number(&envelope) * 2)) }),
        ];

        let out = run_pipeline(&pipes, with_number(3)).await.expect("pipeline ok");
        assert_eq!(number(&out), 8);

        let again = run_pipeline(&pipes, with_number(3)).await.expect("pipeline ok");
        assert_eq!(number(&again), 8);
    }

    #[tokio::test]
    async fn failing_pipe_short_circuits() {
        let pipes = vec![
            Pipe::sync(|_| Err(StreamError::Pipe("bad body".into()))),
            Pipe::sync(|envelope| Ok(with_number(number(&envelope) + 100))),
        ];

        let err = run_pipeline(&pipes, with_number(1)).await.expect_err("must fail");
        assert!(matches!(err, StreamError::Pipe(_)));
    }

    #[tokio::test]
    async fn empty_pipeline_is_identity() {
        let out = run_pipeline(&[], with_number(42)).await.expect("pipeline ok");
        assert_eq!(number(&out), 42);
    }
}
