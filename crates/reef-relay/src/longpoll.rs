use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reef_proto::{ChannelEvent, Command, Envelope, Job};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError};
use crate::router::{Request, Response, RouterError, SocketRouter};

/// Cadence between completion polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Paths and timing for one command-completion route.
#[derive(Debug, Clone)]
pub struct CompletionLoopConfig {
    /// Socket route that opens a loop, and the backend path the initial
    /// request is posted to.
    pub create_path: String,
    /// Backend path polled for command state.
    pub command_path: String,
    /// Backend path queried for job step results once commands finish.
    pub job_path: String,
    pub interval: Duration,
}

impl CompletionLoopConfig {
    pub fn new(create_path: impl Into<String>) -> Self {
        Self {
            create_path: create_path.into(),
            command_path: "/command".into(),
            job_path: "/job".into(),
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[derive(Default)]
struct PollState {
    pending: Vec<u64>,
    last_written: Option<Value>,
}

/// Long-poll driver for slow backend commands.
///
/// One loop runs per inbound request: the request body is posted to the
/// backend, the resulting commands are polled on a fixed cadence until
/// every one reports finished, and the combined command/job result is
/// written back over the originating channel. Polls are strictly
/// sequential; a slow backend stretches the cadence instead of stacking
/// requests.
pub struct CompletionLoop {
    backend: Arc<dyn Backend>,
    config: CompletionLoopConfig,
}

impl CompletionLoop {
    pub fn new(backend: Arc<dyn Backend>, config: CompletionLoopConfig) -> Arc<Self> {
        Arc::new(Self { backend, config })
    }

    /// Installs the loop's post handler on its configured route.
    pub fn register(self: &Arc<Self>, router: &mut SocketRouter) -> Result<(), RouterError> {
        let this = self.clone();
        router
            .route(&self.config.create_path)?
            .post(Arc::new(move |request, response| {
                let this = this.clone();
                tokio::spawn(async move {
                    this.run(request, response).await;
                });
            }));
        Ok(())
    }

    async fn run(self: Arc<Self>, request: Request, response: Response) {
        // Channel teardown ends the loop; checked before every backend
        // call and before every write.
        let live = Arc::new(AtomicBool::new(true));
        let end_flag = live.clone();
        let end_id = response.channel.on(
            ChannelEvent::End,
            Arc::new(move |_, _| end_flag.store(false, Ordering::SeqCst)),
        );

        let data = request.data.unwrap_or(Value::Null);
        let mut state = PollState::default();

        loop {
            if !live.load(Ordering::SeqCst) {
                break;
            }
            match self.poll_once(&mut state, &data, &live).await {
                Ok(Some(body)) => {
                    if live.load(Ordering::SeqCst)
                        && state.last_written.as_ref() != Some(&body)
                    {
                        response.write(Envelope::ok(body.clone()));
                        state.last_written = Some(body);
                    }
                    // Finished set delivered; the next cycle starts over.
                    state.pending.clear();
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        target: "reef.longpoll",
                        channel = %response.channel.name(),
                        error = %err,
                        "completion poll failed"
                    );
                    if live.load(Ordering::SeqCst) {
                        response.write(Envelope::error(err.status_code(), err.to_string()));
                    }
                }
            }
            if !live.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(self.config.interval).await;
        }

        debug!(
            target: "reef.longpoll",
            channel = %response.channel.name(),
            "completion loop ended"
        );
        response.channel.remove_listener(ChannelEvent::End, end_id);
    }

    /// One poll cycle. Returns the combined result body once every pending
    /// command reports finished, `None` while work is still running.
    async fn poll_once(
        &self,
        state: &mut PollState,
        data: &Value,
        live: &AtomicBool,
    ) -> Result<Option<Value>, BackendError> {
        if !live.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let commands = if state.pending.is_empty() {
            let response = self.backend.post(&self.config.create_path, data).await?;
            commands_from_body(&response.body)
        } else {
            let query = id_query(&state.pending);
            let response = self.backend.get(&self.config.command_path, &query).await?;
            commands_from_body(&response.body)
        };
        state.pending = commands.iter().map(|command| command.id).collect();

        if commands.is_empty() || !commands.iter().all(Command::finished) {
            return Ok(None);
        }

        let job_ids: Vec<u64> = commands.iter().flat_map(Command::job_ids).collect();
        let jobs: Vec<Job> = if job_ids.is_empty() || !live.load(Ordering::SeqCst) {
            Vec::new()
        } else {
            let query = id_query(&job_ids);
            let response = self.backend.get(&self.config.job_path, &query).await?;
            jobs_from_body(&response.body)
        };

        Ok(Some(json!({ "commands": commands, "jobs": jobs })))
    }
}

fn id_query(ids: &[u64]) -> Vec<(String, String)> {
    let joined = ids
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",");
    vec![
        ("id__in".to_string(), joined),
        ("limit".to_string(), "0".to_string()),
    ]
}

/// Accepts both shapes the backend produces: a single `{"command": {...}}`
/// wrapper and a collection `{"objects": [{"command": {...}}, ...]}`.
/// Bare command objects are tolerated too.
fn commands_from_body(body: &Value) -> Vec<Command> {
    fn one(value: &Value) -> Option<Command> {
        let inner = value.get("command").unwrap_or(value);
        serde_json::from_value(inner.clone()).ok()
    }

    match body.get("objects").and_then(Value::as_array) {
        Some(objects) => objects.iter().filter_map(one).collect(),
        None => one(body).into_iter().collect(),
    }
}

fn jobs_from_body(body: &Value) -> Vec<Job> {
    match body.get("objects") {
        Some(objects) => serde_json::from_value(objects.clone()).unwrap_or_default(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reef_proto::{Frame, Verb};
    use reef_transport::ChannelHandle;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    use crate::backend::ApiResponse;

    /// Scripted backend: commands report finished after `finish_after`
    /// polls. Tracks concurrency and per-path call counts.
    struct FakeBackend {
        finish_after: usize,
        latency: Duration,
        polls: AtomicUsize,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_posts: bool,
    }

    impl FakeBackend {
        fn build(finish_after: usize, latency: Duration, fail_posts: bool) -> Arc<Self> {
            Arc::new(Self {
                finish_after,
                latency,
                polls: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail_posts,
            })
        }

        fn new(finish_after: usize) -> Arc<Self> {
            Self::build(finish_after, Duration::ZERO, false)
        }

        fn slow(finish_after: usize, latency: Duration) -> Arc<Self> {
            Self::build(finish_after, latency, false)
        }

        fn failing() -> Arc<Self> {
            Self::build(0, Duration::ZERO, true)
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        async fn enter(&self, path: &str) {
            self.calls.lock().push(path.to_string());
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
        }

        fn leave(&self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        fn command_body(&self) -> Value {
            let done = self.polls.fetch_add(1, Ordering::SeqCst) >= self.finish_after;
            json!({
                "command": {
                    "id": 7,
                    "complete": done,
                    "cancelled": false,
                    "errored": false,
                    "jobs": ["/api/job/3/"],
                }
            })
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn get(
            &self,
            path: &str,
            _query: &[(String, String)],
        ) -> Result<ApiResponse, BackendError> {
            self.enter(path).await;
            let body = if path == "/job" {
                json!({ "objects": [{ "id": 3, "step_results": { "stdout": "ok" } }] })
            } else {
                json!({ "objects": [self.command_body()] })
            };
            self.leave();
            Ok(ApiResponse {
                status_code: 200,
                body,
            })
        }

        async fn post(&self, path: &str, _body: &Value) -> Result<ApiResponse, BackendError> {
            self.enter(path).await;
            let result = if self.fail_posts {
                Err(BackendError::Status {
                    status: 503,
                    message: "backend offline".into(),
                })
            } else {
                Ok(ApiResponse {
                    status_code: 201,
                    body: self.command_body(),
                })
            };
            self.leave();
            result
        }
    }

    fn collect_writes(channel: &Arc<ChannelHandle>) -> Arc<Mutex<Vec<Envelope>>> {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let sink = writes.clone();
        channel.on(
            ChannelEvent::Data,
            Arc::new(move |frame: &Frame, _| {
                if let Frame::Data(envelope) = frame {
                    sink.lock().push(envelope.clone());
                }
            }),
        );
        writes
    }

    fn start_loop(backend: Arc<FakeBackend>, interval: Duration) -> Arc<ChannelHandle> {
        let config = CompletionLoopConfig::new("/run").with_interval(interval);
        let completion = CompletionLoop::new(backend, config);
        let mut router = SocketRouter::new();
        completion.register(&mut router).expect("register route");

        let channel = ChannelHandle::new("request");
        router
            .go(
                "/run",
                Verb::Post,
                channel.clone(),
                Some(json!({ "action": "restart" })),
                None,
            )
            .expect("dispatch ok");
        channel
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition within deadline");
    }

    #[tokio::test]
    async fn polls_are_strictly_sequential() {
        let backend = FakeBackend::slow(100, Duration::from_millis(20));
        let _channel = start_loop(backend.clone(), Duration::from_millis(1));

        wait_for(|| backend.call_count() >= 4).await;
        assert_eq!(
            backend.max_in_flight.load(Ordering::SeqCst),
            1,
            "a slow backend must stretch the cadence, not stack polls"
        );
    }

    #[tokio::test]
    async fn finished_result_is_written_once() {
        let backend = FakeBackend::new(1);
        let channel = start_loop(backend.clone(), Duration::from_millis(5));
        let writes = collect_writes(&channel);

        wait_for(|| !writes.lock().is_empty()).await;
        // let several more cycles deliver the same finished set
        let count_then = backend.call_count();
        wait_for(|| backend.call_count() >= count_then + 4).await;

        let writes = writes.lock();
        assert_eq!(writes.len(), 1, "unchanged results must not repeat");
        let body = &writes[0].body;
        assert_eq!(body["commands"][0]["id"], 7);
        assert_eq!(body["jobs"][0]["step_results"]["stdout"], "ok");
    }

    #[tokio::test]
    async fn channel_end_stops_the_backend_traffic() {
        let backend = FakeBackend::new(usize::MAX);
        let channel = start_loop(backend.clone(), Duration::from_millis(5));

        wait_for(|| backend.call_count() >= 2).await;
        channel.emit(ChannelEvent::End, &Frame::Stop);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_end = backend.call_count();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            backend.call_count(),
            after_end,
            "no backend call may start after the channel ends"
        );
    }

    #[tokio::test]
    async fn backend_errors_become_error_envelopes_and_polling_continues() {
        let backend = FakeBackend::failing();
        let channel = start_loop(backend.clone(), Duration::from_millis(5));
        let writes = collect_writes(&channel);

        wait_for(|| writes.lock().len() >= 2).await;
        let writes = writes.lock();
        assert!(writes.iter().all(|envelope| envelope.status_code == 503));
        assert!(backend.call_count() >= 2, "errors must not end the loop");
    }
}
