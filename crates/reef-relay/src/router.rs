use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use reef_proto::{ChannelEvent, Envelope, Frame, Verb};
use reef_transport::{Ack, ChannelHandle};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no route matches {path}")]
    NoRoute { path: String },
    #[error("route {path} has no handler for {verb}")]
    NoHandler { path: String, verb: Verb },
    #[error("invalid route pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

impl RouterError {
    pub fn status_code(&self) -> u16 {
        match self {
            RouterError::NoRoute { .. } => 404,
            RouterError::NoHandler { .. } => 405,
            RouterError::Pattern { .. } => 500,
        }
    }
}

/// Request handed to a matched handler. `params` carries named pattern
/// captures, `matches` the full capture list in order.
#[derive(Debug, Clone)]
pub struct Request {
    pub params: HashMap<String, String>,
    pub matches: Vec<String>,
    pub verb: Verb,
    pub data: Option<Value>,
}

/// Write side of a dispatch: the originating channel plus the request
/// acknowledgement, when the client asked for one.
#[derive(Clone)]
pub struct Response {
    pub channel: Arc<ChannelHandle>,
    pub ack: Option<Arc<Ack>>,
}

impl Response {
    /// First write answers through the acknowledgement; later writes (a
    /// streaming handler) fall back to `data` emission on the channel.
    pub fn write(&self, envelope: Envelope) {
        let frame = Frame::Data(envelope);
        if let Some(ack) = &self.ack {
            if ack.respond(frame.clone()) {
                return;
            }
        }
        self.channel.emit(ChannelEvent::Data, &frame);
    }
}

pub type Handler = Arc<dyn Fn(Request, Response) + Send + Sync>;

/// Compiled path pattern: literal segments, `:name` captures, or a raw
/// regular expression.
pub(crate) struct PathPattern {
    source: String,
    regex: Regex,
}

impl PathPattern {
    pub(crate) fn from_path(path: &str) -> Result<Self, RouterError> {
        let mut pattern = String::from("^");
        for (index, segment) in path.split('/').enumerate() {
            if index > 0 {
                pattern.push('/');
            }
            match segment.strip_prefix(':') {
                Some(name) => {
                    pattern.push_str("(?P<");
                    pattern.push_str(name);
                    pattern.push_str(">[^/]+)");
                }
                None => pattern.push_str(&regex::escape(segment)),
            }
        }
        pattern.push_str("/?$");
        let regex = Regex::new(&pattern).map_err(|source| RouterError::Pattern {
            pattern: path.to_string(),
            source,
        })?;
        Ok(Self {
            source: path.to_string(),
            regex,
        })
    }

    pub(crate) fn from_regex(regex: Regex) -> Self {
        Self {
            source: regex.as_str().to_string(),
            regex,
        }
    }

    pub(crate) fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn matches(&self, path: &str) -> Option<(HashMap<String, String>, Vec<String>)> {
        let captures = self.regex.captures(path)?;
        let mut params = HashMap::new();
        for name in self.regex.capture_names().flatten() {
            if let Some(value) = captures.name(name) {
                params.insert(name.to_string(), value.as_str().to_string());
            }
        }
        let matches = captures
            .iter()
            .flatten()
            .map(|capture| capture.as_str().to_string())
            .collect();
        Some((params, matches))
    }
}

pub(crate) struct RouteEntry {
    pattern: PathPattern,
    verbs: HashMap<Verb, Handler>,
    all: Option<Handler>,
}

/// Per-path registration surface. Registering the same verb twice
/// overwrites the previous handler: last registration wins. This is
/// deliberate and different from [`super::MiddlewareRouter`], which
/// appends to a chain instead.
pub struct PathRouter<'a> {
    entry: &'a mut RouteEntry,
}

impl PathRouter<'_> {
    pub fn get(self, handler: Handler) -> Self {
        self.verb(Verb::Get, handler)
    }

    pub fn post(self, handler: Handler) -> Self {
        self.verb(Verb::Post, handler)
    }

    pub fn put(self, handler: Handler) -> Self {
        self.verb(Verb::Put, handler)
    }

    pub fn patch(self, handler: Handler) -> Self {
        self.verb(Verb::Patch, handler)
    }

    pub fn delete(self, handler: Handler) -> Self {
        self.verb(Verb::Delete, handler)
    }

    /// Fallback invoked when no verb-specific handler is registered.
    pub fn all(self, handler: Handler) -> Self {
        self.entry.all = Some(handler);
        self
    }

    fn verb(self, verb: Verb, handler: Handler) -> Self {
        if self.entry.verbs.insert(verb, handler).is_some() {
            debug!(
                target: "reef.router",
                path = %self.entry.pattern.source(),
                verb = %verb,
                "handler overwritten, last registration wins"
            );
        }
        self
    }
}

/// Push-stream dispatcher: maps inbound (path, verb) pairs to handlers
/// over the socket transport, analogous to an HTTP router.
#[derive(Default)]
pub struct SocketRouter {
    routes: Vec<RouteEntry>,
}

impl SocketRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the registration surface for `path`, creating the route on
    /// first use. Paths support literal segments and `:name` parameters.
    pub fn route(&mut self, path: &str) -> Result<PathRouter<'_>, RouterError> {
        if let Some(index) = self
            .routes
            .iter()
            .position(|entry| entry.pattern.source() == path)
        {
            return Ok(PathRouter {
                entry: &mut self.routes[index],
            });
        }
        let pattern = PathPattern::from_path(path)?;
        self.routes.push(RouteEntry {
            pattern,
            verbs: HashMap::new(),
            all: None,
        });
        let entry = self
            .routes
            .last_mut()
            .ok_or_else(|| RouterError::NoRoute {
                path: path.to_string(),
            })?;
        Ok(PathRouter { entry })
    }

    /// Registration against a full regular expression instead of path
    /// syntax.
    pub fn route_regex(&mut self, regex: Regex) -> PathRouter<'_> {
        let source = regex.as_str().to_string();
        if let Some(index) = self
            .routes
            .iter()
            .position(|entry| entry.pattern.source() == source)
        {
            return PathRouter {
                entry: &mut self.routes[index],
            };
        }
        self.routes.push(RouteEntry {
            pattern: PathPattern::from_regex(regex),
            verbs: HashMap::new(),
            all: None,
        });
        let index = self.routes.len() - 1;
        PathRouter {
            entry: &mut self.routes[index],
        }
    }

    /// Dispatches one request: routes are tried in registration order and
    /// the first matching pattern wins. A match without the requested verb
    /// falls back to the `all` handler; neither present is a routing
    /// error, fatal for this dispatch only.
    pub fn go(
        &self,
        path: &str,
        verb: Verb,
        channel: Arc<ChannelHandle>,
        data: Option<Value>,
        ack: Option<Arc<Ack>>,
    ) -> Result<(), RouterError> {
        for entry in &self.routes {
            let Some((params, matches)) = entry.pattern.matches(path) else {
                continue;
            };
            let handler = entry
                .verbs
                .get(&verb)
                .or(entry.all.as_ref())
                .ok_or_else(|| RouterError::NoHandler {
                    path: path.to_string(),
                    verb,
                })?;
            let request = Request {
                params,
                matches,
                verb,
                data,
            };
            let response = Response { channel, ack };
            handler(request, response);
            return Ok(());
        }
        Err(RouterError::NoRoute {
            path: path.to_string(),
        })
    }

    /// Clears every registered route.
    pub fn reset(&mut self) {
        self.routes.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn channel() -> Arc<ChannelHandle> {
        ChannelHandle::new("test")
    }

    fn recording_handler(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> Handler {
        Arc::new(move |request, _response| {
            log.lock().push(format!(
                "{tag}:{}",
                request
                    .params
                    .get("id")
                    .cloned()
                    .unwrap_or_default()
            ));
        })
    }

    #[test]
    fn named_params_are_extracted() {
        let mut router = SocketRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router
            .route("/host/:id")
            .expect("valid route")
            .get(recording_handler(log.clone(), "host"));

        router
            .go("/host/42", Verb::Get, channel(), None, None)
            .expect("dispatch ok");

        assert_eq!(log.lock().as_slice(), ["host:42"]);
    }

    #[test]
    fn last_registration_wins() {
        let mut router = SocketRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router
            .route("/foo")
            .expect("valid route")
            .get(recording_handler(log.clone(), "a"));
        router
            .route("/foo")
            .expect("valid route")
            .get(recording_handler(log.clone(), "b"));

        router
            .go("/foo", Verb::Get, channel(), None, None)
            .expect("dispatch ok");

        assert_eq!(log.lock().as_slice(), ["b:"]);
    }

    #[test]
    fn first_matching_route_wins() {
        let mut router = SocketRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router
            .route("/host/:id")
            .expect("valid route")
            .get(recording_handler(log.clone(), "param"));
        router
            .route("/host/42")
            .expect("valid route")
            .get(recording_handler(log.clone(), "literal"));

        router
            .go("/host/42", Verb::Get, channel(), None, None)
            .expect("dispatch ok");

        assert_eq!(log.lock().as_slice(), ["param:42"]);
    }

    #[test]
    fn all_handler_answers_unregistered_verbs() {
        let mut router = SocketRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router
            .route("/anything")
            .expect("valid route")
            .all(recording_handler(log.clone(), "all"));

        router
            .go("/anything", Verb::Delete, channel(), None, None)
            .expect("dispatch ok");

        assert_eq!(log.lock().as_slice(), ["all:"]);
    }

    #[test]
    fn missing_route_and_missing_verb_are_errors() {
        let mut router = SocketRouter::new();
        router
            .route("/host")
            .expect("valid route")
            .get(Arc::new(|_, _| {}));

        let err = router
            .go("/nope", Verb::Get, channel(), None, None)
            .expect_err("no route");
        assert!(matches!(err, RouterError::NoRoute { .. }));
        assert_eq!(err.status_code(), 404);

        let err = router
            .go("/host", Verb::Post, channel(), None, None)
            .expect_err("no handler");
        assert!(matches!(err, RouterError::NoHandler { .. }));
        assert_eq!(err.status_code(), 405);
    }

    #[test]
    fn regex_routes_capture_groups() {
        let mut router = SocketRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let matches_log = log.clone();
        router
            .route_regex(Regex::new(r"^/api/(\w+)/(\d+)$").expect("valid regex"))
            .get(Arc::new(move |request, _response| {
                matches_log.lock().push(request.matches.join(","));
            }));

        router
            .go("/api/job/9", Verb::Get, channel(), None, None)
            .expect("dispatch ok");

        assert_eq!(log.lock().as_slice(), ["/api/job/9,job,9"]);
    }

    #[test]
    fn reset_clears_routes() {
        let mut router = SocketRouter::new();
        router
            .route("/host")
            .expect("valid route")
            .get(Arc::new(|_, _| {}));
        assert!(!router.is_empty());

        router.reset();
        assert!(router.is_empty());
        assert!(router
            .go("/host", Verb::Get, channel(), None, None)
            .is_err());
    }

    #[test]
    fn trailing_slash_is_tolerated() {
        let mut router = SocketRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router
            .route("/host/:id")
            .expect("valid route")
            .get(recording_handler(log.clone(), "host"));

        router
            .go("/host/42/", Verb::Get, channel(), None, None)
            .expect("dispatch ok");
        assert_eq!(log.lock().as_slice(), ["host:42"]);
    }
}
