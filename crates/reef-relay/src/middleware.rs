use std::collections::HashMap;
use std::sync::Arc;

use reef_proto::Verb;
use tracing::debug;

use crate::router::{Request, Response, RouterError};

/// Outcome of one middleware handler: keep walking the chain or stop here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Next,
    Halt,
}

pub type MiddlewareHandler = Arc<dyn Fn(&mut Request, &Response) -> Flow + Send + Sync>;

#[derive(Default)]
pub struct MiddlewareChain {
    handlers: Vec<MiddlewareHandler>,
}

impl MiddlewareChain {
    fn push(&mut self, handler: MiddlewareHandler) {
        self.handlers.push(handler);
    }

    /// Runs handlers in registration order until one halts.
    fn run(&self, request: &mut Request, response: &Response) {
        for handler in &self.handlers {
            if handler(request, response) == Flow::Halt {
                debug!(target: "reef.router", "middleware chain halted");
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

struct MiddlewareEntry {
    path: String,
    verbs: HashMap<Verb, MiddlewareChain>,
    all: MiddlewareChain,
}

/// Chain-building counterpart of [`crate::SocketRouter`]. Registering the
/// same (path, verb) twice appends to a chain rather than replacing, so
/// cross-cutting steps (auth checks, request decoration) stack in
/// registration order.
#[derive(Default)]
pub struct MiddlewareRouter {
    entries: Vec<MiddlewareEntry>,
}

impl MiddlewareRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, path: &str, verb: Verb, handler: MiddlewareHandler) -> &mut Self {
        self.entry(path).verbs.entry(verb).or_default().push(handler);
        self
    }

    /// Appends to the chain consulted when no verb-specific chain exists.
    pub fn on_all(&mut self, path: &str, handler: MiddlewareHandler) -> &mut Self {
        self.entry(path).all.push(handler);
        self
    }

    fn entry(&mut self, path: &str) -> &mut MiddlewareEntry {
        if let Some(index) = self.entries.iter().position(|entry| entry.path == path) {
            return &mut self.entries[index];
        }
        self.entries.push(MiddlewareEntry {
            path: path.to_string(),
            verbs: HashMap::new(),
            all: MiddlewareChain::default(),
        });
        let index = self.entries.len() - 1;
        &mut self.entries[index]
    }

    /// Walks the chain registered for (path, verb): the verb chain when one
    /// exists, else the `all` chain. Paths are matched literally here;
    /// pattern matching belongs to the socket router in front.
    pub fn go(
        &self,
        path: &str,
        verb: Verb,
        request: &mut Request,
        response: &Response,
    ) -> Result<(), RouterError> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.path == path)
            .ok_or_else(|| RouterError::NoRoute {
                path: path.to_string(),
            })?;
        let chain = match entry.verbs.get(&verb) {
            Some(chain) => chain,
            None if !entry.all.is_empty() => &entry.all,
            None => {
                return Err(RouterError::NoHandler {
                    path: path.to_string(),
                    verb,
                })
            }
        };
        chain.run(request, response);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use reef_transport::ChannelHandle;

    fn request() -> Request {
        Request {
            params: HashMap::new(),
            matches: Vec::new(),
            verb: Verb::Get,
            data: None,
        }
    }

    fn response() -> Response {
        Response {
            channel: ChannelHandle::new("middleware"),
            ack: None,
        }
    }

    fn step(log: Arc<Mutex<Vec<&'static str>>>, tag: &'static str, flow: Flow) -> MiddlewareHandler {
        Arc::new(move |_, _| {
            log.lock().push(tag);
            flow
        })
    }

    #[test]
    fn registrations_append_and_run_in_order() {
        let mut router = MiddlewareRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.on("/host", Verb::Get, step(log.clone(), "first", Flow::Next));
        router.on("/host", Verb::Get, step(log.clone(), "second", Flow::Next));

        router
            .go("/host", Verb::Get, &mut request(), &response())
            .expect("dispatch ok");

        assert_eq!(log.lock().as_slice(), ["first", "second"]);
    }

    #[test]
    fn halt_stops_the_chain() {
        let mut router = MiddlewareRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.on("/host", Verb::Get, step(log.clone(), "gate", Flow::Halt));
        router.on("/host", Verb::Get, step(log.clone(), "never", Flow::Next));

        router
            .go("/host", Verb::Get, &mut request(), &response())
            .expect("dispatch ok");

        assert_eq!(log.lock().as_slice(), ["gate"]);
    }

    #[test]
    fn all_chain_backs_unregistered_verbs() {
        let mut router = MiddlewareRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.on_all("/host", step(log.clone(), "all", Flow::Next));

        router
            .go("/host", Verb::Post, &mut request(), &response())
            .expect("dispatch ok");
        assert_eq!(log.lock().as_slice(), ["all"]);

        assert!(matches!(
            router.go("/missing", Verb::Get, &mut request(), &response()),
            Err(RouterError::NoRoute { .. })
        ));
    }

    #[test]
    fn middleware_may_mutate_the_request() {
        let mut router = MiddlewareRouter::new();
        router.on(
            "/host",
            Verb::Get,
            Arc::new(|request, _| {
                request.params.insert("decorated".into(), "yes".into());
                Flow::Next
            }),
        );

        let mut req = request();
        router
            .go("/host", Verb::Get, &mut req, &response())
            .expect("dispatch ok");
        assert_eq!(req.params["decorated"], "yes");
    }
}
