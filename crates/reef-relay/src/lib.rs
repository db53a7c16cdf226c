//! Server-side realtime core: socket routing, backend access, and the
//! long-poll command-completion loop.
//!
//! Responsibilities:
//! - matching inbound (path, verb) requests to registered handlers
//! - bridging channel requests onto the HTTP-style backend API
//! - polling slow backend commands to completion and streaming results
//!   back over the originating channel

mod backend;
mod dispatch;
mod longpoll;
mod middleware;
mod router;

pub use backend::{ApiResponse, Backend, BackendError, HttpBackend};
pub use dispatch::RelayDispatcher;
pub use longpoll::{CompletionLoop, CompletionLoopConfig, DEFAULT_POLL_INTERVAL};
pub use middleware::{Flow, MiddlewareChain, MiddlewareHandler, MiddlewareRouter};
pub use router::{Handler, PathRouter, Request, Response, RouterError, SocketRouter};
