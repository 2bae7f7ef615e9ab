//! Middleware layer.
//!
//! Middleware wraps every route with cross-cutting logic. Each one receives
//! the request and an explicit [`Next`] continuation; whatever it does before
//! `next.run(req)` happens on the way in, whatever it does after happens on
//! the way out, once every inner stage has produced the final response.
//!
//! ```text
//! Logger ──► ErrorLogger ──► handler
//!   │            │              │
//!   │            ◄──────────────┘  fills body from errors if unwritten
//!   ◄────────────┘                 stamps X-ReqId, writes the access line
//! ```
//!
//! Layers run outermost-first in the order they were added with
//! [`Router::layer`](crate::Router::layer).
//!
//! Built-in middleware:
//! - [`Logger`]: request-id propagation and one access-log line per request
//! - [`ErrorLogger`]: renders recorded request errors into unwritten bodies
//!
//! Any `async fn(Request, Next) -> Response` is middleware too:
//!
//! ```rust
//! use reqlog::{Request, Response};
//! use reqlog::middleware::Next;
//!
//! async fn server_header(req: Request, next: Next) -> Response {
//!     let mut res = next.run(req).await;
//!     res.set_header("server", "reqlog");
//!     res
//! }
//! ```

pub mod errors;
pub mod logger;

use std::future::Future;
use std::sync::Arc;

use crate::handler::{BoxFuture, BoxedHandler};
use crate::request::Request;
use crate::response::Response;

pub use errors::ErrorLogger;
pub use logger::{LogSink, Logger, RequestLogger, REQUEST_ID_HEADER, request_logger};

/// A stage wrapped around the rest of the chain.
pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, req: Request, next: Next) -> BoxFuture;
}

impl<F, Fut> Middleware for F
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn handle(&self, req: Request, next: Next) -> BoxFuture {
        Box::pin((self)(req, next))
    }
}

pub(crate) type Stack = Arc<[Arc<dyn Middleware>]>;

/// The remainder of the chain: the layers not yet run, then the endpoint.
///
/// Consumed by [`run`](Next::run), so each stage continues the chain at
/// most once.
pub struct Next {
    stack: Stack,
    index: usize,
    endpoint: BoxedHandler,
}

impl Next {
    pub(crate) fn new(stack: Stack, endpoint: BoxedHandler) -> Self {
        Self { stack, index: 0, endpoint }
    }

    pub fn run(self, req: Request) -> BoxFuture {
        let Some(layer) = self.stack.get(self.index).cloned() else {
            return self.endpoint.call(req);
        };
        let next = Self { index: self.index + 1, ..self };
        layer.handle(req, next)
    }
}
