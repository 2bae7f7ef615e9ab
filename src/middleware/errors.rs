//! Surfaces recorded request errors in the response body.

use tracing::warn;

use crate::handler::BoxFuture;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::request_error::ErrorType;

/// Writes the response's errors of one classification as a JSON body.
///
/// Runs after the rest of the chain. Does nothing when a handler already
/// wrote a body or when no error matches; otherwise the body becomes the
/// serialized errors and the status is left as the handler set it. Errors of
/// other classifications stay on the response for outer middleware.
///
/// ```rust
/// use reqlog::Router;
/// use reqlog::middleware::ErrorLogger;
/// use reqlog::request_error::ErrorType;
///
/// let app = Router::new().layer(ErrorLogger::new(ErrorType::PUBLIC));
/// ```
#[derive(Clone, Copy, Debug)]
pub struct ErrorLogger {
    filter: ErrorType,
}

impl ErrorLogger {
    pub fn new(filter: ErrorType) -> Self {
        Self { filter }
    }
}

/// Surfaces every classification.
impl Default for ErrorLogger {
    fn default() -> Self {
        Self::new(ErrorType::ANY)
    }
}

impl Middleware for ErrorLogger {
    fn handle(&self, req: Request, next: Next) -> BoxFuture {
        let filter = self.filter;
        Box::pin(async move {
            let mut res = next.run(req).await;
            if res.is_written() {
                return res;
            }
            let errors = res.errors().by_type(filter);
            if errors.is_empty() {
                return res;
            }
            match serde_json::to_vec(&errors) {
                Ok(body) => res.write_json(body),
                Err(e) => warn!("cannot serialize request errors: {e}"),
            }
            res
        })
    }
}
