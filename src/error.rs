//! Unified error type.

use crate::id::IdError;

/// The error type returned by reqlog's fallible setup operations.
///
/// Application-level errors (404, 422, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values, and request-scoped failures as
/// [`RequestError`](crate::request_error::RequestError)s on them. This type
/// surfaces infrastructure failures: binding to a port, or a request-id
/// generator that cannot be built.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("request id: {0}")]
    Id(#[from] IdError),
}
