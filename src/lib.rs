//! # reqlog
//!
//! Request correlation and access logging for HTTP services, on a minimal
//! hyper-based framework.
//!
//! ## What you get
//!
//! - **Correlation IDs**: every request carries an `X-ReqId` header. A
//!   caller-supplied value is passed through untouched; otherwise one is
//!   generated by [`id::IdGenerator`]: unique across the process (and the
//!   fleet, given distinct machine IDs), roughly time-ordered, 12 URL-safe
//!   characters. The same value is set on the response.
//! - **One access-log line per request**: written by
//!   [`middleware::Logger`] after the handler chain returns, with status and
//!   method colored for a terminal and any private request errors appended.
//! - **Request-scoped errors**: handlers record
//!   [`request_error::RequestError`]s on their response;
//!   [`middleware::ErrorLogger`] renders the ones you choose into the body
//!   when the handler did not write one.
//!
//! Everything else (TLS, rate limiting, log shipping, rotation) is somebody
//! else's job.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use http::{Method, StatusCode};
//! use reqlog::id::Settings;
//! use reqlog::middleware::{ErrorLogger, Logger, request_logger};
//! use reqlog::request_error::RequestError;
//! use reqlog::{Request, Response, Router, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), reqlog::Error> {
//!     // A process that cannot guarantee unique IDs must not start.
//!     let app = Router::new()
//!         .layer(Logger::from_settings(Settings::new())?)
//!         .layer(ErrorLogger::default())
//!         .on(Method::GET, "/widgets/{id}", get_widget);
//!
//!     Server::bind("0.0.0.0:3000").serve(app).await
//! }
//!
//! async fn get_widget(req: Request) -> Response {
//!     request_logger(&req).log("looking up widget");
//!     Response::status(StatusCode::NOT_FOUND)
//!         .with_error(RequestError::public("widget not found"))
//! }
//! ```

mod error;
mod handler;
mod request;
mod response;
mod router;
mod server;

pub mod id;
pub mod middleware;
pub mod request_error;

pub use error::Error;
pub use handler::{BoxFuture, Handler};
pub use request::Request;
pub use response::{IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::Server;
