//! HTTP server and graceful shutdown.
//!
//! Connections are served by hyper's auto builder (HTTP/1.1 or HTTP/2, as the
//! client negotiates), one tokio task per connection. Every request is turned
//! into a [`Request`] and run through the [`Router`], middleware included.
//!
//! On SIGTERM or Ctrl-C the accept loop stops, and [`Server::serve`] returns
//! only after every open connection has finished. A request that was already
//! accepted therefore completes its middleware chain, and the access line
//! [`Logger`](crate::middleware::Logger) writes for it is not lost to the
//! shutdown.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid `host:port` string.
    pub fn bind(addr: &str) -> Self {
        let addr: SocketAddr = addr.parse().expect("invalid socket address");
        Self { addr }
    }

    /// Accepts connections and runs each request through `router`.
    ///
    /// Fails only if the address cannot be bound. Returns `Ok` once a shutdown
    /// signal has arrived and the in-flight connections have drained.
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        let router = Arc::new(router);

        info!(addr = %self.addr, "reqlog listening");

        let mut tasks = tokio::task::JoinSet::new();

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Shutdown first so a SIGTERM stops accepting immediately,
                // even if more connections are queued.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let router = Arc::clone(&router);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        // Called once per request on the connection.
                        let svc = service_fn(move |req| {
                            let router = Arc::clone(&router);
                            async move { dispatch(router, req, remote_addr).await }
                        });

                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("reqlog stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Converts one hyper request, runs it through the router, converts back.
///
/// Infallible: every failure becomes a response so hyper never sees an error.
async fn dispatch(
    router: Arc<Router>,
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(peer = %remote_addr, "failed to read request body: {e}");
            return Ok(Response::status(StatusCode::BAD_REQUEST).into_inner());
        }
    };

    Ok(router.handle(to_request(parts, body, remote_addr)).await.into_inner())
}

/// Builds a [`Request`] from hyper's request head.
///
/// Header values that are not valid UTF-8 are dropped, never rewritten, so a
/// non-UTF-8 `X-ReqId` counts as absent and a fresh ID is generated.
fn to_request(parts: http::request::Parts, body: Bytes, remote_addr: SocketAddr) -> Request {
    let mut request = Request::new(parts.method, parts.uri.path())
        .with_body(body)
        .with_remote_addr(remote_addr);
    request.headers = parts.headers.iter()
        .filter_map(|(name, value)| match std::str::from_utf8(value.as_bytes()) {
            Ok(value) => Some((name.as_str().to_owned(), value.to_owned())),
            Err(_) => {
                debug!(peer = %remote_addr, header = %name, "dropping non-UTF-8 header value");
                None
            }
        })
        .collect();
    request
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or SIGINT (Ctrl-C only on non-Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderValue, Method};

    use super::*;
    use crate::id::{IdGenerator, RequestId, Settings};
    use crate::middleware::{LogSink, Logger, REQUEST_ID_HEADER};

    fn head(request_id: &[u8]) -> http::request::Parts {
        http::Request::builder()
            .uri("/widgets")
            .header("x-reqid", HeaderValue::from_bytes(request_id).unwrap())
            .header("x-note", HeaderValue::from_bytes("café".as_bytes()).unwrap())
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    fn peer() -> SocketAddr {
        "192.0.2.1:5000".parse().unwrap()
    }

    #[test]
    fn utf8_header_values_are_kept_verbatim() {
        let req = to_request(head(b"abc123"), Bytes::new(), peer());
        assert_eq!(req.header(REQUEST_ID_HEADER), Some("abc123"));
        assert_eq!(req.header("x-note"), Some("café"));
    }

    #[test]
    fn non_utf8_header_values_are_dropped() {
        let req = to_request(head(b"ab\xe9cd"), Bytes::new(), peer());
        assert_eq!(req.header(REQUEST_ID_HEADER), None);
        assert_eq!(req.header("x-note"), Some("café"));
    }

    #[tokio::test]
    async fn non_utf8_request_id_is_replaced_not_mangled() {
        let generator = Arc::new(IdGenerator::new(Settings::new().machine_id(5)).unwrap());
        let router = Router::new()
            .layer(Logger::with_sink(generator, LogSink::new(std::io::sink())))
            .on(Method::GET, "/widgets", |_req: Request| async { "ok" });

        let req = to_request(head(b"ab\xe9cd"), Bytes::new(), peer());
        let res = router.handle(req).await.into_inner();

        let echoed = res.headers().get("x-reqid").expect("response carries X-ReqId");
        assert!(!echoed.as_bytes().contains(&0xef), "{echoed:?}");
        assert!(RequestId::decode(echoed.to_str().unwrap()).is_ok(), "{echoed:?}");
    }
}
