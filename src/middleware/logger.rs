//! Request correlation and access logging.
//!
//! [`Logger`] resolves a correlation ID for every request, makes it visible
//! to handlers and callers through the [`REQUEST_ID_HEADER`] header, times
//! the rest of the chain and writes exactly one line per request:
//!
//! ```text
//! [GIN] [AICAgICAgICA] 2024/01/02 - 03:04:05 |\x1b[97;42m 200 \x1b[0m|      1.5024ms | 10.0.0.9 |\x1b[97;44m  \x1b[0m GET     /widgets
//! Error #01: cache miss
//! ```
//!
//! The trailing lines are the request's [`ErrorType::PRIVATE`] errors and
//! are absent when there are none. Downstream tooling parses this layout;
//! keep it stable.
//!
//! A line is written even when the handler panics (status 500) or the
//! request future is dropped before the chain returns (status 499). Write
//! failures are reported through `tracing` and otherwise ignored.

use std::fmt;
use std::io::{self, Write};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use futures::FutureExt;
use http::StatusCode;
use parking_lot::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{error, warn};

use crate::error::Error;
use crate::handler::BoxFuture;
use crate::id::{IdError, IdGenerator, RequestId, Settings};
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::request_error::{ErrorType, RequestError};
use crate::response::Response;

/// Correlation header read from requests and set on every response.
pub const REQUEST_ID_HEADER: &str = "X-ReqId";

/// Logged when the request future is dropped before the chain returns.
const CLIENT_CLOSED_REQUEST: u16 = 499;

const TIMESTAMP_FORMAT: &str = "%Y/%m/%d - %H:%M:%S";

pub const GREEN: &str = "\x1b[97;42m";
pub const WHITE: &str = "\x1b[90;47m";
pub const YELLOW: &str = "\x1b[97;43m";
pub const RED: &str = "\x1b[97;41m";
pub const BLUE: &str = "\x1b[97;44m";
pub const MAGENTA: &str = "\x1b[97;45m";
pub const CYAN: &str = "\x1b[97;46m";
pub const RESET: &str = "\x1b[0m";

// ── Sink ──────────────────────────────────────────────────────────────────────

/// Shared destination for log lines.
///
/// Clones write to the same underlying writer. Each line is written and
/// flushed under one lock, so concurrent requests never interleave.
#[derive(Clone)]
pub struct LogSink(Arc<Mutex<Box<dyn Write + Send>>>);

impl LogSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(Box::new(writer))))
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub(crate) fn write_line(&self, line: &str) -> io::Result<()> {
        let mut out = self.0.lock();
        out.write_all(line.as_bytes())?;
        out.flush()
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::stderr()
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogSink")
    }
}

// ── Per-request handle ────────────────────────────────────────────────────────

/// Log handle for one request, tagged with its correlation ID.
///
/// Reach it from a handler with [`request_logger`] or [`Request::logger`].
#[derive(Clone, Debug)]
pub struct RequestLogger {
    request_id: Arc<str>,
    sink: LogSink,
}

impl RequestLogger {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Writes `[GIN] [<reqid>] <message>` to the access-log sink.
    pub fn log(&self, message: impl fmt::Display) {
        let line = format!("[GIN] [{}] {message}\n", self.request_id);
        if let Err(e) = self.sink.write_line(&line) {
            warn!(request_id = %self.request_id, "request log write failed: {e}");
        }
    }
}

/// The [`RequestLogger`] installed by [`Logger`] for this request.
///
/// # Panics
///
/// Panics when `req` did not pass through [`Logger`]. That is a wiring bug,
/// not a runtime condition.
pub fn request_logger(req: &Request) -> &RequestLogger {
    req.logger()
        .unwrap_or_else(|| panic!("no request logger on {} {}: is Logger installed?", req.method(), req.path()))
}

// ── Access log entry ──────────────────────────────────────────────────────────

/// Everything printed for one request. `Display` renders the full line,
/// newline included.
#[derive(Clone, Debug)]
pub struct AccessLogEntry {
    pub request_id: String,
    pub timestamp: NaiveDateTime,
    pub status: u16,
    pub latency: Duration,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub comment: String,
}

impl fmt::Display for AccessLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[GIN] [{}] {} |{} {:>3} {}| {:>13} | {} |{}  {} {:<7} {}\n{}",
            self.request_id,
            self.timestamp.format(TIMESTAMP_FORMAT),
            color_for_status(self.status),
            self.status,
            RESET,
            format_latency(self.latency),
            self.client_ip,
            color_for_method(&self.method),
            RESET,
            self.method,
            self.path,
            self.comment,
        )?;
        if !self.comment.is_empty() && !self.comment.ends_with('\n') {
            f.write_str("\n")?;
        }
        Ok(())
    }
}

pub fn color_for_status(code: u16) -> &'static str {
    match code {
        200..=299 => GREEN,
        300..=399 => WHITE,
        400..=499 => YELLOW,
        _ => RED,
    }
}

pub fn color_for_method(method: &str) -> &'static str {
    match method {
        "GET" => BLUE,
        "POST" => CYAN,
        "PUT" => YELLOW,
        "DELETE" => RED,
        "PATCH" => GREEN,
        "HEAD" => MAGENTA,
        "OPTIONS" => WHITE,
        _ => RESET,
    }
}

/// Shortest unit that keeps the integer part non-zero, trailing zeros
/// trimmed: `850ns`, `12.5µs`, `1.5024ms`, `2s`, `1m3.25s`, `2h0m1s`.
pub fn format_latency(latency: Duration) -> String {
    let nanos = latency.as_nanos();
    match nanos {
        0 => "0s".to_owned(),
        1..=999 => format!("{nanos}ns"),
        1_000..=999_999 => with_fraction(nanos, 1_000, "µs"),
        1_000_000..=999_999_999 => with_fraction(nanos, 1_000_000, "ms"),
        _ => {
            let secs = latency.as_secs();
            let (hours, minutes) = (secs / 3600, secs % 3600 / 60);
            let seconds = with_fraction(
                u128::from(secs % 60) * 1_000_000_000 + u128::from(latency.subsec_nanos()),
                1_000_000_000,
                "s",
            );
            if hours > 0 {
                format!("{hours}h{minutes}m{seconds}")
            } else if minutes > 0 {
                format!("{minutes}m{seconds}")
            } else {
                seconds
            }
        }
    }
}

fn with_fraction(value: u128, unit: u128, suffix: &str) -> String {
    let (whole, frac) = (value / unit, value % unit);
    if frac == 0 {
        return format!("{whole}{suffix}");
    }
    let width = unit.ilog10() as usize;
    let digits = format!("{frac:0width$}");
    format!("{whole}.{}{suffix}", digits.trim_end_matches('0'))
}

// ── Middleware ────────────────────────────────────────────────────────────────

/// Correlation-ID and access-log middleware.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use reqlog::Router;
/// use reqlog::id::{IdGenerator, Settings};
/// use reqlog::middleware::{LogSink, Logger};
///
/// let generator = Arc::new(IdGenerator::new(Settings::new()).expect("request id generator"));
/// let app = Router::new().layer(Logger::with_sink(generator, LogSink::stdout()));
/// ```
#[derive(Clone)]
pub struct Logger {
    generator: Arc<IdGenerator>,
    sink: LogSink,
}

impl Logger {
    /// Logs to stderr.
    pub fn new(generator: Arc<IdGenerator>) -> Self {
        Self::with_sink(generator, LogSink::default())
    }

    pub fn with_sink(generator: Arc<IdGenerator>, sink: LogSink) -> Self {
        Self { generator, sink }
    }

    /// Builds a dedicated generator from `settings` and logs to stderr.
    pub fn from_settings(settings: Settings) -> Result<Self, Error> {
        Ok(Self::new(Arc::new(IdGenerator::new(settings)?)))
    }
}

/// Issues an ID. When the partition is exhausted the wait for the next one
/// runs in `block_in_place` on a multi-threaded runtime, so the worker's
/// other tasks move to another thread meanwhile.
fn next_request_id(generator: &IdGenerator) -> Result<RequestId, IdError> {
    let reservation = generator.reserve()?;
    if !generator.is_due(&reservation) {
        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => {
                tokio::task::block_in_place(|| generator.wait_for(&reservation))?;
            }
            _ => generator.wait_for(&reservation)?,
        }
    }
    Ok(reservation.id)
}

impl Middleware for Logger {
    fn handle(&self, mut req: Request, next: Next) -> BoxFuture {
        let this = self.clone();
        Box::pin(async move {
            let start = Instant::now();

            let request_id = match req.header(REQUEST_ID_HEADER).filter(|v| !v.is_empty()) {
                Some(id) => id.to_owned(),
                None => match next_request_id(&this.generator) {
                    Ok(id) => {
                        let id = id.to_string();
                        req.set_header(REQUEST_ID_HEADER, &id);
                        id
                    }
                    Err(e) => {
                        error!(method = %req.method(), path = req.path(), "request id generation failed: {e}");
                        let res = Response::status(StatusCode::INTERNAL_SERVER_ERROR)
                            .with_error(RequestError::private(format!("request id generation failed: {e}")));
                        PendingLine::new(&this.sink, String::new(), start, &req).finish(&res);
                        return res;
                    }
                },
            };

            req.logger = Some(RequestLogger {
                request_id: Arc::from(request_id.as_str()),
                sink: this.sink.clone(),
            });

            let mut line = PendingLine::new(&this.sink, request_id.clone(), start, &req);
            let mut res = match AssertUnwindSafe(next.run(req)).catch_unwind().await {
                Ok(res) => res,
                Err(_) => {
                    error!(request_id = %request_id, "handler panicked");
                    Response::status(StatusCode::INTERNAL_SERVER_ERROR)
                }
            };
            res.set_header(REQUEST_ID_HEADER, &request_id);
            line.finish(&res);
            res
        })
    }
}

/// An access line waiting for the chain's outcome.
///
/// Written by [`finish`](PendingLine::finish), or on drop with status 499
/// when the request was abandoned mid-chain.
struct PendingLine {
    sink: LogSink,
    request_id: String,
    start: Instant,
    client_ip: String,
    method: String,
    path: String,
    done: bool,
}

impl PendingLine {
    fn new(sink: &LogSink, request_id: String, start: Instant, req: &Request) -> Self {
        Self {
            sink: sink.clone(),
            request_id,
            start,
            client_ip: req.client_ip(),
            method: req.method().to_string(),
            path: req.path().to_owned(),
            done: false,
        }
    }

    fn finish(&mut self, res: &Response) {
        let comment = res.errors().by_type(ErrorType::PRIVATE).to_string();
        self.emit(res.status_code().as_u16(), comment);
    }

    fn emit(&mut self, status: u16, comment: String) {
        if self.done {
            return;
        }
        self.done = true;

        let entry = AccessLogEntry {
            request_id: std::mem::take(&mut self.request_id),
            timestamp: Local::now().naive_local(),
            status,
            latency: self.start.elapsed(),
            client_ip: std::mem::take(&mut self.client_ip),
            method: std::mem::take(&mut self.method),
            path: std::mem::take(&mut self.path),
            comment,
        };
        if let Err(e) = self.sink.write_line(&entry.to_string()) {
            warn!(request_id = %entry.request_id, "access log write failed: {e}");
        }
    }
}

impl Drop for PendingLine {
    fn drop(&mut self) {
        self.emit(CLIENT_CLOSED_REQUEST, String::new());
    }
}
