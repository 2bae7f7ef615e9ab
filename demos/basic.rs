//! Minimal reqlog example: correlated access logs and surfaced errors.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/widgets/42
//!   curl -i -H 'X-ReqId: abc123' http://localhost:3000/widgets/0
//!   curl -i -X POST http://localhost:3000/widgets -d '{"name":"gear"}'
//!   curl -i http://localhost:3000/nowhere

use std::sync::Arc;

use http::{Method, StatusCode};
use reqlog::id::{IdGenerator, Settings};
use reqlog::middleware::{ErrorLogger, LogSink, Logger, request_logger};
use reqlog::request_error::{ErrorType, RequestError};
use reqlog::{Request, Response, Router, Server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let ids = Arc::new(IdGenerator::new(Settings::new()).expect("request id generator"));

    let app = Router::new()
        .layer(Logger::with_sink(ids, LogSink::stdout()))
        .layer(ErrorLogger::new(ErrorType::PUBLIC))
        .on(Method::GET,  "/widgets/{id}", get_widget)
        .on(Method::POST, "/widgets",      create_widget);

    Server::bind("0.0.0.0:3000")
        .serve(app)
        .await
        .expect("server error");
}

// GET /widgets/{id}
//
// id 0 does not exist: the public error becomes the JSON body, the private
// one only shows up in the access log.
async fn get_widget(req: Request) -> Response {
    let id = req.param("id").unwrap_or("0");
    request_logger(&req).log(format_args!("fetching widget {id}"));

    if id == "0" {
        return Response::status(StatusCode::NOT_FOUND)
            .with_error(RequestError::private("cache miss"))
            .with_error(RequestError::public("widget not found"));
    }
    Response::json(format!(r#"{{"id":"{id}","name":"gear"}}"#).into_bytes())
}

// POST /widgets
async fn create_widget(req: Request) -> Response {
    if req.body().is_empty() {
        return Response::status(StatusCode::BAD_REQUEST)
            .with_error(RequestError::public("empty body"));
    }
    Response::builder()
        .status(StatusCode::CREATED)
        .header("location", "/widgets/99")
        .json(r#"{"id":"99","name":"gear"}"#.to_owned().into_bytes())
}
