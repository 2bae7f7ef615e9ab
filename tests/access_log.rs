mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use http::{Method, StatusCode};
use reqlog::id::{ClockSource, RequestId};
use reqlog::middleware::{LogSink, Logger, REQUEST_ID_HEADER, request_logger};
use reqlog::request_error::RequestError;
use reqlog::{Request, Response, Router};
use tokio::sync::oneshot;

use common::{Broken, Capture, NOW_MS, VirtualClock, generator, generator_on, logger};

async fn widgets(_req: Request) -> Response {
    Response::text("ok").with_error(RequestError::private("cache miss"))
}

async fn echo_request_id(req: Request) -> String {
    req.header(REQUEST_ID_HEADER).unwrap_or_default().to_owned()
}

#[tokio::test]
async fn propagates_caller_request_id() {
    let capture = Capture::default();
    let app = Router::new()
        .layer(logger(&capture))
        .on(Method::GET, "/widgets", widgets);

    let req = Request::new(Method::GET, "/widgets")
        .with_header("X-ReqId", "abc123")
        .with_remote_addr("192.0.2.7:4000".parse().unwrap());
    let res = app.handle(req).await;

    assert_eq!(res.status_code(), StatusCode::OK);
    assert_eq!(res.header(REQUEST_ID_HEADER), Some("abc123"));

    let text = capture.text();
    let lines = capture.access_lines();
    assert_eq!(lines.len(), 1, "{text:?}");
    let line = &lines[0];
    assert!(line.starts_with("[GIN] [abc123] "), "{line:?}");
    assert!(line.contains(" 200 "), "{line:?}");
    assert!(line.contains("| 192.0.2.7 |"), "{line:?}");
    assert!(line.contains(" GET     /widgets"), "{line:?}");
    assert!(text.ends_with("/widgets\nError #01: cache miss\n"), "{text:?}");
}

#[tokio::test]
async fn generates_request_id_when_absent() {
    let capture = Capture::default();
    let app = Router::new()
        .layer(logger(&capture))
        .on(Method::GET, "/echo", echo_request_id);

    let res = app.handle(Request::new(Method::GET, "/echo")).await;

    let header = res.header(REQUEST_ID_HEADER).expect("response carries X-ReqId");
    assert!(RequestId::decode(header).is_ok(), "{header}");
    assert_eq!(res.body(), header.as_bytes(), "handler saw the same id");
    assert!(capture.text().starts_with(&format!("[GIN] [{header}] ")));
}

#[tokio::test]
async fn empty_header_counts_as_absent() {
    let capture = Capture::default();
    let app = Router::new()
        .layer(logger(&capture))
        .on(Method::GET, "/echo", echo_request_id);

    let res = app.handle(Request::new(Method::GET, "/echo").with_header("x-reqid", "")).await;

    let header = res.header(REQUEST_ID_HEADER).unwrap();
    assert!(RequestId::decode(header).is_ok());
}

#[tokio::test]
async fn one_line_per_concurrent_request() {
    let capture = Capture::default();
    let app = Arc::new(
        Router::new()
            .layer(logger(&capture))
            .on(Method::GET, "/echo", echo_request_id),
    );

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..64 {
        let app = Arc::clone(&app);
        tasks.spawn(async move { app.handle(Request::new(Method::GET, "/echo")).await });
    }
    let mut ids = HashSet::new();
    while let Some(res) = tasks.join_next().await {
        ids.insert(res.unwrap().header(REQUEST_ID_HEADER).unwrap().to_owned());
    }

    assert_eq!(ids.len(), 64);
    assert_eq!(capture.access_lines().len(), 64);
}

#[tokio::test]
async fn unmatched_route_is_logged_as_404() {
    let capture = Capture::default();
    let app = Router::new().layer(logger(&capture));

    let res = app.handle(Request::new(Method::DELETE, "/nowhere")).await;

    assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
    assert!(res.header(REQUEST_ID_HEADER).is_some());
    let lines = capture.access_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("|\x1b[97;43m 404 \x1b[0m|"), "{:?}", lines[0]);
    assert!(lines[0].contains("|\x1b[97;41m  \x1b[0m DELETE  /nowhere"), "{:?}", lines[0]);
}

#[tokio::test]
async fn panicking_handler_is_logged_as_500() {
    async fn boom(_req: Request) -> Response {
        panic!("handler bug");
    }

    let capture = Capture::default();
    let app = Router::new()
        .layer(logger(&capture))
        .on(Method::POST, "/boom", boom);

    let res = app.handle(Request::new(Method::POST, "/boom").with_header("X-ReqId", "p-1")).await;

    assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(res.header(REQUEST_ID_HEADER), Some("p-1"));
    let lines = capture.access_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("[GIN] [p-1] ") && lines[0].contains(" 500 "));
}

#[tokio::test]
async fn abandoned_request_is_still_logged() {
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let started_tx = Arc::new(parking_lot::Mutex::new(Some(started_tx)));

    let capture = Capture::default();
    let app = Arc::new(
        Router::new()
            .layer(logger(&capture))
            .on(Method::GET, "/slow", move |_req: Request| {
                let started_tx = Arc::clone(&started_tx);
                async move {
                    if let Some(tx) = started_tx.lock().take() {
                        let _ = tx.send(());
                    }
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    "too late"
                }
            }),
    );

    let task = tokio::spawn({
        let app = Arc::clone(&app);
        async move { app.handle(Request::new(Method::GET, "/slow").with_header("X-ReqId", "gone")).await }
    });
    started_rx.await.unwrap();
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let lines = capture.access_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("[GIN] [gone] ") && lines[0].contains(" 499 "), "{:?}", lines[0]);
}

#[tokio::test]
async fn handlers_log_through_the_request_logger() {
    let capture = Capture::default();
    let app = Router::new()
        .layer(logger(&capture))
        .on(Method::PUT, "/items/{id}", |req: Request| async move {
            let log = request_logger(&req);
            log.log(format_args!("updating item {}", req.param("id").unwrap_or("?")));
            StatusCode::NO_CONTENT
        });

    app.handle(Request::new(Method::PUT, "/items/9").with_header("X-ReqId", "rid-9")).await;

    let text = capture.text();
    assert!(text.starts_with("[GIN] [rid-9] updating item 9\n"), "{text:?}");
    assert_eq!(capture.access_lines().len(), 1);
}

#[tokio::test]
async fn sink_failure_does_not_fail_the_request() {
    let app = Router::new()
        .layer(Logger::with_sink(generator(), LogSink::new(Broken)))
        .on(Method::GET, "/widgets", widgets);

    let res = app.handle(Request::new(Method::GET, "/widgets")).await;

    assert_eq!(res.status_code(), StatusCode::OK);
    assert_eq!(res.body(), b"ok");
    assert!(res.header(REQUEST_ID_HEADER).is_some());
}

#[tokio::test]
async fn failed_id_generation_skips_the_chain_but_is_logged() {
    let clock = VirtualClock::at(NOW_MS);
    let reached = Arc::new(AtomicUsize::new(0));
    let capture = Capture::default();
    let app = Router::new()
        .layer(Logger::with_sink(generator_on(&clock), capture.sink()))
        .on(Method::GET, "/widgets", {
            let reached = Arc::clone(&reached);
            move |_req: Request| {
                let reached = Arc::clone(&reached);
                async move {
                    reached.fetch_add(1, Ordering::SeqCst);
                    "ok"
                }
            }
        });

    let res = app.handle(Request::new(Method::GET, "/widgets")).await;
    assert_eq!(res.status_code(), StatusCode::OK);

    clock.set(NOW_MS - 60_000);
    let res = app.handle(Request::new(Method::GET, "/widgets")).await;

    assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(reached.load(Ordering::SeqCst), 1, "handler ran for the failed request");

    let text = capture.text();
    let lines = capture.access_lines();
    assert_eq!(lines.len(), 2, "{text:?}");
    assert!(lines[1].starts_with("[GIN] [] ") && lines[1].contains(" 500 "), "{:?}", lines[1]);
    assert!(
        text.ends_with("/widgets\nError #01: request id generation failed: clock moved backwards: partition 29047034000 is earlier than 29047040000\n"),
        "{text:?}"
    );
}

async fn exhaust_one_partition() {
    let clock = VirtualClock::at(NOW_MS);
    let capture = Capture::default();
    let app = Router::new()
        .layer(Logger::with_sink(generator_on(&clock), capture.sink()))
        .on(Method::GET, "/echo", echo_request_id);

    let mut ids = Vec::new();
    for _ in 0..257 {
        let res = app.handle(Request::new(Method::GET, "/echo")).await;
        ids.push(RequestId::decode(res.header(REQUEST_ID_HEADER).unwrap()).unwrap());
    }

    let first = ids[0].decompose().time;
    assert!(ids[..256].iter().all(|id| id.decompose().time == first));
    assert_eq!(ids[256].decompose().time, first + 1);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 257);
    assert!(clock.now() >= NOW_MS + 10, "returned before the next partition began");
    assert_eq!(capture.access_lines().len(), 257);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_partition_waits_on_multi_threaded_runtime() {
    exhaust_one_partition().await;
}

#[tokio::test]
async fn exhausted_partition_waits_on_current_thread_runtime() {
    exhaust_one_partition().await;
}
