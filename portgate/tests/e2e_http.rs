mod common;

use std::convert::Infallible;

use bytes::Bytes;
use common::{Frame, Harness, header, merge, request};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use portgate::config::PoolConfig;
use portgate::error::CODE_LOCAL_UNREACHABLE;
use tokio::net::TcpListener;

const BIG_BODY_LEN: usize = 4 * 1024 * 1024 + 1000;

async fn local_app(request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or_default().to_string();
    let forwarded_for = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let tags: Vec<String> = request
        .headers()
        .get_all("x-tag")
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    let body = request
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes())
        .unwrap_or_default();

    let response = match path.as_str() {
        "/echo" => Response::builder()
            .status(201)
            .header("x-query", query)
            .header("x-forwarded-for-seen", forwarded_for)
            .header("x-tags-seen", tags.join(","))
            .body(Full::new(body)),
        "/big" => {
            let data: Vec<u8> = (0..BIG_BODY_LEN).map(|i| (i % 251) as u8).collect();
            Response::builder()
                .status(200)
                .header("content-type", "application/octet-stream")
                .body(Full::new(Bytes::from(data)))
        }
        _ => Response::builder().status(404).body(Full::new(Bytes::from_static(b"missing"))),
    };
    Ok(response.unwrap_or_default())
}

async fn spawn_local_app() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(local_app))
                    .await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_http_round_trip() {
    let addr = spawn_local_app().await;
    let mut harness = Harness::start(&addr);

    let mut req = request(
        "POST",
        "/echo",
        &[("X-Tag", "a"), ("X-Tag", "b"), ("Content-Type", "text/plain")],
        b"ping",
    );
    req.query = "x=1&y=2".to_string();
    harness.push_http("req-1", req);

    let response = merge(harness.collect_http("req-1").await);
    assert_eq!(response.status_code, 201);
    assert_eq!(response.body, Bytes::from_static(b"ping"));
    assert_eq!(header(&response, "x-query"), Some("x=1&y=2"));
    assert_eq!(header(&response, "x-forwarded-for-seen"), Some("203.0.113.7"));
    assert_eq!(header(&response, "x-tags-seen"), Some("a,b"));

    harness.push_http("req-2", request("GET", "/nope", &[], b""));
    let response = merge(harness.collect_http("req-2").await);
    // Local 4xx answers are relayed untouched.
    assert_eq!(response.status_code, 404);
    assert_eq!(response.body, Bytes::from_static(b"missing"));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_chunked_response_frames() {
    let addr = spawn_local_app().await;
    let mut harness = Harness::start(&addr);
    harness.push_http("big-1", request("GET", "/big", &[], b""));

    let frames = harness.collect_http("big-1").await;
    assert!(frames.len() >= 3, "head plus at least two body frames");
    assert_eq!(frames[0].status_code, 200);
    assert_eq!(
        header(&frames[0], "content-type"),
        Some("application/octet-stream")
    );
    assert!(frames[0].body.is_empty());
    assert!(frames.iter().all(|f| f.body.len() <= 4 * 1024 * 1024));

    let response = merge(frames);
    let expected: Vec<u8> = (0..BIG_BODY_LEN).map(|i| (i % 251) as u8).collect();
    assert_eq!(response.body.to_vec(), expected);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_pooled_forwarder_serves_requests() {
    let addr = spawn_local_app().await;
    let pool = PoolConfig {
        enabled: true,
        max_size: 2,
        ..Default::default()
    };
    let mut harness = Harness::start_with(&addr, pool);

    for i in 0..4 {
        let id = format!("pooled-{i}");
        harness.push_http(&id, request("POST", "/echo", &[], id.as_bytes()));
        let response = merge(harness.collect_http(&id).await);
        assert_eq!(response.body, Bytes::from(id.clone()));
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_local_service_reports_error_frame() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let mut harness = Harness::start(&addr);
    harness.push_http("req-x", request("GET", "/", &[], b""));
    match harness.next_frame().await {
        Frame::Error {
            request_id, code, ..
        } => {
            assert_eq!(request_id, "req-x");
            assert_eq!(code, CODE_LOCAL_UNREACHABLE);
        }
        other => panic!("unexpected frame {other:?}"),
    }
    harness.shutdown().await;
}
