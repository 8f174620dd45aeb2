//! Loopback HTTP fixtures shared by the transfer and service tests.

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::{Body, Bytes},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use futures::StreamExt;

/// Serve `body` at `/file.bin` (and any `/files/{name}`), the body reversed
/// at `/alt/{name}`, a 500 at `/broken`, and the body at `/flaky` after one
/// 503. `/slow` sends one byte and then stalls for a minute. The counter
/// tracks requests to `/flaky`.
pub(crate) async fn serve(body: Vec<u8>) -> (SocketAddr, Arc<AtomicUsize>) {
    let body = Arc::new(body);
    let hits = Arc::new(AtomicUsize::new(0));

    let file = {
        let body = body.clone();
        move || {
            let body = body.clone();
            async move { Body::from((*body).clone()) }
        }
    };
    let flaky = {
        let body = body.clone();
        let hits = hits.clone();
        move || {
            let body = body.clone();
            let hits = hits.clone();
            async move {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    StatusCode::SERVICE_UNAVAILABLE.into_response()
                } else {
                    Body::from((*body).clone()).into_response()
                }
            }
        }
    };

    let alt = {
        let body = body.clone();
        move || {
            let mut reversed = (*body).clone();
            reversed.reverse();
            async move { Body::from(reversed) }
        }
    };

    let app = Router::new()
        .route("/file.bin", get(file.clone()))
        .route("/files/{name}", get(file))
        .route("/alt/{name}", get(alt))
        .route("/slow", get(slow))
        .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route("/flaky", get(flaky));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

async fn slow() -> Body {
    let first = futures::stream::iter([Ok::<_, Infallible>(Bytes::from_static(b"x"))]);
    let stalled = futures::stream::once(async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok::<_, Infallible>(Bytes::from_static(b"y"))
    });
    Body::from_stream(first.chain(stalled))
}
