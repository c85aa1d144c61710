//! Plain-text metrics endpoint for `--profile <addr>`.
//!
//! Serves the per-recording percentile summary so a long-running instance
//! can be inspected without attaching a debugger.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{info, warn};
use tokio::net::TcpListener;

use crate::app::App;

pub async fn serve(addr: String, app: Arc<App>) -> Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding metrics endpoint on {addr}"))?;
    info!("metrics endpoint listening on http://{addr}/metrics");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("metrics endpoint accept failed: {e}");
                continue;
            }
        };
        let app = app.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let app = app.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" | "/" => {
                            let body = app.metrics.lock().unwrap().render();
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "text/plain; charset=utf-8")
                                .body(Full::new(Bytes::from(body)))
                        }
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Full::new(Bytes::from_static(b"not found\n"))),
                    };
                    response.map_err(|e| anyhow::anyhow!("building response: {e}"))
                }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                warn!("metrics connection error: {e}");
            }
        });
    }
}
