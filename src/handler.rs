//! HTTP inspection service
//!
//! Serves the inspection endpoints on the configured listener. A
//! request to the ingest path carries a JSON envelope describing the
//! request an upstream proxy is holding; a request to any other path
//! is itself the subject of inspection (the inspector mounts as a
//! catch-all, since the inspected path is arbitrary). Both forms
//! return the same JSON verdict with `200 OK` for allow and
//! `403 Forbidden` for block.
//!
//! Evaluation failures never leak as errors to the caller: the verdict
//! falls back to the configured fail-open/fail-closed policy and the
//! incident is logged.

use crate::engine::{Decision, Engine};
use crate::request::{Ingest, Request as WafRequest};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// JSON verdict returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// `"allow"` or `"block"`
    pub decision: String,
    /// Anomaly score
    pub score: u32,
    /// Number of rules that fired
    pub matched_count: usize,
}

impl Verdict {
    fn from_decision(decision: &Decision) -> Self {
        Self {
            decision: decision.verdict().to_string(),
            score: decision.score,
            matched_count: decision.matches.len(),
        }
    }
}

/// The inspection HTTP server.
pub struct InspectServer {
    engine: Arc<Engine>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl InspectServer {
    /// Create a server over an engine handle.
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            shutdown_tx: None,
            local_addr: None,
        }
    }

    /// Bind the configured listener and start serving.
    pub async fn start(&mut self) -> std::io::Result<()> {
        let addr = self.engine.config().listen_addr.clone();
        let listener = TcpListener::bind(addr.as_str()).await?;
        self.local_addr = Some(listener.local_addr()?);
        info!(addr = %self.local_addr.unwrap(), "inspection listener ready");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        let engine = Arc::clone(&self.engine);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote_addr)) => {
                                debug!(%remote_addr, "new inspection connection");
                                let engine = Arc::clone(&engine);
                                tokio::spawn(async move {
                                    let io = TokioIo::new(stream);
                                    let service = service_fn(move |req| {
                                        let engine = Arc::clone(&engine);
                                        async move {
                                            handle_request(req, &engine, remote_addr).await
                                        }
                                    });
                                    if let Err(e) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        debug!("connection error: {e}");
                                    }
                                });
                            },
                            Err(e) => {
                                error!("accept error: {e}");
                            },
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("inspection listener shutting down");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop accepting connections.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }

    /// Bound address, available after `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// Route one request and produce its verdict response.
async fn handle_request(
    req: Request<Incoming>,
    engine: &Engine,
    remote_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let client_ip = remote_addr.ip().to_string();
    let path = req.uri().path().to_string();

    let decision = if path == engine.config().ingest_path {
        handle_ingest(req, engine, &client_ip).await
    } else {
        handle_inspect(req, engine, &client_ip).await
    };

    Ok(verdict_response(&decision))
}

/// Inspect the inbound request itself.
async fn handle_inspect(req: Request<Incoming>, engine: &Engine, client_ip: &str) -> Decision {
    let (parts, body) = req.into_parts();

    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("could not read request body: {e}");
            return engine.failure_decision();
        },
    };
    let capped = &body[..body.len().min(engine.config().max_body_size)];

    let uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let waf_req = WafRequest::from_http(parts.method.as_str(), uri, &headers, capped);
    engine.inspect(client_ip, &waf_req)
}

/// Inspect a request described by an ingest envelope.
async fn handle_ingest(req: Request<Incoming>, engine: &Engine, client_ip: &str) -> Decision {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("could not read ingest body: {e}");
            return engine.failure_decision();
        },
    };

    let ingest: Ingest = match serde_json::from_slice(&body) {
        Ok(ingest) => ingest,
        Err(e) => {
            warn!("malformed ingest envelope: {e}");
            return engine.failure_decision();
        },
    };

    let waf_req = WafRequest::from_ingest(ingest);
    engine.inspect(client_ip, &waf_req)
}

/// Serialize a decision into the JSON verdict response.
fn verdict_response(decision: &Decision) -> Response<Full<Bytes>> {
    let verdict = Verdict::from_decision(decision);
    let status = if decision.block {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::OK
    };
    let body = serde_json::to_vec(&verdict).unwrap_or_else(|_| b"{}".to_vec());

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
