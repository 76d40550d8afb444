//! HTTP/1.1 reverse proxy distributing requests across cluster workers
//!
//! For each request the proxy snapshots the roster, selects a worker, opens a
//! fresh upstream connection to it on loopback and streams the request and
//! response through. The selected worker's connection counter is incremented
//! before the upstream call and decremented when the response stream ends,
//! on every path.

use crate::balancer::WorkerSelector;
use crate::config::Strategy;
use crate::error::bad_gateway;
use crate::worker::{ConnectionGuard, Roster};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// The reverse proxy server
pub struct ReverseProxy {
    bind_addr: SocketAddr,
    roster: Arc<Roster>,
    selector: Arc<WorkerSelector>,
    client: Client<HttpConnector, Incoming>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ReverseProxy {
    pub fn new(
        bind_addr: SocketAddr,
        roster: Arc<Roster>,
        strategy: Strategy,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        // Zero idle connections per host: every request opens its own
        // upstream connection and closes it on completion
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            bind_addr,
            roster,
            selector: Arc::new(WorkerSelector::new(strategy)),
            client,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(
            addr = %self.bind_addr,
            strategy = ?self.selector.strategy(),
            "Reverse proxy listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let roster = Arc::clone(&self.roster);
                            let selector = Arc::clone(&self.selector);
                            let client = self.client.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, roster, selector, client).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Reverse proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    roster: Arc<Roster>,
    selector: Arc<WorkerSelector>,
    client: Client<HttpConnector, Incoming>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let roster = Arc::clone(&roster);
        let selector = Arc::clone(&selector);
        let client = client.clone();
        async move { handle_request(req, roster, selector, client).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    roster: Arc<Roster>,
    selector: Arc<WorkerSelector>,
    client: Client<HttpConnector, Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let workers = roster.snapshot();
    let worker = match selector.select(&workers) {
        Some(w) => w,
        None => {
            error!("No workers available");
            return Ok(bad_gateway());
        }
    };

    // Count the connection before the upstream call; the guard rides in the
    // response body so the decrement lands when the stream ends
    let guard = ConnectionGuard::new(Arc::clone(&worker));

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://127.0.0.1:{}{}", worker.port(), path_and_query);

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(&uri);

    // Copy every header except Host; the upstream client sets its own from
    // the request URI
    for (name, value) in parts.headers.iter() {
        if name != hyper::header::HOST {
            builder = builder.header(name, value);
        }
    }

    let upstream_req = match builder.body(body) {
        Ok(r) => r,
        Err(e) => {
            error!(port = worker.port(), error = %e, "Failed to build upstream request");
            return Ok(bad_gateway());
        }
    };

    match client.request(upstream_req).await {
        Ok(response) => {
            debug!(
                id = worker.id(),
                port = worker.port(),
                status = %response.status(),
                "Forwarded request"
            );
            let (parts, body) = response.into_parts();
            let body = TrackedBody {
                inner: body.boxed(),
                _guard: guard,
            };
            Ok(Response::from_parts(parts, body.boxed()))
        }
        Err(e) => {
            error!(
                id = worker.id(),
                port = worker.port(),
                error = %e,
                "Failed to forward request to worker"
            );
            Ok(bad_gateway())
        }
    }
}

/// Response body that holds the connection guard until the stream ends
struct TrackedBody {
    inner: BoxBody<Bytes, hyper::Error>,
    _guard: ConnectionGuard,
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
