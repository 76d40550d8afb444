use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use utopia_scale::compute::{ComputePool, HandlerRegistry};
use utopia_scale::config::ScalingConfig;
use utopia_scale::handshake::{Handshake, ProcessRole, WorkerEnv};
use utopia_scale::supervisor::ClusterSupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("utopia_scale=info".parse().expect("valid log directive")),
        )
        .init();

    // The role is decided once, here; workers never re-enter supervisor mode
    match ProcessRole::detect() {
        ProcessRole::Worker(env) => run_worker(env).await,
        ProcessRole::Supervisor => run_supervisor().await,
    }
}

async fn run_supervisor() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("cluster.toml"));

    let config = ScalingConfig::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");

    // Children re-run this executable with the same arguments
    let argv: Vec<String> = std::env::args().skip(1).collect();
    ClusterSupervisor::start(config, argv).await
}

/// Thin demonstration worker: reports its port, echoes request bodies, and
/// delegates `/compute` to a process-local compute pool
async fn run_worker(env: WorkerEnv) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", env.port)).await?;
    info!(id = env.process_id, port = env.port, "Worker serving");

    let mut registry = HandlerRegistry::new();
    registry.register("fib", |payload: serde_json::Value| {
        let n = payload["n"]
            .as_u64()
            .ok_or_else(|| "missing field n".to_string())?;
        Ok(json!(fib(n)))
    });
    let pool = Arc::new(ComputePool::initialize(2, registry)?);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let pool = Arc::clone(&pool);
        let port = env.port;

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let pool = Arc::clone(&pool);
                async move { handle(req, port, pool).await }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(error = %e, "Worker connection error");
            }
        });
    }
}

async fn handle(
    req: Request<Incoming>,
    port: u16,
    pool: Arc<ComputePool>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::GET, "/info") => {
            let handshake = Handshake::from_env();
            let info = json!({
                "cluster": handshake.is_cluster_mode(),
                "worker": handshake.is_worker(),
                "process_id": handshake.process_id(),
                "port": handshake.worker_port(),
            });
            Ok(json_response(StatusCode::OK, info.to_string()))
        }
        (Method::GET, "/compute") => {
            let n = req
                .uri()
                .query()
                .and_then(|q| q.split('&').find_map(|kv| kv.strip_prefix("n=")))
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30);

            match pool.submit("fib", json!({ "n": n })).await {
                Ok(value) => Ok(json_response(StatusCode::OK, value.to_string())),
                Err(e) => Ok(text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    e.to_string(),
                )),
            }
        }
        (Method::POST, _) => {
            // Echo the request body
            let body = req.into_body().collect().await?.to_bytes();
            Ok(Response::new(Full::new(body)))
        }
        _ => Ok(text_response(StatusCode::OK, port.to_string())),
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with static headers")
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with static headers")
}

fn fib(n: u64) -> u64 {
    match n {
        0 => 0,
        1 => 1,
        _ => fib(n - 1) + fib(n - 2),
    }
}
