use crate::executor::ProcessExecutor;
use crate::metadata;
use crate::response::{self, GatewayErrorCode, X_REQUEST_ID};
use crate::routes::RouteTable;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The dispatch gateway server.
///
/// Accepts connections, resolves each request against the immutable route
/// table, runs the matching executable through the process executor, and
/// maps the outcome to an HTTP response. Every request is handled on its
/// own task; one slow execution never blocks the others.
pub struct GatewayServer {
    bind_addr: SocketAddr,
    routes: Arc<RouteTable>,
    executor: Arc<ProcessExecutor>,
    expose_stderr: bool,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        routes: Arc<RouteTable>,
        executor: Arc<ProcessExecutor>,
        expose_stderr: bool,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            routes,
            executor,
            expose_stderr,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, routes = self.routes.len(), "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let routes = Arc::clone(&self.routes);
                            let executor = Arc::clone(&self.executor);
                            let expose_stderr = self.expose_stderr;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, routes, executor, expose_stderr).await {
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
                        info!("Gateway shutting down");
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
    routes: Arc<RouteTable>,
    executor: Arc<ProcessExecutor>,
    expose_stderr: bool,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = Arc::clone(&routes);
        let executor = Arc::clone(&executor);
        async move { handle_request(req, routes, executor, expose_stderr).await }
    });

    // auto::Builder supports both HTTP/1.1 and HTTP/2 (h2c) on one port
    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    routes: Arc<RouteTable>,
    executor: Arc<ProcessExecutor>,
    expose_stderr: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, path, request_id, "Incoming request");

    // Exact-match route lookup; anything unregistered never spawns a process
    let Some(entry) = routes.resolve(&method, &path) else {
        debug!(%method, path, request_id, "No route registered");
        return Ok(response::error_response(
            GatewayErrorCode::RouteNotFound,
            &request_id,
        ));
    };

    // Serialize the header metadata when the route asks for it. The encoded
    // value travels as one argv element; a failure here aborts the request
    // before any process is spawned.
    let argument = if entry.forward_headers {
        match metadata::encode(req.headers()) {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                warn!(path, request_id, error = %e, "Rejecting unencodable request metadata");
                return Ok(response::error_response(
                    GatewayErrorCode::MetadataRejected,
                    &request_id,
                ));
            }
        }
    } else {
        None
    };

    let outcome = executor
        .execute(&entry.executable, argument.as_deref(), Some(entry.timeout))
        .await;

    // Full diagnostic detail lives in the server log; the client body is
    // mapped separately and kept generic by default
    match &outcome {
        Ok(result) if result.success() => {
            debug!(
                path,
                request_id,
                executable = %entry.executable.display(),
                duration_ms = result.duration.as_millis() as u64,
                "Dispatch succeeded"
            );
        }
        Ok(result) => {
            error!(
                path,
                request_id,
                executable = %entry.executable.display(),
                code = result.exit_code(),
                stderr = %String::from_utf8_lossy(&result.stderr),
                "Executable exited with failure"
            );
        }
        Err(e) => {
            error!(
                path,
                request_id,
                executable = %entry.executable.display(),
                error = %e,
                "Dispatch failed"
            );
        }
    }

    Ok(response::from_execution(outcome, expose_stderr, &request_id))
}
