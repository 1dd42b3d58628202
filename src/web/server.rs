// HTTP front-end: request dispatch and the hyper server loop

use std::convert::Infallible;
use std::future::Future;
use std::net::TcpListener;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{debug, info};

use super::registry::SharedRegistry;
use super::response_helpers::{cors_preflight, json_error};
use super::routes;

/// Dispatch one request to its route handler.
pub async fn handle_request(
    req: Request<Body>,
    registry: SharedRegistry,
) -> Result<Response<Body>, Infallible> {
    debug!("{} {}", req.method(), req.uri());

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match (&method, path.as_str()) {
        (&Method::OPTIONS, _) => Ok(cors_preflight()),
        (&Method::GET, "/health") => routes::health::handle().await,
        (&Method::GET, "/models" | "/v1/models") => routes::models::handle_list(registry).await,
        (&Method::POST, "/models/load") => routes::models::handle_load(req, registry).await,
        (&Method::POST, "/models/unload") => routes::models::handle_unload(req, registry).await,
        (&Method::GET, "/props") => routes::props::handle(req, registry).await,
        (&Method::GET, _) => routes::proxy::handle_get(req, registry).await,
        (&Method::POST, _) => routes::proxy::handle_post(req, registry).await,
        _ => Ok(json_error(StatusCode::NOT_FOUND, "Not Found")),
    }
}

/// Serve on `listener` until `shutdown` resolves, then finish in-flight
/// requests.
pub async fn run_server<F>(
    listener: TcpListener,
    registry: SharedRegistry,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(req, registry.clone())))
        }
    });

    let server = Server::from_tcp(listener)?.serve(make_svc);
    info!("Router listening on http://{addr}");
    info!("Available endpoints:");
    info!("  GET  /health          - Health check");
    info!("  GET  /models          - List models and their status");
    info!("  POST /models/load     - Load a model");
    info!("  POST /models/unload   - Unload a model");
    info!("  GET  /props           - Router properties");
    info!("  *    <other>          - Proxied to the named model");

    server.with_graceful_shutdown(shutdown).await?;
    info!("HTTP server stopped");
    Ok(())
}
