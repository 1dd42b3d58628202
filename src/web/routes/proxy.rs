// Proxied route handlers: everything not served by the router itself

use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use hyper::header::{HeaderName, HeaderValue};
use hyper::{Body, Request, Response, StatusCode};
use log::{debug, error, info};
use tokio::sync::{mpsc, oneshot};

use crate::web::error::RouterError;
use crate::web::proxy::http_proxy::{ProxyHead, ProxyRequest, StopSignal};
use crate::web::registry::SharedRegistry;
use crate::web::request::{parse_json_bytes, parse_query_param, read_body};
use crate::web::response_helpers::{json_error, router_error, with_cors};

/// Body chunks buffered between the relay thread and hyper.
const BODY_CHANNEL_CAPACITY: usize = 16;

type BodyChunk = Result<Vec<u8>, io::Error>;

/// GET requests name their model in the `model` query parameter.
pub async fn handle_get(
    req: Request<Body>,
    registry: SharedRegistry,
) -> Result<Response<Body>, Infallible> {
    let query = req.uri().query().unwrap_or("").to_string();
    let name = parse_query_param(&query, "model").unwrap_or_default();
    let autoload = autoload_for(&query, registry.config().models_autoload);

    let (parts, _body) = req.into_parts();
    let request = ProxyRequest {
        method: parts.method.to_string(),
        path: path_and_query(&parts.uri),
        headers: forwarded_headers(&parts.headers),
        body: Vec::new(),
    };
    Ok(forward(registry, name, autoload, request).await)
}

/// POST requests name their model in the JSON body's `model` field.
pub async fn handle_post(
    req: Request<Body>,
    registry: SharedRegistry,
) -> Result<Response<Body>, Infallible> {
    let query = req.uri().query().unwrap_or("").to_string();
    let autoload = autoload_for(&query, registry.config().models_autoload);

    let (parts, body) = req.into_parts();
    let body = match read_body(body).await {
        Ok(b) => b,
        Err(e) => return Ok(e),
    };
    let json: serde_json::Value = match parse_json_bytes(&body) {
        Ok(v) => v,
        Err(e) => return Ok(e),
    };
    let name = json
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();

    let request = ProxyRequest {
        method: parts.method.to_string(),
        path: path_and_query(&parts.uri),
        headers: forwarded_headers(&parts.headers),
        body,
    };
    Ok(forward(registry, name, autoload, request).await)
}

/// `?autoload=true|1` or `false|0` overrides the configured policy.
pub fn autoload_for(query: &str, default: bool) -> bool {
    match parse_query_param(query, "autoload") {
        Some(value) if !value.is_empty() => value == "true" || value == "1",
        _ => default,
    }
}

fn path_and_query(uri: &hyper::Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

fn forwarded_headers(headers: &hyper::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Relay one request to the named model. The exchange runs on a blocking
/// thread; a dropped response body (client gone) cancels it.
async fn forward(
    registry: SharedRegistry,
    name: String,
    autoload: bool,
    request: ProxyRequest,
) -> Response<Body> {
    if name.is_empty() {
        return router_error(&RouterError::BadRequest(
            "model name is missing from the request".to_string(),
        ));
    }

    let (head_tx, head_rx) = oneshot::channel::<Result<ProxyHead, RouterError>>();
    let (chunk_tx, chunk_rx) = mpsc::channel::<BodyChunk>(BODY_CHANNEL_CAPACITY);

    info!("Proxying {} {} to model {name}", request.method, request.path);
    tokio::task::spawn_blocking(move || {
        let probe = chunk_tx.clone();
        let should_stop: StopSignal = Arc::new(move || probe.is_closed());

        let mut response = match registry.route(&name, request, should_stop, autoload) {
            Ok(response) => response,
            Err(e) => {
                let _ = head_tx.send(Err(e));
                return;
            }
        };

        if head_tx.send(Ok(response.head())).is_err() {
            response.cancel();
            return;
        }
        while let Some(chunk) = response.next_chunk() {
            let item = chunk.map_err(|message| {
                error!("Proxy stream for model {name} failed: {message}");
                io::Error::other(message)
            });
            let failed = item.is_err();
            if chunk_tx.blocking_send(item).is_err() {
                debug!("Client for model {name} went away, cancelling");
                response.cancel();
                return;
            }
            if failed {
                break;
            }
        }
    });

    let head = match head_rx.await {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            error!("Proxy request failed: {e}");
            return router_error(&e);
        }
        Err(_) => {
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "proxy task failed");
        }
    };

    let stream = futures_util::stream::unfold(chunk_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    let status = StatusCode::from_u16(head.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = with_cors(status, Body::wrap_stream(stream));
    let headers = response.headers_mut();
    for (name, value) in &head.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            debug!("Dropping invalid upstream header {name}");
            continue;
        };
        headers.append(name, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_autoload_override() {
        assert!(autoload_for("model=a&autoload=1", false));
        assert!(autoload_for("autoload=true", false));
        assert!(!autoload_for("autoload=0", true));
        assert!(!autoload_for("autoload=false", true));
        assert!(autoload_for("model=a", true));
        assert!(!autoload_for("autoload=", false));
    }

    #[test]
    fn test_path_and_query() {
        let uri: hyper::Uri = "/v1/chat?model=a&x=1".parse().unwrap();
        assert_eq!(path_and_query(&uri), "/v1/chat?model=a&x=1");
    }
}
