// Router properties route handler

use hyper::{Body, Request, Response, StatusCode};
use std::convert::Infallible;

use crate::web::registry::SharedRegistry;
use crate::web::request::parse_query_param;
use crate::web::response_helpers::json_response;

use super::proxy;

/// GET /props: describes the router itself unless a `model` is named, in
/// which case the request goes to that model's worker.
pub async fn handle(
    req: Request<Body>,
    registry: SharedRegistry,
) -> Result<Response<Body>, Infallible> {
    let query = req.uri().query().unwrap_or("");
    if parse_query_param(query, "model").is_some_and(|m| !m.is_empty()) {
        return proxy::handle_get(req, registry).await;
    }

    let config = registry.config();
    let props = serde_json::json!({
        "role": "router",
        "max_instances": config.models_max,
        "models_autoload": config.models_autoload,
        "model_alias": "llama-router",
        "model_path": "none",
        "default_generation_settings": {
            "params": {},
            "n_ctx": 0,
        },
    });
    Ok(json_response(StatusCode::OK, &props))
}
