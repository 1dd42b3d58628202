// Request parsing utilities for HTTP requests

use hyper::{Body, Request, Response, StatusCode};
use log::error;
use serde::de::DeserializeOwned;

use super::response_helpers::json_error;

/// Read the whole request body.
/// Returns the bytes or an error response
pub async fn read_body(body: Body) -> Result<Vec<u8>, Response<Body>> {
    match hyper::body::to_bytes(body).await {
        Ok(bytes) => Ok(bytes.to_vec()),
        Err(e) => {
            error!("Failed to read request body: {e}");
            Err(json_error(StatusCode::BAD_REQUEST, "Failed to read request body"))
        }
    }
}

/// Parse request body as JSON
/// Returns the deserialized value or an error response
pub async fn parse_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T, Response<Body>> {
    let body_bytes = read_body(req.into_body()).await?;
    parse_json_bytes(&body_bytes)
}

pub fn parse_json_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Response<Body>> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Ok(value),
        Err(e) => {
            error!("JSON parsing error: {e}");
            Err(json_error(StatusCode::BAD_REQUEST, "Invalid JSON format"))
        }
    }
}

/// Parse query string parameter (URL-decoded)
/// Example: parse_query_param("model=foo&autoload=0", "autoload") => Some("0")
pub fn parse_query_param(query: &str, key: &str) -> Option<String> {
    for param in query.split('&') {
        let (k, v) = param.split_once('=').unwrap_or((param, ""));
        if k == key {
            let decoded = urlencoding::decode(v).map(|s| s.into_owned());
            return Some(decoded.unwrap_or_else(|_| v.to_string()));
        }
    }
    None
}
