// Model list and load/unload route handlers

use std::convert::Infallible;

use hyper::{Body, Request, Response, StatusCode};
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::web::error::RouterError;
use crate::web::models::{ModelMeta, ModelStatus};
use crate::web::registry::SharedRegistry;
use crate::web::request::parse_json;
use crate::web::response_helpers::{json_error, json_response, json_success, router_error};
use crate::web::worker::invocation::public_preset;

#[derive(Deserialize)]
pub struct ModelNameRequest {
    #[serde(default)]
    pub model: String,
}

#[derive(Serialize)]
pub struct ModelStatusInfo {
    pub value: ModelStatus,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
}

#[derive(Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
    pub created: u64,
    pub status: ModelStatusInfo,
}

#[derive(Serialize)]
pub struct ModelList {
    pub data: Vec<ModelInfo>,
    pub object: &'static str,
}

impl ModelInfo {
    pub fn from_meta(meta: &ModelMeta, created: u64) -> Self {
        let args = meta
            .invocation
            .as_ref()
            .map(|inv| {
                std::iter::once(inv.program.display().to_string())
                    .chain(inv.args.iter().cloned())
                    .collect()
            })
            .unwrap_or_default();
        let preset = public_preset(&meta.preset);
        let failed = meta.failed();

        Self {
            id: meta.name.clone(),
            object: "model",
            owned_by: "llama-router",
            created,
            status: ModelStatusInfo {
                value: meta.status,
                args,
                preset: (!preset.is_empty()).then(|| preset.to_ini()),
                port: meta.port,
                exit_code: if failed { meta.exit_code } else { None },
                failed,
            },
        }
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

/// GET /models, GET /v1/models
pub async fn handle_list(registry: SharedRegistry) -> Result<Response<Body>, Infallible> {
    let created = unix_now();
    let data = registry
        .get_all_meta()
        .iter()
        .map(|meta| ModelInfo::from_meta(meta, created))
        .collect();
    Ok(json_response(
        StatusCode::OK,
        &ModelList {
            data,
            object: "list",
        },
    ))
}

/// POST /models/load
pub async fn handle_load(
    req: Request<Body>,
    registry: SharedRegistry,
) -> Result<Response<Body>, Infallible> {
    let request: ModelNameRequest = match parse_json(req).await {
        Ok(r) => r,
        Err(e) => return Ok(e),
    };
    let name = request.model;

    match registry.get_meta(&name) {
        None => return Ok(router_error(&RouterError::NotFound(name))),
        Some(meta) if meta.status == ModelStatus::Loaded => {
            return Ok(router_error(&RouterError::AlreadyLoaded(name)))
        }
        Some(_) => {}
    }

    info!("Load requested for model {name}");
    // Loading may wait for an eviction to finish.
    let result = tokio::task::spawn_blocking(move || registry.load(&name)).await;
    match result {
        Ok(Ok(())) => Ok(json_success("model load started")),
        Ok(Err(e)) => {
            error!("Load failed: {e}");
            Ok(router_error(&e))
        }
        Err(e) => {
            error!("Load task failed: {e}");
            Ok(json_error(StatusCode::INTERNAL_SERVER_ERROR, "load task failed"))
        }
    }
}

/// POST /models/unload
pub async fn handle_unload(
    req: Request<Body>,
    registry: SharedRegistry,
) -> Result<Response<Body>, Infallible> {
    let request: ModelNameRequest = match parse_json(req).await {
        Ok(r) => r,
        Err(e) => return Ok(e),
    };
    let name = request.model;

    match registry.get_meta(&name) {
        None => Ok(router_error(&RouterError::NotFound(name))),
        Some(meta) if !meta.is_active() => Ok(router_error(&RouterError::NotLoaded(name))),
        Some(_) => match registry.unload(&name) {
            Ok(()) => Ok(json_success("model unload started")),
            Err(e) => Ok(router_error(&e)),
        },
    }
}
