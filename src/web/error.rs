// Router error type and its HTTP mapping

use hyper::StatusCode;
use llama_router_config::PresetError;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Config(#[from] PresetError),

    #[error("model name '{0}' is already registered")]
    DuplicateModel(String),

    #[error("model '{0}' not found")]
    NotFound(String),

    #[error("model '{0}' is not loaded")]
    NotLoaded(String),

    #[error("model '{0}' is already loaded")]
    AlreadyLoaded(String),

    #[error("model '{0}' is not ready")]
    NotReady(String),

    #[error("model '{name}' failed to load (exit code {exit_code})")]
    LoadFailed { name: String, exit_code: i32 },

    #[error("failed to spawn worker for '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no free port for worker: {0}")]
    NoFreePort(#[source] std::io::Error),

    #[error("{count} models are marked load-on-startup but models-max is {max}")]
    StartupExceedsMax { count: usize, max: usize },

    #[error("{0}")]
    BadRequest(String),
}

impl RouterError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterError::NotFound(_) => StatusCode::NOT_FOUND,
            RouterError::NotLoaded(_)
            | RouterError::AlreadyLoaded(_)
            | RouterError::NotReady(_)
            | RouterError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
