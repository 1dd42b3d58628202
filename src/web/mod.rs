// Router server modules

pub mod config;
pub mod error;
pub mod logger;
pub mod models;
pub mod proxy;
pub mod registry;
pub mod request;
pub mod response_helpers;
pub mod routes;
pub mod server;
pub mod worker;

// Re-export commonly used types
pub use config::RouterConfig;
pub use error::RouterError;
pub use models::{ModelMeta, ModelStatus};
pub use registry::{ModelRegistry, SharedRegistry};
