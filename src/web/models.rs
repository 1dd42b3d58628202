// Model entry types shared by the registry, supervisor and routes

use std::fmt;
use std::time::Duration;

use llama_router_config::OptionSet;
use serde::Serialize;

use super::worker::invocation::Invocation;

/// Lifecycle of one model entry:
/// `Unloaded -> Loading -> Loaded -> Unloading -> Unloaded`, with a direct
/// return to `Unloaded` when the worker exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

impl ModelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelStatus::Unloaded => "unloaded",
            ModelStatus::Loading => "loading",
            ModelStatus::Loaded => "loaded",
            ModelStatus::Unloading => "unloading",
        }
    }

    /// Counts against `models_max`.
    pub fn is_active(self) -> bool {
        matches!(self, ModelStatus::Loading | ModelStatus::Loaded)
    }

    pub fn can_transition_to(self, next: ModelStatus) -> bool {
        use ModelStatus::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Loaded)
                | (Loading, Unloading)
                | (Loading, Unloaded)
                | (Loaded, Unloading)
                | (Loaded, Unloaded)
                | (Unloading, Unloaded)
        )
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one model entry.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub name: String,
    /// Fully cascaded options for this model.
    pub preset: OptionSet,
    /// Worker port; only set while a worker is (being) started or running.
    pub port: Option<u16>,
    pub status: ModelStatus,
    /// Microseconds since the registry was created.
    pub last_used: u64,
    /// Exit status of the last worker run.
    pub exit_code: Option<i32>,
    pub stop_timeout: Duration,
    /// Exempt from LRU eviction.
    pub pinned: bool,
    pub load_on_startup: bool,
    /// Command line of the current (or last) worker run.
    pub invocation: Option<Invocation>,
}

impl ModelMeta {
    pub fn new(name: &str, preset: OptionSet, stop_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            preset,
            port: None,
            status: ModelStatus::Unloaded,
            last_used: 0,
            exit_code: None,
            stop_timeout,
            pinned: false,
            load_on_startup: false,
            invocation: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// The last run ended with a non-zero status.
    pub fn failed(&self) -> bool {
        self.status == ModelStatus::Unloaded && self.exit_code.is_some_and(|code| code != 0)
    }
}
