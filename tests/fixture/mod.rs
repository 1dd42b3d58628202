//! Shared setup for the integration tests: a registry whose workers are the
//! `mock_worker` binary.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use llama_router::web::config::RouterConfig;
use llama_router::web::models::ModelStatus;
use llama_router::web::registry::{ModelRegistry, SharedRegistry};
use llama_router_config::{ArgKind, ArgRegistry, ArgSpec, OptionSet};

pub const MOCK_WORKER: &str = env!("CARGO_BIN_EXE_mock_worker");

pub type Trace = Arc<Mutex<Vec<(String, ModelStatus)>>>;

/// Server options plus the mock worker's behaviour switches.
pub fn mock_args() -> Arc<ArgRegistry> {
    let mut args = ArgRegistry::server_defaults();
    for spec in [
        ArgSpec::new(&["--mock-ready-delay-ms"], ArgKind::Integer, "delay before ready"),
        ArgSpec::new(&["--mock-no-ready"], ArgKind::Flag, "never become ready"),
        ArgSpec::new(&["--mock-ignore-exit"], ArgKind::Flag, "ignore the exit command"),
        ArgSpec::new(&["--mock-fail-startup"], ArgKind::Integer, "exit code before ready"),
        ArgSpec::new(&["--mock-kill-self-after-ms"], ArgKind::Integer, "crash after ready"),
    ] {
        args.register(spec).expect("mock option registered twice");
    }
    Arc::new(args)
}

pub fn preset(name: &str, options: &[(&str, &str)]) -> OptionSet {
    let mut preset = OptionSet::new(name);
    for (key, value) in options {
        preset.set(key, *value);
    }
    preset
}

/// A registry that unloads every model when dropped.
pub struct Router {
    pub registry: SharedRegistry,
    pub trace: Trace,
}

impl Router {
    pub fn new(models_max: usize, presets: Vec<OptionSet>) -> Self {
        Self::with_config(
            RouterConfig {
                models_max,
                ..RouterConfig::default()
            },
            presets,
        )
    }

    pub fn with_config(config: RouterConfig, presets: Vec<OptionSet>) -> Self {
        let config = RouterConfig {
            worker_bin: MOCK_WORKER.into(),
            timeout: Duration::from_secs(30),
            ..config
        };
        let registry = ModelRegistry::new(config, mock_args());
        for preset in presets {
            registry.register(preset).expect("duplicate preset");
        }

        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&trace);
        registry.set_status_listener(move |name, status| {
            sink.lock().unwrap().push((name.to_string(), status));
        });
        Self { registry, trace }
    }

    pub fn status(&self, name: &str) -> ModelStatus {
        self.registry.get_meta(name).expect("unknown model").status
    }

    pub fn trace(&self) -> Vec<(String, ModelStatus)> {
        self.trace.lock().unwrap().clone()
    }

    /// Position of the first `(name, status)` transition in the trace.
    pub fn position(&self, name: &str, status: ModelStatus) -> Option<usize> {
        self.trace()
            .iter()
            .position(|(n, s)| n == name && *s == status)
    }

    /// Every model's transitions form a path of the status machine that
    /// starts at `Unloaded`.
    pub fn assert_valid_transitions(&self) {
        let trace = self.trace();
        let mut current: HashMap<&str, ModelStatus> = HashMap::new();
        for (name, next) in &trace {
            let prev = current.entry(name.as_str()).or_insert(ModelStatus::Unloaded);
            assert!(
                prev.can_transition_to(*next),
                "{name}: {prev} -> {next} in {trace:?}"
            );
            *prev = *next;
        }
    }

    pub fn wait_for_status(&self, name: &str, status: ModelStatus, timeout: Duration) -> bool {
        wait_until(timeout, || self.status(name) == status)
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.registry.unload_all();
    }
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    check()
}
