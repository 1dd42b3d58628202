//! Model registry: the router's table of named model entries.
//!
//! One mutex guards every entry; status changes are broadcast on `cv`, stop
//! requests and worker exits on `cv_stop`. Loads (including any eviction
//! they trigger) are serialized by `load_lock` so `models_max` holds before
//! a new worker is spawned. Process spawning, joining and proxy I/O happen
//! outside the state lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use llama_router_config::{keys, ArgRegistry, OptionSet, ResolvedPresets};
use log::{error, info, warn};

use super::config::RouterConfig;
use super::error::RouterError;
use super::models::{ModelMeta, ModelStatus};
use super::proxy::http_proxy::{ProxyRequest, ProxyResponse, ProxyTimeouts, StopSignal};
use super::worker::invocation::{Invocation, CHILD_ADDR};
use super::worker::process::{pick_free_port, WorkerProcess, SPAWN_FAILURE_EXIT_CODE};
use super::worker::supervisor;

/// Shared reference to the ModelRegistry.
pub type SharedRegistry = Arc<ModelRegistry>;

/// Observer of status transitions; runs under the registry lock and must not
/// call back into the registry.
pub type StatusListener = Box<dyn Fn(&str, ModelStatus) + Send>;

struct Instance {
    meta: ModelMeta,
    supervisor: Option<JoinHandle<()>>,
    stop_requested: bool,
    process_exited: bool,
}

#[derive(Default)]
struct RegistryState {
    instances: BTreeMap<String, Instance>,
    listener: Option<StatusListener>,
}

impl RegistryState {
    fn set_status(&mut self, name: &str, next: ModelStatus) {
        let Some(inst) = self.instances.get_mut(name) else {
            return;
        };
        let prev = inst.meta.status;
        if !prev.can_transition_to(next) {
            error!("Unexpected status change for model {name}: {prev} -> {next}");
        }
        inst.meta.status = next;
        info!("Model {name}: {prev} -> {next}");
        if let Some(listener) = &self.listener {
            listener(name, next);
        }
    }

    fn status_of(&self, name: &str) -> Option<ModelStatus> {
        self.instances.get(name).map(|i| i.meta.status)
    }

    fn active_count(&self) -> usize {
        self.instances.values().filter(|i| i.meta.is_active()).count()
    }

    /// Least recently used active entry that may be evicted.
    fn lru_candidate(&self, exclude: &str) -> Option<String> {
        self.instances
            .iter()
            .filter(|(name, i)| i.meta.is_active() && !i.meta.pinned && name.as_str() != exclude)
            .min_by_key(|(_, i)| i.meta.last_used)
            .map(|(name, _)| name.clone())
    }
}

pub struct ModelRegistry {
    state: Mutex<RegistryState>,
    cv: Condvar,
    cv_stop: Condvar,
    load_lock: Mutex<()>,
    epoch: Instant,
    config: RouterConfig,
    args: Arc<ArgRegistry>,
}

impl ModelRegistry {
    pub fn new(config: RouterConfig, args: Arc<ArgRegistry>) -> SharedRegistry {
        Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            cv: Condvar::new(),
            cv_stop: Condvar::new(),
            load_lock: Mutex::new(()),
            epoch: Instant::now(),
            config,
            args,
        })
    }

    /// Build a registry holding every resolved preset. Fails on more
    /// load-on-startup models than `models_max` allows.
    pub fn from_presets(
        config: RouterConfig,
        args: Arc<ArgRegistry>,
        resolved: ResolvedPresets,
    ) -> Result<SharedRegistry, RouterError> {
        let registry = Self::new(config, args);
        for preset in resolved.presets.into_values() {
            registry.register(preset)?;
        }

        let all = registry.get_all_meta();
        info!("Available models ({}) (*: custom preset)", all.len());
        for meta in &all {
            let mark = if resolved.custom.contains(&meta.name) { '*' } else { ' ' };
            info!("  {mark} {}", meta.name);
        }

        let startup = all.iter().filter(|m| m.load_on_startup).count();
        let max = registry.config.models_max;
        if max > 0 && startup > max {
            return Err(RouterError::StartupExceedsMax {
                count: startup,
                max,
            });
        }
        Ok(registry)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Add a model entry. The name must be unique.
    pub fn register(&self, preset: OptionSet) -> Result<(), RouterError> {
        let name = preset.name.clone();

        let stop_timeout = match preset.get(keys::STOP_TIMEOUT) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => {
                    warn!(
                        "Invalid stop-timeout value '{raw}' for model '{name}', using default {} seconds",
                        self.config.stop_timeout.as_secs()
                    );
                    self.config.stop_timeout
                }
            },
            None => self.config.stop_timeout,
        };

        let mut meta = ModelMeta::new(&name, preset, stop_timeout);
        meta.pinned = meta.preset.get_bool(keys::PIN).unwrap_or(false);
        meta.load_on_startup = meta.preset.get_bool(keys::LOAD_ON_STARTUP).unwrap_or(false);

        let mut state = self.lock_state();
        if state.instances.contains_key(&name) {
            return Err(RouterError::DuplicateModel(name));
        }
        state.instances.insert(
            name,
            Instance {
                meta,
                supervisor: None,
                stop_requested: false,
                process_exited: false,
            },
        );
        Ok(())
    }

    /// Install an observer of status transitions.
    pub fn set_status_listener<F>(&self, listener: F)
    where
        F: Fn(&str, ModelStatus) + Send + 'static,
    {
        self.lock_state().listener = Some(Box::new(listener));
    }

    /// Start every model marked load-on-startup.
    pub fn load_startup_models(self: &Arc<Self>) -> Result<(), RouterError> {
        let names: Vec<String> = self
            .get_all_meta()
            .into_iter()
            .filter(|m| m.load_on_startup)
            .map(|m| m.name)
            .collect();
        for name in names {
            info!("Loading model {name} on startup");
            self.load(&name)?;
        }
        Ok(())
    }

    pub fn get_meta(&self, name: &str) -> Option<ModelMeta> {
        self.lock_state().instances.get(name).map(|i| i.meta.clone())
    }

    pub fn get_all_meta(&self) -> Vec<ModelMeta> {
        self.lock_state()
            .instances
            .values()
            .map(|i| i.meta.clone())
            .collect()
    }

    /// Start a worker for `name`. A no-op unless the entry is `Unloaded`.
    /// When `models_max` is reached the least recently used model is
    /// unloaded first and this call waits for it to finish.
    pub fn load(self: &Arc<Self>, name: &str) -> Result<(), RouterError> {
        let _serial = self.load_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let status = self.lock_state().status_of(name);
        match status {
            None => return Err(RouterError::NotFound(name.to_string())),
            Some(ModelStatus::Unloaded) => {}
            Some(status) => {
                warn!("Model {name} is already {status}, ignoring load");
                return Ok(());
            }
        }

        // A preset that cannot be rendered must not cost another model its slot.
        let preset = self
            .lock_state()
            .instances
            .get(name)
            .map(|i| i.meta.preset.clone())
            .ok_or_else(|| RouterError::NotFound(name.to_string()))?;
        Invocation::render(&self.args, &self.config.worker_bin, &preset, name, 0, self.config.port)?;

        self.evict_for(name);

        // The previous run's supervisor has written its final state; reap it.
        let previous = self
            .lock_state()
            .instances
            .get_mut(name)
            .and_then(|i| i.supervisor.take());
        if let Some(handle) = previous {
            let _ = handle.join();
        }

        let port = pick_free_port().map_err(RouterError::NoFreePort)?;

        let (invocation, stop_timeout) = {
            let mut state = self.lock_state();
            let inst = state
                .instances
                .get_mut(name)
                .ok_or_else(|| RouterError::NotFound(name.to_string()))?;
            let invocation = Invocation::render(
                &self.args,
                &self.config.worker_bin,
                &inst.meta.preset,
                name,
                port,
                self.config.port,
            )?;
            inst.meta.port = Some(port);
            inst.meta.last_used = self.now();
            inst.meta.invocation = Some(invocation.clone());
            inst.stop_requested = false;
            inst.process_exited = false;
            let stop_timeout = inst.meta.stop_timeout;
            state.set_status(name, ModelStatus::Loading);
            (invocation, stop_timeout)
        };
        self.cv.notify_all();

        let started = WorkerProcess::spawn(&invocation).and_then(|(process, io)| {
            supervisor::spawn(Arc::clone(self), name.to_string(), process, io, port, stop_timeout)
        });

        match started {
            Ok(handle) => {
                if let Some(inst) = self.lock_state().instances.get_mut(name) {
                    inst.supervisor = Some(handle);
                }
                Ok(())
            }
            Err(source) => {
                error!("Failed to start worker for model {name}: {source}");
                self.finish(name, SPAWN_FAILURE_EXIT_CODE);
                Err(RouterError::Spawn {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Unload least recently used models until there is room for one more.
    fn evict_for(&self, requested: &str) {
        let max = self.config.models_max;
        if max == 0 {
            return;
        }

        let mut state = self.lock_state();
        while state.active_count() >= max {
            let Some(victim) = state.lru_candidate(requested) else {
                warn!("models-max ({max}) reached but no model can be evicted, loading {requested} anyway");
                return;
            };
            info!("models-max ({max}) reached, unloading least recently used model {victim}");
            self.request_stop(&mut state, &victim);
            state = self
                .cv
                .wait_while(state, |s| {
                    s.status_of(&victim)
                        .is_some_and(|status| status != ModelStatus::Unloaded)
                })
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Ask the worker for `name` to stop. Idempotent; a no-op when unloaded.
    pub fn unload(&self, name: &str) -> Result<(), RouterError> {
        let mut state = self.lock_state();
        match state.status_of(name) {
            None => Err(RouterError::NotFound(name.to_string())),
            Some(ModelStatus::Loading | ModelStatus::Loaded) => {
                info!("Unloading model {name}");
                self.request_stop(&mut state, name);
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    /// Stop every worker and wait until all of them are gone.
    pub fn unload_all(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.lock_state();
            let active: Vec<String> = state
                .instances
                .iter()
                .filter(|(_, i)| i.meta.is_active())
                .map(|(name, _)| name.clone())
                .collect();
            for name in &active {
                self.request_stop(&mut state, name);
            }
            let mut state = self
                .cv
                .wait_while(state, |s| {
                    s.instances
                        .values()
                        .any(|i| i.meta.status != ModelStatus::Unloaded)
                })
                .unwrap_or_else(PoisonError::into_inner);
            state
                .instances
                .values_mut()
                .filter_map(|i| i.supervisor.take())
                .collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn request_stop(&self, state: &mut RegistryState, name: &str) {
        let Some(inst) = state.instances.get_mut(name) else {
            return;
        };
        inst.stop_requested = true;
        state.set_status(name, ModelStatus::Unloading);
        self.cv.notify_all();
        self.cv_stop.notify_all();
    }

    /// Make sure `name` is `Loaded`, starting it when `autoload` allows.
    /// Blocks while the model is loading; fails fast while it unloads.
    pub fn ensure_loaded(self: &Arc<Self>, name: &str, autoload: bool) -> Result<(), RouterError> {
        let status = self.lock_state().status_of(name);
        match status {
            None => return Err(RouterError::NotFound(name.to_string())),
            Some(ModelStatus::Loaded) => return Ok(()),
            Some(ModelStatus::Unloading) => return Err(RouterError::NotReady(name.to_string())),
            Some(ModelStatus::Unloaded) if !autoload => {
                return Err(RouterError::NotLoaded(name.to_string()))
            }
            Some(ModelStatus::Unloaded) => {
                info!("Model {name} is not loaded, loading it");
                self.load(name)?;
            }
            Some(ModelStatus::Loading) => {}
        }

        let state = self
            .cv
            .wait_while(self.lock_state(), |s| {
                s.status_of(name) == Some(ModelStatus::Loading)
            })
            .unwrap_or_else(PoisonError::into_inner);

        let inst = state
            .instances
            .get(name)
            .ok_or_else(|| RouterError::NotFound(name.to_string()))?;
        match inst.meta.status {
            ModelStatus::Loaded => Ok(()),
            ModelStatus::Unloaded => Err(RouterError::LoadFailed {
                name: name.to_string(),
                exit_code: inst.meta.exit_code.unwrap_or(-1),
            }),
            _ => Err(RouterError::NotReady(name.to_string())),
        }
    }

    /// Route a request to the worker for `name`, loading it if needed.
    pub fn route(
        self: &Arc<Self>,
        name: &str,
        request: ProxyRequest,
        should_stop: StopSignal,
        autoload: bool,
    ) -> Result<ProxyResponse, RouterError> {
        self.ensure_loaded(name, autoload)?;

        let port = {
            let mut state = self.lock_state();
            let now = self.now();
            let inst = state
                .instances
                .get_mut(name)
                .ok_or_else(|| RouterError::NotFound(name.to_string()))?;
            match (inst.meta.status, inst.meta.port) {
                (ModelStatus::Loaded, Some(port)) => {
                    inst.meta.last_used = now;
                    port
                }
                _ => return Err(RouterError::NotReady(name.to_string())),
            }
        };

        let timeouts = ProxyTimeouts {
            read: self.config.timeout,
            write: self.config.timeout,
            ..ProxyTimeouts::default()
        };
        Ok(ProxyResponse::start(CHILD_ADDR, port, request, should_stop, timeouts))
    }

    // Supervisor callbacks

    /// `Loading -> Loaded` once the worker announced readiness.
    pub(crate) fn mark_ready(&self, name: &str) {
        let mut state = self.lock_state();
        if state.status_of(name) == Some(ModelStatus::Loading) {
            state.set_status(name, ModelStatus::Loaded);
            self.cv.notify_all();
        }
    }

    /// Block until an unload is requested (`true`) or the worker exited on
    /// its own (`false`).
    pub(crate) fn wait_for_stop_request(&self, name: &str) -> bool {
        let state = self
            .cv_stop
            .wait_while(self.lock_state(), |s| {
                s.instances
                    .get(name)
                    .is_some_and(|i| !i.stop_requested && !i.process_exited)
            })
            .unwrap_or_else(PoisonError::into_inner);
        state
            .instances
            .get(name)
            .is_some_and(|i| i.stop_requested && !i.process_exited)
    }

    /// Wait up to `timeout` for the worker to exit; `true` if it did.
    pub(crate) fn wait_for_exit(&self, name: &str, timeout: Duration) -> bool {
        let (state, _) = self
            .cv_stop
            .wait_timeout_while(self.lock_state(), timeout, |s| {
                s.instances.get(name).is_some_and(|i| !i.process_exited)
            })
            .unwrap_or_else(PoisonError::into_inner);
        state.instances.get(name).map_or(true, |i| i.process_exited)
    }

    pub(crate) fn mark_exited(&self, name: &str) {
        if let Some(inst) = self.lock_state().instances.get_mut(name) {
            inst.process_exited = true;
        }
        self.cv_stop.notify_all();
    }

    /// Final write of a worker run: `Unloaded` with its exit code.
    pub(crate) fn finish(&self, name: &str, exit_code: i32) {
        let mut state = self.lock_state();
        if let Some(inst) = state.instances.get_mut(name) {
            inst.meta.exit_code = Some(exit_code);
            inst.meta.port = None;
            inst.process_exited = true;
        }
        state.set_status(name, ModelStatus::Unloaded);
        self.cv.notify_all();
        self.cv_stop.notify_all();
    }

    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
