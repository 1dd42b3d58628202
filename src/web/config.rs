// Router settings, filled from the command-line option set

use std::path::PathBuf;
use std::time::Duration;

use llama_router_config::{
    default_cache_dir, keys, ApplyOption, ArgRegistry, ArgValue, OptionSet, PresetError,
};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MODELS_MAX: usize = 4;
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_WORKER_BIN: &str = "llama-server";

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub host: String,
    pub port: u16,
    pub models_dir: Option<PathBuf>,
    pub models_preset: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    /// 0 means no limit.
    pub models_max: usize,
    pub models_autoload: bool,
    /// Used for models without a `stop-timeout` preset value.
    pub stop_timeout: Duration,
    /// Proxy read/write timeout.
    pub timeout: Duration,
    pub worker_bin: PathBuf,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            models_dir: None,
            models_preset: None,
            cache_dir: None,
            models_max: DEFAULT_MODELS_MAX,
            models_autoload: true,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            timeout: DEFAULT_TIMEOUT,
            worker_bin: PathBuf::from(DEFAULT_WORKER_BIN),
            log_file: None,
            verbose: false,
        }
    }
}

impl RouterConfig {
    /// Build from the router's parsed command line. The cache directory
    /// falls back to the platform default.
    pub fn from_options(registry: &ArgRegistry, options: &OptionSet) -> Result<Self, PresetError> {
        let mut config = Self::default();
        options.apply_to(registry, &mut config)?;
        if config.cache_dir.is_none() {
            config.cache_dir = default_cache_dir();
        }
        Ok(config)
    }
}

impl ApplyOption for RouterConfig {
    fn apply_option(&mut self, key: &str, value: ArgValue) -> Result<(), PresetError> {
        let invalid = |value: String, reason: &str| PresetError::InvalidValue {
            key: key.to_string(),
            value,
            reason: reason.to_string(),
        };

        match (key, value) {
            (keys::HOST, ArgValue::Str(host)) => self.host = host,
            (keys::PORT, ArgValue::Int(port)) => {
                self.port = u16::try_from(port)
                    .map_err(|_| invalid(port.to_string(), "port out of range"))?;
            }
            (keys::MODELS_DIR, ArgValue::Str(dir)) => self.models_dir = Some(PathBuf::from(dir)),
            (keys::MODELS_PRESET, ArgValue::Str(path)) => {
                self.models_preset = Some(PathBuf::from(path));
            }
            (keys::CACHE_DIR, ArgValue::Str(dir)) => self.cache_dir = Some(PathBuf::from(dir)),
            (keys::MODELS_MAX, ArgValue::Int(max)) => {
                self.models_max = usize::try_from(max)
                    .map_err(|_| invalid(max.to_string(), "must not be negative"))?;
            }
            (keys::MODELS_AUTOLOAD, ArgValue::Bool(on)) => self.models_autoload = on,
            (keys::TIMEOUT, ArgValue::Int(secs)) => {
                let secs = u64::try_from(secs)
                    .map_err(|_| invalid(secs.to_string(), "must not be negative"))?;
                self.timeout = Duration::from_secs(secs);
            }
            (keys::WORKER_BIN, ArgValue::Str(bin)) => self.worker_bin = PathBuf::from(bin),
            (keys::LOG_FILE, ArgValue::Str(path)) => self.log_file = Some(PathBuf::from(path)),
            (keys::VERBOSE, ArgValue::Flag) => self.verbose = true,
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let registry = ArgRegistry::server_defaults();
        let options = registry.parse_args::<&str>(&[]).unwrap();
        let config = RouterConfig::from_options(&registry, &options).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.models_max, DEFAULT_MODELS_MAX);
        assert!(config.models_autoload);
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.worker_bin, PathBuf::from("llama-server"));
    }

    #[test]
    fn test_overrides() {
        let registry = ArgRegistry::server_defaults();
        let options = registry
            .parse_args(&[
                "--port",
                "9001",
                "--models-max",
                "0",
                "--no-models-autoload",
                "--models-dir",
                "/srv/models",
                "--timeout",
                "30",
                "--worker-bin",
                "/opt/worker",
                "-v",
            ])
            .unwrap();
        let config = RouterConfig::from_options(&registry, &options).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.models_max, 0);
        assert!(!config.models_autoload);
        assert_eq!(config.models_dir, Some(PathBuf::from("/srv/models")));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.worker_bin, PathBuf::from("/opt/worker"));
        assert!(config.verbose);
    }

    #[test]
    fn test_rejects_out_of_range() {
        let registry = ArgRegistry::server_defaults();
        let options = registry.parse_args(&["--port", "70000"]).unwrap();
        assert!(RouterConfig::from_options(&registry, &options).is_err());
        let options = registry.parse_args(&["--models-max", "-1"]).unwrap();
        assert!(RouterConfig::from_options(&registry, &options).is_err());
    }
}
