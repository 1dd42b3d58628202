// Rendering a model preset into a worker command line

use std::path::{Path, PathBuf};

use llama_router_config::{keys, ArgRegistry, OptionSet, PresetError};
use serde::Serialize;

/// Workers only listen on loopback.
pub const CHILD_ADDR: &str = "127.0.0.1";
/// Tells a worker it runs under a router, and on which port.
pub const ROUTER_PORT_ENV: &str = "LLAMA_SERVER_ROUTER_PORT";

/// Options that belong to the router and must never reach a worker.
const ROUTER_ONLY_KEYS: &[&str] = &[
    keys::SSL_KEY_FILE,
    keys::SSL_CERT_FILE,
    keys::API_KEY,
    keys::MODELS_DIR,
    keys::MODELS_MAX,
    keys::MODELS_PRESET,
    keys::MODELS_AUTOLOAD,
    keys::WORKER_BIN,
    keys::LOG_FILE,
    keys::CACHE_DIR,
];

/// Options that pick the model itself.
const MODEL_KEYS: &[&str] = &[keys::MODEL, keys::MMPROJ, keys::HF_REPO];

/// Options injected per worker run.
const INJECTED_KEYS: &[&str] = &[keys::HOST, keys::PORT, keys::ALIAS];

/// Drop router-only options; with `strip_model`, also the model selection so
/// a model given on the router's command line doesn't override every preset.
pub fn strip_router_keys(options: &mut OptionSet, strip_model: bool) {
    for key in ROUTER_ONLY_KEYS {
        options.unset(key);
    }
    if strip_model {
        for key in MODEL_KEYS {
            options.unset(key);
        }
    }
}

/// The preset as shown to API clients: no injected or router-only options.
pub fn public_preset(preset: &OptionSet) -> OptionSet {
    let mut out = preset.clone();
    strip_router_keys(&mut out, false);
    for key in INJECTED_KEYS {
        out.unset(key);
    }
    out
}

/// Program, arguments and extra environment of one worker run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// Render `preset` for model `name` listening on `port`. Host, port and
    /// alias always override the preset's own values.
    pub fn render(
        registry: &ArgRegistry,
        program: &Path,
        preset: &OptionSet,
        name: &str,
        port: u16,
        router_port: u16,
    ) -> Result<Self, PresetError> {
        let mut options = preset.clone();
        strip_router_keys(&mut options, false);
        options.set(keys::HOST, CHILD_ADDR);
        options.set(keys::PORT, port.to_string());
        options.set(keys::ALIAS, name);

        Ok(Self {
            program: program.to_path_buf(),
            args: options.to_args(registry)?,
            env: vec![(ROUTER_PORT_ENV.to_string(), router_port.to_string())],
        })
    }

    /// Human-readable command line for logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push_str(&format!("{arg:?}"));
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preset() -> OptionSet {
        let mut preset = OptionSet::new("chat");
        preset.set("model", "/m/chat.gguf");
        preset.set("host", "0.0.0.0");
        preset.set("port", "1");
        preset.set("alias", "other");
        preset.set("api-key", "secret");
        preset.set("models-max", "2");
        preset.set("stop-timeout", "5");
        preset
    }

    #[test]
    fn test_render_overrides_and_strips() {
        let registry = ArgRegistry::server_defaults();
        let inv =
            Invocation::render(&registry, Path::new("/bin/w"), &preset(), "chat", 40000, 8080)
                .unwrap();
        assert_eq!(
            inv.args,
            vec!["--alias", "chat", "--host", "127.0.0.1", "--model", "/m/chat.gguf", "--port", "40000"]
        );
        assert_eq!(
            inv.env,
            vec![("LLAMA_SERVER_ROUTER_PORT".to_string(), "8080".to_string())]
        );
    }

    #[test]
    fn test_strip_model_keys() {
        let mut options = preset();
        options.set("mmproj", "/m/p.gguf");
        options.set("hf-repo", "u/m");
        strip_router_keys(&mut options, true);
        for key in ["model", "mmproj", "hf-repo", "api-key", "models-max"] {
            assert!(!options.contains(key), "{key}");
        }
        assert!(options.contains("stop-timeout"));
    }

    #[test]
    fn test_public_preset() {
        let public = public_preset(&preset());
        let keys: Vec<_> = public.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["model", "stop-timeout"]);
    }

    #[test]
    fn test_command_line_quotes() {
        let inv = Invocation {
            program: PathBuf::from("/bin/w"),
            args: vec!["--alias".into(), "a b".into()],
            env: Vec::new(),
        };
        assert_eq!(inv.command_line(), r#"/bin/w --alias "a b""#);
    }
}
