//! Option registry shared by the router and the workers it launches.
//!
//! Every option is known by its long name without leading dashes (the
//! canonical key stored in an [`OptionSet`](crate::OptionSet)). Lookups also
//! accept any short/long spelling, negated spellings and the environment
//! variable name.

use std::collections::HashMap;

use crate::error::PresetError;
use crate::option_set::OptionSet;

/// Canonical keys the router inspects directly.
pub mod keys {
    pub const MODEL: &str = "model";
    pub const MMPROJ: &str = "mmproj";
    pub const HF_REPO: &str = "hf-repo";
    pub const ALIAS: &str = "alias";
    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const API_KEY: &str = "api-key";
    pub const SSL_KEY_FILE: &str = "ssl-key-file";
    pub const SSL_CERT_FILE: &str = "ssl-cert-file";
    pub const MODELS_DIR: &str = "models-dir";
    pub const MODELS_PRESET: &str = "models-preset";
    pub const MODELS_MAX: &str = "models-max";
    pub const MODELS_AUTOLOAD: &str = "models-autoload";
    pub const TIMEOUT: &str = "timeout";
    pub const WORKER_BIN: &str = "worker-bin";
    pub const LOG_FILE: &str = "log-file";
    pub const CACHE_DIR: &str = "cache-dir";
    pub const VERBOSE: &str = "verbose";
    pub const LOAD_ON_STARTUP: &str = "load-on-startup";
    pub const STOP_TIMEOUT: &str = "stop-timeout";
    pub const PIN: &str = "pin";
}

/// Options a remote (untrusted) preset source may set. Sampling options are
/// always allowed on top of these.
const REMOTE_ALLOWED: &[&str] = &[
    "model-url",
    "hf-repo",
    "hf-repo-draft",
    "hf-repo-v",
    "hf-file-v",
    "mmproj-url",
    "pooling",
    "jinja",
    "batch-size",
    "ubatch-size",
    "cache-reuse",
    "chat-template-kwargs",
    "mmap",
];

/// Value shape of an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Switch without a value and without a negated form.
    Flag,
    /// Switch with a `--no-...` counterpart.
    Boolean,
    String,
    Integer,
    /// Two values, stored as `first,second`.
    Pair,
}

#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub key: String,
    pub args: Vec<String>,
    pub neg_args: Vec<String>,
    pub env: Option<String>,
    pub kind: ArgKind,
    pub help: String,
    /// Never rendered on a worker command line; consumed by the router.
    pub preset_only: bool,
    pub sampling: bool,
}

impl ArgSpec {
    pub fn new(args: &[&str], kind: ArgKind, help: &str) -> Self {
        let long = args.last().copied().unwrap_or_default();
        Self {
            key: strip_dashes(long).to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            neg_args: Vec::new(),
            env: None,
            kind,
            help: help.to_string(),
            preset_only: false,
            sampling: false,
        }
    }

    pub fn negated(mut self, args: &[&str]) -> Self {
        self.neg_args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn env(mut self, env: &str) -> Self {
        self.env = Some(env.to_string());
        self
    }

    pub fn preset_only(mut self) -> Self {
        self.preset_only = true;
        self
    }

    pub fn sampling(mut self) -> Self {
        self.sampling = true;
        self
    }

    /// The `--long-form` spelling used when rendering a command line.
    pub fn long_arg(&self) -> &str {
        self.args.last().map(String::as_str).unwrap_or(&self.key)
    }

    /// The negated long spelling, if any.
    pub fn long_neg_arg(&self) -> Option<&str> {
        self.neg_args.last().map(String::as_str)
    }

    pub fn takes_value(&self) -> bool {
        matches!(self.kind, ArgKind::String | ArgKind::Integer | ArgKind::Pair)
    }

    /// Normalize a raw value for this option. Switches become `true`/`false`
    /// (inverted when `negated`), integers are checked, pairs need a comma.
    pub fn normalize(&self, value: &str, negated: bool) -> Result<String, PresetError> {
        let invalid = |reason: &str| PresetError::InvalidValue {
            key: self.key.clone(),
            value: value.to_string(),
            reason: reason.to_string(),
        };
        match self.kind {
            ArgKind::Flag | ArgKind::Boolean => {
                let truthy = if is_truthy(value) {
                    true
                } else if is_falsey(value) {
                    false
                } else {
                    return Err(invalid("expected a boolean"));
                };
                Ok((truthy != negated).to_string())
            }
            ArgKind::Integer => value
                .trim()
                .parse::<i64>()
                .map(|n| n.to_string())
                .map_err(|_| invalid("expected an integer")),
            ArgKind::Pair => {
                if value.contains(',') {
                    Ok(value.to_string())
                } else {
                    Err(invalid("expected two comma-separated values"))
                }
            }
            ArgKind::String => Ok(value.to_string()),
        }
    }
}

/// All options known to the router, indexed by every spelling.
#[derive(Debug, Clone, Default)]
pub struct ArgRegistry {
    specs: Vec<ArgSpec>,
    lookup: HashMap<String, (usize, bool)>,
}

impl ArgRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options understood by the router itself plus the worker options it
    /// knows how to pass through.
    pub fn server_defaults() -> Self {
        use ArgKind::*;
        let specs = [
            ArgSpec::new(&["-m", "--model"], String, "model path").env("LLAMA_ARG_MODEL"),
            ArgSpec::new(&["-mm", "--mmproj"], String, "multimodal projector path")
                .env("LLAMA_ARG_MMPROJ"),
            ArgSpec::new(&["-mu", "--model-url"], String, "model download url")
                .env("LLAMA_ARG_MODEL_URL"),
            ArgSpec::new(&["--mmproj-url"], String, "projector download url")
                .env("LLAMA_ARG_MMPROJ_URL"),
            ArgSpec::new(&["-hf", "--hf-repo"], String, "<user>/<model>[:tag] repository")
                .env("LLAMA_ARG_HF_REPO"),
            ArgSpec::new(&["-hfd", "--hf-repo-draft"], String, "draft model repository")
                .env("LLAMA_ARG_HFD_REPO"),
            ArgSpec::new(&["-hfv", "--hf-repo-v"], String, "vocoder repository")
                .env("LLAMA_ARG_HF_REPO_V"),
            ArgSpec::new(&["-hffv", "--hf-file-v"], String, "vocoder file")
                .env("LLAMA_ARG_HF_FILE_V"),
            ArgSpec::new(&["-a", "--alias"], String, "model name exposed by the server")
                .env("LLAMA_ARG_ALIAS"),
            ArgSpec::new(&["--host"], String, "listen address").env("LLAMA_ARG_HOST"),
            ArgSpec::new(&["--port"], Integer, "listen port").env("LLAMA_ARG_PORT"),
            ArgSpec::new(&["-c", "--ctx-size"], Integer, "context size")
                .env("LLAMA_ARG_CTX_SIZE"),
            ArgSpec::new(&["-ngl", "--n-gpu-layers"], Integer, "layers to offload")
                .env("LLAMA_ARG_N_GPU_LAYERS"),
            ArgSpec::new(&["-t", "--threads"], Integer, "generation threads")
                .env("LLAMA_ARG_THREADS"),
            ArgSpec::new(&["-b", "--batch-size"], Integer, "logical batch size")
                .env("LLAMA_ARG_BATCH"),
            ArgSpec::new(&["-ub", "--ubatch-size"], Integer, "physical batch size")
                .env("LLAMA_ARG_UBATCH"),
            ArgSpec::new(&["-np", "--parallel"], Integer, "parallel slots")
                .env("LLAMA_ARG_N_PARALLEL"),
            ArgSpec::new(&["--jinja"], Boolean, "use jinja chat templates")
                .negated(&["--no-jinja"])
                .env("LLAMA_ARG_JINJA"),
            ArgSpec::new(&["--mmap"], Boolean, "memory-map model files")
                .negated(&["--no-mmap"])
                .env("LLAMA_ARG_MMAP"),
            ArgSpec::new(&["-fa", "--flash-attn"], String, "flash attention: on, off or auto")
                .env("LLAMA_ARG_FLASH_ATTN"),
            ArgSpec::new(&["--pooling"], String, "embedding pooling type")
                .env("LLAMA_ARG_POOLING"),
            ArgSpec::new(&["--cache-reuse"], Integer, "minimum chunk size for cache reuse")
                .env("LLAMA_ARG_CACHE_REUSE"),
            ArgSpec::new(&["--chat-template-kwargs"], String, "extra template arguments (JSON)")
                .env("LLAMA_CHAT_TEMPLATE_KWARGS"),
            ArgSpec::new(&["--embeddings"], Flag, "embedding-only mode")
                .env("LLAMA_ARG_EMBEDDINGS"),
            ArgSpec::new(&["--temp"], String, "sampling temperature").sampling(),
            ArgSpec::new(&["--top-k"], Integer, "top-k sampling").sampling(),
            ArgSpec::new(&["--top-p"], String, "top-p sampling").sampling(),
            ArgSpec::new(&["--min-p"], String, "min-p sampling").sampling(),
            ArgSpec::new(&["--lora-scaled"], Pair, "adapter path and scale: FNAME,SCALE"),
            ArgSpec::new(&["--api-key"], String, "API key").env("LLAMA_API_KEY"),
            ArgSpec::new(&["--ssl-key-file"], String, "PEM private key")
                .env("LLAMA_ARG_SSL_KEY_FILE"),
            ArgSpec::new(&["--ssl-cert-file"], String, "PEM certificate")
                .env("LLAMA_ARG_SSL_CERT_FILE"),
            ArgSpec::new(&["--models-dir"], String, "directory of local models")
                .env("LLAMA_ARG_MODELS_DIR"),
            ArgSpec::new(&["--models-preset"], String, "INI file with model presets")
                .env("LLAMA_ARG_MODELS_PRESET"),
            ArgSpec::new(&["--models-max"], Integer, "max models loaded at once (0 = no limit)")
                .env("LLAMA_ARG_MODELS_MAX"),
            ArgSpec::new(&["--models-autoload"], Boolean, "load models on first request")
                .negated(&["--no-models-autoload"])
                .env("LLAMA_ARG_MODELS_AUTOLOAD"),
            ArgSpec::new(&["-to", "--timeout"], Integer, "proxy read/write timeout in seconds")
                .env("LLAMA_ARG_TIMEOUT"),
            ArgSpec::new(&["--worker-bin"], String, "worker executable")
                .env("LLAMA_ARG_WORKER_BIN"),
            ArgSpec::new(&["--log-file"], String, "also write logs to this file")
                .env("LLAMA_LOG_FILE"),
            ArgSpec::new(&["--cache-dir"], String, "model cache directory").env("LLAMA_CACHE"),
            ArgSpec::new(&["-v", "--verbose"], Flag, "debug logging")
                .env("LLAMA_ARG_VERBOSE"),
            ArgSpec::new(&[keys::LOAD_ON_STARTUP], Boolean, "load this model at startup")
                .preset_only(),
            ArgSpec::new(&[keys::STOP_TIMEOUT], Integer, "seconds before a forced kill")
                .preset_only(),
            ArgSpec::new(&[keys::PIN], Boolean, "never evict this model").preset_only(),
        ];

        let mut registry = Self::new();
        for spec in specs {
            // The built-in table has no duplicate spellings.
            let _ = registry.register(spec);
        }
        registry
    }

    /// Add an option. Every spelling must be unique across the registry.
    pub fn register(&mut self, spec: ArgSpec) -> Result<(), PresetError> {
        let index = self.specs.len();
        let mut names: Vec<(String, bool)> = vec![(spec.key.clone(), false)];
        names.extend(spec.args.iter().map(|a| (strip_dashes(a).to_string(), false)));
        names.extend(spec.neg_args.iter().map(|a| (strip_dashes(a).to_string(), true)));
        names.extend(spec.env.iter().map(|e| (e.clone(), false)));
        names.sort();
        names.dedup();

        if let Some((name, _)) = names.iter().find(|(n, _)| self.lookup.contains_key(n)) {
            return Err(PresetError::DuplicateOption(name.clone()));
        }
        for (name, negated) in names {
            self.lookup.insert(name, (index, negated));
        }
        self.specs.push(spec);
        Ok(())
    }

    /// Resolve any spelling to its option; the flag is set for negated forms.
    pub fn find(&self, name: &str) -> Option<(&ArgSpec, bool)> {
        self.lookup
            .get(strip_dashes(name))
            .map(|&(index, negated)| (&self.specs[index], negated))
    }

    /// Look up an option by its canonical key only.
    pub fn get(&self, key: &str) -> Option<&ArgSpec> {
        match self.lookup.get(key) {
            Some(&(index, false)) if self.specs[index].key == key => Some(&self.specs[index]),
            _ => None,
        }
    }

    pub fn specs(&self) -> &[ArgSpec] {
        &self.specs
    }

    /// Whether a remote preset source may set this key.
    pub fn is_remote_allowed(&self, name: &str) -> bool {
        self.find(name)
            .map(|(spec, _)| spec.sampling || REMOTE_ALLOWED.contains(&spec.key.as_str()))
            .unwrap_or(false)
    }

    /// Parse command-line arguments (without the program name). Accepts
    /// `--key value` and `--key=value`.
    pub fn parse_args<S: AsRef<str>>(&self, args: &[S]) -> Result<OptionSet, PresetError> {
        let mut set = OptionSet::new(crate::preset::DEFAULT_PRESET_NAME);
        let mut iter = args.iter().map(|s| AsRef::<str>::as_ref(s));

        while let Some(token) = iter.next() {
            let (name, inline) = match token.split_once('=') {
                Some((n, v)) if n.starts_with('-') => (n, Some(v)),
                _ => (token, None),
            };
            let found = if name.starts_with('-') { self.find(name) } else { None };
            let (spec, negated) = match found {
                Some(found) if !found.0.preset_only => found,
                _ => {
                    return Err(PresetError::UnknownOption {
                        key: token.to_string(),
                        preset: "command line".to_string(),
                    })
                }
            };

            let value = match spec.kind {
                ArgKind::Flag | ArgKind::Boolean => inline.unwrap_or("true").to_string(),
                ArgKind::String | ArgKind::Integer => match inline {
                    Some(v) => v.to_string(),
                    None => iter
                        .next()
                        .ok_or_else(|| PresetError::MissingValue(spec.key.clone()))?
                        .to_string(),
                },
                ArgKind::Pair => {
                    let mut value = || {
                        iter.next()
                            .ok_or_else(|| PresetError::MissingValue(spec.key.clone()))
                    };
                    let first = value()?;
                    let second = value()?;
                    format!("{first},{second}")
                }
            };
            set.set(&spec.key, spec.normalize(&value, negated)?);
        }

        Ok(set)
    }

    /// Fill options that were not given on the command line from the
    /// environment. `lookup` is usually `|name| std::env::var(name).ok()`.
    pub fn apply_env<F>(&self, set: &mut OptionSet, lookup: F) -> Result<(), PresetError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for spec in &self.specs {
            let Some(env) = &spec.env else { continue };
            if set.contains(&spec.key) {
                continue;
            }
            if let Some(value) = lookup(env) {
                set.set(&spec.key, spec.normalize(&value, false)?);
            }
        }
        Ok(())
    }

    /// Usage text listing every command-line option.
    pub fn help_text(&self) -> String {
        let mut out = String::from("options:\n");
        for spec in self.specs.iter().filter(|s| !s.preset_only) {
            let mut names = spec.args.join(", ");
            if !spec.neg_args.is_empty() {
                names = format!("{names}, {}", spec.neg_args.join(", "));
            }
            match spec.kind {
                ArgKind::String | ArgKind::Integer => names.push_str(" VALUE"),
                ArgKind::Pair => names.push_str(" A B"),
                ArgKind::Flag | ArgKind::Boolean => {}
            }
            out.push_str(&format!("  {names:<40} {}", spec.help));
            if let Some(env) = &spec.env {
                out.push_str(&format!(" (env: {env})"));
            }
            out.push('\n');
        }
        out
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "on" | "enabled" | "true" | "1"
    )
}

pub fn is_falsey(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "off" | "disabled" | "false" | "0"
    )
}

pub(crate) fn strip_dashes(name: &str) -> &str {
    name.trim_start_matches('-')
}
