//! Preset sources and their resolution into one option set per model.
//!
//! Sources, lowest precedence first: the model cache (one preset per cached
//! manifest), a local models directory, an INI preset file. The INI file's
//! `[*]` section is cascaded under every source's presets, and the router's
//! own command-line options are merged on top of every model last.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use walkdir::WalkDir;

use crate::arg::{keys, ArgRegistry};
use crate::error::PresetError;
use crate::ini::{parse_ini, DEFAULT_SECTION};
use crate::option_set::OptionSet;

pub const DEFAULT_PRESET_NAME: &str = "default";
/// INI section applied as the base of every model.
pub const GLOBAL_SECTION: &str = "*";

/// Presets keyed by model name.
pub type Presets = BTreeMap<String, OptionSet>;

/// Contents of an INI preset file.
#[derive(Debug, Clone, Default)]
pub struct PresetFile {
    pub global: OptionSet,
    pub presets: Presets,
}

/// Where `resolve` looks for presets.
#[derive(Debug, Clone, Default)]
pub struct PresetSources {
    pub cache_dir: Option<PathBuf>,
    pub models_dir: Option<PathBuf>,
    pub preset_file: Option<PathBuf>,
    /// Router command-line options, already stripped of router-only keys.
    pub base: OptionSet,
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedPresets {
    pub presets: Presets,
    /// Names that came from (or were adjusted by) the INI file.
    pub custom: BTreeSet<String>,
}

/// A cached model, identified by its manifest file name
/// `manifest=<user>=<model>=<tag>.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedModel {
    pub user: String,
    pub model: String,
    pub tag: String,
    pub manifest_path: PathBuf,
}

impl CachedModel {
    fn from_file_name(name: &str, path: &Path) -> Option<Self> {
        let stem = name.strip_prefix("manifest=")?.strip_suffix(".json")?;
        let parts: Vec<&str> = stem.split('=').collect();
        match parts.as_slice() {
            [user, model, tag] => Some(Self {
                user: user.to_string(),
                model: model.to_string(),
                tag: tag.to_string(),
                manifest_path: path.to_path_buf(),
            }),
            _ => None,
        }
    }

    /// `user/model[:tag]`, the tag omitted when it is `latest`.
    pub fn repo_name(&self) -> String {
        if self.tag.is_empty() || self.tag == "latest" {
            format!("{}/{}", self.user, self.model)
        } else {
            format!("{}/{}:{}", self.user, self.model, self.tag)
        }
    }
}

/// Resolves `LLAMA_CACHE`, then the platform cache directory.
pub fn default_cache_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("LLAMA_CACHE").filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    if let Some(dir) = std::env::var_os("XDG_CACHE_HOME").filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir).join("llama.cpp"));
    }
    if cfg!(windows) {
        std::env::var_os("LOCALAPPDATA").map(|d| PathBuf::from(d).join("llama.cpp"))
    } else if cfg!(target_os = "macos") {
        std::env::var_os("HOME").map(|d| PathBuf::from(d).join("Library/Caches/llama.cpp"))
    } else {
        std::env::var_os("HOME").map(|d| PathBuf::from(d).join(".cache/llama.cpp"))
    }
}

#[derive(Debug, Clone)]
pub struct PresetContext {
    registry: Arc<ArgRegistry>,
    remote_only: bool,
}

impl PresetContext {
    pub fn new(registry: Arc<ArgRegistry>) -> Self {
        Self {
            registry,
            remote_only: false,
        }
    }

    /// A context for untrusted preset files: only allow-listed keys pass.
    pub fn remote(registry: Arc<ArgRegistry>) -> Self {
        Self {
            registry,
            remote_only: true,
        }
    }

    pub fn registry(&self) -> &Arc<ArgRegistry> {
        &self.registry
    }

    /// Parse the router's own command line, falling back to environment
    /// variables for options not given.
    pub fn load_from_args<S: AsRef<str>>(&self, args: &[S]) -> Result<OptionSet, PresetError> {
        let mut preset = self.registry.parse_args(args)?;
        self.registry
            .apply_env(&mut preset, |name| std::env::var(name).ok())?;
        Ok(preset)
    }

    pub fn load_from_ini(&self, path: &Path) -> Result<PresetFile, PresetError> {
        let text = std::fs::read_to_string(path).map_err(|e| PresetError::io(path, e))?;
        self.load_from_ini_str(&text)
    }

    pub fn load_from_ini_str(&self, text: &str) -> Result<PresetFile, PresetError> {
        let mut out = PresetFile {
            global: OptionSet::new(GLOBAL_SECTION),
            presets: Presets::new(),
        };

        for section in parse_ini(text)? {
            let name = if section.name.is_empty() {
                DEFAULT_SECTION.to_string()
            } else {
                section.name
            };
            debug!("loading preset: {name}");

            let mut preset = OptionSet::new(name.clone());
            for entry in section.entries {
                if entry.key == "version" {
                    continue;
                }
                if self.remote_only && !self.registry.is_remote_allowed(&entry.key) {
                    return Err(PresetError::NotAllowed(entry.key));
                }
                preset.set_option(&self.registry, &entry.key, &entry.value)?;
            }

            if name == GLOBAL_SECTION {
                out.global = preset;
            } else if name == DEFAULT_SECTION && preset.is_empty() {
                // Only `version` above the first header.
                continue;
            } else {
                out.presets.insert(name, preset);
            }
        }

        Ok(out)
    }

    /// One preset per cached manifest, pointing the worker at the repository.
    /// A missing cache directory yields no presets.
    pub fn load_from_cache(&self, cache_dir: &Path) -> Result<Presets, PresetError> {
        let mut out = Presets::new();
        if !cache_dir.is_dir() {
            return Ok(out);
        }

        for entry in WalkDir::new(cache_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| walk_error(cache_dir, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            let Some(model) = CachedModel::from_file_name(&file_name, entry.path()) else {
                continue;
            };
            let name = model.repo_name();
            let mut preset = OptionSet::new(name.clone());
            preset.set_option(&self.registry, keys::HF_REPO, &name)?;
            out.insert(name, preset);
        }

        Ok(out)
    }

    /// One preset per subdirectory holding a `.gguf` file, plus one per
    /// loose `.gguf` file named after its stem.
    pub fn load_from_models_dir(&self, models_dir: &Path) -> Result<Presets, PresetError> {
        if !models_dir.is_dir() {
            return Err(PresetError::NotADirectory(models_dir.to_path_buf()));
        }

        let mut out = Presets::new();
        for entry in WalkDir::new(models_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| walk_error(models_dir, e))?;
            let file_name = entry.file_name().to_string_lossy().to_string();

            let found = if entry.file_type().is_dir() {
                scan_model_subdir(entry.path())?.map(|(model, mmproj)| (file_name, model, mmproj))
            } else if let Some(stem) = file_name.strip_suffix(".gguf") {
                Some((stem.to_string(), entry.path().to_path_buf(), None))
            } else {
                None
            };

            if let Some((name, model, mmproj)) = found {
                let mut preset = OptionSet::new(name.clone());
                preset.set_option(&self.registry, keys::MODEL, &model.to_string_lossy())?;
                if let Some(mmproj) = mmproj {
                    preset.set_option(&self.registry, keys::MMPROJ, &mmproj.to_string_lossy())?;
                }
                out.insert(name, preset);
            }
        }

        Ok(out)
    }

    /// Merge `added` into `base` by name: existing presets are cascaded,
    /// new ones inserted.
    pub fn cascade(base: &Presets, added: &Presets) -> Presets {
        let mut out = base.clone();
        for (name, preset) in added {
            match out.get_mut(name) {
                Some(target) => target.merge(preset),
                None => {
                    out.insert(name.clone(), preset.clone());
                }
            }
        }
        out
    }

    /// Lay every preset over a copy of `base`.
    pub fn cascade_over_base(base: &OptionSet, presets: &Presets) -> Presets {
        presets
            .iter()
            .map(|(name, preset)| {
                let mut out = base.cascaded(preset);
                out.name = name.clone();
                (name.clone(), out)
            })
            .collect()
    }

    /// Load every configured source and produce the final preset per model.
    pub fn resolve(&self, sources: &PresetSources) -> Result<ResolvedPresets, PresetError> {
        let cached = match &sources.cache_dir {
            Some(dir) => self.load_from_cache(dir)?,
            None => Presets::new(),
        };
        info!("Loaded {} cached model presets", cached.len());

        let local = match &sources.models_dir {
            Some(dir) => {
                let local = self.load_from_models_dir(dir)?;
                info!("Loaded {} local model presets from {}", local.len(), dir.display());
                local
            }
            None => Presets::new(),
        };

        let file = match &sources.preset_file {
            Some(path) => {
                let file = self.load_from_ini(path)?;
                info!(
                    "Loaded {} custom model presets from {}",
                    file.presets.len(),
                    path.display()
                );
                file
            }
            None => PresetFile::default(),
        };

        let cached = Self::cascade_over_base(&file.global, &cached);
        let local = Self::cascade_over_base(&file.global, &local);
        let custom = Self::cascade_over_base(&file.global, &file.presets);

        // A local model replaces a cached one of the same name outright.
        let mut presets = cached;
        presets.extend(local);
        let mut presets = Self::cascade(&presets, &custom);
        for preset in presets.values_mut() {
            preset.merge(&sources.base);
        }

        Ok(ResolvedPresets {
            presets,
            custom: custom.keys().cloned().collect(),
        })
    }
}

/// Pick the model file (first shard preferred) and projector in a model
/// subdirectory.
fn scan_model_subdir(dir: &Path) -> Result<Option<(PathBuf, Option<PathBuf>)>, PresetError> {
    let mut model = None;
    let mut first_shard = None;
    let mut mmproj = None;

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(dir, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(".gguf") {
            continue;
        }
        let path = entry.path().to_path_buf();
        if name.contains("mmproj") {
            mmproj = Some(path);
        } else if name.contains("-00001-of-") {
            first_shard = Some(path);
        } else if model.is_none() {
            model = Some(path);
        }
    }

    Ok(first_shard.or(model).map(|path| (path, mmproj)))
}

fn walk_error(dir: &Path, e: walkdir::Error) -> PresetError {
    let path = e.path().unwrap_or(dir).to_path_buf();
    let source = e
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other("directory loop"));
    PresetError::io(path, source)
}
