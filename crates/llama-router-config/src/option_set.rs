//! Named option sets ("presets") and cascade merging.

use std::collections::BTreeMap;

use crate::arg::{is_truthy, ArgKind, ArgRegistry};
use crate::error::PresetError;

/// A typed option value handed to [`ApplyOption`] targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    /// A switch that is present.
    Flag,
    Bool(bool),
    Str(String),
    Int(i64),
    Pair(String, String),
}

/// A typed settings struct that can be filled from an [`OptionSet`].
pub trait ApplyOption {
    /// Apply one option. Targets ignore keys they have no field for.
    fn apply_option(&mut self, key: &str, value: ArgValue) -> Result<(), PresetError>;
}

/// Mapping of canonical option key to its string value. Keys are unique and
/// iterate in a deterministic order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    pub name: String,
    options: BTreeMap<String, String>,
}

impl OptionSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: BTreeMap::new(),
        }
    }

    /// Store a value under a canonical key as-is.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.options.insert(key.to_string(), value.into());
    }

    /// Store a value under any spelling of a registered option, validating
    /// and normalizing it first.
    pub fn set_option(
        &mut self,
        registry: &ArgRegistry,
        name: &str,
        value: &str,
    ) -> Result<(), PresetError> {
        let (spec, negated) = registry.find(name).ok_or_else(|| PresetError::UnknownOption {
            key: name.to_string(),
            preset: self.name.clone(),
        })?;
        let value = spec.normalize(value, negated)?;
        self.options.insert(spec.key.clone(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Boolean view of a switch; `None` when unset.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).map(is_truthy)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    pub fn unset(&mut self, key: &str) -> Option<String> {
        self.options.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Cascade `overlay` onto this set: overlay values win, keys only present
    /// here are kept, keys only present in the overlay are added.
    pub fn merge(&mut self, overlay: &OptionSet) {
        for (key, value) in &overlay.options {
            self.options.insert(key.clone(), value.clone());
        }
    }

    /// A copy of this set with `overlay` cascaded on top, named after the
    /// overlay.
    pub fn cascaded(&self, overlay: &OptionSet) -> OptionSet {
        let mut out = self.clone();
        out.name = overlay.name.clone();
        out.merge(overlay);
        out
    }

    /// Render as a command line. Preset-only keys are skipped, false
    /// switches use their negated form (or are dropped), pairs expand to two
    /// values.
    pub fn to_args(&self, registry: &ArgRegistry) -> Result<Vec<String>, PresetError> {
        let mut args = Vec::new();
        for (key, value) in &self.options {
            let spec = registry.get(key).ok_or_else(|| PresetError::UnknownOption {
                key: key.clone(),
                preset: self.name.clone(),
            })?;
            if spec.preset_only {
                continue;
            }
            match spec.kind {
                ArgKind::Flag | ArgKind::Boolean => {
                    if is_truthy(value) {
                        args.push(spec.long_arg().to_string());
                    } else if let Some(neg) = spec.long_neg_arg() {
                        args.push(neg.to_string());
                    }
                }
                ArgKind::String | ArgKind::Integer => {
                    args.push(spec.long_arg().to_string());
                    args.push(value.clone());
                }
                ArgKind::Pair => {
                    let (first, second) = split_pair(key, value)?;
                    args.push(spec.long_arg().to_string());
                    args.push(first.to_string());
                    args.push(second.to_string());
                }
            }
        }
        Ok(args)
    }

    /// Render as an INI section.
    pub fn to_ini(&self) -> String {
        let mut out = format!("[{}]\n", self.name);
        for (key, value) in &self.options {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(&value.replace('\n', "\\\n"));
            out.push('\n');
        }
        out.push('\n');
        out
    }

    /// Feed every option to a typed target.
    pub fn apply_to<T: ApplyOption>(
        &self,
        registry: &ArgRegistry,
        target: &mut T,
    ) -> Result<(), PresetError> {
        for (key, value) in &self.options {
            let Some(spec) = registry.get(key) else {
                continue;
            };
            let typed = match spec.kind {
                ArgKind::Flag => {
                    if !is_truthy(value) {
                        continue;
                    }
                    ArgValue::Flag
                }
                ArgKind::Boolean => ArgValue::Bool(is_truthy(value)),
                ArgKind::Integer => {
                    ArgValue::Int(value.trim().parse().map_err(|_| PresetError::InvalidValue {
                        key: key.clone(),
                        value: value.clone(),
                        reason: "expected an integer".to_string(),
                    })?)
                }
                ArgKind::String => ArgValue::Str(value.clone()),
                ArgKind::Pair => {
                    let (first, second) = split_pair(key, value)?;
                    ArgValue::Pair(first.to_string(), second.to_string())
                }
            };
            target.apply_option(key, typed)?;
        }
        Ok(())
    }
}

fn split_pair<'a>(key: &str, value: &'a str) -> Result<(&'a str, &'a str), PresetError> {
    value
        .rsplit_once(',')
        .ok_or_else(|| PresetError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected two comma-separated values".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(name: &str, pairs: &[(&str, &str)]) -> OptionSet {
        let mut out = OptionSet::new(name);
        for (k, v) in pairs {
            out.set(k, *v);
        }
        out
    }

    #[test]
    fn test_merge_is_right_biased() {
        let mut base = set("a", &[("ctx-size", "1024"), ("threads", "4")]);
        base.merge(&set("b", &[("ctx-size", "8192"), ("jinja", "true")]));
        assert_eq!(base.get("ctx-size"), Some("8192"));
        assert_eq!(base.get("threads"), Some("4"));
        assert_eq!(base.get("jinja"), Some("true"));
        assert_eq!(base.name, "a");
    }

    #[test]
    fn test_cascade_empty_overlay_is_identity() {
        let base = set("m", &[("ctx-size", "1024")]);
        let out = base.cascaded(&OptionSet::new("m"));
        assert_eq!(out, base);
    }

    #[test]
    fn test_cascade_is_associative() {
        let a = set("x", &[("ctx-size", "1"), ("threads", "1")]);
        let b = set("x", &[("ctx-size", "2"), ("port", "2")]);
        let c = set("x", &[("port", "3"), ("jinja", "true")]);
        let left = a.cascaded(&b).cascaded(&c);
        let right = a.cascaded(&b.cascaded(&c));
        assert_eq!(left, right);
    }

    #[test]
    fn test_set_option_normalizes() {
        let registry = ArgRegistry::server_defaults();
        let mut s = OptionSet::new("m");
        s.set_option(&registry, "no-mmap", "true").unwrap();
        s.set_option(&registry, "LLAMA_ARG_JINJA", "on").unwrap();
        s.set_option(&registry, "-c", " 2048 ").unwrap();
        assert_eq!(s.get("mmap"), Some("false"));
        assert_eq!(s.get("jinja"), Some("true"));
        assert_eq!(s.get("ctx-size"), Some("2048"));

        let err = s.set_option(&registry, "nope", "1").unwrap_err();
        assert!(matches!(err, PresetError::UnknownOption { preset, .. } if preset == "m"));
    }

    #[test]
    fn test_to_args() {
        let registry = ArgRegistry::server_defaults();
        let s = set(
            "m",
            &[
                ("model", "/m.gguf"),
                ("mmap", "false"),
                ("jinja", "true"),
                ("embeddings", "false"),
                ("lora-scaled", "a.gguf,0.5"),
                ("stop-timeout", "3"),
                ("load-on-startup", "true"),
            ],
        );
        assert_eq!(
            s.to_args(&registry).unwrap(),
            vec![
                "--jinja",
                "--lora-scaled",
                "a.gguf",
                "0.5",
                "--no-mmap",
                "--model",
                "/m.gguf",
            ]
        );
    }

    #[test]
    fn test_to_ini() {
        let s = set("m", &[("alias", "a\nb"), ("ctx-size", "10")]);
        assert_eq!(s.to_ini(), "[m]\nalias = a\\\nb\nctx-size = 10\n\n");
    }

    #[derive(Default)]
    struct Target {
        port: i64,
        mmap: Option<bool>,
        verbose: bool,
        lora: Option<(String, String)>,
    }

    impl ApplyOption for Target {
        fn apply_option(&mut self, key: &str, value: ArgValue) -> Result<(), PresetError> {
            match (key, value) {
                ("port", ArgValue::Int(n)) => self.port = n,
                ("mmap", ArgValue::Bool(b)) => self.mmap = Some(b),
                ("verbose", ArgValue::Flag) => self.verbose = true,
                ("lora-scaled", ArgValue::Pair(a, b)) => self.lora = Some((a, b)),
                _ => {}
            }
            Ok(())
        }
    }

    #[test]
    fn test_apply_to() {
        let registry = ArgRegistry::server_defaults();
        let s = set(
            "m",
            &[
                ("port", "9000"),
                ("mmap", "false"),
                ("verbose", "true"),
                ("lora-scaled", "x,1.5"),
            ],
        );
        let mut target = Target::default();
        s.apply_to(&registry, &mut target).unwrap();
        assert_eq!(target.port, 9000);
        assert_eq!(target.mmap, Some(false));
        assert!(target.verbose);
        assert_eq!(target.lora, Some(("x".to_string(), "1.5".to_string())));
    }
}
