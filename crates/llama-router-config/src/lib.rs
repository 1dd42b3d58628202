//! Option registry, option sets and preset resolution for the model router.

pub mod arg;
pub mod error;
pub mod ini;
pub mod option_set;
pub mod preset;

pub use arg::{is_falsey, is_truthy, keys, ArgKind, ArgRegistry, ArgSpec};
pub use error::PresetError;
pub use option_set::{ApplyOption, ArgValue, OptionSet};
pub use preset::{
    default_cache_dir, PresetContext, PresetSources, Presets, ResolvedPresets,
    DEFAULT_PRESET_NAME, GLOBAL_SECTION,
};
