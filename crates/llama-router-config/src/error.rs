use std::path::PathBuf;

/// Errors raised while building or resolving presets. All of them are
/// configuration errors and abort router startup.
#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    #[error("option '{key}' not recognized in preset '{preset}'")]
    UnknownOption { key: String, preset: String },

    #[error("option '{0}' is not allowed in remote presets")]
    NotAllowed(String),

    #[error("invalid value '{value}' for option '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("option '{0}' expects a value")]
    MissingValue(String),

    #[error("option '{0}' is already registered")]
    DuplicateOption(String),

    #[error("failed to parse preset file at line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("'{}' does not exist or is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PresetError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
