use std::fmt::{Display, Formatter};

use ticklog_core::{ConfigError, RebuildError, ValidationError, WriteError};

/// CLI-level errors with process exit codes.
#[derive(Debug)]
pub enum CliError {
    Config(ConfigError),
    InvalidPair(ValidationError),
    UnknownPair { pair: String },
    Storage(WriteError),
    Rebuild(RebuildError),
    Io(std::io::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::InvalidPair(_) | Self::UnknownPair { .. } => 2,
            Self::Storage(_) | Self::Rebuild(_) | Self::Io(_) => 1,
        }
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(error) => write!(f, "configuration error: {error}"),
            Self::InvalidPair(error) => write!(f, "invalid pair: {error}"),
            Self::UnknownPair { pair } => {
                write!(f, "pair '{pair}' is not present in the configuration")
            }
            Self::Storage(error) => write!(f, "partition storage error: {error}"),
            Self::Rebuild(error) => write!(f, "rebuild failed: {error}"),
            Self::Io(error) => write!(f, "io error: {error}"),
        }
    }
}

impl std::error::Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(error: ConfigError) -> Self {
        Self::Config(error)
    }
}

impl From<ValidationError> for CliError {
    fn from(error: ValidationError) -> Self {
        Self::InvalidPair(error)
    }
}

impl From<WriteError> for CliError {
    fn from(error: WriteError) -> Self {
        Self::Storage(error)
    }
}

impl From<RebuildError> for CliError {
    fn from(error: RebuildError) -> Self {
        Self::Rebuild(error)
    }
}

impl From<std::io::Error> for CliError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}
