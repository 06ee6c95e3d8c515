//! cgconfig.conf support: `mount`, `default` and `group` blocks are parsed
//! and realized through the cgroup manager, and torn down again on unload.
mod lexer;
mod loader;
mod parser;

use std::path::PathBuf;

pub use loader::ConfigLoader;
pub use parser::{
    parse, AdminPerm, Config, ControllerDef, GroupDef, MountDirective, PermSpec, Principal,
    TaskPerm, UNIFIED_MOUNT_KEY,
};

/// Malformed configuration, with the line and the field it was found at.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {field}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub field: String,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new<M: Into<String>>(line: usize, field: &str, message: M) -> Self {
        Self {
            line,
            field: field.to_owned(),
            message: message.into(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Cgroup(#[from] cgroups::Error),
    #[error("failed to read {path}: {err}")]
    Io { err: std::io::Error, path: PathBuf },
}
