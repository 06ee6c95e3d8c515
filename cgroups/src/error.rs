use crate::common::{InvalidGroupPath, WrappedIoError};
use crate::fs::ScanError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to scan mounted cgroup hierarchies: {0}")]
    Initialization(#[from] ScanError),
    #[error("controller {0} is not mounted")]
    NotMounted(String),
    #[error("parameter {param} of controller {controller} not found")]
    NotFound { controller: String, param: String },
    #[error("value {value:?} of {param} cannot be read as {expected}")]
    TypeMismatch {
        param: String,
        value: String,
        expected: &'static str,
    },
    #[error("parameter {param} of controller {controller} already exists")]
    ValueExists { controller: String, param: String },
    #[error("recursive and empty-only delete flags cannot be combined")]
    InvalidFlagCombination,
    #[error("group {0} has not been created")]
    NotCommitted(String),
    #[error("groups are not equal")]
    GroupNotEqual,
    #[error("controllers are not equal")]
    ControllerNotEqual,
    #[error("group {0} does not exist in any mounted hierarchy")]
    GroupNotFound(String),
    #[error("group {0} has no controllers attached")]
    NoControllers(String),
    #[error("invalid group path: {0}")]
    InvalidPath(#[from] InvalidGroupPath),
    #[error("kernel operation failed: {0}")]
    KernelOperation(#[from] WrappedIoError),
    #[error("end of sequence")]
    EndOfSequence,
}

impl Error {
    /// OS error code of a failed kernel operation.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::KernelOperation(err) => err.errno(),
            _ => None,
        }
    }
}
