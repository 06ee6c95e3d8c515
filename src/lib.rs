//! cgmgr manages control groups from `cgconfig.conf` files on top of the
//! `cgroups` crate, which it re-exports.
pub mod config;
pub mod logger;

pub use cgroups;
pub use config::{ConfigError, ConfigLoader, ParseError};
