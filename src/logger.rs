use std::env;
use std::io::{stderr, Write};
use std::path::PathBuf;
use std::{
    fs::{File, OpenOptions},
    str::FromStr,
};

use anyhow::{Context, Result};
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

pub const LOG_LEVEL_ENV: &str = "CGMGR_LOG_LEVEL";

pub static CGMGR_LOGGER: OnceCell<CgmgrLogger> = OnceCell::new();
pub static LOG_FILE: OnceCell<Option<File>> = OnceCell::new();

fn level_filter() -> LevelFilter {
    env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|level| LevelFilter::from_str(&level).ok())
        .unwrap_or(LevelFilter::Warn)
}

/// Installs the global logger. Records go to `log_file` when given, to
/// stderr otherwise. Only the first call has an effect.
pub fn init(log_file: Option<PathBuf>) -> Result<()> {
    let log_file = LOG_FILE.get_or_try_init(|| -> Result<Option<File>> {
        log_file
            .as_ref()
            .map(|path| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open log file {path:?}"))
            })
            .transpose()
    })?;

    let level_filter = level_filter();
    let mut installed = false;
    let logger = CGMGR_LOGGER.get_or_init(|| {
        installed = true;
        CgmgrLogger::new(level_filter.to_level())
    });
    if installed {
        log::set_logger(logger)
            .map(|()| log::set_max_level(level_filter))
            .map_err(|err| anyhow::anyhow!("failed to install the logger: {err}"))?;
        log::debug!(
            "logging to {}",
            if log_file.is_some() { "file" } else { "stderr" }
        );
    }
    Ok(())
}

pub struct CgmgrLogger {
    level: Option<log::Level>,
}

impl CgmgrLogger {
    pub fn new(level: Option<log::Level>) -> Self {
        Self { level }
    }

    fn format(record: &Record) -> String {
        match (record.file(), record.line()) {
            (Some(file), Some(line)) => format!(
                "[{} {}:{}] {} {}",
                record.level(),
                file,
                line,
                chrono::Local::now().to_rfc3339(),
                record.args()
            ),
            (_, _) => format!(
                "[{}] {} {}",
                record.level(),
                chrono::Local::now().to_rfc3339(),
                record.args()
            ),
        }
    }
}

impl Log for CgmgrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if let Some(level) = self.level {
            metadata.level() <= level
        } else {
            false
        }
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let log_msg = Self::format(record);
            if let Some(mut log_file) = LOG_FILE.get().and_then(Option::as_ref) {
                let _ = writeln!(log_file, "{log_msg}");
            } else {
                let _ = writeln!(stderr(), "{log_msg}");
            }
        }
    }

    fn flush(&self) {
        if let Some(mut log_file) = LOG_FILE.get().and_then(Option::as_ref) {
            let _ = log_file.flush();
        } else {
            let _ = stderr().flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_level_from_env() {
        env::set_var(LOG_LEVEL_ENV, "debug");
        assert_eq!(level_filter(), LevelFilter::Debug);
        env::set_var(LOG_LEVEL_ENV, "nonsense");
        assert_eq!(level_filter(), LevelFilter::Warn);
        env::remove_var(LOG_LEVEL_ENV);
        assert_eq!(level_filter(), LevelFilter::Warn);
    }

    #[test]
    fn test_enabled_levels() {
        let logger = CgmgrLogger::new(Some(log::Level::Info));
        let info = Metadata::builder().level(log::Level::Info).build();
        let debug = Metadata::builder().level(log::Level::Debug).build();
        assert!(logger.enabled(&info));
        assert!(!logger.enabled(&debug));

        let off = CgmgrLogger::new(None);
        assert!(!off.enabled(&info));
    }

    #[test]
    fn test_format() {
        let line = CgmgrLogger::format(
            &Record::builder()
                .args(format_args!("created group {}", "test"))
                .level(log::Level::Warn)
                .file(Some("manager.rs"))
                .line(Some(42))
                .build(),
        );
        assert!(line.starts_with("[WARN manager.rs:42] "));
        assert!(line.ends_with(" created group test"));
    }

    #[test]
    #[serial]
    fn test_init_with_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cgmgr.log");
        init(Some(path)).unwrap();
        // later calls keep the first configuration
        init(None).unwrap();
        assert!(CGMGR_LOGGER.get().is_some());
    }
}
