use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::{Result, TrawlError};

/// Initialize tracing from the logging keys of `Config`.
///
/// `RUST_LOG` wins over `log_level` when set. With `log_to_file` the
/// subscriber writes ANSI-less output to `log_path`, creating parent
/// directories as needed. Calling this twice is an error from the
/// subscriber; callers do it once at process start.
pub fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    if config.log_to_file {
        let file = open_log_file(&config.log_path)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn open_log_file(path: &str) -> Result<File> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| TrawlError::Misconfigured(format!("log dir {parent:?}: {e}")))?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| TrawlError::Misconfigured(format!("log file {path}: {e}")))
}
