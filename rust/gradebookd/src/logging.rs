//! Logging bootstrap for the daemon.
//!
//! stdout carries IPC responses, so log lines go to stderr or to rotating
//! files, never to stdout. Initialization happens once and never panics.

use crate::config::DaemonConfig;
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};
use log::info;
use once_cell::sync::OnceCell;

const LOG_FILE_BASENAME: &str = "gradebookd";
const MAX_LOG_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: usize = 5;

static LOGGER: OnceCell<LoggerHandle> = OnceCell::new();

pub fn init(cfg: &DaemonConfig) -> Result<(), String> {
    LOGGER
        .get_or_try_init(|| -> Result<LoggerHandle, String> {
            let logger = Logger::try_with_str(cfg.log_level)
                .map_err(|err| format!("invalid log level `{}`: {err}", cfg.log_level))?;
            let handle = match &cfg.log_dir {
                Some(dir) => {
                    std::fs::create_dir_all(dir).map_err(|err| {
                        format!("failed to create log directory `{}`: {err}", dir.display())
                    })?;
                    logger
                        .log_to_file(
                            FileSpec::default()
                                .directory(dir.as_path())
                                .basename(LOG_FILE_BASENAME),
                        )
                        .rotate(
                            Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
                            Naming::Numbers,
                            Cleanup::KeepLogFiles(MAX_LOG_FILES),
                        )
                        .write_mode(WriteMode::BufferAndFlush)
                        .append()
                        .format_for_files(flexi_logger::detailed_format)
                        .start()
                }
                None => logger
                    .log_to_stderr()
                    .format_for_stderr(flexi_logger::default_format)
                    .start(),
            }
            .map_err(|err| format!("failed to start logger: {err}"))?;

            info!(
                "event=daemon_start module=core status=ok version={} level={}",
                env!("CARGO_PKG_VERSION"),
                cfg.log_level
            );
            Ok(handle)
        })
        .map(|_| ())
}
