//! Process-wide logging setup.
//!
//! A single `flexi_logger` instance is started once from `main`/test-harness
//! code; per Design Note §9 ("no file-scope singletons"), this module only
//! exposes the `start`/`stop`-shaped entry point, it does not install a
//! global on first use.

use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, Naming, opt_format};

/// Starts the process-wide logger, reading the level from `RUST_LOG`/`LOG`
/// (falling back to `info`), rotating at 10MB and keeping one prior file.
pub fn setup_logging() {
    Logger::try_with_env_or_str("info")
        .unwrap()
        .log_to_file(FileSpec::default().directory("/var/log/alphazero-core/"))
        .format(opt_format)
        .rotate(
            Criterion::Size(10 * 1024 * 1024),
            Naming::Numbers,
            Cleanup::KeepLogFiles(1),
        )
        .start()
        .unwrap();
}

/// Variant used by short-lived binaries (self-play workers, test harnesses)
/// that should log to stderr instead of a rotating file.
pub fn setup_logging_stderr() {
    Logger::try_with_env_or_str("info")
        .unwrap()
        .format(opt_format)
        .start()
        .unwrap();
}
