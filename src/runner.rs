/// One monitoring cycle: load and validate config, take the run lock,
/// refresh the checkout, run the monitor, report, rotate the log.
///
/// Every failure is written to the run log before `run` returns its exit
/// code. Only config, directory, lock and spawn failures are fatal before
/// the monitor runs; a failed refresh is downgraded to a warning.
use crate::config::{config_dir, default_log_path, ConfigError, ConfigFile, RunnerConfig};
use crate::lock::RunLock;
use crate::monitor::{self, MonitorResult};
use crate::run_log::{RunLog, ROTATE_THRESHOLD_BYTES};
use crate::source::{self, PullOutcome};
use std::path::{Path, PathBuf};

/// Exit code for failures that happen before the monitor reports its own.
pub const EXIT_FAILURE: i32 = 1;

/// Per-invocation options, resolved from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    /// Pass `--debug` to the monitor regardless of the config.
    pub force_debug: bool,
    pub rotate_threshold: u64,
}

impl RunOptions {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            force_debug: false,
            rotate_threshold: ROTATE_THRESHOLD_BYTES,
        }
    }
}

/// A config that could not be loaded, with the run log its failure
/// belongs in (the default one when the file itself is unreadable).
#[derive(Debug)]
pub struct LoadError {
    pub error: ConfigError,
    pub log: RunLog,
}

/// Load and validate the config. Nothing is written anywhere; callers
/// decide whether a failure goes to the run log or to stderr.
pub fn load_config(config_path: &Path) -> Result<(RunnerConfig, RunLog), LoadError> {
    let file = ConfigFile::read(config_path).map_err(|error| LoadError {
        error,
        log: RunLog::new(default_log_path(&config_dir(config_path))),
    })?;

    let log = RunLog::new(file.log_file());
    match file.resolve() {
        Ok(config) => Ok((config, log)),
        Err(error) => Err(LoadError { error, log }),
    }
}

/// Run one cycle and return the process exit code.
pub async fn run(options: &RunOptions) -> i32 {
    let (config, log) = match load_config(&options.config_path) {
        Ok(loaded) => loaded,
        Err(LoadError { error, log }) => {
            log.error(&error.to_string());
            return EXIT_FAILURE;
        }
    };

    log.info(&format!(
        "Starting traffic monitor for {} ({}) on {}",
        config.server_name, config.server_ip, config.interface
    ));

    let lock = match RunLock::acquire(&config.lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            log.error(&e.to_string());
            return EXIT_FAILURE;
        }
    };

    refresh_source(&config, &log).await;

    let exit_code = match monitor::run_monitor(&config, &log, options.force_debug).await {
        Ok(result) => {
            report(&log, &result);
            result.exit_code
        }
        Err(e) => {
            log.error(&e.to_string());
            EXIT_FAILURE
        }
    };

    // Rotate while still holding the lock so no overlapping run writes
    // into the file mid-rename.
    match log.rotate_if_needed(options.rotate_threshold) {
        Ok(Some(backup)) => log.info(&format!("Log rotated to {}", backup.display())),
        Ok(None) => {}
        Err(e) => log.warn(&format!("Log rotation failed: {e}")),
    }

    drop(lock);
    exit_code
}

async fn refresh_source(config: &RunnerConfig, log: &RunLog) {
    log.info(&format!(
        "Updating source from {}/{}",
        config.source.remote, config.source.branch
    ));
    match source::pull(&config.source, &config.working_dir).await {
        Ok(PullOutcome::UpToDate) => log.info("Source already up to date"),
        Ok(PullOutcome::Updated) => log.info("Source updated to latest revision"),
        Err(e) => {
            log.warn(&format!(
                "Source update failed, continuing with current checkout: {e}"
            ));
            if let Some(output) = e.output() {
                log.append_raw(output);
            }
        }
    }
}

fn report(log: &RunLog, result: &MonitorResult) {
    tracing::debug!(pid = result.pid, exit_code = result.exit_code, "monitor finished");
    if result.success() {
        log.info(&format!(
            "Traffic monitor completed successfully in {}s",
            result.duration.as_secs()
        ));
    } else if let Some(signal) = result.signal {
        log.error(&format!(
            "Traffic monitor killed by signal {signal} (exit code {})",
            result.exit_code
        ));
    } else {
        log.error(&format!(
            "Traffic monitor failed with exit code {}",
            result.exit_code
        ));
    }
}
