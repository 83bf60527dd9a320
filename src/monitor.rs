/// Monitor invocation: spawn the external traffic monitor in the working
/// directory, append its stdout+stderr to the run log, and report how it
/// exited.
use crate::config::RunnerConfig;
use crate::run_log::RunLog;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// Result of a completed monitor run.
#[derive(Debug)]
pub struct MonitorResult {
    /// Exit code as a shell would report it: the process's own code, or
    /// `128 + signal` when it was killed.
    pub exit_code: i32,
    /// Signal that terminated the process, if any.
    pub signal: Option<i32>,
    /// Wall-clock duration of the run.
    pub duration: std::time::Duration,
    /// Child PID (for logging/diagnostics).
    pub pid: u32,
}

impl MonitorResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors that prevent the monitor from running to completion.
#[derive(Debug)]
pub enum MonitorError {
    /// The run log could not be opened as the output sink.
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to spawn the monitor process.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Failed while waiting for the monitor to exit.
    Wait { source: std::io::Error },
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::LogFile { path, source } => {
                write!(f, "failed to open run log {}: {}", path.display(), source)
            }
            MonitorError::Spawn { command, source } => {
                write!(f, "failed to start monitor `{}`: {}", command, source)
            }
            MonitorError::Wait { source } => {
                write!(f, "failed waiting for monitor to exit: {}", source)
            }
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::LogFile { source, .. } => Some(source),
            MonitorError::Spawn { source, .. } => Some(source),
            MonitorError::Wait { source } => Some(source),
        }
    }
}

/// Arguments passed to the monitor command: the script followed by the
/// named flags it expects.
pub fn build_args(config: &RunnerConfig, force_debug: bool) -> Vec<String> {
    let mut args = vec![
        config.monitor.script.display().to_string(),
        "--server-name".to_string(),
        config.server_name.clone(),
        "--server-ip".to_string(),
        config.server_ip.clone(),
        "--interface".to_string(),
        config.interface.clone(),
        "--apps-script-url".to_string(),
        config.apps_script_url.clone(),
    ];
    if let Some(history) = &config.monitor.history_file {
        args.push("--history-file".to_string());
        args.push(history.display().to_string());
    }
    if config.monitor.debug || force_debug {
        args.push("--debug".to_string());
    }
    args
}

/// Run the monitor to completion. No timeout: the scheduler owns cancellation.
pub async fn run_monitor(
    config: &RunnerConfig,
    log: &RunLog,
    force_debug: bool,
) -> Result<MonitorResult, MonitorError> {
    let open_log = || {
        log.open_append().map_err(|e| MonitorError::LogFile {
            path: log.path().to_path_buf(),
            source: e,
        })
    };
    let stdout_log = open_log()?;
    let stderr_log = open_log()?;

    let args = build_args(config, force_debug);
    tracing::info!(
        command = %config.monitor.command,
        args = ?args,
        dir = %config.working_dir.display(),
        "spawning traffic monitor"
    );

    let start = Instant::now();

    let mut child = Command::new(&config.monitor.command)
        .args(&args)
        .current_dir(&config.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_log))
        .stderr(Stdio::from(stderr_log))
        .spawn()
        .map_err(|e| MonitorError::Spawn {
            command: config.monitor.command.clone(),
            source: e,
        })?;

    let pid = child.id().unwrap_or(0);
    tracing::debug!(pid, "traffic monitor started");

    let status = child
        .wait()
        .await
        .map_err(|e| MonitorError::Wait { source: e })?;

    let duration = start.elapsed();
    let signal = status.signal();
    let exit_code = match (status.code(), signal) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    };

    tracing::info!(
        exit_code,
        signal = ?signal,
        duration_secs = duration.as_secs(),
        "traffic monitor exited"
    );

    Ok(MonitorResult {
        exit_code,
        signal,
        duration,
        pid,
    })
}
