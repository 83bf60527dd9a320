use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// File name of the settings file, looked up beside the runner executable.
pub const CONFIG_FILE_NAME: &str = "config.sh";
/// Template operators copy to create `config.sh`.
pub const CONFIG_TEMPLATE_NAME: &str = "config.sh.example";
/// Default run log name, placed beside the config file.
pub const DEFAULT_LOG_FILE_NAME: &str = "traffic_monitor.log";
/// Default lock file name, placed beside the config file.
pub const DEFAULT_LOCK_FILE_NAME: &str = ".traffic-runner.lock";

/// Required settings, in validation order, with the placeholder each one
/// carries in the template. A setting equal to its placeholder, empty, or
/// absent is unconfigured.
pub const REQUIRED_SETTINGS: &[(&str, &str)] = &[
    ("SERVER_NAME", "your-server-name"),
    ("SERVER_IP", "your-server-ip"),
    ("INTERFACE", "your-interface"),
    ("APPS_SCRIPT_URL", "your-apps-script-url"),
    ("SCRIPT_DIR", "/path/to/your/script"),
];

static ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)=(.*)$").unwrap()
});

/// Fully resolved settings for one monitoring cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerConfig {
    pub server_name: String,
    pub server_ip: String,
    pub interface: String,
    pub apps_script_url: String,
    pub working_dir: PathBuf,
    pub log_file: PathBuf,
    pub lock_file: PathBuf,
    pub monitor: MonitorConfig,
    pub source: SourceConfig,
}

/// How the external monitor is launched.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorConfig {
    pub command: String,
    /// Script passed as the first argument; relative paths resolve against the working dir.
    pub script: PathBuf,
    pub history_file: Option<PathBuf>,
    pub debug: bool,
}

/// Remote and branch pulled before each run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceConfig {
    pub remote: String,
    pub branch: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            script: PathBuf::from("traffic_monitor.py"),
            history_file: None,
            debug: false,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            branch: "main".to_string(),
        }
    }
}

/// Errors raised while loading or validating the config file.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file does not exist.
    NotFound { path: PathBuf, template: PathBuf },
    /// The config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A required setting is absent, empty, or still the template placeholder.
    Unconfigured { key: &'static str },
    /// A setting uses command substitution, which is never evaluated.
    Unsupported { key: &'static str },
    /// `SCRIPT_DIR` does not point at an existing directory.
    MissingWorkingDir { path: PathBuf },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound { path, template } => write!(
                f,
                "config file not found: {}. Create it from the template: cp {} {}",
                path.display(),
                template.display(),
                path.display()
            ),
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config file {}: {}", path.display(), source)
            }
            ConfigError::Unconfigured { key } => {
                write!(f, "{key} is not configured. Set it in {CONFIG_FILE_NAME}")
            }
            ConfigError::Unsupported { key } => write!(
                f,
                "{key} uses command substitution, which is not supported. Set a literal value in {CONFIG_FILE_NAME}"
            ),
            ConfigError::MissingWorkingDir { path } => {
                write!(f, "working directory does not exist: {}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Path of `config.sh` beside the running executable, falling back to the
/// current directory when the executable path is unknown.
pub fn default_config_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILE_NAME)
}

/// Right-hand side of one assignment after quote removal and expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Assigned {
    Value(String),
    /// `$(...)` or backticks; the shell would run a command here.
    CommandSubstitution,
}

/// Raw assignments read from a config file, before validation.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    dir: PathBuf,
    vars: HashMap<String, Assigned>,
}

impl ConfigFile {
    /// Read and parse the config file at `path`.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let dir = config_dir(path);
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound {
                    path: path.to_path_buf(),
                    template: dir.join(CONFIG_TEMPLATE_NAME),
                });
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        Ok(Self::parse(dir, &contents))
    }

    /// Parse config text; `dir` anchors relative paths.
    pub fn parse(dir: impl Into<PathBuf>, contents: &str) -> Self {
        Self {
            dir: dir.into(),
            vars: parse_assignments(contents),
        }
    }

    /// Look up a raw setting. Settings that use command substitution read
    /// as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self.vars.get(key) {
            Some(Assigned::Value(v)) => Some(v),
            _ => None,
        }
    }

    /// Run log path. Available even when validation fails so that the
    /// failure itself can be logged.
    pub fn log_file(&self) -> PathBuf {
        match self.get("LOG_FILE").filter(|v| !v.is_empty()) {
            Some(p) => self.dir.join(p),
            None => default_log_path(&self.dir),
        }
    }

    /// Validate required settings and build the resolved config.
    ///
    /// Settings are checked in template order and the first
    /// unconfigured one is reported. Any setting that relies on command
    /// substitution is rejected. The working directory's existence is
    /// checked last.
    pub fn resolve(&self) -> Result<RunnerConfig, ConfigError> {
        let server_name = self.required("SERVER_NAME")?;
        let server_ip = self.required("SERVER_IP")?;
        let interface = self.required("INTERFACE")?;
        let apps_script_url = self.required("APPS_SCRIPT_URL")?;
        let script_dir = self.required("SCRIPT_DIR")?;

        let log_file = self.optional("LOG_FILE")?;
        let lock_file = self.optional("LOCK_FILE")?;
        let monitor_command = self.optional("MONITOR_COMMAND")?;
        let monitor_script = self.optional("MONITOR_SCRIPT")?;
        let history_file = self.optional("HISTORY_FILE")?;
        let debug = self.optional("DEBUG")?;
        let git_remote = self.optional("GIT_REMOTE")?;
        let git_branch = self.optional("GIT_BRANCH")?;

        let working_dir = self.dir.join(script_dir);
        if !working_dir.is_dir() {
            return Err(ConfigError::MissingWorkingDir { path: working_dir });
        }

        let defaults = MonitorConfig::default();
        let monitor = MonitorConfig {
            command: monitor_command.unwrap_or(defaults.command),
            script: monitor_script.map(PathBuf::from).unwrap_or(defaults.script),
            history_file: history_file.map(PathBuf::from),
            debug: debug.as_deref().is_some_and(is_truthy),
        };

        let defaults = SourceConfig::default();
        let source = SourceConfig {
            remote: git_remote.unwrap_or(defaults.remote),
            branch: git_branch.unwrap_or(defaults.branch),
        };

        Ok(RunnerConfig {
            server_name,
            server_ip,
            interface,
            apps_script_url,
            working_dir,
            log_file: log_file
                .map(|p| self.dir.join(p))
                .unwrap_or_else(|| default_log_path(&self.dir)),
            lock_file: self
                .dir
                .join(lock_file.as_deref().unwrap_or(DEFAULT_LOCK_FILE_NAME)),
            monitor,
            source,
        })
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        let placeholder = REQUIRED_SETTINGS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, p)| *p);
        match self.optional(key)? {
            Some(v) if Some(v.as_str()) != placeholder => Ok(v),
            _ => Err(ConfigError::Unconfigured { key }),
        }
    }

    /// A non-empty setting, or `None` when absent or empty.
    fn optional(&self, key: &'static str) -> Result<Option<String>, ConfigError> {
        match self.vars.get(key) {
            Some(Assigned::CommandSubstitution) => Err(ConfigError::Unsupported { key }),
            Some(Assigned::Value(v)) if !v.is_empty() => Ok(Some(v.clone())),
            _ => Ok(None),
        }
    }
}

/// Default run log location for a config directory.
pub fn default_log_path(config_dir: &Path) -> PathBuf {
    config_dir.join(DEFAULT_LOG_FILE_NAME)
}

/// Directory containing the config file; `.` for a bare file name.
pub fn config_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Parse shell `KEY=value` assignments. Later assignments win. Lines that
/// are not assignments are skipped.
fn parse_assignments(contents: &str) -> HashMap<String, Assigned> {
    let mut vars = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(caps) = ASSIGNMENT.captures(line) else {
            tracing::debug!(line = trimmed, "ignoring non-assignment line in config");
            continue;
        };
        let value = match parse_value(&caps[2], &vars) {
            Some(v) => Assigned::Value(v),
            None => Assigned::CommandSubstitution,
        };
        vars.insert(caps[1].to_string(), value);
    }
    vars
}

/// Evaluate the right-hand side of an assignment as a single shell word:
/// quotes are removed, a leading `~` becomes `$HOME`, `$NAME`/`${NAME}`
/// expand outside single quotes, and the word ends at the first unquoted
/// whitespace (dropping trailing comments).
///
/// Returns `None` when the word needs command substitution, either directly
/// or through a variable that did.
fn parse_value(raw: &str, vars: &HashMap<String, Assigned>) -> Option<String> {
    let mut out = String::new();
    let mut chars = raw.chars().peekable();

    if chars.peek() == Some(&'~') {
        let rest = &raw[1..];
        if rest.is_empty() || rest.starts_with('/') || rest.starts_with(char::is_whitespace) {
            if let Ok(home) = std::env::var("HOME") {
                chars.next();
                out.push_str(&home);
            }
        }
    }

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    out.push(c);
                }
            }
            '"' => {
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => match chars.peek() {
                            Some(&next @ ('"' | '\\' | '$' | '`')) => {
                                out.push(next);
                                chars.next();
                            }
                            _ => out.push('\\'),
                        },
                        '$' => expand_variable(&mut chars, vars, &mut out)?,
                        '`' => return None,
                        _ => out.push(c),
                    }
                }
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '$' => expand_variable(&mut chars, vars, &mut out)?,
            '`' => return None,
            c if c.is_whitespace() => break,
            _ => out.push(c),
        }
    }
    Some(out)
}

/// Expand the variable after a `$`. Returns `None` for `$(`.
fn expand_variable(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    vars: &HashMap<String, Assigned>,
    out: &mut String,
) -> Option<()> {
    let mut name = String::new();
    match chars.peek() {
        Some('(') => return None,
        Some('{') => {
            chars.next();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
        }
        Some(&c) if c == '_' || c.is_ascii_alphabetic() => {
            while let Some(&c) = chars.peek() {
                if c == '_' || c.is_ascii_alphanumeric() {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
        }
        _ => {
            out.push('$');
            return Some(());
        }
    }
    match vars.get(&name) {
        Some(Assigned::Value(v)) => out.push_str(v),
        Some(Assigned::CommandSubstitution) => return None,
        None => {
            if let Ok(v) = std::env::var(&name) {
                out.push_str(&v);
            }
        }
    }
    Some(())
}
