/// Source refresh: pull the configured branch into the working directory
/// before each run. Callers treat any error as a warning and carry on with
/// the revision already checked out.
use crate::config::SourceConfig;
use std::path::Path;
use tokio::process::Command;

/// What a successful pull did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// Nothing new on the remote.
    UpToDate,
    /// New commits were applied.
    Updated,
}

/// Errors from `git pull`.
#[derive(Debug)]
pub enum RefreshError {
    /// `git` could not be started.
    Spawn { source: std::io::Error },
    /// `git pull` exited non-zero; `output` holds its combined stdout/stderr.
    Failed { exit_code: Option<i32>, output: String },
}

impl RefreshError {
    /// Captured git output, for appending to the run log.
    pub fn output(&self) -> Option<&str> {
        match self {
            RefreshError::Failed { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }
}

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshError::Spawn { source } => write!(f, "failed to run git: {}", source),
            RefreshError::Failed {
                exit_code: Some(code),
                ..
            } => write!(f, "git pull exited with code {code}"),
            RefreshError::Failed {
                exit_code: None, ..
            } => write!(f, "git pull was terminated by a signal"),
        }
    }
}

impl std::error::Error for RefreshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RefreshError::Spawn { source } => Some(source),
            RefreshError::Failed { .. } => None,
        }
    }
}

/// Run `git pull <remote> <branch>` in `working_dir`. Never retried.
pub async fn pull(source: &SourceConfig, working_dir: &Path) -> Result<PullOutcome, RefreshError> {
    tracing::debug!(
        remote = %source.remote,
        branch = %source.branch,
        dir = %working_dir.display(),
        "pulling latest source"
    );

    let output = Command::new("git")
        .args(["pull", &source.remote, &source.branch])
        .current_dir(working_dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("LC_ALL", "C")
        .output()
        .await
        .map_err(|e| RefreshError::Spawn { source: e })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(RefreshError::Failed {
            exit_code: output.status.code(),
            output: combined.trim_end().to_string(),
        });
    }

    Ok(classify_pull_output(&combined))
}

/// Decide from `git pull` output whether anything changed. Older git
/// versions spell it "up-to-date".
pub fn classify_pull_output(output: &str) -> PullOutcome {
    if output.contains("Already up to date") || output.contains("Already up-to-date") {
        PullOutcome::UpToDate
    } else {
        PullOutcome::Updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .args([
                "-c",
                "user.name=Test",
                "-c",
                "user.email=test@example.com",
                "-c",
                "init.defaultBranch=main",
            ])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            status.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&status.stderr)
        );
    }

    /// Build `origin.git` plus two clones of it; returns (tempdir, checkout, other).
    fn setup_remote() -> (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let seed = dir.path().join("seed");
        std::fs::create_dir(&seed).unwrap();
        git(&seed, &["init", "-q"]);
        git(&seed, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        std::fs::write(seed.join("traffic_monitor.py"), "print('v1')\n").unwrap();
        git(&seed, &["add", "."]);
        git(&seed, &["commit", "-q", "-m", "v1"]);
        git(dir.path(), &["clone", "-q", "--bare", "seed", "origin.git"]);
        git(dir.path(), &["clone", "-q", "origin.git", "checkout"]);
        git(dir.path(), &["clone", "-q", "origin.git", "other"]);
        let checkout = dir.path().join("checkout");
        let other = dir.path().join("other");
        (dir, checkout, other)
    }

    #[test]
    fn test_classify_pull_output() {
        assert_eq!(classify_pull_output("Already up to date.\n"), PullOutcome::UpToDate);
        assert_eq!(classify_pull_output("Already up-to-date.\n"), PullOutcome::UpToDate);
        assert_eq!(
            classify_pull_output("Updating 1a2b3c..4d5e6f\nFast-forward\n a | 1 +\n"),
            PullOutcome::Updated
        );
    }

    #[tokio::test]
    async fn test_pull_up_to_date_twice() {
        let (_dir, checkout, _other) = setup_remote();
        let source = SourceConfig::default();
        assert_eq!(pull(&source, &checkout).await.unwrap(), PullOutcome::UpToDate);
        assert_eq!(pull(&source, &checkout).await.unwrap(), PullOutcome::UpToDate);
    }

    #[tokio::test]
    async fn test_pull_applies_new_commits() {
        let (_dir, checkout, other) = setup_remote();
        std::fs::write(other.join("traffic_monitor.py"), "print('v2')\n").unwrap();
        git(&other, &["commit", "-q", "-am", "v2"]);
        git(&other, &["push", "-q", "origin", "main"]);

        let outcome = pull(&SourceConfig::default(), &checkout).await.unwrap();
        assert_eq!(outcome, PullOutcome::Updated);
        let contents = std::fs::read_to_string(checkout.join("traffic_monitor.py")).unwrap();
        assert_eq!(contents, "print('v2')\n");
    }

    #[tokio::test]
    async fn test_pull_outside_repository_fails_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let err = pull(&SourceConfig::default(), dir.path()).await.unwrap_err();
        assert!(matches!(err, RefreshError::Failed { .. }));
        assert!(err.output().is_some_and(|o| o.contains("not a git repository")));
    }

    #[tokio::test]
    async fn test_pull_unknown_remote_fails() {
        let (_dir, checkout, _other) = setup_remote();
        let source = SourceConfig {
            remote: "nowhere".to_string(),
            branch: "main".to_string(),
        };
        let err = pull(&source, &checkout).await.unwrap_err();
        assert!(err.to_string().contains("git pull exited with code"));
    }
}
