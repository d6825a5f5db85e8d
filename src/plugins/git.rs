use crate::core::error::FngError;
use crate::core::snapshot::{VersionControl, VersionReceipt};
use std::path::{Path, PathBuf};
use tracing::debug;

pub fn run_git(repo_root: &Path, args: &[&str]) -> Result<String, FngError> {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()
        .map_err(|e| FngError::VersionControl(format!("git failed: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        return Err(FngError::VersionControl(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            detail.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Commits the working tree (snapshot included) with the change summary.
pub struct GitVersionControl {
    repo_root: PathBuf,
    push: bool,
}

impl GitVersionControl {
    pub fn new(repo_root: impl Into<PathBuf>, push: bool) -> Self {
        Self {
            repo_root: repo_root.into(),
            push,
        }
    }
}

impl VersionControl for GitVersionControl {
    fn name(&self) -> &str {
        "git"
    }

    fn record(&self, snapshot: &Path, summary: &str) -> Result<VersionReceipt, FngError> {
        if !self.repo_root.join(".git").exists() {
            return Ok(VersionReceipt::Skipped {
                reason: format!("no git repository at {}", self.repo_root.display()),
            });
        }

        run_git(&self.repo_root, &["add", "-A"])?;
        let snapshot_name = snapshot
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let message = format!("{}\n\nSnapshot: {}", summary, snapshot_name);
        run_git(&self.repo_root, &["commit", "-m", &message])?;
        debug!(repo = %self.repo_root.display(), "committed snapshot");

        if self.push {
            run_git(&self.repo_root, &["push"])?;
        }
        Ok(VersionReceipt::Committed { pushed: self.push })
    }
}
