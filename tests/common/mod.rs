//! Git fixtures shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// Run git, returning trimmed stdout on success.
pub fn git(dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).current_dir(dir).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// A bare "origin" plus any number of clones of it.
pub struct Remote {
    pub temp: TempDir,
    pub bare: PathBuf,
}

impl Remote {
    /// `None` when git is not available.
    pub fn new() -> Option<Self> {
        let temp = TempDir::new().ok()?;
        let bare = temp.path().join("origin.git");
        std::fs::create_dir_all(&bare).ok()?;
        git(&bare, &["init", "--bare", "-b", "main"])?;
        Some(Self { temp, bare })
    }

    /// Clone the remote into `name` with a committer identity configured.
    pub fn clone_as(&self, name: &str) -> Option<PathBuf> {
        let path = self.temp.path().join(name);
        git(
            self.temp.path(),
            &["clone", "--quiet", self.bare.to_str()?, path.to_str()?],
        )?;
        git(&path, &["config", "user.email", "agent@example.com"])?;
        git(&path, &["config", "user.name", "Agent"])?;
        Some(path)
    }

    /// Clone `name`, commit a README on main and push it.
    pub fn seeded_clone(&self, name: &str) -> Option<PathBuf> {
        let path = self.clone_as(name)?;
        git(&path, &["checkout", "-q", "-B", "main"])?;
        std::fs::write(path.join("README.md"), "# app\n").ok()?;
        git(&path, &["add", "."])?;
        git(&path, &["commit", "-q", "-m", "Initial commit"])?;
        git(&path, &["push", "-q", "-u", "origin", "main"])?;
        Some(path)
    }

    /// Read a file from `main` on the remote.
    pub fn show_main(&self, file: &str) -> Option<String> {
        git(&self.bare, &["show", &format!("main:{}", file)])
    }
}
