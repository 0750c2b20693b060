//! Git plumbing for the merge lock, the finish workflow and worktree listing.
//!
//! Every operation shells out to the `git` CLI; nothing here reimplements
//! git behaviour. The remote's refusal to create a ref that already exists
//! is what [`GitRefStore`] exposes as the lock's compare-and-swap.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::coordination::lock::{LOCK_FILE, RefContent, RefStore};
use crate::error::{Error, Result};

/// Minimum git version required for worktree support.
const MIN_GIT_VERSION: (u32, u32) = (2, 5);

/// Runs git commands against one repository.
#[derive(Debug, Clone)]
pub struct Git {
    repo_path: PathBuf,
}

impl Git {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    /// Repository this runner operates on.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Run git and return the raw output, whatever the exit status.
    pub async fn output(&self, args: &[&str]) -> Result<Output> {
        self.output_in(&self.repo_path, args).await
    }

    /// Run git in another directory (e.g. a worktree).
    pub async fn output_in(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        Ok(Command::new("git").args(args).current_dir(dir).output().await?)
    }

    /// Run git and return trimmed stdout, failing on a non-zero exit.
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        checked(args, output)
    }

    /// Run git with `input` on stdin and return trimmed stdout.
    pub async fn run_with_input(&self, args: &[&str], input: &[u8]) -> Result<String> {
        let mut child = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
            // Dropping stdin closes the pipe so git sees EOF.
        }

        let output = child.wait_with_output().await?;
        checked(args, output)
    }

    /// Check if git is available and meets minimum version.
    pub async fn check_version() -> Result<(u32, u32, u32)> {
        let output = Command::new("git").args(["--version"]).output().await?;

        if !output.status.success() {
            return Err(Error::Git {
                command: "version check".to_string(),
                stderr: "git not found".to_string(),
            });
        }

        let version_str = String::from_utf8_lossy(&output.stdout);
        let (major, minor, patch) = parse_version(&version_str).ok_or_else(|| Error::Git {
            command: "version parse".to_string(),
            stderr: format!("Could not parse version: {}", version_str.trim()),
        })?;

        if (major, minor) < MIN_GIT_VERSION {
            return Err(Error::Git {
                command: "version check".to_string(),
                stderr: format!(
                    "Git version {}.{}.{} is too old. Minimum required: {}.{}",
                    major, minor, patch, MIN_GIT_VERSION.0, MIN_GIT_VERSION.1
                ),
            });
        }

        Ok((major, minor, patch))
    }

    /// Get the root of the working tree containing `path`.
    pub async fn repo_root(path: &Path) -> Result<PathBuf> {
        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(path)
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::NotGitRepo {
                path: path.to_path_buf(),
            });
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(PathBuf::from(root))
    }

    /// Get the main repository root, even when `path` is inside a linked worktree.
    pub async fn main_repo_root(path: &Path) -> Result<PathBuf> {
        let toplevel = Self::repo_root(path).await?;
        let output = Command::new("git")
            .args(["rev-parse", "--git-common-dir"])
            .current_dir(&toplevel)
            .output()
            .await?;

        if !output.status.success() {
            return Ok(toplevel);
        }

        let common = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        let common = if common.is_absolute() { common } else { toplevel.join(common) };
        let common = common.canonicalize().unwrap_or(common);

        match common.file_name().and_then(|n| n.to_str()) {
            Some(".git") => Ok(common.parent().map(Path::to_path_buf).unwrap_or(toplevel)),
            _ => Ok(toplevel),
        }
    }

    /// Check if a local branch exists.
    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{}", branch);
        let output = self.output(&["show-ref", "--verify", "--quiet", &reference]).await?;
        Ok(output.status.success())
    }

    /// Check out `branch` in the main repository.
    pub async fn checkout(&self, branch: &str) -> Result<()> {
        self.run(&["checkout", branch]).await.map(|_| ())
    }

    /// Fast-forward `branch` from `remote`.
    pub async fn pull_ff_only(&self, remote: &str, branch: &str) -> Result<()> {
        self.run(&["pull", remote, branch, "--ff-only"]).await.map(|_| ())
    }

    /// Merge `branch` into the current branch.
    pub async fn merge(&self, branch: &str) -> Result<()> {
        self.run(&["merge", branch, "--no-edit"]).await.map(|_| ())
    }

    /// Push `branch` to `remote`.
    pub async fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.run(&["push", remote, branch]).await.map(|_| ())
    }

    /// Detach HEAD in a worktree so its branch can be deleted.
    pub async fn detach_head(&self, worktree: &Path) -> Result<()> {
        let args = ["checkout", "--detach"];
        let output = self.output_in(worktree, &args).await?;
        checked(&args, output).map(|_| ())
    }

    /// Remove a worktree, forcing removal when a plain remove fails.
    pub async fn remove_worktree(&self, worktree: &Path) -> Result<()> {
        let path = worktree.to_string_lossy();
        let output = self.output(&["worktree", "remove", &path]).await?;
        if output.status.success() {
            return Ok(());
        }

        // Try force remove if normal remove fails
        self.run(&["worktree", "remove", "--force", &path]).await.map(|_| ())
    }

    /// Create a worktree at `path` on `branch`, creating the branch when missing.
    pub async fn add_worktree(&self, path: &Path, branch: &str) -> Result<()> {
        let target = path.to_string_lossy();
        if self.branch_exists(branch).await? {
            self.run(&["worktree", "add", &target, branch]).await.map(|_| ())
        } else {
            self.run(&["worktree", "add", &target, "-b", branch]).await.map(|_| ())
        }
    }

    /// Remove a worktree and discard its changes. When git refuses, delete
    /// the directory and prune the stale entry.
    pub async fn discard_worktree(&self, worktree: &Path) -> Result<()> {
        let path = worktree.to_string_lossy();
        let output = self.output(&["worktree", "remove", "--force", &path]).await?;
        if output.status.success() {
            return Ok(());
        }

        log::warn!(
            "git worktree remove failed for {}: {}",
            worktree.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        tokio::fs::remove_dir_all(worktree).await?;
        self.run(&["worktree", "prune"]).await.map(|_| ())
    }

    /// Delete a merged branch, falling back to a force delete.
    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        let output = self.output(&["branch", "-d", branch]).await?;
        if output.status.success() {
            return Ok(());
        }

        log::debug!("git branch -d {} failed, retrying with -D", branch);
        self.run(&["branch", "-D", branch]).await.map(|_| ())
    }

    /// List worktrees known to the repository.
    pub async fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>> {
        let stdout = self.run(&["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&stdout))
    }
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    /// Path to the worktree.
    pub path: PathBuf,
    /// Checked-out commit.
    pub head: String,
    /// Full ref name, `None` when detached.
    pub branch: Option<String>,
    /// Whether this is the bare repository entry.
    pub is_bare: bool,
}

impl WorktreeEntry {
    /// Branch name without the `refs/heads/` prefix.
    pub fn short_branch(&self) -> &str {
        match &self.branch {
            Some(b) => b.strip_prefix("refs/heads/").unwrap_or(b),
            None => "(detached)",
        }
    }

    /// Abbreviated commit hash.
    pub fn short_head(&self) -> &str {
        &self.head[..self.head.len().min(7)]
    }
}

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                head: String::new(),
                branch: None,
                is_bare: false,
            });
            continue;
        }

        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = Some(branch.to_string());
        } else if line == "bare" {
            entry.is_bare = true;
        }
    }
    entries.extend(current);

    entries
}

fn parse_version(version_str: &str) -> Option<(u32, u32, u32)> {
    // Parse "git version 2.39.0" or similar
    let version = version_str.split_whitespace().nth(2)?;
    let parts: Vec<u32> = version.split('.').filter_map(|s| s.parse().ok()).collect();

    match parts.as_slice() {
        [major, minor, patch, ..] => Some((*major, *minor, *patch)),
        [major, minor] => Some((*major, *minor, 0)),
        [major] => Some((*major, 0, 0)),
        _ => None,
    }
}

fn checked(args: &[&str], output: Output) -> Result<String> {
    if !output.status.success() {
        return Err(Error::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Lock ref storage on a git remote.
///
/// Creation pushes a fresh commit to the ref without `--force`, so the
/// remote rejects it whenever the ref already exists.
#[derive(Debug, Clone)]
pub struct GitRefStore {
    git: Git,
    remote: String,
}

impl GitRefStore {
    /// Store backed by `origin` of the repository at `repo_path`.
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self::with_remote(repo_path, "origin")
    }

    pub fn with_remote(repo_path: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            git: Git::new(repo_path),
            remote: remote.into(),
        }
    }

    async fn read_fetched(&self) -> Result<Option<Vec<u8>>> {
        let tree = self.git.run(&["ls-tree", "FETCH_HEAD"]).await?;

        // "<mode> blob <sha>\t<name>"
        let blob = tree.lines().find_map(|line| {
            let (meta, name) = line.split_once('\t')?;
            if name != LOCK_FILE {
                return None;
            }
            meta.split_whitespace().nth(2).map(str::to_string)
        });
        let Some(blob) = blob else {
            return Ok(None);
        };

        let output = self.git.output(&["cat-file", "blob", &blob]).await?;
        Ok(output.status.success().then_some(output.stdout))
    }
}

#[async_trait]
impl RefStore for GitRefStore {
    async fn create_ref(&self, name: &str, content: &[u8], message: &str) -> Result<bool> {
        let blob = self.git.run_with_input(&["hash-object", "-w", "--stdin"], content).await?;
        let tree_input = format!("100644 blob {}\t{}\n", blob, LOCK_FILE);
        let tree = self.git.run_with_input(&["mktree"], tree_input.as_bytes()).await?;
        let commit = self.git.run(&["commit-tree", &tree, "-m", message]).await?;

        let refspec = format!("{}:{}", commit, name);
        let output = self.git.output(&["push", &self.remote, &refspec]).await?;
        if !output.status.success() {
            log::debug!(
                "push {} rejected: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.success())
    }

    async fn read_ref(&self, name: &str) -> Result<RefContent> {
        let output = self.git.output(&["fetch", &self.remote, name]).await?;
        if !output.status.success() {
            return Ok(RefContent::Absent);
        }

        match self.read_fetched().await {
            Ok(content) => Ok(RefContent::Present(content)),
            Err(e) => {
                log::warn!("Could not read lock ref contents: {}", e);
                Ok(RefContent::Present(None))
            }
        }
    }

    async fn delete_ref(&self, name: &str) -> Result<bool> {
        let output = self.git.output(&["push", &self.remote, "--delete", name]).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        // Local and file remotes accept deleting a missing ref with a warning.
        if reports_missing_ref(&stderr) {
            return Ok(false);
        }
        if output.status.success() {
            return Ok(true);
        }

        Err(Error::Git {
            command: format!("push {} --delete {}", self.remote, name),
            stderr: stderr.trim().to_string(),
        })
    }
}

/// Whether `push --delete` output (lowercased) says the ref was not there.
fn reports_missing_ref(stderr: &str) -> bool {
    ["remote ref does not exist", "unable to delete", "non-existent ref"]
        .iter()
        .any(|needle| stderr.contains(needle))
}
