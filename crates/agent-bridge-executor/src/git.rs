//! Read-only git queries for an agent's working directory.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use agent_bridge_core::WorktreeProbe;

const FIELD: char = '\x1f';
const RECORD: char = '\x1e';
const LOG_FORMAT: &str = "--format=%H%x1f%h%x1f%P%x1f%s%x1f%an%x1f%ar%x1f%D%x1e";

#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to run git: {0}")]
    Io(#[from] std::io::Error),
    #[error("git {command} failed: {stderr}")]
    Failed { command: String, stderr: String },
}

/// One changed path from `git status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: String,
    /// One of `U` (untracked), `A`, `M`, `D`, `R`, `C` (conflict).
    pub status: char,
}

/// One commit from `git log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub hash: String,
    pub short_hash: String,
    pub parents: Vec<String>,
    pub subject: String,
    pub author: String,
    pub relative_time: String,
    pub refs: Vec<String>,
}

/// Git queries through the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(GitError::Failed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Current branch, `None` when detached.
    ///
    /// # Errors
    /// Returns error if `cwd` is not in a repository.
    pub async fn branch(&self, cwd: &Path) -> Result<Option<String>, GitError> {
        let name = self.run(cwd, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let name = name.trim();
        Ok((!name.is_empty() && name != "HEAD").then(|| name.to_string()))
    }

    /// Commits `(ahead, behind)` the upstream branch, if one is configured.
    ///
    /// # Errors
    /// Returns error if the repository has no upstream or git fails.
    pub async fn ahead_behind(&self, cwd: &Path) -> Result<(u32, u32), GitError> {
        let counts = self
            .run(cwd, &["rev-list", "--left-right", "--count", "HEAD...@{upstream}"])
            .await?;
        Ok(parse_counts(&counts).unwrap_or((0, 0)))
    }

    /// Changed paths in the working tree.
    ///
    /// # Errors
    /// Returns error if git fails.
    pub async fn status(&self, cwd: &Path) -> Result<Vec<FileStatus>, GitError> {
        let out = self.run(cwd, &["status", "--porcelain=v1", "-z"]).await?;
        Ok(parse_status(&out))
    }

    /// Unified diff of the working tree, optionally for one path.
    ///
    /// # Errors
    /// Returns error if git fails.
    pub async fn diff(&self, cwd: &Path, path: Option<&str>) -> Result<String, GitError> {
        let mut args = vec!["diff", "--no-color"];
        if let Some(path) = path {
            args.extend(["--", path]);
        }
        self.run(cwd, &args).await
    }

    /// The most recent `limit` commits.
    ///
    /// # Errors
    /// Returns error if git fails.
    pub async fn log(&self, cwd: &Path, limit: usize) -> Result<Vec<CommitInfo>, GitError> {
        let count = format!("-n{limit}");
        let out = self.run(cwd, &["log", &count, LOG_FORMAT]).await?;
        Ok(parse_log(&out))
    }
}

#[async_trait]
impl WorktreeProbe for GitCli {
    async fn current_branch(&self, cwd: &Path) -> Option<String> {
        match self.branch(cwd).await {
            Ok(branch) => branch,
            Err(e) => {
                tracing::debug!(cwd = %cwd.display(), "No branch: {e}");
                None
            }
        }
    }
}

fn parse_counts(counts: &str) -> Option<(u32, u32)> {
    let mut parts = counts.split_whitespace();
    let ahead = parts.next()?.parse().ok()?;
    let behind = parts.next()?.parse().ok()?;
    Some((ahead, behind))
}

/// Map a two-letter porcelain code to a single status letter.
///
/// The worktree column wins when set, otherwise the index column.
#[must_use]
pub fn classify(code: &str) -> char {
    match code {
        "??" => return 'U',
        "UU" | "AA" | "DD" | "AU" | "UA" | "DU" | "UD" => return 'C',
        _ => {}
    }
    let mut chars = code.chars();
    let index = chars.next().unwrap_or(' ');
    let worktree = chars.next().unwrap_or(' ');
    let letter = if worktree == ' ' { index } else { worktree };
    match letter {
        'A' | 'C' => 'A',
        'D' => 'D',
        'R' => 'R',
        '?' => 'U',
        _ => 'M',
    }
}

/// Parse `git status --porcelain=v1 -z`. Renames and copies are followed
/// by their source path, which is skipped; the new path is kept.
#[must_use]
pub fn parse_status(out: &str) -> Vec<FileStatus> {
    let mut entries = out.split('\0').filter(|e| !e.is_empty());
    let mut files = Vec::new();
    while let Some(entry) = entries.next() {
        let (Some(code), Some(path)) = (entry.get(..2), entry.get(3..)) else {
            continue;
        };
        if code.starts_with(['R', 'C']) {
            entries.next();
        }
        files.push(FileStatus {
            path: path.to_string(),
            status: classify(code),
        });
    }
    files
}

fn parse_log(out: &str) -> Vec<CommitInfo> {
    out.split(RECORD)
        .map(|record| record.trim_start_matches('\n'))
        .filter(|record| !record.is_empty())
        .filter_map(|record| {
            let fields: Vec<&str> = record.split(FIELD).collect();
            let [hash, short, parents, subject, author, when, refs] = fields.as_slice() else {
                return None;
            };
            Some(CommitInfo {
                hash: (*hash).to_string(),
                short_hash: (*short).to_string(),
                parents: parents.split_whitespace().map(str::to_string).collect(),
                subject: (*subject).to_string(),
                author: (*author).to_string(),
                relative_time: (*when).to_string(),
                refs: refs
                    .split(", ")
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })
        .collect()
}
