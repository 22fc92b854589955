//! Git access for the planner
//!
//! Wraps the git CLI for the three operations planning needs: name-status
//! diffs between commits, worktree file reads, and branch-tip lookup.
//! Diffs ride the orchestrator's transient-retry schedule, so lock
//! contention or a flaky remote gets the same bounded backoff as any
//! other dependency.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::{retry_transient, OrchestratorError, OrchestratorResult};
use crate::model::{ChangeKind, FileChange};

/// A checked-out repository the planner can diff and read
pub struct GitWorkdir {
    root: PathBuf,
}

impl GitWorkdir {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run git once, returning stdout on success.
    ///
    /// Failures carry the first stderr line, which is what the
    /// retryability classification keys on.
    fn run_git(&self, args: &[&str]) -> OrchestratorResult<String> {
        let operation = args.first().copied().unwrap_or("git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|e| OrchestratorError::git(operation, format!("spawn failed: {e}")))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("git exited nonzero")
            .to_string();
        Err(OrchestratorError::git(operation, detail))
    }

    /// List files differing between two commits.
    ///
    /// Uses `--name-status -M -C` so renames and copies arrive as R/C rows
    /// rather than delete+add pairs. Transient git failures retry on the
    /// shared backoff schedule.
    pub async fn diff(&self, from: &str, to: &str) -> OrchestratorResult<Vec<FileChange>> {
        let range = format!("{from}..{to}");
        let output = retry_transient("git diff", || async {
            self.run_git(&["diff", "--name-status", "-M", "-C", &range])
        })
        .await?;

        let changes: Vec<FileChange> = output
            .lines()
            .filter_map(parse_name_status_line)
            .collect();

        debug!(from, to, files = changes.len(), "computed diff");
        Ok(changes)
    }

    /// Read a file's current worktree content
    pub fn read_file(&self, path: &str) -> OrchestratorResult<Vec<u8>> {
        let full = self.root.join(path);
        std::fs::read(&full).map_err(OrchestratorError::Io)
    }

    /// Resolve a branch to its tip commit
    pub fn last_commit(&self, branch: &str) -> OrchestratorResult<String> {
        self.run_git(&["rev-parse", branch])
    }
}

/// Parse one `git diff --name-status` row into a FileChange.
///
/// Rows are `<status>\t<path>` for A/M/D and `<status><score>\t<old>\t<new>`
/// for renames and copies. Unknown statuses (T, U, X) map to Modified so a
/// type change is still rescanned.
fn parse_name_status_line(line: &str) -> Option<FileChange> {
    let mut parts = line.split('\t');
    let status = parts.next()?.trim();
    if status.is_empty() {
        return None;
    }

    match status.chars().next()? {
        'A' => Some(FileChange::new(parts.next()?, ChangeKind::Added)),
        'M' => Some(FileChange::new(parts.next()?, ChangeKind::Modified)),
        'D' => Some(FileChange::new(parts.next()?, ChangeKind::Deleted)),
        'R' => {
            let old_path = parts.next()?.to_string();
            let new_path = parts.next()?;
            Some(FileChange::new(new_path, ChangeKind::Renamed { old_path }))
        }
        'C' => {
            let _source = parts.next()?;
            Some(FileChange::new(parts.next()?, ChangeKind::Copied))
        }
        _ => Some(FileChange::new(parts.next()?, ChangeKind::Modified)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn git(dir: &Path, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    }

    fn setup_repo() -> (tempfile::TempDir, GitWorkdir) {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-b", "main"]);
        git(dir.path(), &["config", "user.email", "test@test.com"]);
        git(dir.path(), &["config", "user.name", "Test"]);

        std::fs::write(dir.path().join("app.py"), "print('v1')\n").unwrap();
        std::fs::write(dir.path().join("util.py"), "x = 1\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "initial"]);

        let workdir = GitWorkdir::new(dir.path());
        (dir, workdir)
    }

    #[test]
    fn test_parse_name_status_rows() {
        assert_eq!(
            parse_name_status_line("M\tsrc/app.js"),
            Some(FileChange::new("src/app.js", ChangeKind::Modified))
        );
        assert_eq!(
            parse_name_status_line("A\tsrc/new.go"),
            Some(FileChange::new("src/new.go", ChangeKind::Added))
        );
        assert_eq!(
            parse_name_status_line("D\tsrc/gone.rb"),
            Some(FileChange::new("src/gone.rb", ChangeKind::Deleted))
        );
        assert_eq!(
            parse_name_status_line("R087\told.py\tnew.py"),
            Some(FileChange::new(
                "new.py",
                ChangeKind::Renamed {
                    old_path: "old.py".into()
                }
            ))
        );
        assert_eq!(
            parse_name_status_line("C100\tsrc/a.ts\tsrc/b.ts"),
            Some(FileChange::new("src/b.ts", ChangeKind::Copied))
        );
        assert_eq!(parse_name_status_line(""), None);
    }

    #[tokio::test]
    async fn test_diff_between_commits() {
        let (dir, workdir) = setup_repo();
        let base = workdir.last_commit("main").unwrap();

        std::fs::write(dir.path().join("app.py"), "print('v2')\n").unwrap();
        std::fs::write(dir.path().join("added.py"), "y = 2\n").unwrap();
        std::fs::remove_file(dir.path().join("util.py")).unwrap();
        git(dir.path(), &["add", "-A"]);
        git(dir.path(), &["commit", "-m", "changes"]);
        let head = workdir.last_commit("main").unwrap();

        let mut changes = workdir.diff(&base, &head).await.unwrap();
        changes.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(
            changes,
            vec![
                FileChange::new("added.py", ChangeKind::Added),
                FileChange::new("app.py", ChangeKind::Modified),
                FileChange::new("util.py", ChangeKind::Deleted),
            ]
        );
    }

    #[tokio::test]
    async fn test_diff_with_bad_revision_fails_without_retry() {
        let (_dir, workdir) = setup_repo();
        // A bad revision is not a transient failure; this returns promptly
        // instead of burning the backoff schedule.
        let err = workdir.diff("no-such-rev", "also-bad").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Git { .. }));
    }

    #[test]
    fn test_read_file_returns_worktree_bytes() {
        let (_dir, workdir) = setup_repo();
        let bytes = workdir.read_file("app.py").unwrap();
        assert_eq!(bytes, b"print('v1')\n");

        assert!(workdir.read_file("missing.py").is_err());
    }

    #[test]
    fn test_last_commit_resolves_branch() {
        let (_dir, workdir) = setup_repo();
        let commit = workdir.last_commit("main").unwrap();
        assert_eq!(commit.len(), 40);
    }
}
