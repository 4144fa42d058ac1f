pub mod git;

use anyhow::{Context, Result};
use git2::Repository;
use std::path::PathBuf;

use git::{FileDiff, RepoStatus};

/// Read-only accessor for a session's working-tree status and diffs.
///
/// Backs `GET /api/sessions/:name/diff`. git2 is synchronous, so every call
/// runs the actual repository walk on the blocking pool.
pub struct RepoReader;

impl RepoReader {
    pub async fn status(repo_path: &str) -> Result<RepoStatus> {
        let path = canonicalize(repo_path)?;
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&path).context("not a git repository")?;
            git::read_status(&repo)
        })
        .await?
    }

    pub async fn diff(repo_path: &str) -> Result<Vec<FileDiff>> {
        let path = canonicalize(repo_path)?;
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&path).context("not a git repository")?;
            git::read_diff(&repo)
        })
        .await?
    }

    pub async fn file_diff(repo_path: &str, file_path: &str, staged: bool) -> Result<FileDiff> {
        let path = canonicalize(repo_path)?;
        let file_path = file_path.to_string();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&path).context("not a git repository")?;
            git::read_file_diff(&repo, &file_path, staged)
        })
        .await?
    }
}

fn canonicalize(repo_path: &str) -> Result<PathBuf> {
    PathBuf::from(repo_path)
        .canonicalize()
        .context("path does not exist")
}

/// Render parsed `FileDiff`s back into one unified-diff-style string for API
/// responses that want plain text rather than the structured hunk form.
pub fn render_unified(diffs: &[FileDiff]) -> String {
    let mut out = String::new();
    for file in diffs {
        let old_path = file.old_path.as_deref().unwrap_or(&file.path);
        out.push_str(&format!("--- a/{old_path}\n+++ b/{}\n", file.path));
        if file.is_binary {
            out.push_str("Binary files differ\n");
            continue;
        }
        for hunk in &file.hunks {
            out.push_str(&hunk.header);
            out.push('\n');
            for line in &hunk.lines {
                let prefix = match line.kind {
                    git::DiffLineKind::Added => '+',
                    git::DiffLineKind::Removed => '-',
                    git::DiffLineKind::Context => ' ',
                };
                out.push(prefix);
                out.push_str(&line.content);
                out.push('\n');
            }
        }
    }
    out
}
