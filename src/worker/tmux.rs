//! Multiplexer abstraction and its tmux-backed implementation.
//!
//! `csm-` is the session-name prefix this worker owns; any other tmux
//! session is left alone. The trait exists so the poll/diff logic in
//! `agent.rs` can be driven by a fake in unit tests without shelling out.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

const SESSION_PREFIX: &str = "csm-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSession {
    pub session_name: String,
    pub attached: bool,
    pub windows: u32,
}

#[derive(Debug, Clone, Default)]
pub struct PaneInfo {
    pub cwd: Option<String>,
    pub current_command: Option<String>,
}

#[async_trait]
pub trait Multiplexer: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<RawSession>>;

    /// Best-effort detail lookup for one session's active pane. Returns the
    /// default (all-`None`) value rather than erroring when tmux can't
    /// answer — this is enrichment, not a required field.
    async fn pane_info(&self, session_name: &str) -> PaneInfo;
}

pub struct TmuxMultiplexer;

#[async_trait]
impl Multiplexer for TmuxMultiplexer {
    async fn list_sessions(&self) -> Result<Vec<RawSession>> {
        let output = Command::new("tmux")
            .args([
                "list-sessions",
                "-F",
                "#{session_name}\t#{session_attached}\t#{session_windows}",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .context("spawning tmux list-sessions")?;

        if !output.status.success() {
            // No server running yet, or no sessions — not an error for us.
            return Ok(Vec::new());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().filter_map(parse_line).collect())
    }

    async fn pane_info(&self, session_name: &str) -> PaneInfo {
        let target = format!("{SESSION_PREFIX}{session_name}");
        let output = Command::new("tmux")
            .args(["display-message", "-p", "-t", &target, "#{pane_current_path}\t#{pane_current_command}"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        let Ok(output) = output else { return PaneInfo::default() };
        if !output.status.success() {
            return PaneInfo::default();
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let mut parts = text.trim().splitn(2, '\t');
        PaneInfo {
            cwd: parts.next().filter(|s| !s.is_empty()).map(String::from),
            current_command: parts.next().filter(|s| !s.is_empty()).map(String::from),
        }
    }
}

fn parse_line(line: &str) -> Option<RawSession> {
    let mut parts = line.splitn(3, '\t');
    let key = parts.next()?;
    let attached = parts.next()? == "1";
    let windows = parts.next()?.parse().ok()?;

    let session_name = key.strip_prefix(SESSION_PREFIX)?.to_string();
    Some(RawSession { session_name, attached, windows })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixed_session_line() {
        let line = "csm-foo\t1\t3";
        let s = parse_line(line).unwrap();
        assert_eq!(s.session_name, "foo");
        assert!(s.attached);
        assert_eq!(s.windows, 3);
    }

    #[test]
    fn ignores_sessions_without_prefix() {
        assert!(parse_line("other-session\t0\t1").is_none());
    }

    #[test]
    fn handles_detached_session() {
        let s = parse_line("csm-bar\t0\t2").unwrap();
        assert!(!s.attached);
    }
}
