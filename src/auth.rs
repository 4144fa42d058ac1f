//! Bearer-token auth for the master's REST/SSE/WS surface.
//!
//! `GET /api/auth/setup` generates the token on first call and persists it
//! to `{data_dir}/auth_token` (mode 0600 on Unix); later calls return the
//! same token idempotently. Every other endpoint requires it, either via
//! `Authorization: Bearer <t>` or `?token=<t>` for transports that cannot
//! set headers (SSE, the CLI-facing WS upgrade).

use anyhow::Result;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

pub struct TokenStore {
    data_dir: std::path::PathBuf,
    cached: Mutex<Option<String>>,
}

impl TokenStore {
    pub fn new(data_dir: std::path::PathBuf) -> Self {
        Self {
            data_dir,
            cached: Mutex::new(None),
        }
    }

    /// Idempotently return the token, generating and persisting it on first call.
    pub fn get_or_create(&self) -> Result<String> {
        if let Some(t) = self.cached.lock().unwrap().clone() {
            return Ok(t);
        }
        let token = get_or_create_token(&self.data_dir)?;
        *self.cached.lock().unwrap() = Some(token.clone());
        Ok(token)
    }

    pub fn validate(&self, presented: &str) -> bool {
        match self.cached.lock().unwrap().clone() {
            Some(t) => tokens_equal(presented, &t),
            None => false,
        }
    }
}

fn get_or_create_token(data_dir: &Path) -> Result<String> {
    let path = data_dir.join("auth_token");

    if path.exists() {
        let token = std::fs::read_to_string(&path)?.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }

    let token = Uuid::new_v4().to_string().replace('-', "");
    std::fs::create_dir_all(data_dir)?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        f.write_all(token.as_bytes())?;
    }
    #[cfg(not(unix))]
    std::fs::write(&path, &token)?;

    Ok(token)
}

/// Constant-time token comparison to avoid a timing oracle on the bearer check.
pub fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_equal_matches_identical() {
        assert!(tokens_equal("abc123", "abc123"));
    }

    #[test]
    fn tokens_equal_rejects_mismatch() {
        assert!(!tokens_equal("abc123", "abc124"));
        assert!(!tokens_equal("short", "longerstring"));
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().to_path_buf());
        let t1 = store.get_or_create().unwrap();
        let t2 = store.get_or_create().unwrap();
        assert_eq!(t1, t2);
    }
}
