use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_MASTER_PORT: u16 = 4300;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    log: Option<String>,
    poll_interval_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    master_url: Option<String>,
    worker_id: Option<String>,
    /// Seed rules for the rule engine, loaded once at master startup.
    /// Shape matches `crate::policy::Rule`.
    tool_approval_rules: Option<Vec<crate::policy::Rule>>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── MasterConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub tool_approval_rules: Vec<crate::policy::Rule>,
}

impl MasterConfig {
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        Self {
            port: port.or(toml.port).unwrap_or(DEFAULT_MASTER_PORT),
            log: log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            tool_approval_rules: toml.tool_approval_rules.unwrap_or_default(),
            data_dir,
        }
    }
}

// ─── WorkerConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub data_dir: PathBuf,
    pub log: String,
    pub master_url: Option<String>,
    pub poll_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl WorkerConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — `CSM_WORKER_ID` / `CSM_MASTER_URL` per the wire spec,
    ///      or an explicit CLI flag
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        worker_id: Option<String>,
        master_url: Option<String>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        poll_interval_secs: Option<u64>,
        heartbeat_interval_secs: Option<u64>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let worker_id = worker_id
            .or_else(|| std::env::var("CSM_WORKER_ID").ok())
            .or(toml.worker_id)
            .unwrap_or_else(default_worker_id);

        let master_url = master_url
            .or_else(|| std::env::var("CSM_MASTER_URL").ok())
            .or(toml.master_url);

        Self {
            worker_id,
            log: log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            poll_interval_secs: poll_interval_secs
                .or(toml.poll_interval_secs)
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            heartbeat_interval_secs: heartbeat_interval_secs
                .or(toml.heartbeat_interval_secs)
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            master_url,
            data_dir,
        }
    }
}

/// Sanitized hostname fallback for `CSM_WORKER_ID` — lowercase, non-alphanumeric
/// characters replaced with `-`.
fn default_worker_id() -> String {
    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "worker".to_string());
    hostname
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("csm");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("csm");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("csm");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("csm");
        }
    }
    PathBuf::from(".csm")
}
