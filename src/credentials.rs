use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info};

use crate::layout::write_atomic;

const CREDENTIALS_FILE: &str = ".credentials.json";
const SETTINGS_FILE: &str = "settings.json";

/// Keeps a box's cached agent credentials in sync with the host.
pub trait CredentialsManager {
    /// Directory inside the state root holding the cached credentials.
    fn cache_dir(&self) -> &Path;

    /// Pull newer host credentials into the box. Returns whether anything changed.
    fn refresh(&self, state_root: &Path) -> Result<bool>;

    /// Reduce host settings to what the box may see.
    fn filter_settings(&self, raw: Value) -> Value;

    /// Store filtered settings in the box and push newer box credentials
    /// back to the host.
    fn writeback(&self, state_root: &Path, filtered: &Value) -> Result<()>;
}

/// Credentials for Claude agents, mirrored from `~/.claude/.credentials.json`.
pub struct ClaudeCredentials {
    host_dir: PathBuf,
    cache_dir: PathBuf,
}

impl ClaudeCredentials {
    pub fn new(host_home: &Path) -> Self {
        Self {
            host_dir: host_home.join(".claude"),
            cache_dir: PathBuf::from("credentials"),
        }
    }

    /// Credentials for the current user's home directory.
    pub fn for_current_user() -> Result<Self> {
        let home = home::home_dir().context("Could not determine home directory")?;
        Ok(Self::new(&home))
    }

    pub fn host_settings_path(&self) -> PathBuf {
        self.host_dir.join("settings.json")
    }

    fn host_credentials(&self) -> PathBuf {
        self.host_dir.join(CREDENTIALS_FILE)
    }

    fn box_credentials(&self, state_root: &Path) -> PathBuf {
        state_root.join(&self.cache_dir).join(CREDENTIALS_FILE)
    }
}

impl CredentialsManager for ClaudeCredentials {
    fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn refresh(&self, state_root: &Path) -> Result<bool> {
        let host = self.host_credentials();
        let cached = self.box_credentials(state_root);
        if !is_newer(&host, &cached) {
            debug!(path = %cached.display(), "credentials:up to date");
            return Ok(false);
        }
        copy_atomic(&host, &cached)?;
        info!(path = %cached.display(), "credentials:refreshed from host");
        Ok(true)
    }

    fn filter_settings(&self, raw: Value) -> Value {
        match raw {
            Value::Object(_) => raw,
            _ => Value::Object(Default::default()),
        }
    }

    fn writeback(&self, state_root: &Path, filtered: &Value) -> Result<()> {
        let settings = state_root.join(&self.cache_dir).join(SETTINGS_FILE);
        if let Some(parent) = settings.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(filtered)?;
        write_atomic(&settings, json.as_bytes())
            .with_context(|| format!("Failed to write {}", settings.display()))?;

        let cached = self.box_credentials(state_root);
        let host = self.host_credentials();
        if is_newer(&cached, &host) {
            copy_atomic(&cached, &host)?;
            info!(path = %host.display(), "credentials:written back to host");
        }
        Ok(())
    }
}

/// Whether `src` exists and is strictly newer than `dst` (or `dst` is missing).
fn is_newer(src: &Path, dst: &Path) -> bool {
    let Some(src_time) = modified(src) else {
        return false;
    };
    match modified(dst) {
        Some(dst_time) => src_time > dst_time,
        None => true,
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn copy_atomic(src: &Path, dst: &Path) -> Result<()> {
    let contents = fs::read(src).with_context(|| format!("Failed to read {}", src.display()))?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    write_atomic(dst, &contents).with_context(|| format!("Failed to write {}", dst.display()))
}
