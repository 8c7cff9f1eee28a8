//! The runtime override: a JSON file that temporarily masks a whitelisted
//! subset of config keys without editing the main config file (SPEC_FULL
//! §4.1).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use super::{build, schema, Config, ConfigError};

const PARSE_RETRIES: u32 = 10;
const PARSE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum OverrideError {
    #[error("override file {0:?} did not stabilize after {1} retries")]
    NeverStabilized(PathBuf, u32),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Tracks whether a runtime override is currently applied and the mtime it
/// was last loaded at, so [`OverrideState::poll`] only re-reads the file
/// when it changes.
#[derive(Debug, Default)]
pub struct OverrideState {
    last_loaded_mtime: Option<SystemTime>,
    applied: bool,
}

impl OverrideState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// Inspects the override file named by `base.override_file`. Returns
    /// `Ok(Some(merged))` when the effective config changed this tick (an
    /// override was applied, changed, or reverted), `Ok(None)` when nothing
    /// changed. Never returns an error for a transiently unreadable or
    /// malformed file - those are logged and treated as "no change" so the
    /// caller keeps running on the last-known-good config.
    pub async fn poll(&mut self, base: &Config) -> Option<Config> {
        let Some(path) = base.override_file.clone() else {
            return None;
        };

        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.applied {
                    info!(path = %path.display(), "override file removed, reverting to base config");
                    self.applied = false;
                    self.last_loaded_mtime = None;
                    return Some(base.clone());
                }
                return None;
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not stat override file, keeping current config");
                return None;
            },
        };

        let mtime = meta.modified().ok();
        if self.applied && mtime == self.last_loaded_mtime {
            return None;
        }

        match self.load_and_merge(&path, base).await {
            Ok(merged) => {
                log_diff(base.effective_raw(), merged.effective_raw());
                self.applied = true;
                self.last_loaded_mtime = mtime;
                Some(merged)
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "override reload failed, keeping current config");
                None
            },
        }
    }

    async fn load_and_merge(
        &self,
        path: &PathBuf,
        base: &Config,
    ) -> Result<Config, OverrideError> {
        let text = self.read_with_retries(path).await?;
        let values: BTreeMap<String, Value> =
            serde_json::from_str(&text).map_err(|e| {
                OverrideError::Config(ConfigError::InvalidValue {
                    key: "<override file>".into(),
                    value: e.to_string(),
                    reason: "not a JSON object",
                })
            })?;

        let mut raw = base.effective_raw().clone();
        for (key, value) in values {
            let spec = schema::find(&key).ok_or_else(|| {
                OverrideError::Config(ConfigError::NotOverridable { key: key.clone() })
            })?;
            if !spec.canoverride {
                return Err(OverrideError::Config(ConfigError::NotOverridable { key }));
            }
            raw.insert(key, json_value_to_raw(&value));
        }

        Ok(build(raw)?)
    }

    /// Retries up to [`PARSE_RETRIES`] times with [`PARSE_RETRY_DELAY`]
    /// sleeps to tolerate a reader racing the plugin's atomic
    /// temp-file-then-rename write of the override file.
    async fn read_with_retries(&self, path: &PathBuf) -> Result<String, OverrideError> {
        let mut last_err = None;
        for _ in 0..PARSE_RETRIES {
            match tokio::fs::read_to_string(path).await {
                Ok(text) if serde_json::from_str::<Value>(&text).is_ok() => return Ok(text),
                Ok(_) | Err(_) => {
                    last_err = Some(());
                    sleep(PARSE_RETRY_DELAY).await;
                },
            }
        }
        let _ = last_err;
        Err(OverrideError::NeverStabilized(path.clone(), PARSE_RETRIES))
    }
}

fn json_value_to_raw(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn log_diff(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) {
    for (key, new_val) in new {
        match old.get(key) {
            None => info!(key, value = new_val, "override added key"),
            Some(old_val) if old_val != new_val => {
                info!(key, from = old_val, to = new_val, "override changed key");
            },
            _ => {},
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            info!(key, "override removed key");
        }
    }
}
