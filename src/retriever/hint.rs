//! The tape-hint file: identifier -> tape volume mapping, produced
//! out-of-band by a one-shot generator (out of scope per SPEC_FULL §1/§4.5).
//! This module only parses the documented JSON shape and watches its mtime.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::SystemTime;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::identifier::Identifier;

/// The synthetic volume name for requests the hint file doesn't cover
/// (SPEC_FULL §4.3).
pub const DEFAULT_VOLUME: &str = "default";

#[derive(Clone, Debug, Deserialize)]
pub struct HintEntry {
    pub volid: String,
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct TapeHint {
    entries: HashMap<Identifier, HintEntry>,
    loaded_mtime: Option<SystemTime>,
}

impl TapeHint {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn mtime(&self) -> Option<SystemTime> {
        self.loaded_mtime
    }

    /// Sanitized volume for `id`, or [`DEFAULT_VOLUME`] if unmapped
    /// (SPEC_FULL §4.3).
    pub fn volume_for(&self, id: &Identifier) -> String {
        match self.entries.get(id) {
            Some(hint) => sanitize_volume(&hint.volid),
            None => DEFAULT_VOLUME.to_string(),
        }
    }
}

fn unsafe_char_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9.\-]").unwrap())
}

/// Replaces any character outside `[a-zA-Z0-9.-]` with `_` (SPEC_FULL
/// §4.3), since the volume name becomes part of a `requestlists/` filename.
pub fn sanitize_volume(raw: &str) -> String {
    unsafe_char_re().replace_all(raw, "_").into_owned()
}

/// Watches `path`'s mtime; if it has changed (or this is the first call),
/// reparses and returns the new [`TapeHint`]. Returns `None` on a stat
/// failure (file absent - no hints configured or not yet generated) or a
/// JSON parse failure, in which case the caller should keep using the
/// previous hint set (SPEC_FULL §4.3, §7).
pub async fn reload_if_changed(path: &Path, previous: &TapeHint) -> Option<TapeHint> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let mtime = meta.modified().ok();
    if mtime.is_some() && mtime == previous.loaded_mtime {
        return None;
    }

    let text = match tokio::fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read tape hint file");
            return None;
        },
    };

    let raw: HashMap<String, HintEntry> = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse tape hint file, keeping previous hints");
            return None;
        },
    };

    let entries = raw
        .into_iter()
        .filter_map(|(k, v)| Identifier::parse(&k).map(|id| (id, v)))
        .collect();

    Some(TapeHint { entries, loaded_mtime: mtime })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_unsafe_characters() {
        assert_eq!(sanitize_volume("VOL 001/A"), "VOL_001_A");
        assert_eq!(sanitize_volume("vol-1.2"), "vol-1.2");
    }

    #[test]
    fn unmapped_identifier_falls_back_to_default() {
        let hint = TapeHint::default();
        let id = Identifier::parse("deadbeef").unwrap();
        assert_eq!(hint.volume_for(&id), DEFAULT_VOLUME);
    }

    #[tokio::test]
    async fn reload_parses_and_tracks_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("hints.json");
        tokio::fs::write(&path, r#"{"deadbeef": {"volid": "VOL 1", "order": "1"}}"#)
            .await
            .unwrap();

        let hint = reload_if_changed(&path, &TapeHint::default()).await.unwrap();
        assert_eq!(hint.len(), 1);
        let id = Identifier::parse("deadbeef").unwrap();
        assert_eq!(hint.volume_for(&id), "VOL_1");

        // Unchanged mtime -> no reload.
        assert!(reload_if_changed(&path, &hint).await.is_none());
    }

    #[tokio::test]
    async fn missing_hint_file_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("missing.json");
        assert!(reload_if_changed(&path, &TapeHint::default()).await.is_none());
    }
}
