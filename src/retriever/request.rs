//! `RetrievalRequest`/`RetrievalJob` types and ingestion (SPEC_FULL §3,
//! §4.3): parsing `request/<ID>` JSON state files, the mtime-keyed cache
//! that avoids re-parsing unchanged requests every tick, and the drop rules
//! that unlink a request without ever spawning a worker for it.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::identifier::Identifier;
use crate::staging;

const PARSE_RETRIES: u32 = 25;
const PARSE_RETRY_DELAY: Duration = Duration::from_millis(20);

/// One `request/<ID>` JSON state file (SPEC_FULL §3). Other fields the
/// plugin may write are tolerated and ignored via serde's default
/// unknown-field behavior.
#[derive(Clone, Debug, Deserialize)]
pub struct RetrievalRequest {
    pub parent_pid: i32,
    pub file_size: u64,
    #[serde(default)]
    pub action: Option<String>,
}

impl RetrievalRequest {
    /// Only `action: "recall"` (or an absent `action`) is processed; any
    /// other value is ignored by the retriever (SPEC_FULL §3).
    pub fn is_recall(&self) -> bool {
        matches!(self.action.as_deref(), None | Some("recall"))
    }
}

#[derive(Clone, Debug)]
struct Cached {
    request: RetrievalRequest,
    mtime: SystemTime,
}

/// Parsed-request cache keyed by identifier, revalidated by comparing the
/// cached mtime to the file's current mtime each tick; an identifier that
/// disappears from this tick's scan (a stat race or genuine deletion) is
/// treated as invalidated, exactly as a mtime comparison failure would be
/// (SPEC_FULL §9 open question - the ambiguity is preserved rather than
/// guessed away).
#[derive(Default)]
pub struct RequestCache(HashMap<Identifier, Cached>);

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&mut self, id: &Identifier) {
        self.0.remove(id);
    }

    /// Drops every cached entry, forcing a full reparse on the next
    /// [`ingest`] call. Used after a tape-hint reload, since every request's
    /// volume mapping may have changed (SPEC_FULL §4.3).
    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// A live, actionable retrieval request: survived the drop rules and is
/// ready to be grouped into a per-volume [`super::Job`].
#[derive(Clone, Debug)]
pub struct LiveRequest {
    pub id: Identifier,
    pub file_size: u64,
    pub ts: SystemTime,
}

/// Scans `request/`, reparsing anything new or changed, and applies the
/// drop rules from SPEC_FULL §4.3:
///
/// - non-`recall` actions are excluded from the result (but the file is
///   left alone - the plugin may still be deciding what to do with it);
/// - a request whose `parent_pid` process group is dead is unlinked;
/// - a request whose `in/ID` already exists with the expected size is
///   unlinked (the plugin just hasn't noticed success yet).
///
/// A request file that fails to parse even after [`PARSE_RETRIES`] is
/// logged and discarded (SPEC_FULL §7).
pub async fn ingest(
    request_dir: &Path,
    in_dir: &Path,
    cache: &mut RequestCache,
) -> anyhow::Result<Vec<LiveRequest>> {
    let entries = staging::scan(request_dir).await?;
    let seen: std::collections::HashSet<_> = entries.iter().map(|e| e.id.clone()).collect();
    cache.0.retain(|id, _| seen.contains(id));

    let mut live = Vec::new();
    for entry in entries {
        let path = request_dir.join(entry.id.as_str());

        let request = match cache.0.get(&entry.id) {
            Some(c) if c.mtime == entry.mtime => c.request.clone(),
            _ => match load_with_retries(&path).await {
                Some(req) => {
                    cache.0.insert(entry.id.clone(), Cached { request: req.clone(), mtime: entry.mtime });
                    req
                },
                None => {
                    warn!(id = %entry.id, "request file never parsed cleanly, discarding");
                    let _ = tokio::fs::remove_file(&path).await;
                    cache.invalidate(&entry.id);
                    continue;
                },
            },
        };

        if !request.is_recall() {
            debug!(id = %entry.id, action = ?request.action, "ignoring non-recall request");
            continue;
        }

        if !group_alive(request.parent_pid) {
            debug!(id = %entry.id, pid = request.parent_pid, "parent process group dead, dropping request");
            let _ = tokio::fs::remove_file(&path).await;
            cache.invalidate(&entry.id);
            continue;
        }

        if already_retrieved(in_dir, &entry.id, request.file_size).await {
            debug!(id = %entry.id, "in/ already has matching file, dropping request");
            let _ = tokio::fs::remove_file(&path).await;
            cache.invalidate(&entry.id);
            continue;
        }

        live.push(LiveRequest { id: entry.id, file_size: request.file_size, ts: entry.mtime });
    }

    Ok(live)
}

/// Re-checks one request against the same drop rules `ingest` applies, used
/// by the worker-spawn path right before a line is written into a
/// `requestlists/` file (SPEC_FULL §4.3 "Pre-cleanup").
pub async fn still_valid(request_dir: &Path, in_dir: &Path, id: &Identifier) -> bool {
    let path = request_dir.join(id.as_str());
    let Some(req) = load_with_retries(&path).await else { return false };
    if !req.is_recall() {
        return false;
    }
    if !group_alive(req.parent_pid) {
        return false;
    }
    !already_retrieved(in_dir, id, req.file_size).await
}

async fn already_retrieved(in_dir: &Path, id: &Identifier, expected_size: u64) -> bool {
    match tokio::fs::metadata(in_dir.join(id.as_str())).await {
        Ok(meta) => meta.len() == expected_size,
        Err(_) => false,
    }
}

async fn load_with_retries(path: &Path) -> Option<RetrievalRequest> {
    for _ in 0..PARSE_RETRIES {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(req) => return Some(req),
                Err(_) => sleep(PARSE_RETRY_DELAY).await,
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(_) => sleep(PARSE_RETRY_DELAY).await,
        }
    }
    None
}

/// Probes process-group liveness via `kill(-pgid, 0)` (SPEC_FULL §4.3):
/// `parent_pid` names the process group of the plugin-spawned mover.
fn group_alive(pgid: i32) -> bool {
    if pgid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs no action beyond existence/permission
    // checking; passing a negative pid targets the whole process group.
    let rc = unsafe { libc::kill(-pgid, 0) };
    if rc == 0 {
        return true;
    }
    matches!(std::io::Error::last_os_error().raw_os_error(), Some(e) if e == libc::EPERM)
}
