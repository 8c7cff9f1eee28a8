//! The staging tree: the on-disk contract with the dCache HSM plugin
//! (SPEC_FULL §3). Every fallible filesystem operation the three daemons
//! perform funnels through here so failure handling (skip-and-log vs.
//! abort) is applied consistently (SPEC_FULL §4.7).

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::identifier::Identifier;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("base directory {0:?} does not exist")]
    MissingBaseDir(PathBuf),
    #[error("required directory {0:?} is not writable: {1}")]
    NotWritable(PathBuf, #[source] io::Error),
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The subdirectories every daemon requires under `$base`, created if
/// missing (SPEC_FULL §4.1).
pub fn required_dirs(cfg: &Config) -> Vec<PathBuf> {
    vec![
        cfg.out_dir(),
        cfg.in_dir(),
        cfg.request_dir(),
        cfg.requestlists_dir(),
        cfg.trash_dir(),
        cfg.trash_queue_dir(),
    ]
}

/// Verifies the base dir exists and every required subdir is
/// present-and-writable, creating subdirs if missing, by creating and
/// removing a temp file in each. Aborts (returns `Err`) if not - this is one
/// of the four `die`-worthy cases in SPEC_FULL §4.7/§7.
pub async fn verify_startup(cfg: &Config) -> Result<(), StagingError> {
    if !tokio::fs::try_exists(&cfg.dir)
        .await
        .unwrap_or(false)
    {
        return Err(StagingError::MissingBaseDir(cfg.dir.clone()));
    }

    for dir in required_dirs(cfg) {
        tokio::fs::create_dir_all(&dir).await.map_err(|e| StagingError::Io {
            path: dir.clone(),
            source: e,
        })?;
        probe_writable(&dir).await?;
    }
    Ok(())
}

async fn probe_writable(dir: &Path) -> Result<(), StagingError> {
    let probe = dir.join(format!(".endit-probe-{}", std::process::id()));
    tokio::fs::write(&probe, b"").await.map_err(|e| {
        StagingError::NotWritable(dir.to_path_buf(), e)
    })?;
    let _ = tokio::fs::remove_file(&probe).await;
    Ok(())
}

/// One entry found while scanning a staging subdirectory: the validated
/// [`Identifier`], its size, and its mtime. Non-identifier names are
/// filtered out before this type is constructed (invariant 2, SPEC_FULL §3).
#[derive(Clone, Debug)]
pub struct Entry {
    pub id: Identifier,
    pub size: u64,
    pub mtime: SystemTime,
}

/// Scans `dir` for identifier-pattern names, skipping (and logging at
/// `debug!`) anything that races out from under us - the directory is
/// mutated concurrently by the plugin and the tape client.
pub async fn scan(dir: &Path) -> Result<Vec<Entry>, StagingError> {
    let mut out = Vec::new();
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(StagingError::Io { path: dir.to_path_buf(), source: e }),
    };

    while let Some(entry) = rd
        .next_entry()
        .await
        .map_err(|e| StagingError::Io { path: dir.to_path_buf(), source: e })?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(id) = Identifier::parse(name) else { continue };

        let meta = match entry.metadata().await {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "skipping entry that vanished mid-scan");
                continue;
            },
        };
        if !meta.is_file() {
            continue;
        }
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        out.push(Entry { id, size: meta.len(), mtime });
    }
    Ok(out)
}

/// Total size in bytes of every identifier-named file in `dir`.
pub async fn total_size(dir: &Path) -> Result<u64, StagingError> {
    Ok(scan(dir).await?.iter().map(|e| e.size).sum())
}

/// Removes stale files older than `max_age` from `dir`, ignoring
/// identifier-pattern filtering (invariant 5, SPEC_FULL §3): on restart,
/// `in/` and `requestlists/` may carry leftovers from a crashed previous
/// run regardless of name shape.
pub async fn sweep_stale(dir: &Path, max_age: Duration) -> Result<usize, StagingError> {
    let mut removed = 0;
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StagingError::Io { path: dir.to_path_buf(), source: e }),
    };

    let now = SystemTime::now();
    while let Some(entry) = rd
        .next_entry()
        .await
        .map_err(|e| StagingError::Io { path: dir.to_path_buf(), source: e })?
    {
        let path = entry.path();
        let Ok(meta) = entry.metadata().await else { continue };
        if !meta.is_file() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or(Duration::ZERO);
        if age > max_age {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    debug!(path = %path.display(), ?age, "removed stale file");
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => {},
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale file"),
            }
        }
    }
    Ok(removed)
}

/// Runs the restart-time stale-file sweep over `in/` and `requestlists/`
/// (invariant 5, SPEC_FULL §3).
pub async fn sweep_stale_on_startup(cfg: &Config) -> Result<(), StagingError> {
    let max_age = Duration::from_secs(cfg.stale_age);
    let in_removed = sweep_stale(&cfg.in_dir(), max_age).await?;
    let rl_removed = sweep_stale(&cfg.requestlists_dir(), max_age).await?;
    if in_removed + rl_removed > 0 {
        debug!(in_removed, requestlists_removed = rl_removed, "startup stale sweep complete");
    }
    Ok(())
}

/// Writes `lines` (one path per line) into a fresh temp file under
/// `requestlists/`, named `<prefix>.XXXXXX`, for the life of one worker
/// invocation (`-filelist=`, SPEC_FULL §3/§4.2/§4.3/§4.4). The caller owns
/// deleting it once the worker exits.
pub fn write_filelist(
    dir: &Path,
    prefix: &str,
    lines: &[String],
) -> Result<tempfile::NamedTempFile, StagingError> {
    use std::io::Write;

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!("{prefix}."))
        .tempfile_in(dir)
        .map_err(|e| StagingError::Io { path: dir.to_path_buf(), source: e })?;
    for line in lines {
        writeln!(tmp, "{line}").map_err(|e| StagingError::Io {
            path: tmp.path().to_path_buf(),
            source: e,
        })?;
    }
    tmp.flush().map_err(|e| StagingError::Io {
        path: tmp.path().to_path_buf(),
        source: e,
    })?;
    Ok(tmp)
}
