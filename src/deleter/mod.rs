//! The deleter: the one component where cron-scheduled batching replaces
//! continuous polling for the tape operation, because tape deletions are
//! expensive and have low urgency (SPEC_FULL §4.4).
//!
//! [`schedule`] holds the pure crontab/named-interval rollover tracker so
//! it can be unit tested without a clock. This module wires that tracker
//! to the filesystem's `trash/` → `trash/queue/<ts>` handoff and to a
//! single tape-client delete invocation per processed batch.

pub mod schedule;

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, OverrideState};
use crate::identifier::Identifier;
use crate::signals::SignalHandles;
use crate::staging;
use crate::stats::DeleterStats;
use crate::tape;
use crate::worker::{SpawnSpec, Worker};
use schedule::{Schedule, Tracker};

/// Failure to durably rename a `trash/queue/<ts>` batch file into place.
/// Unlike every other per-tick error this one is `die`-worthy: the plugin
/// has already been told (by the vanished `trash/<ID>` marker) that the
/// deletion was accepted, so losing the batch now would silently break
/// that promise (SPEC_FULL §7).
#[derive(Debug, thiserror::Error)]
#[error("failed to rename deletion queue batch into place: {0}")]
struct BatchRenameFailed(#[source] io::Error);

struct DeleteWorker {
    worker: Worker,
    ids: Vec<Identifier>,
    batch_paths: Vec<PathBuf>,
    _listfile: tempfile::NamedTempFile,
    output: tokio::task::JoinHandle<String>,
}

struct State {
    tracker: Tracker,
    /// Set by a failed batch that left some identifiers unresolved, or by
    /// `USR1`; makes the next tick reattempt immediately regardless of
    /// schedule (SPEC_FULL §4.4 "Queue-process path").
    pending_retry: bool,
    worker: Option<DeleteWorker>,
}

/// Runs the deleter supervisor loop until `signals.shutdown` fires.
pub async fn run(cfg: Config, signals: SignalHandles) -> anyhow::Result<()> {
    let schedule = Schedule::parse(&cfg.deleter_queueprocinterval, jitter_seed()).unwrap_or_else(|e| {
        warn!(
            error = %e,
            configured = %cfg.deleter_queueprocinterval,
            "invalid deleter_queueprocinterval, falling back to hourly"
        );
        Schedule::parse("hourly", 0).expect("named interval literal always parses")
    });
    let mut state = State { tracker: Tracker::new(schedule), pending_retry: false, worker: None };
    let mut stats = DeleterStats::default();
    let mut overrides = OverrideState::new();
    let mut cfg = cfg;

    loop {
        if let Some(merged) = overrides.poll(&cfg).await {
            cfg = merged;
        }

        if signals.shutdown.is_cancelled() {
            break;
        }

        let reaped = match tick(&cfg, &mut state, &mut stats, &signals).await {
            Ok(reaped) => reaped,
            Err(e)
                if e.downcast_ref::<BatchRenameFailed>().is_some()
                    || e.downcast_ref::<crate::worker::ForkFailed>().is_some() =>
            {
                error!(error = %e, "deleter hit a fatal error, exiting");
                if let Some(dw) = &mut state.worker {
                    dw.worker.kill_now();
                }
                return Err(e);
            },
            Err(e) => {
                error!(error = %e, "deleter tick failed");
                false
            },
        };

        stats.stamp();
        if let Err(e) = stats.emit(&cfg.statsdir, &cfg.hsm).await {
            warn!(error = %e, "failed to emit deleter stats");
        }

        // Mirrors the archiver/retriever shortened-sleep convention: after
        // a worker exit, or with a retry pending, stay responsive instead
        // of waiting out the full `sleeptime` (SPEC_FULL §5).
        let next_sleep = if reaped || state.pending_retry {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(cfg.sleeptime)
        };

        tokio::select! {
            _ = sleep(next_sleep) => {},
            _ = signals.shutdown.cancelled() => break,
        }
    }

    if let Some(dw) = &mut state.worker {
        dw.worker.kill_now();
    }
    info!("deleter shutting down");
    Ok(())
}

#[instrument(skip_all)]
async fn tick(
    cfg: &Config,
    state: &mut State,
    stats: &mut DeleterStats,
    signals: &SignalHandles,
) -> anyhow::Result<bool> {
    let had_worker = state.worker.is_some();
    reap_finished(cfg, state, stats).await?;
    let reaped = had_worker && state.worker.is_none();

    // Enqueue path runs every iteration regardless of schedule or whether a
    // delete worker is currently running (SPEC_FULL §4.4).
    enqueue(cfg, stats).await?;

    let usr1 = signals.take_usr1();
    if usr1 {
        info!("SIGUSR1 received, forcing immediate queue processing");
    }

    let due = state.tracker.due(Utc::now());
    stats.batches_pending = count_batches(&cfg.trash_queue_dir()).await.unwrap_or(0);

    if state.worker.is_none() && (due || usr1 || state.pending_retry) {
        spawn_worker(cfg, state).await?;
    }

    Ok(reaped)
}

/// Moves every identifier-pattern name in `trash/` into one fresh
/// `trash/queue/<unix_ts>` batch file, then unlinks (or, in debug mode,
/// relocates to `trash/debug/`) the originals. This *is* the acceptance
/// signal the plugin watches for - the batch file must be durable on disk
/// before any original is removed, so the identifiers listed always equal
/// the identifiers removed from `trash/` in the same tick (SPEC_FULL §8
/// invariant 5).
async fn enqueue(cfg: &Config, stats: &mut DeleterStats) -> anyhow::Result<()> {
    let entries = staging::scan(&cfg.trash_dir()).await?;
    if entries.is_empty() {
        return Ok(());
    }

    let ids: Vec<Identifier> = entries.iter().map(|e| e.id.clone()).collect();
    let batch_path = allocate_batch_path(&cfg.trash_queue_dir()).await?;
    write_batch_atomic(&batch_path, &ids).await?;

    let debug_dir = cfg.deleter_debug.then(|| cfg.trash_debug_dir());
    if let Some(debug_dir) = &debug_dir {
        tokio::fs::create_dir_all(debug_dir).await?;
    }

    for entry in &entries {
        let path = cfg.trash_dir().join(entry.id.as_str());
        let result = match &debug_dir {
            Some(debug_dir) => tokio::fs::rename(&path, debug_dir.join(entry.id.as_str())).await,
            None => tokio::fs::remove_file(&path).await,
        };
        if let Err(e) = result {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to acknowledge trash entry");
            }
        }
    }

    stats.queued_files += ids.len() as u64;
    debug!(count = ids.len(), batch = %batch_path.display(), "enqueued deletion batch");
    Ok(())
}

async fn spawn_worker(cfg: &Config, state: &mut State) -> anyhow::Result<()> {
    let loaded = load_queue(&cfg.trash_queue_dir()).await?;
    if loaded.ids.is_empty() {
        // Nothing pending; clear a stale retry flag rather than spin.
        state.pending_retry = false;
        return Ok(());
    }

    let lines: Vec<String> = loaded
        .ids
        .iter()
        .map(|id| cfg.out_dir().join(id.as_str()).display().to_string())
        .collect();
    let listfile = staging::write_filelist(&cfg.requestlists_dir(), "delete", &lines)?;
    let args = tape::delete_args(
        &cfg.dsmc_display_opts,
        &cfg.dsmcopts,
        &listfile.path().display().to_string(),
    );

    let mut worker = Worker::spawn(SpawnSpec {
        program: "dsmc".to_string(),
        args,
        cpu_limit_secs: cfg.dsmc_cpulimit,
        pipe_stdin: false,
    })?;

    let stdout = worker.stdout();
    let stderr = worker.stderr();
    let output = tokio::spawn(drain_combined(stdout, stderr));

    info!(pid = worker.pid, count = loaded.ids.len(), "spawned delete worker");
    state.worker = Some(DeleteWorker {
        worker,
        ids: loaded.ids,
        batch_paths: loaded.batch_paths,
        _listfile: listfile,
        output,
    });
    Ok(())
}

async fn reap_finished(
    cfg: &Config,
    state: &mut State,
    stats: &mut DeleterStats,
) -> anyhow::Result<()> {
    let Some(dw) = &mut state.worker else { return Ok(()) };
    let Some(status) = dw.worker.try_wait()? else { return Ok(()) };
    let dw = state.worker.take().expect("checked Some above");

    let output = dw.output.await.unwrap_or_default();
    let (deleted, requeue) = classify(&output, status.success(), &dw.ids);

    for path in &dw.batch_paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove processed batch file");
            }
        }
    }

    stats.deleted_files += deleted.len() as u64;
    info!(deleted = deleted.len(), requeued = requeue.len(), "delete batch processed");

    if requeue.is_empty() {
        state.pending_retry = false;
    } else {
        let batch_path = allocate_batch_path(&cfg.trash_queue_dir()).await?;
        write_batch_atomic(&batch_path, &requeue).await?;
        stats.delete_retries += requeue.len() as u64;
        state.pending_retry = true;
        info!(count = requeue.len(), "delete batch partially failed, re-queued");
    }

    Ok(())
}

/// Applies the partial-success parser from SPEC_FULL §4.4: a whole-batch
/// `ANS1302E` makes every identifier a success; an unclassified code marks
/// the whole invocation failed, with any `ANS1345E`-reported identifiers
/// still counted as deleted; otherwise fall through to the exit status.
fn classify(output: &str, exit_success: bool, ids: &[Identifier]) -> (Vec<Identifier>, Vec<Identifier>) {
    let codes = tape::scan(output);

    let mut already_deleted = HashSet::new();
    let mut has_unclassified = false;
    let mut no_objects_matched = false;

    for code in &codes {
        match code {
            tape::Code::Benign(c) => debug!(code = %c, "benign tape-client message"),
            tape::Code::NoObjectsMatched => no_objects_matched = true,
            tape::Code::AlreadyDeleted(basename) => match Identifier::parse(basename) {
                Some(id) => {
                    already_deleted.insert(id);
                },
                None => warn!(basename, "ANS1345E path did not yield a valid identifier"),
            },
            tape::Code::Unclassified(line) => {
                has_unclassified = true;
                warn!(line, "unclassified tape-client error during delete batch");
            },
        }
    }

    if no_objects_matched {
        (ids.to_vec(), Vec::new())
    } else if exit_success && !has_unclassified {
        // Clean exit with nothing unclassified: every requested identifier
        // succeeded, whether or not some were reported via ANS1345E.
        (ids.to_vec(), Vec::new())
    } else if has_unclassified || !already_deleted.is_empty() {
        // Either an unclassified code marked the whole invocation failed, or
        // a non-zero exit with no unclassified code but some ANS1345E hits:
        // those identifiers still count as success (SPEC_FULL §4.4), the
        // rest are re-enqueued.
        ids.iter().cloned().partition(|id| already_deleted.contains(id))
    } else {
        // Non-zero exit with no recognizable code at all: conservatively
        // requeue everything rather than guess (SPEC_FULL §7).
        (Vec::new(), ids.to_vec())
    }
}

struct LoadedQueue {
    ids: Vec<Identifier>,
    batch_paths: Vec<PathBuf>,
}

/// Loads every `trash/queue/<ts>` batch file into one deduplicated set of
/// identifiers, alongside the paths that were read (so the caller can
/// unlink them once the batch has been attempted).
async fn load_queue(dir: &Path) -> anyhow::Result<LoadedQueue> {
    let mut ids = Vec::new();
    let mut batch_paths = Vec::new();
    let mut seen = HashSet::new();

    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(LoadedQueue { ids, batch_paths });
        },
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        let Ok(meta) = entry.metadata().await else { continue };
        if !meta.is_file() {
            continue;
        }
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read deletion batch file");
                continue;
            },
        };
        let batch_ids: Vec<Identifier> = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed deletion batch file, skipping");
                continue;
            },
        };
        for id in batch_ids {
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
        batch_paths.push(path);
    }

    Ok(LoadedQueue { ids, batch_paths })
}

async fn count_batches(dir: &Path) -> io::Result<u64> {
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut n = 0u64;
    while let Some(entry) = rd.next_entry().await? {
        if entry.metadata().await.map(|m| m.is_file()).unwrap_or(false) {
            n += 1;
        }
    }
    Ok(n)
}

/// Picks a non-colliding `trash/queue/<unix_ts>` path, sleeping 1s and
/// retrying on collision (SPEC_FULL §4.4 "Enqueue path").
async fn allocate_batch_path(dir: &Path) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    loop {
        let ts = now_unix();
        let path = dir.join(ts.to_string());
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }
        sleep(Duration::from_secs(1)).await;
    }
}

/// Writes `ids` as a JSON array through the temp-file-then-`rename` atomic
/// pattern, so a concurrent reader of `trash/queue/` never sees a
/// half-written batch file.
async fn write_batch_atomic(path: &Path, ids: &[Identifier]) -> anyhow::Result<()> {
    let dir = path.parent().expect("batch path always has a parent dir");
    tokio::fs::create_dir_all(dir).await?;
    let json = serde_json::to_vec(ids)?;
    let tmp = tempfile::Builder::new().prefix(".queue.tmp.").tempfile_in(dir)?;
    tokio::fs::write(tmp.path(), &json).await?;
    let (_, tmp_path) = tmp.keep()?;
    tokio::fs::rename(&tmp_path, path).await.map_err(BatchRenameFailed)?;
    Ok(())
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A cheap per-process jitter seed for the crontab seconds field - spreads
/// concurrent deleters across a tape server's fleet off the exact minute
/// boundary. Not a source of cryptographic randomness; just deterministic
/// spread.
fn jitter_seed() -> u32 {
    std::process::id() % 60
}

async fn read_to_string_opt<R: tokio::io::AsyncRead + Unpin>(stream: Option<R>) -> String {
    let Some(mut stream) = stream else { return String::new() };
    let mut buf = String::new();
    let _ = stream.read_to_string(&mut buf).await;
    buf
}

/// The tape client's error codes appear "stderr-mixed stdout" in practice
/// (SPEC_FULL §7); read both streams to completion and concatenate so
/// [`tape::scan`] sees everything regardless of which stream `dsmc` wrote
/// a given line to.
async fn drain_combined(
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
) -> String {
    let (out, err) = tokio::join!(read_to_string_opt(stdout), read_to_string_opt(stderr));
    format!("{out}\n{err}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identifier {
        Identifier::parse(s).unwrap()
    }

    #[test]
    fn classify_no_objects_matched_is_whole_batch_success() {
        let ids = vec![id("aa"), id("bb"), id("cc")];
        let output = "ANS1302E No objects on server match query\n";
        let (deleted, requeue) = classify(output, false, &ids);
        assert_eq!(deleted.len(), 3);
        assert!(requeue.is_empty());
    }

    #[test]
    fn classify_partial_failure_requeues_unmatched() {
        let ids = vec![id("aa"), id("bb")];
        let output = "ANS1345E Object '/pool/out/aa' already deleted\n\
                       ANS9999E something else went wrong for '/pool/out/bb'\n";
        let (deleted, mut requeue) = classify(output, false, &ids);
        requeue.sort();
        assert_eq!(deleted, vec![id("aa")]);
        assert_eq!(requeue, vec![id("bb")]);
    }

    #[test]
    fn classify_clean_exit_with_no_codes_is_success() {
        let ids = vec![id("aa")];
        let (deleted, requeue) = classify("", true, &ids);
        assert_eq!(deleted, ids);
        assert!(requeue.is_empty());
    }

    #[test]
    fn classify_already_deleted_counts_as_success_even_on_nonzero_exit() {
        // Real dsmc behavior: reporting ANS1345E for an object can still
        // leave the process exit code non-zero even though no unclassified
        // code appeared.
        let ids = vec![id("aa"), id("bb")];
        let output = "ANS1345E Object '/pool/out/aa' already deleted\n";
        let (mut deleted, requeue) = classify(output, false, &ids);
        deleted.sort();
        assert_eq!(deleted, vec![id("aa")]);
        assert_eq!(requeue, vec![id("bb")]);
    }

    #[test]
    fn classify_silent_failure_requeues_everything() {
        let ids = vec![id("aa"), id("bb")];
        let (deleted, requeue) = classify("", false, &ids);
        assert!(deleted.is_empty());
        assert_eq!(requeue.len(), 2);
    }

    #[tokio::test]
    async fn enqueue_moves_trash_into_one_batch_atomically() {
        let tmp = tempfile::tempdir().unwrap();
        let text = format!("dir = {}\n", tmp.path().display());
        let conf_path = tmp.path().join("endit.conf");
        std::fs::write(&conf_path, text).unwrap();
        let cfg = Config::from_file(&conf_path).unwrap();
        crate::staging::verify_startup(&cfg).await.unwrap();

        tokio::fs::write(cfg.trash_dir().join("deadbeef"), b"").await.unwrap();
        tokio::fs::write(cfg.trash_dir().join("cafef00d"), b"").await.unwrap();

        let mut stats = DeleterStats::default();
        enqueue(&cfg, &mut stats).await.unwrap();

        assert!(!cfg.trash_dir().join("deadbeef").exists());
        assert!(!cfg.trash_dir().join("cafef00d").exists());

        let loaded = load_queue(&cfg.trash_queue_dir()).await.unwrap();
        let mut names: Vec<String> = loaded.ids.iter().map(|id| id.as_str().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["cafef00d".to_string(), "deadbeef".to_string()]);
        assert_eq!(stats.queued_files, 2);
    }

    #[tokio::test]
    async fn enqueue_in_debug_mode_relocates_instead_of_removing() {
        let tmp = tempfile::tempdir().unwrap();
        let text = format!("dir = {}\ndeleter_debug = true\n", tmp.path().display());
        let conf_path = tmp.path().join("endit.conf");
        std::fs::write(&conf_path, text).unwrap();
        let cfg = Config::from_file(&conf_path).unwrap();
        crate::staging::verify_startup(&cfg).await.unwrap();

        tokio::fs::write(cfg.trash_dir().join("deadbeef"), b"").await.unwrap();

        let mut stats = DeleterStats::default();
        enqueue(&cfg, &mut stats).await.unwrap();

        assert!(!cfg.trash_dir().join("deadbeef").exists());
        assert!(cfg.trash_debug_dir().join("deadbeef").exists());
    }

    #[tokio::test]
    async fn enqueue_is_noop_on_empty_trash() {
        let tmp = tempfile::tempdir().unwrap();
        let text = format!("dir = {}\n", tmp.path().display());
        let conf_path = tmp.path().join("endit.conf");
        std::fs::write(&conf_path, text).unwrap();
        let cfg = Config::from_file(&conf_path).unwrap();
        crate::staging::verify_startup(&cfg).await.unwrap();

        let mut stats = DeleterStats::default();
        enqueue(&cfg, &mut stats).await.unwrap();
        assert_eq!(count_batches(&cfg.trash_queue_dir()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn load_queue_dedupes_across_batch_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("queue");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        write_batch_atomic(&dir.join("100"), &[id("aa"), id("bb")]).await.unwrap();
        write_batch_atomic(&dir.join("200"), &[id("bb"), id("cc")]).await.unwrap();

        let loaded = load_queue(&dir).await.unwrap();
        let mut names: Vec<String> = loaded.ids.iter().map(|i| i.as_str().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["aa".to_string(), "bb".to_string(), "cc".to_string()]);
        assert_eq!(loaded.batch_paths.len(), 2);
    }

    #[tokio::test]
    async fn load_queue_skips_malformed_batch_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("queue");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("100"), b"not json").await.unwrap();
        write_batch_atomic(&dir.join("200"), &[id("aa")]).await.unwrap();

        let loaded = load_queue(&dir).await.unwrap();
        assert_eq!(loaded.ids, vec![id("aa")]);
        assert_eq!(loaded.batch_paths.len(), 1);
    }

    #[tokio::test]
    async fn full_cycle_enqueue_process_against_fake_tape_client() {
        let tmp = tempfile::tempdir().unwrap();
        let text = format!("dir = {}\n", tmp.path().display());
        let conf_path = tmp.path().join("endit.conf");
        std::fs::write(&conf_path, text).unwrap();
        let cfg = Config::from_file(&conf_path).unwrap();
        crate::staging::verify_startup(&cfg).await.unwrap();

        tokio::fs::write(cfg.out_dir().join("deadbeef"), b"x").await.unwrap();
        tokio::fs::write(cfg.trash_dir().join("deadbeef"), b"").await.unwrap();

        let mut stats = DeleterStats::default();
        enqueue(&cfg, &mut stats).await.unwrap();
        assert_eq!(count_batches(&cfg.trash_queue_dir()).await.unwrap(), 1);

        let loaded = load_queue(&cfg.trash_queue_dir()).await.unwrap();
        assert_eq!(loaded.ids, vec![id("deadbeef")]);

        // Stand in for a real `dsmc delete archive` invocation: emit the
        // benign "no objects matched" code the real client would if the
        // object were already gone.
        let mut worker = Worker::spawn(SpawnSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "echo 'ANS1302E No objects on server match query'".to_string()],
            cpu_limit_secs: 60,
            pipe_stdin: false,
        })
        .unwrap();
        let stdout = worker.stdout();
        let stderr = worker.stderr();
        let output = drain_combined(stdout, stderr).await;
        let status = worker.wait().await.unwrap();

        let (deleted, requeue) = classify(&output, status.success(), &loaded.ids);
        assert_eq!(deleted, vec![id("deadbeef")]);
        assert!(requeue.is_empty());

        for path in &loaded.batch_paths {
            tokio::fs::remove_file(path).await.unwrap();
        }
        assert_eq!(count_batches(&cfg.trash_queue_dir()).await.unwrap(), 0);
    }
}
