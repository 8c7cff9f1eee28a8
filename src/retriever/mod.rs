//! The retriever: reads pending retrieval requests, groups them by tape
//! volume to minimize mounts, and runs up to `retriever_maxworkers`
//! parallel tape-read sessions (SPEC_FULL §4.3).

pub mod hint;
mod policy;
pub mod request;

pub use policy::{buffer_state, should_skip_volume, BufferState};

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, SystemTime};

use itertools::Itertools;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, OverrideState};
use crate::identifier::Identifier;
use crate::signals::SignalHandles;
use crate::staging;
use crate::stats::RetrieverStats;
use crate::tape;
use crate::worker::{SpawnSpec, Worker};
use hint::TapeHint;
use request::{LiveRequest, RequestCache};

/// Requests grouped by the tape volume they live on.
struct Job {
    volume: String,
    requests: HashMap<Identifier, u64>,
    tsoldest: SystemTime,
    tsnewest: SystemTime,
}

fn group_by_volume(live: Vec<LiveRequest>, hint: &TapeHint) -> Vec<Job> {
    let grouped = live.into_iter().into_group_map_by(|r| hint.volume_for(&r.id));

    let mut jobs: Vec<Job> = grouped
        .into_iter()
        .map(|(volume, reqs)| {
            let tsoldest = reqs.iter().map(|r| r.ts).min().unwrap();
            let tsnewest = reqs.iter().map(|r| r.ts).max().unwrap();
            let requests = reqs.into_iter().map(|r| (r.id, r.file_size)).collect();
            Job { volume, requests, tsoldest, tsnewest }
        })
        .collect();
    jobs.sort_by_key(|j| j.tsoldest);
    jobs
}

struct RetrieveWorker {
    worker: Worker,
    volume: String,
    ids: HashMap<Identifier, u64>,
    _listfile: tempfile::NamedTempFile,
    output: tokio::task::JoinHandle<String>,
}

#[derive(Default)]
struct State {
    hint: TapeHint,
    cache: RequestCache,
    lastmount: HashMap<String, SystemTime>,
    workers: Vec<RetrieveWorker>,
}

impl State {
    fn held_volumes(&self) -> std::collections::HashSet<String> {
        self.workers.iter().map(|w| w.volume.clone()).collect()
    }
}

/// Runs the retriever supervisor loop until `signals.shutdown` fires.
pub async fn run(cfg: Config, signals: SignalHandles) -> anyhow::Result<()> {
    let mut state = State::default();
    let mut stats = RetrieverStats::default();
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
            Err(e) if e.downcast_ref::<crate::worker::ForkFailed>().is_some() => {
                error!(error = %e, "retriever failed to fork a worker, exiting");
                for w in &mut state.workers {
                    w.worker.kill_now();
                }
                return Err(e);
            },
            Err(e) => {
                error!(error = %e, "retriever tick failed");
                false
            },
        };

        stats.stamp();
        if let Err(e) = stats.emit(&cfg.statsdir, &cfg.hsm).await {
            warn!(error = %e, "failed to emit retriever stats");
        }

        let waiting_for_slot = state.workers.len() >= cfg.retriever_maxworkers as usize;
        let next_sleep = if reaped {
            Duration::from_secs(1)
        } else if waiting_for_slot {
            Duration::from_millis(500)
        } else {
            Duration::from_secs(cfg.sleeptime)
        };

        tokio::select! {
            _ = sleep(next_sleep) => {},
            _ = signals.shutdown.cancelled() => break,
        }
    }

    for w in &mut state.workers {
        w.worker.kill_now();
    }
    info!("retriever shutting down");
    Ok(())
}

#[instrument(skip_all)]
async fn tick(
    cfg: &Config,
    state: &mut State,
    stats: &mut RetrieverStats,
    signals: &SignalHandles,
) -> anyhow::Result<bool> {
    let before = state.workers.len();
    reap_finished(cfg, state, stats).await?;
    let reaped = state.workers.len() < before;

    if let Some(new_hint) = hint::reload_if_changed(
        cfg.retriever_hintfile.as_deref().unwrap_or(Path::new("")),
        &state.hint,
    )
    .await
    {
        state.hint = new_hint;
        state.cache.clear();
        info!(entries = state.hint.len(), "reloaded tape hint file");
    }
    stats.hintfile_entries = state.hint.len() as u64;
    stats.hintfile_mtime = state
        .hint
        .mtime()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let live = request::ingest(&cfg.request_dir(), &cfg.in_dir(), &mut state.cache).await?;
    stats.requests_files = live.len() as u64;
    stats.requests_bytes = live.iter().map(|r| r.file_size).sum();

    let held = state.held_volumes();
    let jobs: Vec<Job> = group_by_volume(live, &state.hint)
        .into_iter()
        .filter(|j| !held.contains(&j.volume))
        .collect();

    let (free, total) = disk_stats(&cfg.in_dir()).unwrap_or((u64::MAX, u64::MAX));
    stats.in_avail_bytes = free;
    let buffer = buffer_state(
        free,
        total,
        cfg.retriever_buffersize,
        cfg.retriever_backlogthreshold,
        cfg.retriever_killthreshold,
    );

    if buffer == BufferState::Kill {
        warn!("in/ filesystem below kill threshold, terminating all retrieve workers");
        for w in &mut state.workers {
            w.worker.kill_now();
        }
    }

    let usr1 = signals.take_usr1();
    let now = SystemTime::now();

    if buffer != BufferState::Backoff && buffer != BufferState::Kill {
        for job in jobs {
            if state.workers.len() >= cfg.retriever_maxworkers as usize {
                break;
            }
            let lastmount = state.lastmount.get(&job.volume).copied();
            if should_skip_volume(
                &job.volume,
                lastmount,
                now,
                Duration::from_secs(cfg.retriever_remountdelay),
                job.tsoldest,
                job.tsnewest,
                Duration::from_secs(cfg.retriever_reqlistfillwait),
                Duration::from_secs(cfg.retriever_reqlistfillwaitmax),
                usr1,
            ) {
                continue;
            }
            spawn_worker(cfg, state, job).await?;
        }
    }

    stats.working_files = state.workers.iter().map(|w| w.ids.len() as u64).sum();
    stats.working_bytes = state.workers.iter().flat_map(|w| w.ids.values()).sum();
    stats.busyworkers = state.workers.len() as u32;
    stats.maxworkers = cfg.retriever_maxworkers;

    Ok(reaped)
}

async fn spawn_worker(cfg: &Config, state: &mut State, job: Job) -> anyhow::Result<()> {
    let request_dir = cfg.request_dir();
    let in_dir = cfg.in_dir();
    let out_dir = cfg.out_dir();

    let mut lines = Vec::new();
    let mut ids = HashMap::new();
    for (id, size) in &job.requests {
        if !request::still_valid(&request_dir, &in_dir, id).await {
            continue;
        }
        lines.push(out_dir.join(id.as_str()).display().to_string());
        ids.insert(id.clone(), *size);
    }

    if lines.is_empty() {
        debug!(volume = %job.volume, "no valid requests left for volume, skipping spawn");
        return Ok(());
    }

    for (id, expected_size) in &ids {
        let path = in_dir.join(id.as_str());
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if meta.len() != *expected_size {
                warn!(id = %id, "removing size-mismatched in/ leftover before retrieve");
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
    }

    let listfile = staging::write_filelist(&cfg.requestlists_dir(), &job.volume, &lines)?;
    let args = tape::retrieve_args(
        &cfg.dsmc_display_opts,
        &cfg.dsmcopts,
        &listfile.path().display().to_string(),
        &in_dir.display().to_string(),
    );

    let mut worker = Worker::spawn(SpawnSpec {
        program: "dsmc".to_string(),
        args,
        cpu_limit_secs: cfg.dsmc_cpulimit,
        pipe_stdin: true,
    })?;

    if let Some(mut stdin) = worker.stdin() {
        let _ = stdin.write_all(b"A\n").await;
        let _ = stdin.shutdown().await;
    }

    let pid = worker.pid;
    let stdout = worker.stdout();
    let output = tokio::spawn(async move { drain_with_prompt_watch(stdout, pid).await });

    info!(pid, volume = %job.volume, count = ids.len(), "spawned retrieve worker");
    state.workers.push(RetrieveWorker {
        worker,
        volume: job.volume,
        ids,
        _listfile: listfile,
        output,
    });
    Ok(())
}

fn prompt_re() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\(yes/no\)|continue\?").unwrap())
}

/// Reads a worker's stdout to completion, accumulating it for later
/// classification. If a line looks like an interactive prompt (the tape
/// client unexpectedly asking a question despite `"A\n"` on stdin), kills
/// the tape client immediately rather than waiting for an unanswerable
/// prompt to hang the worker (SPEC_FULL §4.3).
async fn drain_with_prompt_watch(stdout: Option<tokio::process::ChildStdout>, pid: u32) -> String {
    let Some(mut stdout) = stdout else { return String::new() };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        if let Ok(text) = std::str::from_utf8(&buf) {
            if prompt_re().is_match(text) {
                warn!(pid, "detected interactive prompt on tape-client stdout, killing it");
                // SAFETY: pid is our own child's pid.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn reap_finished(
    cfg: &Config,
    state: &mut State,
    stats: &mut RetrieverStats,
) -> anyhow::Result<()> {
    let mut i = 0;
    while i < state.workers.len() {
        match state.workers[i].worker.try_wait()? {
            None => i += 1,
            Some(status) => {
                let w = state.workers.remove(i);
                let output = w.output.await.unwrap_or_default();
                let errors = tape::error_lines(&output);

                if status.success() && errors.is_empty() {
                    for (id, size) in &w.ids {
                        let retrieved = cfg.in_dir().join(id.as_str());
                        if tokio::fs::try_exists(&retrieved).await.unwrap_or(false) {
                            stats.staged_bytes += size;
                            stats.staged_files += 1;
                        }
                    }
                    info!(volume = %w.volume, count = w.ids.len(), "retrieve worker completed");
                } else {
                    for line in &errors {
                        warn!(volume = %w.volume, "tape client error: {line}");
                    }
                    for (id, expected_size) in &w.ids {
                        let path = cfg.in_dir().join(id.as_str());
                        if let Ok(meta) = tokio::fs::metadata(&path).await {
                            if meta.len() != *expected_size {
                                warn!(id = %id, "size mismatch on retrieved file, likely duplicate archival");
                            }
                        }
                    }
                    stats.stage_retries += w.ids.len() as u64;
                    // Let the supervisor settle before reconsidering this
                    // volume, so a broken tape isn't hammered with remounts
                    // (SPEC_FULL §4.3 "Completion + retry").
                    sleep(Duration::from_secs(cfg.sleeptime)).await;
                }

                state.lastmount.insert(w.volume, SystemTime::now());
            },
        }
    }
    Ok(())
}

fn disk_stats(path: &Path) -> io::Result<(u64, u64)> {
    let c = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    // SAFETY: `stat` is zero-initialized and statvfs fills it in on success;
    // `c` is a valid NUL-terminated path for the duration of the call.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let free = stat.f_bavail as u64 * stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * stat.f_frsize as u64;
    Ok((free, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use request::LiveRequest;

    #[test]
    fn group_by_volume_tracks_extremes_and_defaults_unmapped() {
        let now = SystemTime::now();
        let earlier = now - Duration::from_secs(100);
        let live = vec![
            LiveRequest { id: Identifier::parse("aa").unwrap(), file_size: 1, ts: now },
            LiveRequest { id: Identifier::parse("bb").unwrap(), file_size: 2, ts: earlier },
        ];
        let jobs = group_by_volume(live, &TapeHint::default());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].volume, hint::DEFAULT_VOLUME);
        assert_eq!(jobs[0].tsoldest, earlier);
        assert_eq!(jobs[0].tsnewest, now);
    }

    #[test]
    fn disk_stats_reads_real_filesystem() {
        let (free, total) = disk_stats(Path::new("/tmp")).unwrap();
        assert!(total > 0);
        assert!(free <= total);
    }

    /// Drives `reap_finished` against a fake tape client standing in for
    /// `dsmc retrieve`: a clean exit with the requested file materialized in
    /// `in/` counts as staged, matching what a real successful retrieve
    /// leaves behind.
    #[tokio::test]
    async fn reap_finished_stages_on_clean_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let text = format!("dir = {}\n", tmp.path().display());
        let conf_path = tmp.path().join("endit.conf");
        std::fs::write(&conf_path, text).unwrap();
        let cfg = Config::from_file(&conf_path).unwrap();
        crate::staging::verify_startup(&cfg).await.unwrap();

        let id = Identifier::parse("deadbeef").unwrap();
        tokio::fs::write(cfg.in_dir().join(id.as_str()), b"data").await.unwrap();

        let listfile = staging::write_filelist(&cfg.requestlists_dir(), "VOL1", &[]).unwrap();
        let mut worker = Worker::spawn(SpawnSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "exit 0".to_string()],
            cpu_limit_secs: 60,
            pipe_stdin: false,
        })
        .unwrap();
        let stdout = worker.stdout();
        let pid = worker.pid;
        let output = tokio::spawn(async move { drain_with_prompt_watch(stdout, pid).await });

        let mut state = State::default();
        state.workers.push(RetrieveWorker {
            worker,
            volume: "VOL1".to_string(),
            ids: HashMap::from([(id.clone(), 4u64)]),
            _listfile: listfile,
            output,
        });
        let mut stats = RetrieverStats::default();

        for _ in 0..50 {
            if state.workers[0].worker.try_wait().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        reap_finished(&cfg, &mut state, &mut stats).await.unwrap();

        assert!(state.workers.is_empty());
        assert_eq!(stats.staged_files, 1);
        assert_eq!(stats.staged_bytes, 4);
        assert_eq!(stats.stage_retries, 0);
        assert!(state.lastmount.contains_key("VOL1"));
    }
}
