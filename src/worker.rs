//! Child-process supervision: every tape-client invocation runs as a
//! forked-then-`exec`ed OS process, never an in-process task, so the
//! supervisor can signal a real PID (SPEC_FULL §9, "Forked workers").

use std::io;
use std::os::unix::process::CommandExt;
use std::process::Stdio;

use tokio::process::{Child as TokioChild, Command};
use tracing::{debug, warn};

/// A child process failed to fork/exec. One of the handful of `die`-worthy
/// failures (SPEC_FULL §7): a supervisor that can't launch workers at all
/// has nothing useful left to do, so this is always fatal to the daemon
/// that hit it rather than logged-and-retried like a single bad file.
#[derive(Debug, thiserror::Error)]
#[error("failed to spawn tape-client worker: {0}")]
pub struct ForkFailed(#[from] pub io::Error);

/// Everything needed to launch one tape-client invocation.
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    /// `RLIMIT_CPU` installed via a `pre_exec` hook before `exec` (SPEC_FULL
    /// §5, `dsmc_cpulimit`).
    pub cpu_limit_secs: u64,
    /// Piped so the caller can write `"A\n"` (retriever) or leave closed.
    pub pipe_stdin: bool,
}

/// A supervised child process running one tape-client invocation. Killing it
/// always sends `SIGKILL` directly to the tape client per the tape client's
/// own guidance that `SIGTERM` can crash it mid-transfer (SPEC_FULL §5); the
/// supervisor itself is what receives and reacts to `SIGTERM`/`SIGINT`.
pub struct Worker {
    pub pid: u32,
    child: TokioChild,
}

impl Worker {
    /// Forks and execs the tape client described by `spec`.
    pub fn spawn(spec: SpawnSpec) -> Result<Self, ForkFailed> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.stdin(if spec.pipe_stdin { Stdio::piped() } else { Stdio::null() });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let cpu_limit = spec.cpu_limit_secs;
        // SAFETY: the closure only calls async-signal-safe libc functions
        // (setrlimit) between fork and exec, as required by `pre_exec`.
        unsafe {
            cmd.pre_exec(move || set_cpu_rlimit(cpu_limit));
        }

        let child = cmd.spawn().map_err(ForkFailed)?;
        let pid = child.id().ok_or_else(|| {
            ForkFailed(io::Error::new(io::ErrorKind::Other, "spawned child has no pid"))
        })?;

        debug!(pid, program = %spec.program, "spawned tape-client worker");
        Ok(Self { pid, child })
    }

    pub fn stdin(&mut self) -> Option<tokio::process::ChildStdin> {
        self.child.stdin.take()
    }

    pub fn stdout(&mut self) -> Option<tokio::process::ChildStdout> {
        self.child.stdout.take()
    }

    pub fn stderr(&mut self) -> Option<tokio::process::ChildStderr> {
        self.child.stderr.take()
    }

    /// Non-blocking check for exit, used by the supervisor's polling loop
    /// instead of a synchronous `.wait()` (SPEC_FULL §5).
    pub fn try_wait(&mut self) -> io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    /// Awaits full exit; only ever raced against the sleep timer or
    /// cancellation token in a `tokio::select!`, never called bare.
    pub async fn wait(&mut self) -> io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Sends `SIGKILL` directly to the child PID.
    pub fn kill_now(&mut self) {
        // SAFETY: `self.pid` is this process's own child; kill(2) with a
        // valid pid and no special flags has no safety preconditions beyond
        // a correct signal number.
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                warn!(pid = self.pid, error = %err, "failed to signal worker");
            }
        }
    }
}

fn set_cpu_rlimit(secs: u64) -> io::Result<()> {
    let limit = libc::rlimit { rlim_cur: secs, rlim_max: secs };
    // SAFETY: setrlimit is async-signal-safe and `limit` is a valid, live
    // value for the duration of the call.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CPU, &limit) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawns_and_waits_for_true() {
        let mut w = Worker::spawn(SpawnSpec {
            program: "true".into(),
            args: vec![],
            cpu_limit_secs: 60,
            pipe_stdin: false,
        })
        .unwrap();
        let status = w.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn kill_now_terminates_sleeper() {
        let mut w = Worker::spawn(SpawnSpec {
            program: "sleep".into(),
            args: vec!["30".into()],
            cpu_limit_secs: 60,
            pipe_stdin: false,
        })
        .unwrap();
        w.kill_now();
        let status = w.wait().await.unwrap();
        assert!(!status.success());
    }

    #[test]
    fn spawn_of_nonexistent_program_is_fork_failed() {
        let err = Worker::spawn(SpawnSpec {
            program: "/no/such/tape-client-binary".into(),
            args: vec![],
            cpu_limit_secs: 60,
            pipe_stdin: false,
        })
        .unwrap_err();
        assert_eq!(err.0.kind(), io::ErrorKind::NotFound);
    }
}
