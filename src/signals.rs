//! A single signal-dispatch point (SPEC_FULL §9): OS signals are turned into
//! plain async events selected alongside the sleep timer in the supervisor's
//! `tokio::select!`, never handled with a libc signal handler, so there is
//! no async-signal-safety concern and no I/O happens inside a handler.
//!
//! `USR1` is level-triggered-for-one-iteration: [`SignalHandles::take_usr1`]
//! clears the flag it reads, so a caller that doesn't check it this tick
//! doesn't see it fire again until another `USR1` arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared flag set by the `USR1` listener task and drained by the
/// supervisor loop via [`SignalHandles::take_usr1`].
#[derive(Clone, Default)]
pub struct Usr1Flag(Arc<AtomicBool>);

impl Usr1Flag {
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Spawns the background tasks that translate `SIGUSR1`/`SIGTERM`/`SIGINT`/
/// `SIGQUIT`/`SIGHUP` into a [`Usr1Flag`] and a [`CancellationToken`]
/// respectively, and returns handles the supervisor loop polls.
pub struct SignalHandles {
    pub usr1: Usr1Flag,
    pub shutdown: CancellationToken,
}

impl SignalHandles {
    /// Installs the signal listeners for one daemon. Each call spawns its
    /// own set of tasks; call once per supervisor.
    pub fn install() -> anyhow::Result<Self> {
        Self::install_with_shutdown(CancellationToken::new())
    }

    /// Like [`SignalHandles::install`], but the supervisor's shutdown token
    /// is supplied by the caller rather than created fresh. Lets several
    /// daemons in one process share a single token, so cancelling it from
    /// outside any one daemon's own signal listeners - e.g. a sibling
    /// daemon hitting a `die`-worthy failure - reaches all of them.
    pub fn install_with_shutdown(shutdown: CancellationToken) -> anyhow::Result<Self> {
        let usr1 = Usr1Flag::default();

        spawn_usr1_listener(usr1.clone())?;
        for kind in [
            SignalKind::terminate(),
            SignalKind::interrupt(),
            SignalKind::quit(),
            SignalKind::hangup(),
        ] {
            spawn_shutdown_listener(kind, shutdown.clone())?;
        }

        Ok(Self { usr1, shutdown })
    }

    pub fn take_usr1(&self) -> bool {
        self.usr1.take()
    }
}

fn spawn_usr1_listener(flag: Usr1Flag) -> anyhow::Result<()> {
    let mut stream = signal(SignalKind::user_defined1())?;
    tokio::spawn(async move {
        loop {
            if stream.recv().await.is_none() {
                return;
            }
            info!("received SIGUSR1, bypassing delays for next iteration");
            flag.set();
        }
    });
    Ok(())
}

fn spawn_shutdown_listener(kind: SignalKind, token: CancellationToken) -> anyhow::Result<()> {
    let mut stream = signal(kind)?;
    tokio::spawn(async move {
        if stream.recv().await.is_some() {
            info!(?kind, "received shutdown signal");
            token.cancel();
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usr1_flag_is_level_triggered_once() {
        let flag = Usr1Flag::default();
        assert!(!flag.take());
        flag.set();
        assert!(flag.take());
        assert!(!flag.take());
    }
}
