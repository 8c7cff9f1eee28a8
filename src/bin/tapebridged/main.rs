mod args;

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, Level};

use args::{Args, Command};
use tapebridge::config::Config;
use tapebridge::signals::SignalHandles;
use tapebridge::staging;
use tapebridge::{archiver, deleter, retriever};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt().with_max_level(Level::TRACE).init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let cfg = match Config::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Config load failure is one of the four `die`-worthy cases
            // (SPEC_FULL §7); there is no sensible partial startup.
            error!(error = %e, path = %args.config.display(), "failed to load configuration");
            return ExitCode::from(2);
        },
    };

    if let Err(e) = staging::verify_startup(&cfg).await {
        error!(error = %e, "staging tree verification failed");
        return ExitCode::from(2);
    }
    if let Err(e) = staging::sweep_stale_on_startup(&cfg).await {
        error!(error = %e, "startup stale-file sweep failed");
        return ExitCode::from(2);
    }

    let result = match args.command {
        Command::Archiver => run_one(cfg, archiver::run).await,
        Command::Retriever => run_one(cfg, retriever::run).await,
        Command::Deleter => run_one(cfg, deleter::run).await,
        Command::Run => run_all(cfg).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon exited with error");
            ExitCode::FAILURE
        },
    }
}

async fn run_one<F, Fut>(cfg: Config, daemon: F) -> anyhow::Result<()>
where
    F: FnOnce(Config, SignalHandles) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let signals = SignalHandles::install()?;
    daemon(cfg, signals).await
}

/// Drives all three daemons as independent tasks inside one process,
/// sharing nothing but the filesystem (SPEC_FULL §2, §5). `USR1` dispatch
/// stays per-daemon (each gets its own [`Usr1Flag`]), but all three share
/// one shutdown [`CancellationToken`]: besides the usual OS-signal path,
/// a `die`-worthy failure in one daemon (SPEC_FULL §7, e.g. the deleter
/// losing its queue-file rename) cancels that same token, so the other
/// two unwind immediately instead of running on orphaned.
async fn run_all(cfg: Config) -> anyhow::Result<()> {
    let shutdown = tokio_util::sync::CancellationToken::new();
    let archiver_signals = SignalHandles::install_with_shutdown(shutdown.clone())?;
    let retriever_signals = SignalHandles::install_with_shutdown(shutdown.clone())?;
    let deleter_signals = SignalHandles::install_with_shutdown(shutdown.clone())?;

    let archiver_cfg = cfg.clone();
    let retriever_cfg = cfg.clone();
    let deleter_cfg = cfg;

    let archiver_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let res = archiver::run(archiver_cfg, archiver_signals).await;
            if res.is_err() {
                shutdown.cancel();
            }
            res
        }
    });
    let retriever_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let res = retriever::run(retriever_cfg, retriever_signals).await;
            if res.is_err() {
                shutdown.cancel();
            }
            res
        }
    });
    let deleter_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let res = deleter::run(deleter_cfg, deleter_signals).await;
            if res.is_err() {
                shutdown.cancel();
            }
            res
        }
    });

    let (archiver_res, retriever_res, deleter_res) =
        tokio::join!(archiver_task, retriever_task, deleter_task);

    let mut fatal = None;
    for (name, res) in [
        ("archiver", archiver_res),
        ("retriever", retriever_res),
        ("deleter", deleter_res),
    ] {
        match res {
            Ok(Ok(())) => info!(daemon = name, "daemon exited cleanly"),
            Ok(Err(e)) => {
                error!(daemon = name, error = %e, "daemon exited with error");
                fatal.get_or_insert(e);
            },
            Err(e) => error!(daemon = name, error = %e, "daemon task panicked"),
        }
    }

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
