// fild: modem file-system daemon for Linux hosts.

mod config;
mod device;

use std::sync::Arc;

use anyhow::Context;
use fild_core::{Daemon, DaemonMode, FsServer};

const VERSION: &str = env!("CARGO_PKG_VERSION");

enum Stop {
    Signal,
    ExitGate,
}

fn main() -> anyhow::Result<()> {
    let mut fs_only = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fild {}", VERSION);
                return Ok(());
            }
            "--fs-only" => fs_only = true,
            other => anyhow::bail!("unknown argument {other:?} (try --version or --fs-only)"),
        }
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut cfg = config::load();
    if fs_only {
        cfg.mode = DaemonMode::FsOnly;
    }
    log::info!(
        "fild {} mode={} channel={} scheme={} inbox={:?}",
        VERSION,
        cfg.mode,
        cfg.fs_channel,
        cfg.scheme,
        cfg.inbox
    );

    let channel = Arc::new(device::DeviceChannel::new(cfg.channel()));
    let fs = FsServer::new(cfg.channel(), channel, cfg.inbox.clone())
        .with_open_retry(cfg.open_retry())
        .with_reinit_delay(cfg.reinit_delay())
        .with_max_frame_size(cfg.max_frame_size);
    // Boot servers are linked in by board-specific builds; this binary serves files.
    let handle = Daemon::new(cfg.mode)
        .with_fs_server(fs)
        .start()
        .context("failed to start daemon")?;
    let ctx = handle.context().clone();

    let rt = tokio::runtime::Runtime::new()?;
    let stop = rt.block_on(async {
        let gate = ctx.clone();
        let exit = tokio::task::spawn_blocking(move || gate.wait_for_exit());
        tokio::select! {
            r = shutdown_signal() => r.map(|()| Stop::Signal),
            _ = exit => Ok(Stop::ExitGate),
        }
    });
    ctx.disconnect_fs();
    // Workers may sit in a blocking device read; they end with the process.
    rt.shutdown_background();

    match stop? {
        Stop::Signal => {
            log::info!("shutting down");
            Ok(())
        }
        Stop::ExitGate => Err(anyhow::anyhow!("a worker requested a restart")),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
