//! Daemon orchestrator: boot state, worker threads and file-system channel ownership.
//!
//! The primary worker runs the boot protocol on the primary channel. The secondary
//! worker waits on the boot gate, then serves files or runs a secondary boot depending
//! on [`BootState`]. The boot protocol itself is supplied through [`BootServer`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::channel::{ByteChannel, ChannelConfig, ChannelError, TransportScheme};
use crate::file::FileService;
use crate::fs::LocalFileSystem;
use crate::server::{ObexServer, RegisterError, RunExit, ServerControl};
use crate::sync::Semaphore;
use crate::wire::{PacketCodec, DEFAULT_REINIT_DELAY};

pub const DEFAULT_OPEN_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("{0} mode needs a boot server")]
    MissingBootServer(DaemonMode),
    #[error("{0} mode needs a file-system server")]
    MissingFsServer(DaemonMode),
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Which role currently owns the modem link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BootState {
    NoBoot = 0,
    PrimaryBoot = 1,
    SecondaryBoot = 2,
}

impl BootState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NoBoot,
            1 => Self::PrimaryBoot,
            _ => Self::SecondaryBoot,
        }
    }
}

/// [`BootState`] shared between threads. Writers publish with release ordering and
/// readers load with acquire, so state written before a gate post is seen after it.
#[derive(Debug)]
pub struct SharedBootState(AtomicU8);

impl SharedBootState {
    pub fn new(state: BootState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> BootState {
        BootState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: BootState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// The three daemon gates.
#[derive(Debug, Default)]
pub struct DaemonSync {
    /// Released once at startup to let the primary worker begin.
    pub start: Semaphore,
    /// Released whenever the secondary worker should re-read the boot state.
    pub boot: Semaphore,
    /// Released by anyone who decides the process must restart.
    pub exit: Semaphore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonMode {
    /// Boot the modem, then serve files between boots.
    Full,
    /// Serve files only; the modem is already up.
    FsOnly,
    /// Boot only; the file-system server never starts.
    BootOnly,
}

impl FromStr for DaemonMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "fs-only" => Ok(Self::FsOnly),
            "boot-only" => Ok(Self::BootOnly),
            other => Err(format!("unknown daemon mode {other:?}")),
        }
    }
}

impl fmt::Display for DaemonMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::FsOnly => "fs-only",
            Self::BootOnly => "boot-only",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootChannel {
    Primary,
    Secondary,
}

/// Boot protocol on one channel. Called in a loop by the owning worker; each call is
/// one boot attempt.
pub trait BootServer: Send + Sync {
    fn serve(&self, channel: BootChannel, ctx: &DaemonContext) -> anyhow::Result<()>;

    /// Whether a secondary boot channel exists.
    fn serves_secondary(&self) -> bool {
        false
    }
}

/// Shared daemon state handed to boot servers.
#[derive(Clone)]
pub struct DaemonContext {
    boot_state: Arc<SharedBootState>,
    sync: Arc<DaemonSync>,
    fs: Option<Arc<FsServer>>,
    stopping: Arc<AtomicBool>,
}

impl DaemonContext {
    fn new(initial: BootState, fs: Option<Arc<FsServer>>) -> Self {
        Self {
            boot_state: Arc::new(SharedBootState::new(initial)),
            sync: Arc::new(DaemonSync::default()),
            fs,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn boot_state(&self) -> BootState {
        self.boot_state.load()
    }

    pub fn set_boot_state(&self, state: BootState) {
        debug!("boot state -> {:?}", state);
        self.boot_state.store(state);
    }

    /// Let the secondary worker act on the current boot state.
    pub fn boot_completed(&self) {
        self.sync.boot.post();
    }

    /// Take the file-system channel back from a running file server.
    pub fn disconnect_fs(&self) {
        if let Some(fs) = &self.fs {
            fs.disconnect();
        }
    }

    pub fn request_exit(&self) {
        warn!("exit requested");
        self.sync.exit.post();
    }

    pub fn wait_for_exit(&self) {
        self.sync.exit.wait();
    }

    pub fn wait_for_exit_timeout(&self, timeout: Duration) -> bool {
        self.sync.exit.wait_timeout(timeout)
    }

    pub fn fs_server(&self) -> Option<&Arc<FsServer>> {
        self.fs.as_ref()
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

/// File-system server bound to one channel, restarted after every disconnect while
/// the boot state stays [`BootState::NoBoot`].
pub struct FsServer {
    config: ChannelConfig,
    channel: Arc<dyn ByteChannel>,
    inbox: String,
    open_retry: Duration,
    reinit_delay: Duration,
    max_frame_size: Option<u16>,
    in_use: AtomicBool,
    stopped: AtomicBool,
    active: Mutex<Option<Arc<ServerControl>>>,
}

impl FsServer {
    pub fn new(config: ChannelConfig, channel: Arc<dyn ByteChannel>, inbox: impl Into<String>) -> Self {
        Self {
            config,
            channel,
            inbox: inbox.into(),
            open_retry: DEFAULT_OPEN_RETRY,
            reinit_delay: DEFAULT_REINIT_DELAY,
            max_frame_size: None,
            in_use: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            active: Mutex::new(None),
        }
    }

    pub fn with_open_retry(mut self, delay: Duration) -> Self {
        self.open_retry = delay;
        self
    }

    pub fn with_reinit_delay(mut self, delay: Duration) -> Self {
        self.reinit_delay = delay;
        self
    }

    pub fn with_max_frame_size(mut self, max: Option<u16>) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// True while a server run owns the channel.
    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Serve until the boot state leaves `NoBoot` or the server is stopped.
    pub fn serve(&self, boot_state: &SharedBootState) {
        while boot_state.load() == BootState::NoBoot && !self.stopped.load(Ordering::Acquire) {
            match self.run_once(boot_state) {
                Ok(Some(exit)) => debug!("{}: run ended: {:?}", self.config.name, exit),
                Ok(None) => break,
                Err(e) => {
                    error!("{}: {}", self.config.name, e);
                    thread::sleep(self.open_retry);
                }
            }
        }
    }

    /// One open, serve, close cycle. `Ok(None)` means the open was abandoned because
    /// the boot state changed or a disconnect was requested while retrying.
    pub fn run_once(&self, boot_state: &SharedBootState) -> Result<Option<RunExit>, DaemonError> {
        let control = ServerControl::new();
        *self.active.lock() = Some(control.clone());
        let result = self.run_with(&control, boot_state);
        *self.active.lock() = None;
        result
    }

    fn run_with(
        &self,
        control: &Arc<ServerControl>,
        boot_state: &SharedBootState,
    ) -> Result<Option<RunExit>, DaemonError> {
        if !self.open_channel(control, boot_state) {
            return Ok(None);
        }
        self.in_use.store(true, Ordering::Release);
        info!("{}: file-system channel open ({})", self.config.name, self.config.scheme);

        let result = self.serve_open_channel(control);
        self.channel.close();
        self.in_use.store(false, Ordering::Release);
        result.map(Some)
    }

    fn serve_open_channel(&self, control: &Arc<ServerControl>) -> Result<RunExit, DaemonError> {
        if self.config.scheme == TransportScheme::Shm {
            self.channel.write_all(&[0])?;
        }
        let codec = PacketCodec::new(self.channel.clone()).with_reinit_delay(self.reinit_delay);
        let service = FileService::new(LocalFileSystem, self.inbox.clone());
        let mut server = ObexServer::new(codec, service).with_control(control.clone());
        if let Some(max) = self.max_frame_size {
            server = server.with_max_packet_len(max);
        }
        FileService::register(&mut server)?;
        Ok(server.run())
    }

    fn open_channel(&self, control: &ServerControl, boot_state: &SharedBootState) -> bool {
        loop {
            if control.disconnect_requested() || self.stopped.load(Ordering::Acquire) {
                info!("{}: open abandoned, disconnect requested", self.config.name);
                return false;
            }
            let state = boot_state.load();
            if state != BootState::NoBoot {
                info!("{}: open abandoned, boot state is {:?}", self.config.name, state);
                return false;
            }
            match self.channel.open() {
                Ok(()) => return true,
                Err(e) => {
                    debug!("{}: open failed: {}", self.config.name, e);
                    thread::sleep(self.open_retry);
                }
            }
        }
    }

    /// Stop the current run and close the channel so a blocked read returns.
    pub fn disconnect(&self) {
        if let Some(control) = self.active.lock().as_ref() {
            control.request_disconnect();
        }
        self.channel.close();
    }

    /// Disconnect and do not start another run.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.disconnect();
    }
}

/// Configured but not yet started daemon.
pub struct Daemon {
    mode: DaemonMode,
    boot: Option<Arc<dyn BootServer>>,
    fs: Option<FsServer>,
}

impl Daemon {
    pub fn new(mode: DaemonMode) -> Self {
        Self {
            mode,
            boot: None,
            fs: None,
        }
    }

    pub fn with_boot_server(mut self, boot: Arc<dyn BootServer>) -> Self {
        self.boot = Some(boot);
        self
    }

    pub fn with_fs_server(mut self, fs: FsServer) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Spawn the workers and open the first gate.
    pub fn start(self) -> Result<DaemonHandle, DaemonError> {
        let mode = self.mode;
        if mode != DaemonMode::FsOnly && self.boot.is_none() {
            return Err(DaemonError::MissingBootServer(mode));
        }
        if mode == DaemonMode::FsOnly && self.fs.is_none() {
            return Err(DaemonError::MissingFsServer(mode));
        }
        let fs = match mode {
            DaemonMode::BootOnly => None,
            _ => self.fs.map(Arc::new),
        };
        let initial = match mode {
            DaemonMode::FsOnly => BootState::NoBoot,
            _ => BootState::PrimaryBoot,
        };
        let ctx = DaemonContext::new(initial, fs.clone());
        let mut threads = Vec::new();

        let primary_boot = if mode == DaemonMode::FsOnly { None } else { self.boot.clone() };
        if let Some(boot) = primary_boot {
            let ctx = ctx.clone();
            threads.push(spawn("fild-primary", move || primary_loop(&ctx, &*boot))?);
        }

        let secondary_boot = self.boot.filter(|b| b.serves_secondary() && mode != DaemonMode::FsOnly);
        if fs.is_some() || secondary_boot.is_some() {
            let ctx = ctx.clone();
            threads.push(spawn("fild-secondary", move || {
                secondary_loop(&ctx, secondary_boot.as_deref())
            })?);
        }

        info!("daemon started in {} mode", mode);
        if mode == DaemonMode::FsOnly {
            ctx.set_boot_state(BootState::NoBoot);
            ctx.boot_completed();
        } else {
            ctx.sync.start.post();
        }
        Ok(DaemonHandle { ctx, threads })
    }
}

fn spawn<F>(name: &'static str, f: F) -> Result<JoinHandle<()>, DaemonError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| DaemonError::Spawn { name, source })
}

fn primary_loop(ctx: &DaemonContext, boot: &dyn BootServer) {
    ctx.sync.start.wait();
    while !ctx.is_stopping() {
        if let Err(e) = boot.serve(BootChannel::Primary, ctx) {
            error!("primary boot: {:#}", e);
        }
    }
}

fn secondary_loop(ctx: &DaemonContext, boot: Option<&dyn BootServer>) {
    loop {
        ctx.sync.boot.wait();
        if ctx.is_stopping() {
            break;
        }
        match ctx.boot_state() {
            BootState::NoBoot => {
                if let Some(fs) = &ctx.fs {
                    fs.serve(&ctx.boot_state);
                }
            }
            BootState::SecondaryBoot => {
                if let Some(boot) = boot {
                    if let Err(e) = boot.serve(BootChannel::Secondary, ctx) {
                        error!("secondary boot: {:#}", e);
                    }
                }
            }
            BootState::PrimaryBoot => debug!("secondary worker idle during primary boot"),
        }
    }
}

/// Running daemon.
pub struct DaemonHandle {
    ctx: DaemonContext,
    threads: Vec<JoinHandle<()>>,
}

impl DaemonHandle {
    pub fn context(&self) -> &DaemonContext {
        &self.ctx
    }

    /// Stop the workers and join them. Boot servers must return from `serve` for the
    /// primary worker to finish.
    pub fn shutdown(self) {
        self.ctx.stopping.store(true, Ordering::Release);
        if let Some(fs) = &self.ctx.fs {
            fs.stop();
        }
        self.ctx.sync.start.post();
        self.ctx.sync.boot.post();
        for t in self.threads {
            let name = t.thread().name().unwrap_or("worker").to_string();
            if t.join().is_err() {
                error!("{} panicked", name);
            }
        }
        info!("daemon stopped");
    }
}
