//! Load config from file and environment.

use fild_core::{ChannelConfig, DaemonMode, TransportScheme};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration. File: $FILD_CONFIG, ~/.config/fild/config.toml or
/// /etc/fild/config.toml. Env overrides: FILD_MODE, FILD_FS_CHANNEL, FILD_INBOX,
/// FILD_SCHEME, FILD_SPEED, FILD_FLOW_CONTROL, FILD_MAX_FRAME_SIZE, FILD_OPEN_RETRY_MS,
/// FILD_REINIT_DELAY_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_mode")]
    pub mode: DaemonMode,
    /// Device backing the file-system channel (default /dev/ttyACM1).
    #[serde(default = "default_fs_channel")]
    pub fs_channel: String,
    /// Prefix prepended to every requested name.
    #[serde(default)]
    pub inbox: String,
    #[serde(default = "default_scheme")]
    pub scheme: TransportScheme,
    #[serde(default = "default_speed")]
    pub speed: u32,
    #[serde(default = "default_flow_control")]
    pub flow_control: bool,
    /// Cap on the packet size proposed at CONNECT.
    #[serde(default)]
    pub max_frame_size: Option<u16>,
    #[serde(default = "default_open_retry_ms")]
    pub open_retry_ms: u64,
    #[serde(default = "default_reinit_delay_ms")]
    pub reinit_delay_ms: u64,
}

fn default_mode() -> DaemonMode {
    DaemonMode::FsOnly
}
fn default_fs_channel() -> String {
    "/dev/ttyACM1".to_string()
}
fn default_scheme() -> TransportScheme {
    TransportScheme::Uart
}
fn default_speed() -> u32 {
    3_500_000
}
fn default_flow_control() -> bool {
    true
}
fn default_open_retry_ms() -> u64 {
    100
}
fn default_reinit_delay_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            fs_channel: default_fs_channel(),
            inbox: String::new(),
            scheme: default_scheme(),
            speed: default_speed(),
            flow_control: default_flow_control(),
            max_frame_size: None,
            open_retry_ms: default_open_retry_ms(),
            reinit_delay_ms: default_reinit_delay_ms(),
        }
    }
}

impl Config {
    pub fn channel(&self) -> ChannelConfig {
        ChannelConfig {
            speed: self.speed,
            flow_control: self.flow_control,
            ..ChannelConfig::new(self.fs_channel.clone(), self.scheme)
        }
    }

    pub fn open_retry(&self) -> Duration {
        Duration::from_millis(self.open_retry_ms)
    }

    pub fn reinit_delay(&self) -> Duration {
        Duration::from_millis(self.reinit_delay_ms)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Override keys from `FILD_*` variables; unparsable values are ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        let v = var(key)?;
        match v.parse() {
            Ok(t) => Some(t),
            Err(_) => {
                log::warn!("ignoring {}={:?}", key, v);
                None
            }
        }
    }

    if let Some(m) = parsed(&var, "FILD_MODE") {
        c.mode = m;
    }
    if let Some(s) = var("FILD_FS_CHANNEL") {
        c.fs_channel = s;
    }
    if let Some(s) = var("FILD_INBOX") {
        c.inbox = s;
    }
    if let Some(s) = parsed(&var, "FILD_SCHEME") {
        c.scheme = s;
    }
    if let Some(s) = parsed(&var, "FILD_SPEED") {
        c.speed = s;
    }
    if let Some(f) = parsed(&var, "FILD_FLOW_CONTROL") {
        c.flow_control = f;
    }
    if let Some(m) = parsed(&var, "FILD_MAX_FRAME_SIZE") {
        c.max_frame_size = Some(m);
    }
    if let Some(ms) = parsed(&var, "FILD_OPEN_RETRY_MS") {
        c.open_retry_ms = ms;
    }
    if let Some(ms) = parsed(&var, "FILD_REINIT_DELAY_MS") {
        c.reinit_delay_ms = ms;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("FILD_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/fild/config.toml"));
    }
    out.push(PathBuf::from("/etc/fild/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            return parse_file(&p);
        }
    }
    None
}

fn parse_file(p: &std::path::Path) -> Option<Config> {
    let s = match std::fs::read_to_string(p) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("{}: {}", p.display(), e);
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => {
            log::info!("config loaded from {}", p.display());
            Some(c)
        }
        Err(e) => {
            log::warn!("{}: {}, using defaults", p.display(), e);
            None
        }
    }
}
