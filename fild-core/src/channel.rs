//! Byte channel: one blocking, bidirectional link to the baseband.
//!
//! Physical transports (UART, HSI, shared memory) live outside this crate and plug in
//! through [`ByteChannel`]. [`MemoryChannel`] is an in-memory stand-in used for tests
//! and host-side simulation.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::str::FromStr;

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("end of stream")]
    Eof,
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Blocking byte stream over one physical link.
///
/// All methods take `&self` so that another thread can [`ByteChannel::close`] the
/// channel while a reader is blocked; the blocked read must then fail.
pub trait ByteChannel: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self) -> Result<(), ChannelError>;

    /// Idempotent. Wakes any reader blocked in [`ByteChannel::read_exact`].
    fn close(&self);

    /// Fill `buf` completely or fail.
    fn read_exact(&self, buf: &mut [u8]) -> Result<(), ChannelError>;

    fn write_all(&self, buf: &[u8]) -> Result<(), ChannelError>;
}

/// Physical transport family of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportScheme {
    Uart,
    Hsi,
    Shm,
}

impl FromStr for TransportScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uart" => Ok(Self::Uart),
            "hsi" => Ok(Self::Hsi),
            "shm" => Ok(Self::Shm),
            other => Err(format!("unknown transport scheme {other:?}")),
        }
    }
}

impl fmt::Display for TransportScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uart => "uart",
            Self::Hsi => "hsi",
            Self::Shm => "shm",
        })
    }
}

/// Static description of a physical channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Device name, e.g. `/dev/ttyACM1`.
    pub name: String,
    pub scheme: TransportScheme,
    /// Baud rate for UART links.
    pub speed: u32,
    pub flow_control: bool,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, scheme: TransportScheme) -> Self {
        Self {
            name: name.into(),
            scheme,
            speed: 3_500_000,
            flow_control: true,
        }
    }
}

/// In-memory channel with scripted input and captured output.
pub struct MemoryChannel {
    name: String,
    state: Mutex<MemoryState>,
    readable: Condvar,
}

struct MemoryState {
    open: bool,
    openable: bool,
    eof_when_drained: bool,
    opens: usize,
    input: VecDeque<u8>,
    output: Vec<u8>,
}

impl MemoryChannel {
    /// Closed channel that opens on request; reads block until input arrives or the
    /// channel is closed.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState {
                open: false,
                openable: true,
                eof_when_drained: false,
                opens: 0,
                input: VecDeque::new(),
                output: Vec::new(),
            }),
            readable: Condvar::new(),
        }
    }

    /// Open channel preloaded with `input`. Reads past the end report EOF and the
    /// channel refuses to reopen, like a device that went away.
    pub fn scripted(name: impl Into<String>, input: &[u8]) -> Self {
        let channel = Self::new(name);
        {
            let mut st = channel.state.lock();
            st.open = true;
            st.openable = false;
            st.eof_when_drained = true;
            st.input.extend(input.iter().copied());
        }
        channel
    }

    pub fn push_input(&self, bytes: &[u8]) {
        self.state.lock().input.extend(bytes.iter().copied());
        self.readable.notify_all();
    }

    /// Everything written since the last call.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().output)
    }

    pub fn set_openable(&self, openable: bool) {
        self.state.lock().openable = openable;
    }

    pub fn set_eof_when_drained(&self, eof: bool) {
        self.state.lock().eof_when_drained = eof;
        self.readable.notify_all();
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }
}

impl ByteChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<(), ChannelError> {
        let mut st = self.state.lock();
        if !st.openable {
            return Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} unavailable", self.name),
            )));
        }
        st.open = true;
        st.opens += 1;
        Ok(())
    }

    fn close(&self) {
        self.state.lock().open = false;
        self.readable.notify_all();
    }

    fn read_exact(&self, buf: &mut [u8]) -> Result<(), ChannelError> {
        let mut st = self.state.lock();
        loop {
            if !st.open {
                return Err(ChannelError::Closed);
            }
            let n = buf.len();
            if st.input.len() >= n {
                for (dst, src) in buf.iter_mut().zip(st.input.drain(..n)) {
                    *dst = src;
                }
                return Ok(());
            }
            if st.eof_when_drained {
                st.input.clear();
                return Err(ChannelError::Eof);
            }
            self.readable.wait(&mut st);
        }
    }

    fn write_all(&self, buf: &[u8]) -> Result<(), ChannelError> {
        let mut st = self.state.lock();
        if !st.open {
            return Err(ChannelError::Closed);
        }
        st.output.extend_from_slice(buf);
        Ok(())
    }
}
