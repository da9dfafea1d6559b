//! Byte channel over a tty or character device node.
//!
//! A UART tty gets raw mode plus the configured speed and RTS/CTS setting on open.
//! Reads wait in `poll` with a short timeout so that `close` from another thread ends
//! a blocked reader before it can take bytes from the device.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use fild_core::{ByteChannel, ChannelConfig, ChannelError, TransportScheme};
use parking_lot::Mutex;

const POLL_INTERVAL_MS: libc::c_int = 100;

pub struct DeviceChannel {
    config: ChannelConfig,
    file: Mutex<Option<Arc<File>>>,
}

impl DeviceChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            file: Mutex::new(None),
        }
    }

    fn current(&self) -> Result<Arc<File>, ChannelError> {
        self.file.lock().clone().ok_or(ChannelError::Closed)
    }

    fn still_open(&self, file: &Arc<File>) -> bool {
        self.file
            .lock()
            .as_ref()
            .is_some_and(|f| Arc::ptr_eq(f, file))
    }
}

fn baud(speed: u32) -> Option<libc::speed_t> {
    Some(match speed {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        460_800 => libc::B460800,
        921_600 => libc::B921600,
        1_000_000 => libc::B1000000,
        1_500_000 => libc::B1500000,
        2_000_000 => libc::B2000000,
        3_000_000 => libc::B3000000,
        3_500_000 => libc::B3500000,
        4_000_000 => libc::B4000000,
        _ => return None,
    })
}

fn apply_line_settings(fd: RawFd, speed: u32, flow_control: bool) -> io::Result<()> {
    let rate = baud(speed).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("unsupported line speed {speed}"))
    })?;
    // SAFETY: `fd` is an open descriptor owned by the caller; `tio` is plain data
    // fully initialised by tcgetattr before use.
    unsafe {
        let mut tio: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut tio) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::cfmakeraw(&mut tio);
        if libc::cfsetispeed(&mut tio, rate) != 0 || libc::cfsetospeed(&mut tio, rate) != 0 {
            return Err(io::Error::last_os_error());
        }
        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        if flow_control {
            tio.c_cflag |= libc::CRTSCTS;
        } else {
            tio.c_cflag &= !libc::CRTSCTS;
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Waits up to one poll interval. `Ok(false)` on timeout or signal.
fn wait_readable(fd: RawFd) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: one valid pollfd, count matches.
    let rc = unsafe { libc::poll(&mut pfd, 1, POLL_INTERVAL_MS) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(rc > 0)
}

impl ByteChannel for DeviceChannel {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn open(&self) -> Result<(), ChannelError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.config.name)?;
        let fd = file.as_raw_fd();
        // SAFETY: `fd` belongs to `file`, which is alive here.
        let tty = unsafe { libc::isatty(fd) } == 1;
        if tty && self.config.scheme == TransportScheme::Uart {
            apply_line_settings(fd, self.config.speed, self.config.flow_control)?;
            log::debug!(
                "{}: raw, {} baud, flow control {}",
                self.config.name,
                self.config.speed,
                if self.config.flow_control { "on" } else { "off" }
            );
        }
        *self.file.lock() = Some(Arc::new(file));
        log::debug!("{}: opened", self.config.name);
        Ok(())
    }

    fn close(&self) {
        if self.file.lock().take().is_some() {
            log::debug!("{}: closed", self.config.name);
        }
    }

    fn read_exact(&self, buf: &mut [u8]) -> Result<(), ChannelError> {
        let file = self.current()?;
        let mut filled = 0;
        while filled < buf.len() {
            if !self.still_open(&file) {
                return Err(ChannelError::Closed);
            }
            if !wait_readable(file.as_raw_fd())? {
                continue;
            }
            if !self.still_open(&file) {
                return Err(ChannelError::Closed);
            }
            let n = match (&*file).read(&mut buf[filled..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return Err(ChannelError::Eof);
            }
            filled += n;
        }
        Ok(())
    }

    fn write_all(&self, buf: &[u8]) -> Result<(), ChannelError> {
        let file = self.current()?;
        (&*file).write_all(buf)?;
        (&*file).flush()?;
        Ok(())
    }
}
