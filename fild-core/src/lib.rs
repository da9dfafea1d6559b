//! OBEX file server and boot-channel arbitration for an attached baseband modem.
//! Transports are injected through [`ByteChannel`]; the boot protocol through [`BootServer`].

pub mod channel;
pub mod chunk;
pub mod daemon;
pub mod error;
pub mod file;
pub mod fs;
pub mod integrity;
pub mod protocol;
pub mod server;
pub mod sync;
pub mod wire;

#[cfg(test)]
mod testutil;

pub use channel::{ByteChannel, ChannelConfig, ChannelError, MemoryChannel, TransportScheme};
pub use daemon::{
    BootChannel, BootServer, BootState, Daemon, DaemonContext, DaemonError, DaemonHandle,
    DaemonMode, FsServer,
};
pub use error::ObexError;
pub use file::FileService;
pub use fs::{FileSystem, LocalFileSystem};
pub use server::{ObexServer, Outcome, RunExit};
pub use wire::{Header, Packet, PacketCodec};
