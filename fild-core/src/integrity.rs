//! Object digests returned by `GET` with `TYPE: md5`.

use std::io::{self, Read};

use md5::{Digest, Md5};

use crate::protocol::BUFFER_SIZE;

/// Size of an MD5 digest.
pub const MD5_DIGEST_LEN: usize = 16;

/// MD5 of an in-memory payload.
#[cfg(test)]
pub fn md5_digest(payload: &[u8]) -> [u8; MD5_DIGEST_LEN] {
    let mut hasher = Md5::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// MD5 of the next `len` bytes of `reader`, read in buffer-sized blocks.
///
/// Fails with `UnexpectedEof` if the reader runs dry first.
pub fn md5_stream<R: Read + ?Sized>(reader: &mut R, len: u64) -> io::Result<[u8; MD5_DIGEST_LEN]> {
    let mut hasher = Md5::new();
    let mut block = vec![0u8; BUFFER_SIZE];
    let mut left = len;
    while left > 0 {
        let n = left.min(BUFFER_SIZE as u64) as usize;
        reader.read_exact(&mut block[..n])?;
        hasher.update(&block[..n]);
        left -= n as u64;
    }
    Ok(hasher.finalize().into())
}
