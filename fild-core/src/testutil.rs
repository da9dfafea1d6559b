//! Client-side helpers for tests: build request bytes, split and parse responses.

use crate::protocol::{HeaderEncoding, HeaderId, PROLOGUE_LEN};
use crate::wire::Header;

/// Serialize one request packet.
pub fn request(code: u8, data: &[u8], headers: &[Header<'_>]) -> Vec<u8> {
    let mut out = vec![code, 0, 0];
    out.extend_from_slice(data);
    for h in headers {
        let start = out.len();
        out.resize(start + h.encoded_len(), 0);
        h.encode(&mut out[start..]).unwrap();
    }
    let len = out.len() as u16;
    out[1..3].copy_from_slice(&len.to_be_bytes());
    out
}

/// One response packet as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub code: u8,
    pub payload: Vec<u8>,
}

impl RawPacket {
    /// Headers after `skip` bytes of fixed body, as `(id, value bytes)`. Four-byte
    /// values are returned big-endian, unicode values as raw UTF-16BE.
    pub fn headers(&self, skip: usize) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        let mut rest = &self.payload[skip..];
        while let Some(&id) = rest.first() {
            let (value, used) = match HeaderEncoding::of(id) {
                HeaderEncoding::Unicode | HeaderEncoding::ByteSequence => {
                    let len = usize::from(u16::from_be_bytes([rest[1], rest[2]]));
                    (rest[PROLOGUE_LEN..len].to_vec(), len)
                }
                HeaderEncoding::OneByte => (rest[1..2].to_vec(), 2),
                HeaderEncoding::FourBytes => (rest[1..5].to_vec(), 5),
            };
            out.push((id, value));
            rest = &rest[used..];
        }
        out
    }

    pub fn header(&self, id: HeaderId) -> Option<Vec<u8>> {
        self.headers(0)
            .into_iter()
            .find(|(h, _)| *h == id as u8)
            .map(|(_, v)| v)
    }
}

/// Split a captured byte stream into packets.
pub fn responses(mut bytes: &[u8]) -> Vec<RawPacket> {
    let mut out = Vec::new();
    while bytes.len() >= PROLOGUE_LEN {
        let len = usize::from(u16::from_be_bytes([bytes[1], bytes[2]]));
        out.push(RawPacket {
            code: bytes[0],
            payload: bytes[PROLOGUE_LEN..len].to_vec(),
        });
        bytes = &bytes[len..];
    }
    assert!(bytes.is_empty(), "trailing bytes in response stream");
    out
}
