//! Chunked object access: APP_PARAMS byte ranges and the arithmetic of streamed GETs.

use std::ops::Range;

use crate::error::ObexError;
use crate::protocol::PROLOGUE_LEN;

/// APP_PARAMS body: two tag-length-value parameters of 4 bytes each.
pub const APP_PARAMS_LEN: usize = 12;

const OFFSET_PARAM_ID: u8 = 0x00;
const LENGTH_PARAM_ID: u8 = 0x01;
const PARAM_VALUE_LEN: u8 = 4;

/// Overhead of one streamed GET response: packet prologue plus BODY header prologue.
pub const BODY_OVERHEAD: usize = 2 * PROLOGUE_LEN;

/// Byte range requested through APP_PARAMS. All zero means "whole object".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub start_offset: u32,
    pub length: u32,
}

impl ChunkDescriptor {
    pub fn new(start_offset: u32, length: u32) -> Self {
        Self {
            start_offset,
            length,
        }
    }

    /// Parse an APP_PARAMS header value.
    pub fn parse(data: &[u8]) -> Result<Self, ObexError> {
        if data.len() != APP_PARAMS_LEN {
            return Err(ObexError::Invalid("APP_PARAMS must be 12 bytes"));
        }
        if data[0] != OFFSET_PARAM_ID
            || data[1] != PARAM_VALUE_LEN
            || data[6] != LENGTH_PARAM_ID
            || data[7] != PARAM_VALUE_LEN
        {
            return Err(ObexError::Invalid("unexpected APP_PARAMS layout"));
        }
        Ok(Self {
            start_offset: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
            length: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    #[cfg(test)]
    pub fn encode(&self) -> [u8; APP_PARAMS_LEN] {
        let mut out = [0u8; APP_PARAMS_LEN];
        out[0] = OFFSET_PARAM_ID;
        out[1] = PARAM_VALUE_LEN;
        out[2..6].copy_from_slice(&self.start_offset.to_be_bytes());
        out[6] = LENGTH_PARAM_ID;
        out[7] = PARAM_VALUE_LEN;
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    pub fn is_set(&self) -> bool {
        self.start_offset != 0 || self.length != 0
    }

    /// Bytes of an object of `size` bytes a GET should return.
    pub fn read_window(&self, size: u64) -> Result<Range<u64>, ObexError> {
        if !self.is_set() {
            return Ok(0..size);
        }
        let start = u64::from(self.start_offset);
        let end = start + u64::from(self.length);
        if end > size {
            return Err(ObexError::Rejected("chunk beyond end of object"));
        }
        Ok(start..end)
    }

    /// Position at which a PUT starts writing into a file currently `size` bytes long.
    pub fn write_offset(&self, size: u64) -> Result<u64, ObexError> {
        let start = u64::from(self.start_offset);
        if start > size {
            return Err(ObexError::Rejected("chunk offset beyond end of file"));
        }
        Ok(start)
    }
}

/// Largest BODY payload that fits both directions' negotiated packet sizes.
pub fn max_body_payload(max_client_to_server: u16, max_server_to_client: u16) -> usize {
    usize::from(max_client_to_server.min(max_server_to_client)).saturating_sub(BODY_OVERHEAD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_app_params() {
        let raw = [0x00, 0x04, 0, 0, 0x10, 0x00, 0x01, 0x04, 0, 0, 0, 0x20];
        let c = ChunkDescriptor::parse(&raw).unwrap();
        assert_eq!(c, ChunkDescriptor::new(0x1000, 0x20));
        assert_eq!(c.encode(), raw);
        assert!(c.is_set());
    }

    #[test]
    fn parse_rejects_bad_layout() {
        assert!(ChunkDescriptor::parse(&[0u8; 11]).is_err());
        let mut raw = ChunkDescriptor::new(1, 2).encode();
        raw[6] = 0x02;
        assert!(ChunkDescriptor::parse(&raw).is_err());
        let mut raw = ChunkDescriptor::new(1, 2).encode();
        raw[1] = 0x02;
        assert!(ChunkDescriptor::parse(&raw).is_err());
    }

    #[test]
    fn unset_descriptor_covers_whole_object() {
        let c = ChunkDescriptor::default();
        assert!(!c.is_set());
        assert_eq!(c.read_window(42).unwrap(), 0..42);
        assert_eq!(c.write_offset(0).unwrap(), 0);
    }

    #[test]
    fn read_window_bounds() {
        assert_eq!(ChunkDescriptor::new(10, 5).read_window(15).unwrap(), 10..15);
        assert!(ChunkDescriptor::new(10, 6).read_window(15).is_err());
        assert!(ChunkDescriptor::new(u32::MAX, u32::MAX).read_window(100).is_err());
        assert_eq!(ChunkDescriptor::new(3, 0).read_window(15).unwrap(), 3..3);
    }

    #[test]
    fn write_offset_may_reach_end_of_file() {
        assert_eq!(ChunkDescriptor::new(8, 100).write_offset(8).unwrap(), 8);
        assert!(ChunkDescriptor::new(9, 0).write_offset(8).is_err());
    }

    #[test]
    fn body_payload_uses_smaller_direction() {
        assert_eq!(max_body_payload(8192, 0xFF00), 8186);
        assert_eq!(max_body_payload(8192, 255), 249);
        assert_eq!(max_body_payload(4, 4), 0);
    }
}
