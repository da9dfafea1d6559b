//! Packet codec: OBEX framing over a [`ByteChannel`].
//!
//! A packet is `code:u8, length:u16` followed by an optional fixed body and a run of
//! headers. All integers are big-endian and every length includes its own 3-byte
//! prologue. The codec owns one receive and one transmit buffer of [`BUFFER_SIZE`]
//! bytes; headers handed out by [`PacketCodec::read_next_header`] borrow the receive
//! buffer.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::channel::ByteChannel;
use crate::error::ObexError;
use crate::protocol::{HeaderEncoding, HeaderId, BUFFER_SIZE, PROLOGUE_LEN};

/// Default pause between closing and reopening the channel in [`PacketCodec::reinit`].
pub const DEFAULT_REINIT_DELAY: Duration = Duration::from_secs(1);

/// Decoded packet prologue. The payload stays in the codec's receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub code: u8,
    pub packet_length: u16,
    pub payload_length: u16,
}

/// Header value; the variant always agrees with the encoding bits of the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue<'a> {
    /// UTF-16 code units, terminating NUL included.
    Unicode(Vec<u16>),
    Bytes(&'a [u8]),
    OneByte(u8),
    FourBytes(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header<'a> {
    pub id: u8,
    pub value: HeaderValue<'a>,
}

impl<'a> Header<'a> {
    /// NUL-terminated UTF-16 header built from `text`.
    pub fn unicode(id: HeaderId, text: &str) -> Self {
        debug_assert_eq!(HeaderEncoding::of(id as u8), HeaderEncoding::Unicode);
        let mut units: Vec<u16> = text.encode_utf16().collect();
        units.push(0);
        Self {
            id: id as u8,
            value: HeaderValue::Unicode(units),
        }
    }

    pub fn bytes(id: HeaderId, data: &'a [u8]) -> Self {
        debug_assert_eq!(HeaderEncoding::of(id as u8), HeaderEncoding::ByteSequence);
        Self {
            id: id as u8,
            value: HeaderValue::Bytes(data),
        }
    }

    pub fn one_byte(id: HeaderId, value: u8) -> Self {
        debug_assert_eq!(HeaderEncoding::of(id as u8), HeaderEncoding::OneByte);
        Self {
            id: id as u8,
            value: HeaderValue::OneByte(value),
        }
    }

    pub fn four_bytes(id: HeaderId, value: u32) -> Self {
        debug_assert_eq!(HeaderEncoding::of(id as u8), HeaderEncoding::FourBytes);
        Self {
            id: id as u8,
            value: HeaderValue::FourBytes(value),
        }
    }

    /// Size on the wire, id byte included.
    pub fn encoded_len(&self) -> usize {
        match &self.value {
            HeaderValue::Unicode(units) => PROLOGUE_LEN + units.len() * 2,
            HeaderValue::Bytes(data) => PROLOGUE_LEN + data.len(),
            HeaderValue::OneByte(_) => 2,
            HeaderValue::FourBytes(_) => 5,
        }
    }

    /// Serialize into the front of `out`; returns the number of bytes written.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, ObexError> {
        let len = self.encoded_len();
        if out.len() < len {
            return Err(ObexError::TxOverflow);
        }
        out[0] = self.id;
        match &self.value {
            HeaderValue::Unicode(units) => {
                let declared = u16::try_from(len).map_err(|_| ObexError::TxOverflow)?;
                out[1..3].copy_from_slice(&declared.to_be_bytes());
                for (dst, unit) in out[3..len].chunks_exact_mut(2).zip(units) {
                    dst.copy_from_slice(&unit.to_be_bytes());
                }
            }
            HeaderValue::Bytes(data) => {
                let declared = u16::try_from(len).map_err(|_| ObexError::TxOverflow)?;
                out[1..3].copy_from_slice(&declared.to_be_bytes());
                out[3..len].copy_from_slice(data);
            }
            HeaderValue::OneByte(v) => out[1] = *v,
            HeaderValue::FourBytes(v) => out[1..5].copy_from_slice(&v.to_be_bytes()),
        }
        Ok(len)
    }
}

/// Decode a NUL-terminated UTF-16 header value into a string.
pub fn decode_unicode(units: &[u16]) -> Result<String, ObexError> {
    let (last, text) = units
        .split_last()
        .ok_or(ObexError::Invalid("empty unicode header"))?;
    if *last != 0 {
        return Err(ObexError::Invalid("unicode header not NUL-terminated"));
    }
    if text.contains(&0) {
        return Err(ObexError::Invalid("embedded NUL in unicode header"));
    }
    String::from_utf16(text).map_err(|_| ObexError::Invalid("ill-formed UTF-16"))
}

/// Framing state for one channel.
pub struct PacketCodec {
    channel: Arc<dyn ByteChannel>,
    rx: Vec<u8>,
    rx_offset: usize,
    tx: Vec<u8>,
    tx_offset: usize,
    tx_limit: usize,
    reinit_delay: Duration,
}

impl PacketCodec {
    pub fn new(channel: Arc<dyn ByteChannel>) -> Self {
        Self {
            channel,
            rx: vec![0; BUFFER_SIZE],
            rx_offset: 0,
            tx: vec![0; BUFFER_SIZE],
            tx_offset: 0,
            tx_limit: BUFFER_SIZE,
            reinit_delay: DEFAULT_REINIT_DELAY,
        }
    }

    pub fn with_reinit_delay(mut self, delay: Duration) -> Self {
        self.reinit_delay = delay;
        self
    }

    pub fn channel(&self) -> &Arc<dyn ByteChannel> {
        &self.channel
    }

    /// Cap outgoing packets below the transmit buffer size, e.g. to the peer's
    /// negotiated maximum.
    pub fn set_tx_limit(&mut self, limit: usize) {
        self.tx_limit = limit.clamp(PROLOGUE_LEN, BUFFER_SIZE);
    }

    pub fn tx_limit(&self) -> usize {
        self.tx_limit
    }

    /// Block until one whole packet has been read from the channel.
    ///
    /// An oversized packet is drained from the stream so the next read starts on a
    /// packet boundary, and reported as [`ObexError::DataTooBig`].
    pub fn read_packet(&mut self) -> Result<Packet, ObexError> {
        self.rx_offset = 0;
        let mut prologue = [0u8; PROLOGUE_LEN];
        self.channel.read_exact(&mut prologue)?;
        let code = prologue[0];
        let packet_length = u16::from_be_bytes([prologue[1], prologue[2]]);
        if usize::from(packet_length) < PROLOGUE_LEN {
            return Err(ObexError::InvalidLength(packet_length));
        }
        let payload_length = packet_length - PROLOGUE_LEN as u16;

        if usize::from(packet_length) > BUFFER_SIZE {
            let mut left = usize::from(payload_length);
            while left > 0 {
                let n = left.min(BUFFER_SIZE);
                self.channel.read_exact(&mut self.rx[..n])?;
                left -= n;
            }
            warn!(
                "dropped packet 0x{:02x} of {} bytes (buffer is {})",
                code, packet_length, BUFFER_SIZE
            );
            return Err(ObexError::DataTooBig(packet_length));
        }

        self.channel
            .read_exact(&mut self.rx[..usize::from(payload_length)])?;
        debug!("rx packet 0x{:02x}, {} bytes", code, packet_length);
        Ok(Packet {
            code,
            packet_length,
            payload_length,
        })
    }

    /// Next header of `packet`, or `None` at end of packet.
    pub fn read_next_header(&mut self, packet: &Packet) -> Result<Option<Header<'_>>, ObexError> {
        let end = usize::from(packet.payload_length);
        let start = self.rx_offset;
        if start >= end {
            return Ok(None);
        }
        let left = end - start;
        let id = self.rx[start];

        let value_range = match HeaderEncoding::of(id) {
            HeaderEncoding::Unicode | HeaderEncoding::ByteSequence => {
                if left < PROLOGUE_LEN {
                    return Err(ObexError::Invalid("truncated header prologue"));
                }
                let declared = usize::from(u16::from_be_bytes([
                    self.rx[start + 1],
                    self.rx[start + 2],
                ]));
                if declared < PROLOGUE_LEN {
                    return Err(ObexError::Invalid("header length shorter than its prologue"));
                }
                if declared > left {
                    return Err(ObexError::Invalid("header overruns packet"));
                }
                start + PROLOGUE_LEN..start + declared
            }
            HeaderEncoding::OneByte => {
                if left < 2 {
                    return Err(ObexError::Invalid("truncated one-byte header"));
                }
                start + 1..start + 2
            }
            HeaderEncoding::FourBytes => {
                if left < 5 {
                    return Err(ObexError::Invalid("truncated four-byte header"));
                }
                start + 1..start + 5
            }
        };

        let value = match HeaderEncoding::of(id) {
            HeaderEncoding::Unicode => {
                let raw = &self.rx[value_range.clone()];
                if raw.len() % 2 != 0 {
                    return Err(ObexError::Invalid("odd unicode header length"));
                }
                let units: Vec<u16> = raw
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                if units.last() != Some(&0) {
                    return Err(ObexError::Invalid("unicode header not NUL-terminated"));
                }
                self.rx_offset = value_range.end;
                HeaderValue::Unicode(units)
            }
            HeaderEncoding::ByteSequence => {
                self.rx_offset = value_range.end;
                HeaderValue::Bytes(&self.rx[value_range])
            }
            HeaderEncoding::OneByte => {
                self.rx_offset = value_range.end;
                HeaderValue::OneByte(self.rx[value_range.start])
            }
            HeaderEncoding::FourBytes => {
                self.rx_offset = value_range.end;
                let b = &self.rx[value_range];
                HeaderValue::FourBytes(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
        };
        Ok(Some(Header { id, value }))
    }

    /// Fixed-format body that follows the prologue of a request (CONNECT).
    pub fn read_request_data(&mut self, packet: &Packet, len: usize) -> Result<&[u8], ObexError> {
        if usize::from(packet.packet_length) < PROLOGUE_LEN + len {
            return Err(ObexError::Invalid("packet shorter than its fixed body"));
        }
        let start = self.rx_offset;
        if start + len > usize::from(packet.payload_length) {
            return Err(ObexError::Invalid("fixed body overruns packet"));
        }
        self.rx_offset = start + len;
        Ok(&self.rx[start..start + len])
    }

    /// Fixed-format body that follows the prologue of a response.
    pub fn read_response_data(&mut self, packet: &Packet, len: usize) -> Result<&[u8], ObexError> {
        self.read_request_data(packet, len)
    }

    /// Start a new outgoing packet, discarding any unsent one.
    pub fn create_packet_for_sending(&mut self, code: u8, data: &[u8]) -> Result<Packet, ObexError> {
        self.tx_offset = 0;
        let len = PROLOGUE_LEN + data.len();
        if len > self.tx_limit {
            return Err(ObexError::TxOverflow);
        }
        self.tx[0] = code;
        self.tx[PROLOGUE_LEN..len].copy_from_slice(data);
        self.tx_offset = len;
        Ok(Packet {
            code,
            packet_length: len as u16,
            payload_length: data.len() as u16,
        })
    }

    pub fn append_header(&mut self, packet: &mut Packet, header: &Header<'_>) -> Result<(), ObexError> {
        let start = self.tx_offset;
        let end = self.tx_limit.max(start);
        let n = header.encode(&mut self.tx[start..end])?;
        self.tx_offset += n;
        packet.packet_length = self.tx_offset as u16;
        packet.payload_length = (self.tx_offset - PROLOGUE_LEN) as u16;
        Ok(())
    }

    /// Write the packet under construction to the channel.
    pub fn send_packet(&mut self, packet: &Packet) -> Result<(), ObexError> {
        let len = self.tx_offset;
        self.tx_offset = 0;
        if len < PROLOGUE_LEN {
            return Err(ObexError::Invalid("no packet under construction"));
        }
        self.tx[1..3].copy_from_slice(&(len as u16).to_be_bytes());
        debug!("tx packet 0x{:02x}, {} bytes", packet.code, len);
        self.channel.write_all(&self.tx[..len])?;
        Ok(())
    }

    pub fn send_simple_packet(&mut self, code: u8, data: &[u8]) -> Result<(), ObexError> {
        let packet = self.create_packet_for_sending(code, data)?;
        self.send_packet(&packet)
    }

    /// Close and reopen the channel after a transport failure.
    pub fn reinit(&mut self) -> Result<(), ObexError> {
        debug!("reinit {}", self.channel.name());
        self.channel.close();
        if !self.reinit_delay.is_zero() {
            thread::sleep(self.reinit_delay);
        }
        self.rx_offset = 0;
        self.tx_offset = 0;
        self.channel.open()?;
        Ok(())
    }
}
