//! Operation dispatcher: connection state machine and opcode routing.
//!
//! CONNECT and DISCONNECT are handled here; every other opcode goes to a handler
//! registered by the service. Handlers reply through the [`Request`] they receive and
//! return [`Outcome::Continue`] while a multi-packet operation is still open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::chunk;
use crate::error::ObexError;
use crate::protocol::{
    Opcode, ResponseCode, BUFFER_SIZE, CONNECT_BODY_LEN, MIN_MAX_PACKET_LEN, OBEX_VERSION,
};
use crate::wire::{Header, Packet, PacketCodec};

/// Handler result when no error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// More packets of the same operation are expected.
    Continue,
    Done,
}

/// Why [`ObexServer::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The peer sent DISCONNECT.
    Disconnected,
    /// [`ServerControl::request_disconnect`] was called.
    Interrupted,
    /// The channel failed and could not be reopened.
    TransportLost,
}

/// Per-run connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub max_client_to_server_len: u16,
    pub max_server_to_client_len: u16,
    pub processing_request: Option<Opcode>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            connected: false,
            max_client_to_server_len: BUFFER_SIZE as u16,
            max_server_to_client_len: MIN_MAX_PACKET_LEN,
            processing_request: None,
        }
    }
}

/// Cross-thread handle to stop a running server.
#[derive(Debug, Default)]
pub struct ServerControl {
    disconnect: AtomicBool,
}

impl ServerControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ask the server loop to mark the link disconnected and return. Pair with closing
    /// the channel so a blocked read wakes up.
    pub fn request_disconnect(&self) {
        self.disconnect.store(true, Ordering::Release);
    }

    pub fn disconnect_requested(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }
}

/// One received packet handed to a handler, with the means to answer it.
pub struct Request<'a> {
    pub opcode: Opcode,
    pub packet: Packet,
    pub codec: &'a mut PacketCodec,
    pub max_client_to_server_len: u16,
    pub max_server_to_client_len: u16,
}

impl<'a> Request<'a> {
    pub fn next_header(&mut self) -> Result<Option<Header<'_>>, ObexError> {
        let packet = self.packet;
        self.codec.read_next_header(&packet)
    }

    /// Largest BODY payload a response may carry on this connection.
    pub fn max_body_payload(&self) -> usize {
        chunk::max_body_payload(self.max_client_to_server_len, self.max_server_to_client_len)
    }

    pub fn reply(&mut self, code: u8) -> Result<(), ObexError> {
        self.codec.send_simple_packet(code, &[])
    }

    pub fn reply_with(&mut self, code: u8, headers: &[Header<'_>]) -> Result<(), ObexError> {
        let mut packet = self.codec.create_packet_for_sending(code, &[])?;
        for header in headers {
            self.codec.append_header(&mut packet, header)?;
        }
        self.codec.send_packet(&packet)
    }
}

/// Registered operation handler: a method of the service.
pub type OperationFn<S> = fn(&mut S, &mut Request<'_>) -> Result<Outcome, ObexError>;

/// State a service keeps across the packets of one run.
pub trait ObexService {
    /// Drop any open object and return to idle.
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("{0:?} is handled by the server itself")]
    BuiltIn(Opcode),
    #[error("{0:?} already has a handler")]
    Taken(Opcode),
}

pub struct ObexServer<S> {
    codec: PacketCodec,
    state: ConnectionState,
    routes: [Option<OperationFn<S>>; Opcode::COUNT],
    service: S,
    control: Arc<ServerControl>,
    max_packet_len: u16,
}

impl<S: ObexService> ObexServer<S> {
    pub fn new(codec: PacketCodec, service: S) -> Self {
        Self {
            codec,
            state: ConnectionState::default(),
            routes: [None; Opcode::COUNT],
            service,
            control: ServerControl::new(),
            max_packet_len: BUFFER_SIZE as u16,
        }
    }

    pub fn with_control(mut self, control: Arc<ServerControl>) -> Self {
        self.control = control;
        self
    }

    /// Cap the packet size proposed at CONNECT; kept within `[255, 8192]`.
    pub fn with_max_packet_len(mut self, len: u16) -> Self {
        self.max_packet_len = len.clamp(MIN_MAX_PACKET_LEN, BUFFER_SIZE as u16);
        self
    }

    pub fn register(&mut self, opcode: Opcode, handler: OperationFn<S>) -> Result<(), RegisterError> {
        if matches!(opcode, Opcode::Connect | Opcode::Disconnect) {
            return Err(RegisterError::BuiltIn(opcode));
        }
        let slot = &mut self.routes[opcode.index()];
        if slot.is_some() {
            return Err(RegisterError::Taken(opcode));
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn control(&self) -> Arc<ServerControl> {
        self.control.clone()
    }

    /// Serve packets until the peer disconnects, the control asks to stop, or the
    /// channel is lost for good. Transport EOF triggers a channel reinit first.
    pub fn run(&mut self) -> RunExit {
        self.state = ConnectionState::default();
        self.service.reset();
        let name = self.codec.channel().name().to_string();
        info!("{}: serving", name);

        let exit = loop {
            if self.control.disconnect_requested() {
                break RunExit::Interrupted;
            }
            match self.process_next() {
                Ok(true) => break RunExit::Disconnected,
                Ok(false) => {}
                Err(e) => {
                    if self.control.disconnect_requested() {
                        break RunExit::Interrupted;
                    }
                    warn!("{}: {}, reinitializing channel", name, e);
                    if let Err(e) = self.codec.reinit() {
                        error!("{}: reinit failed: {}", name, e);
                        break RunExit::TransportLost;
                    }
                }
            }
        };

        self.state.connected = false;
        self.state.processing_request = None;
        self.service.reset();
        info!("{}: server stopped ({:?})", name, exit);
        exit
    }

    /// Read and answer one packet. Returns `Ok(true)` after a DISCONNECT. Only
    /// transport errors are returned; every other failure is answered on the wire.
    pub fn process_next(&mut self) -> Result<bool, ObexError> {
        let packet = match self.codec.read_packet() {
            Ok(packet) => packet,
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => {
                warn!("malformed packet: {}", e);
                self.reply_error(&e)?;
                return Ok(false);
            }
        };
        let opcode = Opcode::from_u8(packet.code);

        if opcode == Some(Opcode::Connect) {
            self.on_connect(&packet)?;
            return Ok(false);
        }
        if !self.state.connected {
            debug!("0x{:02x} while disconnected", packet.code);
            self.reply_error(&ObexError::NotReady)?;
            return Ok(false);
        }
        if let Some(in_flight) = self.state.processing_request {
            if !opcode.is_some_and(|op| op.same_operation(in_flight)) {
                debug!("0x{:02x} while {:?} is in progress", packet.code, in_flight);
                self.reply_error(&ObexError::NotReady)?;
                return Ok(false);
            }
        }
        let opcode = match opcode {
            Some(Opcode::Disconnect) => {
                self.on_disconnect()?;
                return Ok(true);
            }
            Some(op) => op,
            None => {
                self.reply_error(&ObexError::UnknownOpcode(packet.code))?;
                return Ok(false);
            }
        };
        let Some(handler) = self.routes[opcode.index()] else {
            self.reply_error(&ObexError::UnsupportedOperation(packet.code))?;
            return Ok(false);
        };

        let mut request = Request {
            opcode,
            packet,
            codec: &mut self.codec,
            max_client_to_server_len: self.state.max_client_to_server_len,
            max_server_to_client_len: self.state.max_server_to_client_len,
        };
        match handler(&mut self.service, &mut request) {
            Ok(Outcome::Continue) => self.state.processing_request = Some(opcode),
            Ok(Outcome::Done) => self.state.processing_request = None,
            Err(e) => {
                self.state.processing_request = None;
                if e.is_transport() {
                    return Err(e);
                }
                warn!("{:?} failed: {}", opcode, e);
                self.reply_error(&e)?;
            }
        }
        Ok(false)
    }

    fn reply_error(&mut self, e: &ObexError) -> Result<(), ObexError> {
        self.codec.send_simple_packet(e.response_code().fbs(), &[])
    }

    fn on_connect(&mut self, packet: &Packet) -> Result<(), ObexError> {
        let [hi, lo] = self.max_packet_len.to_be_bytes();
        let response = [OBEX_VERSION, 0, hi, lo];

        let body = self
            .codec
            .read_request_data(packet, CONNECT_BODY_LEN)
            .map(|d| [d[0], d[1], d[2], d[3]]);
        let code = match body {
            Err(e) => {
                warn!("CONNECT rejected: {}", e);
                ResponseCode::BadRequest
            }
            Ok(_) if self.state.connected => {
                warn!("CONNECT rejected: already connected");
                ResponseCode::PreconditionFailed
            }
            Ok([version, flags, req_hi, req_lo]) => {
                let requested = u16::from_be_bytes([req_hi, req_lo]);
                if version != OBEX_VERSION || flags != 0 || requested < MIN_MAX_PACKET_LEN {
                    warn!(
                        "CONNECT rejected: version 0x{:02x}, flags 0x{:02x}, max packet {}",
                        version, flags, requested
                    );
                    ResponseCode::NotAcceptable
                } else if !matches!(self.codec.read_next_header(packet), Ok(None)) {
                    warn!("CONNECT rejected: optional headers are not supported");
                    ResponseCode::BadRequest
                } else {
                    self.state.connected = true;
                    self.state.processing_request = None;
                    self.state.max_client_to_server_len = self.max_packet_len;
                    self.state.max_server_to_client_len = requested.min(self.max_packet_len);
                    self.codec
                        .set_tx_limit(usize::from(self.state.max_server_to_client_len));
                    info!(
                        "connected, max packet {} in / {} out",
                        self.state.max_client_to_server_len, self.state.max_server_to_client_len
                    );
                    ResponseCode::Ok
                }
            }
        };
        self.codec.send_simple_packet(code.fbs(), &response)
    }

    fn on_disconnect(&mut self) -> Result<(), ObexError> {
        info!("peer disconnected");
        self.state.connected = false;
        self.state.processing_request = None;
        self.service.reset();
        let reply = self.codec.send_simple_packet(ResponseCode::Ok.fbs(), &[]);
        self.codec.set_tx_limit(BUFFER_SIZE);
        reply
    }
}
