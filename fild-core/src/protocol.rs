//! OBEX subset spoken with the baseband: opcodes, response codes, header ids and size limits.

/// OBEX version carried in the CONNECT body (1.0).
pub const OBEX_VERSION: u8 = 0x10;

/// Final bit of an opcode or response code.
pub const FINAL_BIT: u8 = 0x80;

/// Packet prologue: code + 16-bit length. Sequence headers use the same 3-byte prologue.
pub const PROLOGUE_LEN: usize = 3;

/// Capacity of the receive and transmit buffers.
pub const BUFFER_SIZE: usize = 8192;

/// Smallest max packet length a peer may negotiate.
pub const MIN_MAX_PACKET_LEN: u16 = 255;

/// CONNECT fixed body: version, flags, max packet length (u16).
pub const CONNECT_BODY_LEN: usize = 4;

/// Longest path (inbox prefix + name, terminator included) accepted from a NAME header.
pub const MAX_FILENAME_LEN: usize = 256;

/// Only TYPE value understood in GET: ask for the object's MD5 digest instead of its content.
pub const MD5_TYPE: &[u8] = b"md5";

/// Request opcodes. `*Final` variants carry the final bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Connect,
    Disconnect,
    Put,
    PutFinal,
    Get,
    GetFinal,
    SetPath,
    Action,
    ActionFinal,
    Session,
    Abort,
}

impl Opcode {
    /// Number of opcodes; size of any table indexed by [`Opcode::index`].
    pub const COUNT: usize = 11;

    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0x80 => Self::Connect,
            0x81 => Self::Disconnect,
            0x02 => Self::Put,
            0x82 => Self::PutFinal,
            0x03 => Self::Get,
            0x83 => Self::GetFinal,
            0x85 => Self::SetPath,
            0x06 => Self::Action,
            0x86 => Self::ActionFinal,
            0x87 => Self::Session,
            0xFF => Self::Abort,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Connect => 0x80,
            Self::Disconnect => 0x81,
            Self::Put => 0x02,
            Self::PutFinal => 0x82,
            Self::Get => 0x03,
            Self::GetFinal => 0x83,
            Self::SetPath => 0x85,
            Self::Action => 0x06,
            Self::ActionFinal => 0x86,
            Self::Session => 0x87,
            Self::Abort => 0xFF,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Connect => 0,
            Self::Disconnect => 1,
            Self::Put => 2,
            Self::PutFinal => 3,
            Self::Get => 4,
            Self::GetFinal => 5,
            Self::SetPath => 6,
            Self::Action => 7,
            Self::ActionFinal => 8,
            Self::Session => 9,
            Self::Abort => 10,
        }
    }

    pub fn is_final(self) -> bool {
        self.code() & FINAL_BIT != 0
    }

    /// True when both opcodes belong to the same operation, final bit ignored.
    pub fn same_operation(self, other: Opcode) -> bool {
        self.code() | FINAL_BIT == other.code() | FINAL_BIT
    }
}

/// Response codes. The wire value of a final response is [`ResponseCode::fbs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Continue = 0x10,
    Ok = 0x20,
    Created = 0x21,
    Accepted = 0x22,
    NonAuthoritative = 0x23,
    NoContent = 0x24,
    ResetContent = 0x25,
    PartialContent = 0x26,
    MultipleChoices = 0x30,
    MovedPermanently = 0x31,
    MovedTemporarily = 0x32,
    SeeOther = 0x33,
    NotModified = 0x34,
    UseProxy = 0x35,
    BadRequest = 0x40,
    Unauthorized = 0x41,
    PaymentRequired = 0x42,
    Forbidden = 0x43,
    NotFound = 0x44,
    MethodNotAllowed = 0x45,
    NotAcceptable = 0x46,
    ProxyAuthRequired = 0x47,
    RequestTimeout = 0x48,
    Conflict = 0x49,
    Gone = 0x4A,
    LengthRequired = 0x4B,
    PreconditionFailed = 0x4C,
    EntityTooLarge = 0x4D,
    UrlTooLarge = 0x4E,
    UnsupportedMediaType = 0x4F,
    InternalServerError = 0x50,
    NotImplemented = 0x51,
    BadGateway = 0x52,
    ServiceUnavailable = 0x53,
    GatewayTimeout = 0x54,
    HttpVersionNotSupported = 0x55,
    DatabaseFull = 0x60,
    DatabaseLocked = 0x61,
}

impl ResponseCode {
    /// Wire value with the final bit set.
    pub fn fbs(self) -> u8 {
        self as u8 | FINAL_BIT
    }
}

/// Header ids used by the file service. The two high bits select the value encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderId {
    Count = 0xC0,
    Name = 0x01,
    Type = 0x42,
    Length = 0xC3,
    TimeIso = 0x44,
    Time4 = 0xC4,
    Description = 0x05,
    Target = 0x46,
    Http = 0x47,
    Body = 0x48,
    EndOfBody = 0x49,
    Who = 0x4A,
    ConnectId = 0xCB,
    AppParams = 0x4C,
    AuthChallenge = 0x4D,
    AuthResponse = 0x4E,
    CreatorId = 0xCF,
    WanUuid = 0x50,
    ObjectClass = 0x51,
    SessionParams = 0x52,
    SessionSeq = 0x93,
    ActionId = 0x94,
    DestName = 0x15,
    Permissions = 0xD6,
    Srm = 0x97,
    SrmParams = 0x98,
}

impl HeaderId {
    pub fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0xC0 => Self::Count,
            0x01 => Self::Name,
            0x42 => Self::Type,
            0xC3 => Self::Length,
            0x44 => Self::TimeIso,
            0xC4 => Self::Time4,
            0x05 => Self::Description,
            0x46 => Self::Target,
            0x47 => Self::Http,
            0x48 => Self::Body,
            0x49 => Self::EndOfBody,
            0x4A => Self::Who,
            0xCB => Self::ConnectId,
            0x4C => Self::AppParams,
            0x4D => Self::AuthChallenge,
            0x4E => Self::AuthResponse,
            0xCF => Self::CreatorId,
            0x50 => Self::WanUuid,
            0x51 => Self::ObjectClass,
            0x52 => Self::SessionParams,
            0x93 => Self::SessionSeq,
            0x94 => Self::ActionId,
            0x15 => Self::DestName,
            0xD6 => Self::Permissions,
            0x97 => Self::Srm,
            0x98 => Self::SrmParams,
            _ => return None,
        })
    }
}

/// Value encoding selected by the two high bits of a header id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderEncoding {
    /// Length-prefixed, NUL-terminated UTF-16BE.
    Unicode,
    /// Length-prefixed bytes.
    ByteSequence,
    OneByte,
    /// Big-endian u32.
    FourBytes,
}

impl HeaderEncoding {
    pub fn of(id: u8) -> Self {
        match id >> 6 {
            0 => Self::Unicode,
            1 => Self::ByteSequence,
            2 => Self::OneByte,
            _ => Self::FourBytes,
        }
    }
}

/// ACTION_ID values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionId {
    Copy,
    MoveRename,
    /// Defined by OBEX, not served here.
    SetPermissions,
    /// Vendor extension: grow or shrink a file to LENGTH bytes.
    Resize,
}

impl ActionId {
    pub fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0x00 => Self::Copy,
            0x01 => Self::MoveRename,
            0x02 => Self::SetPermissions,
            0x80 => Self::Resize,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Copy => 0x00,
            Self::MoveRename => 0x01,
            Self::SetPermissions => 0x02,
            Self::Resize => 0x80,
        }
    }
}
