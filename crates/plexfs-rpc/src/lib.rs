//! Text RPC wire format for the plexfs metadata protocol.
//!
//! Requests and responses are blocks of `Name: value` header lines terminated
//! by an empty line, optionally followed by `Content-length` bytes of body.
//! Two encodings of the same headers exist: the long format with descriptive
//! keys and decimal integers, and the short format with one- or two-letter
//! keys and hex integers. The format is negotiated on the first reply of a
//! connection and then locked for its lifetime.

pub mod headers;
pub mod request;

pub use headers::{find_header_block, HeaderBlock, MAX_RPC_HEADER_LEN};
pub use request::{RequestBuilder, ResponseBuilder};

/// Wire encoding of RPC headers, negotiated per connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcFormat {
    /// Not yet negotiated; parsed like the long format.
    Undef,
    /// Descriptive keys, decimal integers.
    Long,
    /// Single-letter keys, hex integers.
    Short,
}

impl RpcFormat {
    /// Integer base used for header values in this format.
    pub fn int_base(self) -> u32 {
        match self {
            RpcFormat::Short => 16,
            RpcFormat::Undef | RpcFormat::Long => 10,
        }
    }

    /// Select the key spelling for this format.
    pub fn key(self, key: Key) -> &'static str {
        match self {
            RpcFormat::Short => key.1,
            RpcFormat::Undef | RpcFormat::Long => key.0,
        }
    }

    pub fn is_short(self) -> bool {
        matches!(self, RpcFormat::Short)
    }
}

/// A header key in both spellings: `(long, short)`.
pub type Key = (&'static str, &'static str);

/// Header keys used by the metadata protocol.
pub mod key {
    use super::Key;

    pub const CSEQ: Key = ("Cseq", "c");
    pub const STATUS: Key = ("Status", "s");
    pub const STATUS_MSG: Key = ("Status-message", "m");
    pub const CONTENT_LENGTH: Key = ("Content-length", "l");
    pub const RESUME: Key = ("Resume", "R");
    pub const FILE_SYSTEM_ID: Key = ("File-system-id", "FI");
    pub const DELETE_ALL_CHUNKS: Key = ("Delete-all-chunks", "DA");
    pub const DELETED: Key = ("Deleted", "D");
    pub const MODIFIED: Key = ("Modified", "M");
    pub const CHUNKS: Key = ("Chunks", "C");
    pub const CHECKSUM: Key = ("Checksum", "K");
    pub const DELETED_REPORT: Key = ("Deleted-report", "DR");
    pub const PENDING_NOTIFY: Key = ("Pending-notify", "PN");
    pub const MAX_PENDING: Key = ("Max-pending", "MP");
    pub const AUTH_TYPE: Key = ("Auth-type", "A");
    pub const USE_SSL: Key = ("Use-ssl", "US");
    pub const SHORT_RPC_FMT: Key = ("Short-rpc-fmt", "f");
}

/// True when the buffer starts with a reply marker: `OK` followed by a space,
/// newline, or carriage return.
pub fn is_reply(buf: &[u8]) -> bool {
    buf.len() >= 3 && buf[0] == b'O' && buf[1] == b'K' && buf[2] <= b' '
}
