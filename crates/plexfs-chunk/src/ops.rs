//! Client ops sent to the metadata server.

use bytes::Bytes;
use plexfs_auth::AuthTypes;
use plexfs_common::ServerLocation;
use plexfs_rpc::{key, HeaderBlock, Key, RequestBuilder, RpcFormat};
use std::any::Any;

// Request-only header keys.
pub(crate) const CHUNK_SERVER_NAME: Key = ("Chunk-server-name", "SN");
pub(crate) const CHUNK_SERVER_PORT: Key = ("Chunk-server-port", "SP");
pub(crate) const CLUSTER_KEY: Key = ("Cluster-key", "CK");
pub(crate) const MD5_SUM: Key = ("MD5Sum", "5");
pub(crate) const RACK_ID: Key = ("Rack-id", "RI");
pub(crate) const NUM_CHUNKS: Key = ("Num-chunks", "NC");
pub(crate) const NO_FIDS: Key = ("No-fids", "NF");
pub(crate) const HELLO_DONE_COUNT: Key = ("Hello-done-count", "HD");
pub(crate) const CHUNK_HANDLE: Key = ("Chunk-handle", "H");
pub(crate) const CHUNK_DIR: Key = ("Chunk-dir", "CD");
pub(crate) const DIR_OK: Key = ("Dir-ok", "DO");

/// Fields every client op carries.
#[derive(Debug, Default)]
pub struct OpBase {
    pub seq: i64,
    /// Zero or a negative host errno.
    pub status: i32,
    pub status_msg: String,
    /// Connection generation at which the op was accepted.
    pub generation: u64,
}

/// An op the chunk server sends to the metadata server.
///
/// The connection assigns the sequence number at dispatch, writes the
/// request, and routes the matching reply back through `parse_response` and
/// (when a body is present) `parse_response_content`.
pub trait ClientOp: Send {
    fn base(&self) -> &OpBase;
    fn base_mut(&mut self) -> &mut OpBase;

    /// Wire command name, the first line of the request.
    fn name(&self) -> &'static str;

    /// Ops that expect no reply complete as soon as the request is written.
    fn no_reply(&self) -> bool {
        false
    }

    /// Append op-specific header fields; the connection writes the sequence
    /// and content length itself.
    fn write_request(&self, req: &mut RequestBuilder);

    /// Body bytes appended after the header block.
    fn content(&self) -> &[u8] {
        &[]
    }

    fn parse_response(&mut self, _hdr: &HeaderBlock, _fmt: RpcFormat) -> bool {
        true
    }

    fn parse_response_content(&mut self, body: &[u8]) -> bool {
        body.is_empty()
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// The inventory-synchronization handshake op.
///
/// `resume_step` drives the multi-step exchange: `-1` sends the full
/// inventory, `0` sends a compact summary the server may accept (advancing to
/// step `1`) or reject with a request for a full re-send.
#[derive(Debug)]
pub struct HelloOp {
    pub base: OpBase,
    pub location: ServerLocation,
    pub cluster_key: String,
    pub md5sum: String,
    pub rack_id: i32,
    pub no_fids: bool,
    pub hello_done_count: u64,
    pub resume_step: i32,
    pub file_system_id: i64,
    pub chunk_count: u64,
    pub checksum: u64,
    pub inventory: Bytes,
    pub lost_chunk_dirs: Vec<String>,

    // Filled from the reply.
    pub meta_file_system_id: i64,
    pub delete_all_chunks: bool,
    pub deleted_count: u64,
    pub modified_count: u64,
    pub meta_chunk_count: u64,
    pub meta_checksum: Option<u64>,
    pub deleted_report: u64,
    pub pending_notify: bool,
    pub resume_reply: Bytes,
}

impl ClientOp for HelloOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OpBase {
        &mut self.base
    }

    fn name(&self) -> &'static str {
        "HELLO"
    }

    fn write_request(&self, req: &mut RequestBuilder) {
        req.field_str(CHUNK_SERVER_NAME, &self.location.host);
        req.field_i64(CHUNK_SERVER_PORT, i64::from(self.location.port));
        req.field_str(CLUSTER_KEY, &self.cluster_key);
        req.field_str(MD5_SUM, &self.md5sum);
        req.field_i64(RACK_ID, i64::from(self.rack_id));
        req.field_i64(key::FILE_SYSTEM_ID, self.file_system_id);
        req.field_i64(NUM_CHUNKS, self.chunk_count as i64);
        req.field_i64(key::CHECKSUM, self.checksum as i64);
        req.field_flag(NO_FIDS, self.no_fids);
        req.field_i64(HELLO_DONE_COUNT, self.hello_done_count as i64);
        if self.resume_step >= 0 {
            req.field_i64(key::RESUME, i64::from(self.resume_step));
        }
    }

    fn content(&self) -> &[u8] {
        // The full handshake carries the inventory; resume steps send only
        // the summary headers.
        if self.resume_step < 0 {
            &self.inventory
        } else {
            &[]
        }
    }

    fn parse_response_content(&mut self, body: &[u8]) -> bool {
        self.resume_reply = Bytes::copy_from_slice(body);
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The authentication exchange op.
#[derive(Debug)]
pub struct AuthOp {
    pub base: OpBase,
    pub requested_types: AuthTypes,
    pub payload: Vec<u8>,
    pub chosen_type: AuthTypes,
    pub use_ssl: bool,
    pub response_len: usize,
    pub response: Vec<u8>,
}

impl AuthOp {
    pub fn new(seq: i64, requested_types: AuthTypes, payload: Vec<u8>) -> Self {
        Self {
            base: OpBase {
                seq,
                ..OpBase::default()
            },
            requested_types,
            payload,
            chosen_type: AuthTypes::NONE,
            use_ssl: false,
            response_len: 0,
            response: Vec::new(),
        }
    }
}

impl ClientOp for AuthOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OpBase {
        &mut self.base
    }

    fn name(&self) -> &'static str {
        "AUTHENTICATE"
    }

    fn write_request(&self, req: &mut RequestBuilder) {
        req.field_i64(key::AUTH_TYPE, i64::from(self.requested_types.bits()));
    }

    fn content(&self) -> &[u8] {
        &self.payload
    }

    fn parse_response(&mut self, hdr: &HeaderBlock, fmt: RpcFormat) -> bool {
        self.chosen_type = AuthTypes::from_bits(hdr.get_i64_or(key::AUTH_TYPE, fmt, 0) as u32);
        self.use_ssl = hdr.get_i64_or(key::USE_SSL, fmt, 0) != 0;
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Report of a corrupt or lost chunk (or a whole chunk directory). The
/// server takes it as notification only; no reply comes back.
#[derive(Debug)]
pub struct CorruptChunkOp {
    pub base: OpBase,
    /// Chunk handle, or -1 when reporting a whole directory.
    pub chunk_id: i64,
    pub chunk_dir: String,
    /// False when the directory itself went bad.
    pub dir_ok: bool,
}

impl CorruptChunkOp {
    pub fn new(chunk_id: i64, chunk_dir: impl Into<String>, dir_ok: bool) -> Self {
        Self {
            base: OpBase::default(),
            chunk_id,
            chunk_dir: chunk_dir.into(),
            dir_ok,
        }
    }
}

impl ClientOp for CorruptChunkOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OpBase {
        &mut self.base
    }

    fn name(&self) -> &'static str {
        "CORRUPT_CHUNK"
    }

    fn no_reply(&self) -> bool {
        true
    }

    fn write_request(&self, req: &mut RequestBuilder) {
        req.field_i64(CHUNK_HANDLE, self.chunk_id);
        req.field_str(CHUNK_DIR, &self.chunk_dir);
        req.field_flag(DIR_OK, self.dir_ok);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
