//! Server-originated commands and their responses.
//!
//! The metadata server drives the chunk server with its own requests over
//! the same connection. The connection parses them, hands them to the upper
//! layer for execution, and writes the response back once the upper layer
//! reports the outcome. Responses carry the connection generation at which
//! the command arrived; a response produced for an earlier generation is
//! discarded rather than written to a socket the command never came from.

use bytes::Bytes;
use plexfs_rpc::{key, HeaderBlock, Key, ResponseBuilder, RpcFormat};

pub(crate) const AUTHENTICATE_FLAG: Key = ("Authenticate", "AU");

/// Periodic liveness probe; also the server's channel for retuning the
/// dispatch window and requesting re-authentication.
#[derive(Debug)]
pub struct HeartbeatCmd {
    pub seq: i64,
    pub authenticate: bool,
    pub max_pending_ops: usize,
}

/// Orders the chunk server to drop chunks the server no longer considers
/// valid; the chunk ids arrive in the body as hex, space-separated.
#[derive(Debug)]
pub struct StaleChunksCmd {
    pub seq: i64,
    pub content_length: usize,
    pub chunk_ids: Vec<i64>,
}

/// A parsed command from the metadata server.
#[derive(Debug)]
pub enum ServerCommand {
    Heartbeat(HeartbeatCmd),
    StaleChunks(StaleChunksCmd),
}

/// Execution outcome, set by the upper layer before responding.
#[derive(Debug, Default)]
pub struct CmdOutcome {
    pub status: i32,
    pub status_msg: String,
}

impl ServerCommand {
    /// Parse a command header block. Unknown commands are a protocol error
    /// and return `None`.
    pub fn parse(hdr: &HeaderBlock, fmt: RpcFormat) -> Option<(ServerCommand, CmdMeta)> {
        let seq = hdr.get_i64_or(key::CSEQ, fmt, -1);
        let cmd = match hdr.verb() {
            "HEARTBEAT" => ServerCommand::Heartbeat(HeartbeatCmd {
                seq,
                authenticate: hdr.get_i64_or(AUTHENTICATE_FLAG, fmt, 0) != 0,
                max_pending_ops: hdr.get_i64_or(key::MAX_PENDING, fmt, 96).max(1) as usize,
            }),
            "STALE_CHUNKS" => ServerCommand::StaleChunks(StaleChunksCmd {
                seq,
                content_length: hdr.get_i64_or(key::CONTENT_LENGTH, fmt, 0).max(0) as usize,
                chunk_ids: Vec::new(),
            }),
            _ => return None,
        };
        Some((
            cmd,
            CmdMeta {
                seq,
                generation: 0,
                outcome: CmdOutcome::default(),
            },
        ))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerCommand::Heartbeat(_) => "HEARTBEAT",
            ServerCommand::StaleChunks(_) => "STALE_CHUNKS",
        }
    }

    pub fn seq(&self) -> i64 {
        match self {
            ServerCommand::Heartbeat(c) => c.seq,
            ServerCommand::StaleChunks(c) => c.seq,
        }
    }

    /// Body bytes the command still expects.
    pub fn content_length(&self) -> usize {
        match self {
            ServerCommand::Heartbeat(_) => 0,
            ServerCommand::StaleChunks(c) => c.content_length,
        }
    }

    /// Consume the command body once fully buffered.
    pub fn parse_content(&mut self, body: &[u8]) -> bool {
        match self {
            ServerCommand::Heartbeat(_) => body.is_empty(),
            ServerCommand::StaleChunks(c) => {
                let Ok(text) = std::str::from_utf8(body) else {
                    return false;
                };
                for field in text.split_whitespace() {
                    match i64::from_str_radix(field, 16) {
                        Ok(id) => c.chunk_ids.push(id),
                        Err(_) => return false,
                    }
                }
                true
            }
        }
    }
}

/// A command in the upper layer's hands: the parsed request plus the
/// connection bookkeeping its response needs.
#[derive(Debug)]
pub struct IncomingCmd {
    pub cmd: ServerCommand,
    pub meta: CmdMeta,
}

/// Response bookkeeping for one command.
#[derive(Debug)]
pub struct CmdMeta {
    pub seq: i64,
    pub generation: u64,
    pub outcome: CmdOutcome,
}

impl IncomingCmd {
    pub fn set_status(&mut self, status: i32, msg: impl Into<String>) {
        self.meta.outcome.status = status;
        self.meta.outcome.status_msg = msg.into();
    }

    pub(crate) fn write_response(&self, fmt: RpcFormat) -> Bytes {
        let mut resp = ResponseBuilder::new(fmt);
        resp.field_i64(key::CSEQ, self.meta.seq);
        resp.field_i64(key::STATUS, i64::from(self.meta.outcome.status));
        if !self.meta.outcome.status_msg.is_empty() {
            resp.field_str(key::STATUS_MSG, &self.meta.outcome.status_msg);
        }
        resp.finish()
    }
}
