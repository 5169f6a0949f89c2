//! Header block framing and parsing.

use crate::{Key, RpcFormat};
use std::collections::BTreeMap;

/// Upper bound on a single header block. A connection that buffers more than
/// this without finding the terminating empty line is violating the protocol.
pub const MAX_RPC_HEADER_LEN: usize = 16 << 10;

/// Locate a complete header block at the start of `buf`.
///
/// A block is a sequence of lines terminated by an empty line; lines end with
/// `\n`, optionally preceded by `\r`. Returns the total block length in bytes
/// including the terminating empty line, or `None` when the block is not yet
/// fully buffered.
pub fn find_header_block(buf: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            let mut line_end = i;
            if line_end > line_start && buf[line_end - 1] == b'\r' {
                line_end -= 1;
            }
            if line_end == line_start {
                return Some(i + 1);
            }
            line_start = i + 1;
        }
        i += 1;
    }
    None
}

/// A parsed header block: the first line (reply marker or command name) and
/// the `Name: value` fields that follow it.
#[derive(Debug)]
pub struct HeaderBlock {
    verb: String,
    fields: BTreeMap<String, String>,
}

impl HeaderBlock {
    /// Parse a complete header block (as delimited by [`find_header_block`]).
    ///
    /// Lines without a `:` separator are ignored, matching the tolerant
    /// behavior expected from peers of different versions.
    pub fn parse(block: &[u8]) -> Self {
        let text = String::from_utf8_lossy(block);
        let mut lines = text.lines();
        let verb = lines.next().unwrap_or("").trim().to_string();
        let mut fields = BTreeMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                fields.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
        Self { verb, fields }
    }

    /// The first line of the block: `OK` for replies, the command name for
    /// server-originated requests.
    pub fn verb(&self) -> &str {
        &self.verb
    }

    /// Raw lookup by exact key spelling.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Integer lookup using the key spelling and base of `fmt`.
    pub fn get_i64(&self, key: Key, fmt: RpcFormat) -> Option<i64> {
        let raw = self.get(fmt.key(key))?;
        let (digits, neg) = match raw.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (raw, false),
        };
        i64::from_str_radix(digits, fmt.int_base())
            .ok()
            .map(|v| if neg { -v } else { v })
    }

    /// Integer lookup with a default for missing or unparsable values.
    pub fn get_i64_or(&self, key: Key, fmt: RpcFormat, default: i64) -> i64 {
        self.get_i64(key, fmt).unwrap_or(default)
    }

    /// String lookup using the key spelling of `fmt`.
    pub fn get_str(&self, key: Key, fmt: RpcFormat) -> Option<&str> {
        self.get(fmt.key(key))
    }

    /// Render the fields on one line, for protocol error diagnostics.
    pub fn to_line(&self) -> String {
        let mut out = self.verb.clone();
        for (name, value) in &self.fields {
            out.push(' ');
            out.push_str(name);
            out.push(':');
            out.push_str(value);
        }
        out
    }
}
