//! Serialization of outgoing requests and responses.

use crate::{Key, RpcFormat};
use bytes::{BufMut, Bytes, BytesMut};

/// Builds an outgoing request: command name line, headers, empty line.
pub struct RequestBuilder {
    buf: BytesMut,
    fmt: RpcFormat,
}

impl RequestBuilder {
    pub fn new(verb: &str, fmt: RpcFormat) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(verb.as_bytes());
        buf.put_slice(b"\r\n");
        Self { buf, fmt }
    }

    pub fn format(&self) -> RpcFormat {
        self.fmt
    }

    pub fn field_i64(&mut self, key: Key, value: i64) -> &mut Self {
        self.field_raw(self.fmt.key(key), &format_int(value, self.fmt))
    }

    pub fn field_str(&mut self, key: Key, value: &str) -> &mut Self {
        self.field_raw(self.fmt.key(key), value)
    }

    /// Boolean header written as `1` / `0`.
    pub fn field_flag(&mut self, key: Key, value: bool) -> &mut Self {
        self.field_i64(key, i64::from(value))
    }

    fn field_raw(&mut self, name: &str, value: &str) -> &mut Self {
        self.buf.put_slice(name.as_bytes());
        self.buf.put_slice(b": ");
        self.buf.put_slice(value.as_bytes());
        self.buf.put_slice(b"\r\n");
        self
    }

    /// Terminate the header block, appending `body` after it when present.
    pub fn finish(mut self, body: &[u8]) -> Bytes {
        self.buf.put_slice(b"\r\n");
        if !body.is_empty() {
            self.buf.put_slice(body);
        }
        self.buf.freeze()
    }
}

/// Builds a response to a server-originated command: `OK`, headers, empty line.
pub struct ResponseBuilder {
    inner: RequestBuilder,
}

impl ResponseBuilder {
    pub fn new(fmt: RpcFormat) -> Self {
        Self {
            inner: RequestBuilder::new("OK", fmt),
        }
    }

    pub fn field_i64(&mut self, key: Key, value: i64) -> &mut Self {
        self.inner.field_i64(key, value);
        self
    }

    pub fn field_str(&mut self, key: Key, value: &str) -> &mut Self {
        self.inner.field_str(key, value);
        self
    }

    pub fn finish(self) -> Bytes {
        self.inner.finish(&[])
    }
}

fn format_int(value: i64, fmt: RpcFormat) -> String {
    if fmt.is_short() {
        if value < 0 {
            format!("-{:x}", value.unsigned_abs())
        } else {
            format!("{value:x}")
        }
    } else {
        value.to_string()
    }
}
