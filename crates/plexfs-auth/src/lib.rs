//! Pluggable authentication backend for the meta-server connection.
//!
//! The connection state machine treats authentication as an opaque
//! request/response exchange: the backend produces a request blob for the
//! allowed method set, the metadata server answers with a response blob, and
//! the backend consumes it, optionally installing a transport filter on the
//! connection for the traffic that follows.

pub mod psk;

use std::fmt;
use std::ops::BitOr;
use thiserror::Error;

pub use psk::PskAuthBackend;

/// Authentication backend error.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no common authentication method")]
    NoCommonMethod,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("malformed authentication payload")]
    MalformedPayload,
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Bitmap of authentication methods.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuthTypes(u32);

impl AuthTypes {
    pub const NONE: AuthTypes = AuthTypes(0);
    pub const KRB5: AuthTypes = AuthTypes(0x1);
    pub const X509: AuthTypes = AuthTypes(0x2);
    pub const PSK: AuthTypes = AuthTypes(0x4);

    /// Parse a space-separated method list, e.g. `"Krb5 X509 PSK"`.
    /// Unknown names are ignored.
    pub fn parse(s: &str) -> AuthTypes {
        let mut types = AuthTypes::NONE;
        for name in s.split_whitespace() {
            match name {
                "Krb5" => types = types | AuthTypes::KRB5,
                "X509" => types = types | AuthTypes::X509,
                "PSK" => types = types | AuthTypes::PSK,
                _ => {}
            }
        }
        types
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> AuthTypes {
        AuthTypes(bits & 0x7)
    }

    pub fn contains(self, other: AuthTypes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: AuthTypes) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AuthTypes {
    type Output = AuthTypes;

    fn bitor(self, rhs: AuthTypes) -> AuthTypes {
        AuthTypes(self.0 | rhs.0)
    }
}

impl fmt::Display for AuthTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bit, name) in [
            (AuthTypes::KRB5, "Krb5"),
            (AuthTypes::X509, "X509"),
            (AuthTypes::PSK, "PSK"),
        ] {
            if self.contains(bit) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Request blob produced by a backend for the wire.
#[derive(Debug)]
pub struct AuthRequest {
    /// Methods the backend is requesting, a subset of the allowed set.
    pub requested_types: AuthTypes,
    /// Opaque payload carried as the request body.
    pub payload: Vec<u8>,
}

/// Transport-level filter a backend may install after a successful handshake.
///
/// The connection driver runs all subsequent outgoing bytes through [`seal`]
/// and all incoming bytes through [`open`].
///
/// [`seal`]: ConnectionFilter::seal
/// [`open`]: ConnectionFilter::open
pub trait ConnectionFilter: Send {
    fn name(&self) -> &'static str;

    fn seal(&mut self, data: &[u8]) -> Vec<u8>;

    fn open(&mut self, data: &[u8]) -> Result<Vec<u8>, AuthError>;
}

/// Pluggable authentication backend.
pub trait AuthBackend: Send {
    /// When false the connection skips authentication entirely.
    fn enabled(&self) -> bool;

    /// Produce the request blob for the allowed method set.
    fn request(&mut self, allowed: AuthTypes) -> Result<AuthRequest, AuthError>;

    /// Consume the server's response body. A returned filter is installed on
    /// the connection for all subsequent traffic.
    fn response(
        &mut self,
        chosen: AuthTypes,
        use_ssl: bool,
        body: &[u8],
    ) -> Result<Option<Box<dyn ConnectionFilter>>, AuthError>;
}

/// Backend used when authentication is disabled.
#[derive(Debug, Default)]
pub struct NoAuth;

impl AuthBackend for NoAuth {
    fn enabled(&self) -> bool {
        false
    }

    fn request(&mut self, _allowed: AuthTypes) -> Result<AuthRequest, AuthError> {
        Err(AuthError::NoCommonMethod)
    }

    fn response(
        &mut self,
        _chosen: AuthTypes,
        _use_ssl: bool,
        _body: &[u8],
    ) -> Result<Option<Box<dyn ConnectionFilter>>, AuthError> {
        Err(AuthError::NoCommonMethod)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth_types() {
        let all = AuthTypes::parse("Krb5 X509 PSK");
        assert!(all.contains(AuthTypes::KRB5));
        assert!(all.contains(AuthTypes::X509));
        assert!(all.contains(AuthTypes::PSK));

        let psk_only = AuthTypes::parse("PSK bogus");
        assert_eq!(psk_only, AuthTypes::PSK);
        assert!(AuthTypes::parse("").is_empty());
    }

    #[test]
    fn test_display_round_trip() {
        let types = AuthTypes::KRB5 | AuthTypes::PSK;
        assert_eq!(types.to_string(), "Krb5 PSK");
        assert_eq!(AuthTypes::parse(&types.to_string()), types);
        assert_eq!(AuthTypes::NONE.to_string(), "none");
    }

    #[test]
    fn test_from_bits_masks_unknown() {
        assert_eq!(AuthTypes::from_bits(0xff).bits(), 0x7);
    }
}
