//! Shared vocabulary for plexfs components.
//!
//! This crate holds the types both sides of the metadata protocol agree on:
//! log sequence numbers, the wire error-code space, server locations, and the
//! flat configuration properties consumed by `set_parameters` entry points.

pub mod errno;
pub mod error;
pub mod properties;

pub use error::{Error, Result};
pub use properties::Properties;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonically increasing identifier of metadata mutations.
///
/// Negative values never name a real sequence; they are used as "unset"
/// markers in requests (e.g. "newest checkpoint").
pub type LogSeq = i64;

/// Host and port of a server endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLocation {
    pub host: String,
    pub port: u16,
}

impl ServerLocation {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// A location is valid when it names a host and a nonzero port.
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

impl fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
