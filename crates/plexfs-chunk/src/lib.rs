//! Chunk-server side of the metadata-server connection.
//!
//! A chunk server keeps exactly one persistent connection to the metadata
//! server. [`MetaServerConn`] is the protocol state machine for it
//! (reconnect, optional authentication, the HELLO inventory handshake,
//! bounded-window dispatch, and response routing by sequence number), kept
//! free of sockets and timers so tests can drive it directly. The tokio
//! driver in [`driver`] owns the socket and the clock.

pub mod cmd;
pub mod config;
pub mod conn;
pub mod driver;
pub mod ops;

pub use cmd::{IncomingCmd, ServerCommand};
pub use config::MetaClientConfig;
pub use conn::{ConnCounters, ConnEvent, MetaServerConn};
pub use driver::{client_channel, run_session, ClientMsg, MetaServerClient, SessionEvent};

use bytes::Bytes;
use plexfs_common::ServerLocation;

/// Static identity of this chunk server, fixed for the process lifetime.
#[derive(Clone, Debug)]
pub struct ConnParams {
    /// Metadata server to connect to.
    pub meta_location: ServerLocation,
    /// Shared cluster identity; a mismatch is fatal.
    pub cluster_key: String,
    /// Digest of the running binary, reported in HELLO.
    pub md5sum: String,
    pub rack_id: i32,
    /// Port clients reach this chunk server on; the advertised IP is taken
    /// from the meta connection's local address.
    pub chunk_server_port: u16,
}

/// Chunk inventory summary carried by the HELLO handshake.
#[derive(Clone, Debug, Default)]
pub struct HelloInventory {
    pub chunk_count: u64,
    pub checksum: u64,
    /// Serialized chunk inventory, sent as the body of a full (non-resume)
    /// HELLO.
    pub content: Bytes,
    /// Chunk directories lost since the last handshake; each produces a
    /// `CORRUPT_CHUNK` notification once the handshake completes.
    pub lost_chunk_dirs: Vec<String>,
}

/// Provides the chunk inventory at handshake time.
pub trait InventorySource: Send {
    fn file_system_id(&self) -> i64;
    fn inventory(&self) -> HelloInventory;
}

/// Notified when the meta-server connection goes down. The chunk manager,
/// lease clerk, and replicator each register one to drop leases and cancel
/// replication on disconnect.
pub trait DisconnectObserver: Send + Sync {
    fn meta_connection_lost(&self);
}
