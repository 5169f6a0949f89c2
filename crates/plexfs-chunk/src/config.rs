//! Connection configuration.

use plexfs_auth::AuthTypes;
use plexfs_common::Properties;

const DEFAULT_INACTIVITY_TIMEOUT: i64 = 65;
const DEFAULT_MAX_READ_AHEAD: usize = 4 << 10;

/// Tunables of the meta-server connection, reloadable at runtime.
#[derive(Clone, Debug)]
pub struct MetaClientConfig {
    /// Seconds without a server request after which the connection is
    /// declared dead.
    pub inactivity_timeout: i64,
    /// Socket read chunk size; raised temporarily while a large body is
    /// pending.
    pub max_read_ahead: usize,
    /// Omit per-chunk file ids from the HELLO inventory.
    pub no_fids: bool,
    /// HELLO resume policy: negative disables resume, zero resumes from the
    /// first handshake on, positive resumes only after one full handshake.
    pub hello_resume: i32,
    /// Log every request and response line at debug level.
    pub trace_request_response: bool,
    /// Methods offered to the authentication backend.
    pub auth_types: AuthTypes,
}

impl Default for MetaClientConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            max_read_ahead: DEFAULT_MAX_READ_AHEAD,
            no_fids: true,
            hello_resume: -1,
            trace_request_response: false,
            auth_types: AuthTypes::KRB5 | AuthTypes::X509 | AuthTypes::PSK,
        }
    }
}

impl MetaClientConfig {
    pub fn from_properties(props: &Properties) -> Self {
        let mut config = Self::default();
        config.update(props);
        config
    }

    /// Fold recognized properties into the current settings.
    pub fn update(&mut self, props: &Properties) {
        self.inactivity_timeout = props.get_or(
            "chunkServer.meta.inactivityTimeout",
            self.inactivity_timeout,
        );
        self.max_read_ahead = props.get_or("chunkServer.meta.maxReadAhead", self.max_read_ahead);
        self.no_fids = props.get_flag("chunkServer.meta.noFids", self.no_fids);
        self.hello_resume = props.get_or("chunkServer.meta.helloResume", self.hello_resume);
        self.trace_request_response = props.get_flag(
            "chunkServer.meta.traceRequestResponseFlag",
            self.trace_request_response,
        );
        if let Some(types) = props.get("chunkserver.meta.auth.authType") {
            self.auth_types = AuthTypes::parse(types);
        }
    }
}
