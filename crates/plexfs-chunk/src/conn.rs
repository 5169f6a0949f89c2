//! The meta-server connection state machine.
//!
//! Single-threaded and free of I/O: socket bytes come in through
//! [`MetaServerConn::handle_read`], outgoing bytes accumulate in a buffer
//! the driver flushes, timers arrive as [`MetaServerConn::tick`] calls, and
//! everything the upper layer must see is drained as [`ConnEvent`]s. The
//! driver owns the socket; tests drive the machine with byte slices.

use crate::cmd::{IncomingCmd, ServerCommand};
use crate::config::MetaClientConfig;
use crate::ops::{AuthOp, ClientOp, CorruptChunkOp, HelloOp};
use crate::{ConnParams, DisconnectObserver, InventorySource};
use bytes::{Bytes, BytesMut};
use plexfs_auth::{AuthBackend, ConnectionFilter};
use plexfs_common::{errno, ServerLocation};
use plexfs_rpc::{
    find_header_block, is_reply, key, HeaderBlock, RequestBuilder, RpcFormat, MAX_RPC_HEADER_LEN,
};
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_PENDING_OPS: usize = 96;
const CONNECT_RETRY_INTERVAL: i64 = 1;

/// Effects the driver and upper layer drain after every call into the
/// machine.
pub enum ConnEvent {
    /// A client op completed (reply matched, sent without expecting a reply,
    /// or failed on disconnect).
    OpDone(Box<dyn ClientOp>),
    /// A server command for the upper layer to execute; hand it back through
    /// [`MetaServerConn::send_response`] when done.
    Command(IncomingCmd),
    /// The authentication backend installed a transport filter; the driver
    /// applies it to all subsequent traffic.
    InstallFilter(Box<dyn ConnectionFilter>),
    /// Fatal condition (cluster key mismatch): stop the event loop, do not
    /// reconnect.
    ShutdownEventLoop,
}

/// Connection statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnCounters {
    pub connect_count: u64,
    pub hello_count: u64,
    pub hello_error_count: u64,
    pub hello_done_count: u64,
}

enum PendingBody {
    None,
    Reply(Box<dyn ClientOp>),
    Hello,
    Auth,
    Cmd(IncomingCmd),
}

/// Chunk-server side of the persistent metadata-server connection.
pub struct MetaServerConn {
    params: ConnParams,
    config: MetaClientConfig,
    inventory: Box<dyn InventorySource>,
    auth: Box<dyn AuthBackend>,
    observers: Vec<Arc<dyn DisconnectObserver>>,

    seq: i64,
    rpc_format: RpcFormat,
    requested_short: bool,
    generation: u64,
    sent_hello: bool,
    hello: Option<Box<HelloOp>>,
    auth_op: Option<Box<AuthOp>>,
    pending_ops: VecDeque<Box<dyn ClientOp>>,
    dispatched_ops: BTreeMap<i64, Box<dyn ClientOp>>,
    pending_responses: VecDeque<IncomingCmd>,
    pending_body: PendingBody,
    content_length: usize,
    max_pending_ops: usize,
    /// Advertised chunk-server location, captured from the first meta
    /// connection's local address.
    advertised: Option<ServerLocation>,
    filter_installed: bool,

    connected: bool,
    stopped: bool,
    reconnect_requested: bool,
    last_recv_cmd_time: i64,
    last_connect_time: i64,
    connected_time: i64,

    out: BytesMut,
    events: VecDeque<ConnEvent>,
    counters: ConnCounters,
}

impl MetaServerConn {
    pub fn new(
        params: ConnParams,
        config: MetaClientConfig,
        inventory: Box<dyn InventorySource>,
        auth: Box<dyn AuthBackend>,
    ) -> Self {
        Self {
            params,
            config,
            inventory,
            auth,
            observers: Vec::new(),
            seq: rand::thread_rng().gen_range(1..1 << 30),
            rpc_format: RpcFormat::Undef,
            requested_short: false,
            generation: 1,
            sent_hello: false,
            hello: None,
            auth_op: None,
            pending_ops: VecDeque::new(),
            dispatched_ops: BTreeMap::new(),
            pending_responses: VecDeque::new(),
            pending_body: PendingBody::None,
            content_length: 0,
            max_pending_ops: DEFAULT_MAX_PENDING_OPS,
            advertised: None,
            filter_installed: false,
            connected: false,
            stopped: false,
            reconnect_requested: false,
            last_recv_cmd_time: 0,
            last_connect_time: 0,
            connected_time: 0,
            out: BytesMut::with_capacity(4 << 10),
            events: VecDeque::new(),
            counters: ConnCounters::default(),
        }
    }

    pub fn add_disconnect_observer(&mut self, observer: Arc<dyn DisconnectObserver>) {
        self.observers.push(observer);
    }

    pub fn set_parameters(&mut self, props: &plexfs_common::Properties) {
        self.config.update(props);
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// The HELLO handshake has completed on the current connection.
    pub fn handshake_done(&self) -> bool {
        self.sent_hello && self.hello.is_none()
    }

    fn is_up(&self) -> bool {
        self.connected && self.handshake_done()
    }

    pub fn counters(&self) -> ConnCounters {
        self.counters
    }

    /// Seconds since the current connection was established, zero when down.
    pub fn connection_uptime(&self, now: i64) -> i64 {
        if self.is_up() {
            now - self.last_connect_time
        } else {
            0
        }
    }

    /// Clock value at which the last handshake completed.
    pub fn connected_time(&self) -> i64 {
        self.connected_time
    }

    /// Socket read chunk size the driver should use.
    pub fn max_read_ahead(&self) -> usize {
        self.config.max_read_ahead
    }

    /// Outgoing bytes awaiting a flush.
    pub fn has_output(&self) -> bool {
        !self.out.is_empty()
    }

    pub fn take_output(&mut self) -> BytesMut {
        self.out.split()
    }

    pub fn next_event(&mut self) -> Option<ConnEvent> {
        self.events.pop_front()
    }

    /// Ask for a reconnect at the next tick.
    pub fn request_reconnect(&mut self) {
        self.reconnect_requested = true;
    }

    /// Drop the connection immediately as a protocol error.
    pub fn force_down(&mut self) {
        if self.connected {
            self.error("protocol error");
        }
    }

    /// Periodic timer. Returns true when the driver should dial the
    /// metadata server now.
    pub fn tick(&mut self, now: i64) -> bool {
        if self.stopped {
            return false;
        }
        if self.reconnect_requested {
            self.reconnect_requested = false;
            warn!("meta server reconnect requested");
            self.error("meta server reconnect requested");
        }
        if self.connected
            && self.handshake_done()
            && self.last_recv_cmd_time + self.config.inactivity_timeout < now
        {
            error!(
                idle = now - self.last_recv_cmd_time,
                "meta server inactivity timeout"
            );
            self.error("heartbeat request timeout");
        }
        if !self.connected {
            if self.hello.is_some() {
                self.sent_hello = false;
                self.hello = None;
            }
            if self.last_connect_time + CONNECT_RETRY_INTERVAL < now {
                self.last_connect_time = now;
                self.prepare_connect();
                return true;
            }
            return false;
        }
        if self.auth_op.is_some() || !self.handshake_done() {
            return false;
        }
        self.dispatch_ops();
        false
    }

    fn prepare_connect(&mut self) {
        self.pending_body = PendingBody::None;
        self.auth_op = None;
        self.pending_responses.clear();
        self.content_length = 0;
        self.counters.connect_count += 1;
        self.generation = self.generation.wrapping_add(1);
        self.rpc_format = RpcFormat::Undef;
        self.requested_short = false;
        self.sent_hello = false;
        self.filter_installed = false;
        info!(location = %self.params.meta_location, "connecting to meta server");
    }

    /// The dial finished; `local_addr` is the socket's local address.
    pub fn connected(&mut self, now: i64, local_addr: SocketAddr) {
        self.connected = true;
        self.last_connect_time = now;
        self.last_recv_cmd_time = now;
        info!(location = %self.params.meta_location, "connected to meta server");
        self.send_hello(now, local_addr);
    }

    pub fn connect_failed(&mut self, err: &io::Error) {
        error!(location = %self.params.meta_location, %err, "connection to meta server failed");
    }

    /// The socket closed or failed under the driver.
    pub fn socket_closed(&mut self, _now: i64) {
        if self.connected {
            self.error("network error");
        }
    }

    fn send_hello(&mut self, now: i64, local_addr: SocketAddr) {
        if self.hello.is_some() || self.auth_op.is_some() {
            return;
        }
        let meta_loopback = self
            .params
            .meta_location
            .host
            .parse::<IpAddr>()
            .map(|a| a.is_loopback())
            .unwrap_or(false);
        let ip = local_addr.ip();
        let host = if ip.is_unspecified() && meta_loopback {
            self.params.meta_location.host.clone()
        } else {
            ip.to_string()
        };
        let parsed = host.parse::<IpAddr>().ok();
        let unspecified = parsed.map(|a| a.is_unspecified()).unwrap_or(true);
        let loopback_mismatch =
            parsed.map(|a| a.is_loopback()).unwrap_or(false) && !meta_loopback;
        if unspecified || loopback_mismatch {
            error!(address = %host, "invalid chunk server address");
            self.error("invalid socket address");
            return;
        }
        let location = ServerLocation::new(host, self.params.chunk_server_port);
        match &self.advertised {
            None => {
                info!(location = %location, "chunk server address set");
                self.advertised = Some(location);
            }
            Some(previous) if *previous != location => {
                warn!(
                    previous = %previous,
                    current = %location,
                    "meta connection local address changed"
                );
            }
            _ => {}
        }
        if !self.authenticate(now) {
            self.submit_hello(now);
        }
    }

    /// Start the authentication exchange when the backend is enabled.
    /// Returns true when authentication is in progress (or failed and tore
    /// the connection down).
    fn authenticate(&mut self, _now: i64) -> bool {
        if !self.auth.enabled() {
            return false;
        }
        assert!(
            self.auth_op.is_none(),
            "invalid authenticate invocation: auth is in flight"
        );
        let seq = self.next_seq();
        match self.auth.request(self.config.auth_types) {
            Ok(request) => {
                let op = Box::new(AuthOp::new(seq, request.requested_types, request.payload));
                info!(seq, types = %op.requested_types, "authentication started");
                self.request_op(op.as_ref(), true);
                self.auth_op = Some(op);
                true
            }
            Err(err) => {
                error!(%err, "authentication request failure");
                self.error("authentication error");
                true
            }
        }
    }

    fn submit_hello(&mut self, _now: i64) {
        assert!(self.hello.is_none(), "invalid submit hello invocation");
        let inv = self.inventory.inventory();
        let resume_step = if self.config.hello_resume < 0 {
            -1
        } else if self.config.hello_resume == 0 || self.counters.hello_done_count > 0 {
            0
        } else {
            -1
        };
        let op = Box::new(HelloOp {
            base: crate::ops::OpBase {
                seq: self.next_seq(),
                ..Default::default()
            },
            location: self
                .advertised
                .clone()
                .expect("advertised address set before hello"),
            cluster_key: self.params.cluster_key.clone(),
            md5sum: self.params.md5sum.clone(),
            rack_id: self.params.rack_id,
            no_fids: self.config.no_fids,
            hello_done_count: self.counters.hello_done_count,
            resume_step,
            file_system_id: self.inventory.file_system_id(),
            chunk_count: inv.chunk_count,
            checksum: inv.checksum,
            inventory: inv.content,
            lost_chunk_dirs: inv.lost_chunk_dirs,
            meta_file_system_id: -1,
            delete_all_chunks: false,
            deleted_count: 0,
            modified_count: 0,
            meta_chunk_count: 0,
            meta_checksum: None,
            deleted_report: 0,
            pending_notify: false,
            resume_reply: Bytes::new(),
        });
        self.dispatch_hello(op);
    }

    fn dispatch_hello(&mut self, op: Box<HelloOp>) {
        assert!(
            !self.sent_hello && self.auth_op.is_none(),
            "dispatch hello: invalid invocation"
        );
        if !self.connected {
            return;
        }
        self.sent_hello = true;
        info!(
            seq = op.base.seq,
            resume = op.resume_step,
            "sending hello to meta server"
        );
        self.request_op(op.as_ref(), true);
        self.hello = Some(op);
    }

    fn resubmit_hello(&mut self) {
        let mut hello = self.hello.take().expect("hello in flight");
        self.sent_hello = false;
        hello.base.seq = self.next_seq();
        self.dispatch_hello(hello);
    }

    /// Submit an op for the metadata server. Dispatched immediately when the
    /// window allows, queued otherwise; completed with `EHOSTUNREACH` when
    /// the connection is shut down.
    pub fn enqueue_op(&mut self, mut op: Box<dyn ClientOp>) {
        op.base_mut().generation = self.generation;
        if self.auth_op.is_none()
            && self.pending_ops.is_empty()
            && self.is_up()
            && self.dispatched_ops.len() < self.max_pending_ops
        {
            self.dispatch_one(op);
        } else if !self.stopped && self.params.meta_location.is_valid() {
            self.pending_ops.push_back(op);
        } else {
            op.base_mut().status = -errno::EHOSTUNREACH;
            self.complete_op(op);
        }
    }

    fn dispatch_one(&mut self, mut op: Box<dyn ClientOp>) {
        let seq = self.next_seq();
        op.base_mut().seq = seq;
        op.base_mut().status = 0;
        self.request_op(op.as_ref(), false);
        if op.no_reply() {
            self.complete_op(op);
        } else if self.dispatched_ops.insert(seq, op).is_some() {
            panic!("duplicate sequence number");
        }
    }

    fn dispatch_ops(&mut self) {
        if !self.is_up() || self.auth_op.is_some() {
            return;
        }
        let mut in_flight = self.dispatched_ops.len();
        while in_flight < self.max_pending_ops {
            let Some(op) = self.pending_ops.pop_front() else {
                break;
            };
            self.dispatch_one(op);
            in_flight += 1;
        }
    }

    /// Respond to a previously delivered server command. Responses for an
    /// older generation are discarded; responses during an authentication
    /// exchange queue until it finishes.
    pub fn send_response(&mut self, cmd: IncomingCmd) {
        let discard =
            !self.sent_hello || cmd.meta.generation != self.generation || !self.connected;
        debug!(
            seq = cmd.meta.seq,
            status = cmd.meta.outcome.status,
            discard,
            "meta request response"
        );
        if discard {
            return;
        }
        if self.auth_op.is_some() {
            self.pending_responses.push_back(cmd);
            return;
        }
        self.write_response(&cmd);
        if !self.pending_ops.is_empty() {
            self.dispatch_ops();
        }
    }

    fn write_response(&mut self, cmd: &IncomingCmd) {
        let bytes = cmd.write_response(self.rpc_format);
        self.trace_wire("cs response", &bytes);
        self.out.extend_from_slice(&bytes);
    }

    /// Bytes arrived from the socket.
    pub fn handle_read(&mut self, now: i64, buf: &mut BytesMut) {
        while self.connected && !self.stopped {
            match std::mem::replace(&mut self.pending_body, PendingBody::None) {
                PendingBody::Auth => {
                    let need = {
                        let op = self.auth_op.as_mut().expect("auth op awaiting content");
                        let need = op.response_len - op.response.len();
                        let take = need.min(buf.len());
                        op.response.extend_from_slice(&buf.split_to(take));
                        need - take
                    };
                    if need > 0 {
                        self.pending_body = PendingBody::Auth;
                        return;
                    }
                    self.finish_auth_response(now, buf);
                }
                PendingBody::Reply(op) => {
                    if buf.len() < self.content_length {
                        self.pending_body = PendingBody::Reply(op);
                        return;
                    }
                    let body = buf.split_to(self.content_length);
                    self.content_length = 0;
                    self.finish_reply_content(op, &body);
                }
                PendingBody::Hello => {
                    if buf.len() < self.content_length {
                        self.pending_body = PendingBody::Hello;
                        return;
                    }
                    let body = buf.split_to(self.content_length);
                    self.content_length = 0;
                    self.finish_hello_content(now, &body);
                }
                PendingBody::Cmd(cmd) => {
                    if buf.len() < self.content_length {
                        self.pending_body = PendingBody::Cmd(cmd);
                        return;
                    }
                    let body = buf.split_to(self.content_length);
                    self.content_length = 0;
                    self.finish_cmd_content(now, cmd, &body);
                }
                PendingBody::None => {
                    let Some(len) = find_header_block(buf) else {
                        if buf.len() > MAX_RPC_HEADER_LEN {
                            error!(size = buf.len(), "exceeded max request header size");
                            buf.clear();
                            self.error("protocol parse error");
                        }
                        return;
                    };
                    let block = buf.split_to(len);
                    self.trace_wire("meta message", &block);
                    let hdr = HeaderBlock::parse(&block);
                    if is_reply(&block) {
                        self.handle_reply(now, &hdr);
                    } else {
                        self.handle_cmd(now, &hdr);
                    }
                }
            }
        }
        buf.clear();
    }

    fn handle_reply(&mut self, now: i64, hdr: &HeaderBlock) {
        if self.rpc_format == RpcFormat::Undef
            && self.requested_short
            && hdr.get("Cseq").is_none()
            && hdr.get("c").is_some()
        {
            debug!("negotiated short rpc format");
            self.rpc_format = RpcFormat::Short;
        }
        let fmt = self.rpc_format;
        let seq = hdr.get_i64_or(key::CSEQ, fmt, -1);
        let mut status = hdr.get_i64_or(key::STATUS, fmt, -1) as i32;
        let mut status_msg = String::new();
        if status < 0 {
            status = -errno::wire_to_host_errno(-status);
            status_msg = hdr.get_str(key::STATUS_MSG, fmt).unwrap_or_default().to_string();
        }
        self.content_length = hdr.get_i64_or(key::CONTENT_LENGTH, fmt, 0).max(0) as usize;

        let auth_matches = match self.auth_op.as_ref() {
            Some(op) => !self.handshake_done() || seq == op.base.seq,
            None => false,
        };
        if auth_matches {
            let content_length = std::mem::take(&mut self.content_length);
            let op = self.auth_op.as_mut().expect("auth op");
            if seq != op.base.seq {
                error!(
                    seq,
                    expected = op.base.seq,
                    "authentication response sequence mismatch"
                );
                self.error("authentication protocol error");
                return;
            }
            op.base.status = status;
            op.base.status_msg = status_msg;
            op.response_len = content_length;
            let parsed = op.parse_response(hdr, fmt);
            if !parsed && status >= 0 {
                error!(seq, "invalid authentication response");
                self.error("invalid meta server response");
                return;
            }
            self.pending_body = PendingBody::Auth;
            return;
        }
        if self.hello.is_some() {
            self.handle_hello_reply(now, hdr, seq, status, &status_msg);
            return;
        }
        let Some(mut op) = self.dispatched_ops.remove(&seq) else {
            error!(reply = %hdr.to_line(), "no dispatched op for reply");
            self.error("protocol invalid sequence");
            return;
        };
        op.base_mut().status = status;
        if status < 0 && op.base().status_msg.is_empty() {
            op.base_mut().status_msg = status_msg;
        }
        if !op.parse_response(hdr, fmt) && status >= 0 {
            error!(seq, op = op.name(), "invalid meta reply response");
            self.error("meta response parse error");
            return;
        }
        if self.content_length > 0 {
            self.pending_body = PendingBody::Reply(op);
            return;
        }
        self.complete_op(op);
    }

    fn handle_hello_reply(
        &mut self,
        now: i64,
        hdr: &HeaderBlock,
        seq: i64,
        status: i32,
        status_msg: &str,
    ) {
        if status == -errno::EBADCLUSTERKEY {
            error!(
                cluster_key = %self.params.cluster_key,
                "exiting due to cluster key mismatch"
            );
            self.stopped = true;
            self.events.push_back(ConnEvent::ShutdownEventLoop);
            return;
        }
        self.counters.hello_count += 1;
        let fmt = self.rpc_format;
        let content_length = self.content_length;
        let (hello_seq, resume_step) = {
            let hello = self.hello.as_ref().expect("hello in flight");
            (hello.base.seq, hello.resume_step)
        };
        let resume_reply = if status == 0 {
            hdr.get_i64_or(key::RESUME, fmt, -1)
        } else {
            -1
        };
        let error_flag = seq != hello_seq
            || (status != 0 && content_length > 0)
            || (resume_step != 0 && content_length > 0)
            || (resume_step < 0 && status != 0)
            || (resume_step >= 0 && status != 0 && status != -errno::EAGAIN)
            || (resume_step >= 0 && status == 0 && resume_reply != i64::from(resume_step));
        if error_flag {
            error!(
                seq,
                expected = hello_seq,
                status,
                msg = status_msg,
                resume = resume_step,
                reply_resume = resume_reply,
                content_length,
                "hello response error"
            );
            self.counters.hello_error_count += 1;
            self.error("handshake error");
            return;
        }
        if status != 0 {
            // Busy server asked for a retry; fall back to a full handshake.
            self.hello.as_mut().expect("hello in flight").resume_step = -1;
            self.resubmit_hello();
            return;
        }
        {
            let hello = self.hello.as_mut().expect("hello in flight");
            hello.meta_file_system_id = hdr.get_i64_or(key::FILE_SYSTEM_ID, fmt, -1);
            let delete_all = hdr.get_i64_or(key::DELETE_ALL_CHUNKS, fmt, -1);
            hello.delete_all_chunks = hello.meta_file_system_id > 0
                && delete_all == hello.meta_file_system_id
                && hello.file_system_id > 0
                && hello.file_system_id != hello.meta_file_system_id;
            hello.deleted_count = hdr.get_i64_or(key::DELETED, fmt, 0).max(0) as u64;
            hello.modified_count = hdr.get_i64_or(key::MODIFIED, fmt, 0).max(0) as u64;
            hello.meta_chunk_count = hdr.get_i64_or(key::CHUNKS, fmt, 0).max(0) as u64;
            hello.meta_checksum = hdr.get_i64(key::CHECKSUM, fmt).map(|v| v as u64);
            hello.deleted_report = hdr
                .get_i64_or(key::DELETED_REPORT, fmt, hello.deleted_count as i64)
                .max(0) as u64;
            hello.pending_notify = hdr.get_i64_or(key::PENDING_NOTIFY, fmt, 0) != 0;
        }
        self.max_pending_ops = hdr
            .get_i64_or(key::MAX_PENDING, fmt, DEFAULT_MAX_PENDING_OPS as i64)
            .max(1) as usize;
        if resume_step == 0 {
            if self.content_length > 0 {
                self.pending_body = PendingBody::Hello;
                return;
            }
            self.advance_hello();
            return;
        }
        self.finish_hello(now);
    }

    fn finish_hello_content(&mut self, _now: i64, body: &[u8]) {
        let ok = self
            .hello
            .as_mut()
            .expect("hello in flight")
            .parse_response_content(body);
        if !ok {
            error!("invalid hello response content");
            self.error("response body parse error");
            return;
        }
        self.advance_hello();
    }

    /// Step 0 accepted; move to step 1 and send the delta request.
    fn advance_hello(&mut self) {
        self.hello.as_mut().expect("hello in flight").resume_step = 1;
        self.resubmit_hello();
    }

    fn finish_hello(&mut self, now: i64) {
        let hello = self.hello.take().expect("hello in flight");
        self.connected_time = now;
        self.counters.hello_done_count += 1;
        info!(
            location = %self.params.meta_location,
            file_system_id = hello.meta_file_system_id,
            "meta server handshake complete"
        );
        for dir in &hello.lost_chunk_dirs {
            self.enqueue_op(Box::new(CorruptChunkOp::new(-1, dir.clone(), false)));
        }
        self.dispatch_ops();
    }

    fn finish_reply_content(&mut self, mut op: Box<dyn ClientOp>, body: &[u8]) {
        if !op.parse_response_content(body) {
            error!(
                seq = op.base().seq,
                op = op.name(),
                "invalid meta reply response content"
            );
            op.base_mut().status = -errno::EHOSTUNREACH;
            self.events.push_back(ConnEvent::OpDone(op));
            self.error("response body parse error");
            return;
        }
        self.complete_op(op);
    }

    fn handle_cmd(&mut self, now: i64, hdr: &HeaderBlock) {
        let fmt = self.rpc_format;
        let Some((cmd, mut meta)) = ServerCommand::parse(hdr, fmt) else {
            error!(request = %hdr.to_line(), "invalid meta request");
            self.error("request parse error");
            return;
        };
        meta.generation = self.generation;
        let incoming = IncomingCmd { cmd, meta };
        self.content_length = incoming.cmd.content_length();
        if self.content_length > 0 {
            self.pending_body = PendingBody::Cmd(incoming);
            return;
        }
        self.finish_cmd(now, incoming);
    }

    fn finish_cmd_content(&mut self, now: i64, mut incoming: IncomingCmd, body: &[u8]) {
        if !incoming.cmd.parse_content(body) {
            error!(
                seq = incoming.meta.seq,
                cmd = incoming.cmd.name(),
                "invalid meta request content"
            );
            self.error("request body parse error");
            return;
        }
        self.finish_cmd(now, incoming);
    }

    fn finish_cmd(&mut self, now: i64, incoming: IncomingCmd) {
        self.last_recv_cmd_time = now;
        debug!(
            seq = incoming.meta.seq,
            cmd = incoming.cmd.name(),
            "meta request"
        );
        if self.auth_op.is_none() {
            if let ServerCommand::Heartbeat(hb) = &incoming.cmd {
                let reauthenticate = hb.authenticate;
                let max_pending = hb.max_pending_ops;
                if reauthenticate {
                    let started = self.authenticate(now);
                    if started && !self.connected {
                        return;
                    }
                }
                self.max_pending_ops = max_pending;
            }
        }
        self.events.push_back(ConnEvent::Command(incoming));
    }

    fn finish_auth_response(&mut self, now: i64, buf: &mut BytesMut) {
        assert!(
            self.auth_op.is_some() && self.connected,
            "handle auth response: invalid invocation"
        );
        let mut op = self.auth_op.take().expect("auth op");
        if !buf.is_empty() {
            error!(
                extra = buf.len(),
                "bytes past the authentication response"
            );
            if !op.base.status_msg.is_empty() {
                op.base.status_msg.push_str("; ");
            }
            op.base.status_msg.push_str("invalid extraneous data received");
            op.base.status = -errno::EINVAL;
        } else if op.base.status == 0 {
            if self.filter_installed && !self.handshake_done() {
                op.base.status = -errno::EINVAL;
                op.base.status_msg = "filter exists prior to handshake completion".into();
            } else {
                match self.auth.response(op.chosen_type, op.use_ssl, &op.response) {
                    Ok(None) => {}
                    Ok(Some(filter)) => {
                        self.filter_installed = true;
                        self.events.push_back(ConnEvent::InstallFilter(filter));
                    }
                    Err(err) => {
                        op.base.status = -errno::EPERM;
                        op.base.status_msg = err.to_string();
                    }
                }
            }
        }
        if op.base.status != 0 {
            error!(
                seq = op.base.seq,
                status = op.base.status,
                msg = %op.base.status_msg,
                "authentication failed"
            );
            self.error("authentication protocol error");
            return;
        }
        info!(seq = op.base.seq, "authentication finished");
        if self.handshake_done() {
            // Re-authentication on a live connection: flush the responses
            // that queued behind it, in arrival order.
            while let Some(cmd) = self.pending_responses.pop_front() {
                self.write_response(&cmd);
            }
            self.dispatch_ops();
            return;
        }
        assert!(
            self.hello.is_none(),
            "hello op in flight prior to authentication completion"
        );
        debug_assert!(self.pending_responses.is_empty());
        self.pending_responses.clear();
        self.submit_hello(now);
    }

    /// Tear the connection down after a protocol violation or timeout. All
    /// pending and in-flight ops complete with `EHOSTUNREACH`; disconnect
    /// observers fire; a reconnect is attempted at the next tick.
    fn error(&mut self, msg: &str) {
        let mut doomed: Vec<Box<dyn ClientOp>> = Vec::new();
        if let PendingBody::Reply(op) =
            std::mem::replace(&mut self.pending_body, PendingBody::None)
        {
            doomed.push(op);
        }
        self.auth_op = None;
        self.pending_responses.clear();
        if self.connected {
            self.generation = self.generation.wrapping_add(1);
            error!(
                location = %self.params.meta_location,
                msg,
                "closing meta server connection"
            );
            self.connected = false;
            self.content_length = 0;
            self.filter_installed = false;
            self.out.clear();
            for observer in &self.observers {
                observer.meta_connection_lost();
            }
        }
        doomed.extend(std::mem::take(&mut self.dispatched_ops).into_values());
        doomed.extend(self.pending_ops.drain(..));
        for mut op in doomed {
            op.base_mut().status = -errno::EHOSTUNREACH;
            op.base_mut().status_msg = "host unreachable".into();
            self.events.push_back(ConnEvent::OpDone(op));
        }
        self.sent_hello = false;
        self.hello = None;
    }

    /// Permanent shutdown: fail everything in flight, never reconnect.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.generation = self.generation.wrapping_add(1);
        self.connected = false;
        let mut doomed: Vec<Box<dyn ClientOp>> = Vec::new();
        if let PendingBody::Reply(op) =
            std::mem::replace(&mut self.pending_body, PendingBody::None)
        {
            doomed.push(op);
        }
        doomed.extend(std::mem::take(&mut self.dispatched_ops).into_values());
        doomed.extend(self.pending_ops.drain(..));
        for mut op in doomed {
            op.base_mut().status = -errno::EHOSTUNREACH;
            self.events.push_back(ConnEvent::OpDone(op));
        }
        self.auth_op = None;
        self.pending_responses.clear();
        self.sent_hello = false;
        self.hello = None;
        self.out.clear();
    }

    fn request_op(&mut self, op: &dyn ClientOp, request_short: bool) {
        let fmt = self.rpc_format;
        let mut req = RequestBuilder::new(op.name(), fmt);
        req.field_i64(key::CSEQ, op.base().seq);
        if request_short && !fmt.is_short() {
            req.field_flag(key::SHORT_RPC_FMT, true);
            self.requested_short = true;
        }
        op.write_request(&mut req);
        let body = op.content();
        if !body.is_empty() {
            req.field_i64(key::CONTENT_LENGTH, body.len() as i64);
        }
        let bytes = req.finish(body);
        debug!(seq = op.base().seq, op = op.name(), "cs request");
        self.trace_wire("cs request", &bytes);
        self.out.extend_from_slice(&bytes);
    }

    fn complete_op(&mut self, op: Box<dyn ClientOp>) {
        debug!(
            seq = op.base().seq,
            status = op.base().status,
            op = op.name(),
            "op completed"
        );
        self.events.push_back(ConnEvent::OpDone(op));
    }

    fn next_seq(&mut self) -> i64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn trace_wire(&self, label: &str, bytes: &[u8]) {
        if !self.config.trace_request_response {
            return;
        }
        for line in String::from_utf8_lossy(bytes).lines() {
            debug!(target: "plexfs_chunk::wire", "{label}: {line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HelloInventory, InventorySource};
    use plexfs_auth::{AuthBackend, NoAuth, PskAuthBackend};
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const T0: i64 = 100;

    struct MockInventory {
        lost_dirs: Vec<String>,
    }

    impl InventorySource for MockInventory {
        fn file_system_id(&self) -> i64 {
            42
        }

        fn inventory(&self) -> HelloInventory {
            HelloInventory {
                chunk_count: 3,
                checksum: 7,
                content: Bytes::from_static(b"inventory"),
                lost_chunk_dirs: self.lost_dirs.clone(),
            }
        }
    }

    #[derive(Default)]
    struct LostCount(AtomicUsize);

    impl DisconnectObserver for LostCount {
        fn meta_connection_lost(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[derive(Debug, Default)]
    struct ProbeOp {
        base: crate::ops::OpBase,
        body: Vec<u8>,
    }

    impl ClientOp for ProbeOp {
        fn base(&self) -> &crate::ops::OpBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut crate::ops::OpBase {
            &mut self.base
        }

        fn name(&self) -> &'static str {
            "PROBE"
        }

        fn write_request(&self, _req: &mut RequestBuilder) {}

        fn parse_response_content(&mut self, body: &[u8]) -> bool {
            self.body = body.to_vec();
            true
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn params() -> ConnParams {
        ConnParams {
            meta_location: ServerLocation::new("10.10.0.1", 20000),
            cluster_key: "test-cluster".into(),
            md5sum: "0123abcd".into(),
            rack_id: 3,
            chunk_server_port: 30000,
        }
    }

    fn conn_with(
        hello_resume: i32,
        lost_dirs: Vec<String>,
        auth: Box<dyn AuthBackend>,
    ) -> MetaServerConn {
        let config = MetaClientConfig {
            hello_resume,
            ..MetaClientConfig::default()
        };
        MetaServerConn::new(
            params(),
            config,
            Box::new(MockInventory { lost_dirs }),
            auth,
        )
    }

    fn connect(conn: &mut MetaServerConn, now: i64) {
        assert!(conn.tick(now), "expected a dial request");
        conn.connected(now, "10.10.0.2:41000".parse().unwrap());
    }

    /// Parse the next request out of the connection's output.
    fn next_request(conn: &mut MetaServerConn) -> HeaderBlock {
        let out = conn.take_output();
        let len = find_header_block(&out).expect("complete request");
        HeaderBlock::parse(&out[..len])
    }

    fn feed(conn: &mut MetaServerConn, now: i64, bytes: &[u8]) {
        let mut buf = BytesMut::from(bytes);
        conn.handle_read(now, &mut buf);
    }

    fn reply(seq: i64, fields: &[(&str, &str)]) -> Vec<u8> {
        let mut out = format!("OK\r\nCseq: {seq}\r\n");
        for (name, value) in fields {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    fn handshake(conn: &mut MetaServerConn, now: i64) {
        connect(conn, now);
        let hello = next_request(conn);
        assert_eq!(hello.verb(), "HELLO");
        let seq = hello.get_i64_or(key::CSEQ, RpcFormat::Long, -1);
        feed(conn, now, &reply(seq, &[("Status", "0")]));
        assert!(conn.handshake_done());
    }

    #[test]
    fn test_full_hello_handshake() {
        let mut conn = conn_with(-1, Vec::new(), Box::new(NoAuth));
        connect(&mut conn, T0 + 2);
        let out = conn.take_output();
        let len = find_header_block(&out).unwrap();
        let hello = HeaderBlock::parse(&out[..len]);
        assert_eq!(hello.verb(), "HELLO");
        assert_eq!(hello.get("Chunk-server-name"), Some("10.10.0.2"));
        assert_eq!(hello.get("Cluster-key"), Some("test-cluster"));
        // full handshake: no resume header, inventory as body
        assert_eq!(hello.get("Resume"), None);
        assert_eq!(hello.get("Content-length"), Some("9"));
        assert_eq!(&out[len..], b"inventory");

        let seq = hello.get_i64_or(key::CSEQ, RpcFormat::Long, -1);
        feed(&mut conn, T0 + 2, &reply(seq, &[("Status", "0")]));
        assert!(conn.handshake_done());
        assert_eq!(conn.counters().hello_done_count, 1);
        assert_eq!(conn.connected_time(), T0 + 2);
        assert_eq!(conn.connection_uptime(T0 + 12), 10);
    }

    #[test]
    fn test_two_step_resume_handshake_with_lost_dirs() {
        let mut conn = conn_with(0, vec!["/data/3".into()], Box::new(NoAuth));
        connect(&mut conn, T0 + 2);

        let step0 = next_request(&mut conn);
        assert_eq!(step0.get("Resume"), Some("0"));
        let seq0 = step0.get_i64_or(key::CSEQ, RpcFormat::Long, -1);
        feed(
            &mut conn,
            T0 + 2,
            &reply(seq0, &[("Status", "0"), ("Resume", "0"), ("Chunks", "3")]),
        );
        assert!(!conn.handshake_done());

        let step1 = next_request(&mut conn);
        assert_eq!(step1.verb(), "HELLO");
        assert_eq!(step1.get("Resume"), Some("1"));
        let seq1 = step1.get_i64_or(key::CSEQ, RpcFormat::Long, -1);
        assert_eq!(seq1, seq0 + 1);
        feed(
            &mut conn,
            T0 + 3,
            &reply(seq1, &[("Status", "0"), ("Resume", "1")]),
        );
        assert!(conn.handshake_done());

        // the lost chunk dir produced a corrupt-chunk notification
        let corrupt = next_request(&mut conn);
        assert_eq!(corrupt.verb(), "CORRUPT_CHUNK");
        assert_eq!(corrupt.get("Chunk-dir"), Some("/data/3"));
        let mut completed = Vec::new();
        while let Some(event) = conn.next_event() {
            if let ConnEvent::OpDone(op) = event {
                completed.push(op);
            }
        }
        assert_eq!(completed.len(), 1);
        assert!(completed[0].as_any().is::<CorruptChunkOp>());
        assert_eq!(completed[0].base().status, 0);
    }

    #[test]
    fn test_step0_delta_content_advances_to_step1() {
        let mut conn = conn_with(0, Vec::new(), Box::new(NoAuth));
        connect(&mut conn, T0 + 2);
        let step0 = next_request(&mut conn);
        let seq0 = step0.get_i64_or(key::CSEQ, RpcFormat::Long, -1);
        let mut bytes = reply(
            seq0,
            &[("Status", "0"), ("Resume", "0"), ("Content-length", "5")],
        );
        bytes.extend_from_slice(b"delta");
        feed(&mut conn, T0 + 2, &bytes);

        let step1 = next_request(&mut conn);
        assert_eq!(step1.get("Resume"), Some("1"));
    }

    #[test]
    fn test_bad_cluster_key_shuts_down_event_loop() {
        let mut conn = conn_with(-1, Vec::new(), Box::new(NoAuth));
        connect(&mut conn, T0 + 2);
        let hello = next_request(&mut conn);
        let seq = hello.get_i64_or(key::CSEQ, RpcFormat::Long, -1);
        feed(&mut conn, T0 + 2, &reply(seq, &[("Status", "-1001")]));

        assert!(matches!(
            conn.next_event(),
            Some(ConnEvent::ShutdownEventLoop)
        ));
        assert!(conn.is_stopped());
        // no reconnect attempts after the fatal error
        assert!(!conn.tick(T0 + 60));
    }

    #[test]
    fn test_eagain_falls_back_to_full_hello() {
        let mut conn = conn_with(0, Vec::new(), Box::new(NoAuth));
        connect(&mut conn, T0 + 2);
        let step0 = next_request(&mut conn);
        assert_eq!(step0.get("Resume"), Some("0"));
        let seq0 = step0.get_i64_or(key::CSEQ, RpcFormat::Long, -1);
        feed(&mut conn, T0 + 2, &reply(seq0, &[("Status", "-11")]));

        let full = next_request(&mut conn);
        assert_eq!(full.verb(), "HELLO");
        assert_eq!(full.get("Resume"), None);
        assert_eq!(full.get("Content-length"), Some("9"));
        assert!(!conn.handshake_done());
    }

    #[test]
    fn test_unknown_reply_sequence_is_protocol_error() {
        let mut conn = conn_with(-1, Vec::new(), Box::new(NoAuth));
        let lost = Arc::new(LostCount::default());
        conn.add_disconnect_observer(lost.clone());
        handshake(&mut conn, T0 + 2);

        conn.enqueue_op(Box::new(ProbeOp::default()));
        let probe = next_request(&mut conn);
        assert_eq!(probe.verb(), "PROBE");
        let seq = probe.get_i64_or(key::CSEQ, RpcFormat::Long, -1);

        feed(&mut conn, T0 + 3, &reply(seq + 100, &[("Status", "0")]));
        assert!(!conn.is_connected());
        assert_eq!(lost.0.load(Ordering::Relaxed), 1);

        let mut failed = 0;
        while let Some(event) = conn.next_event() {
            if let ConnEvent::OpDone(op) = event {
                assert_eq!(op.base().status, -errno::EHOSTUNREACH);
                failed += 1;
            }
        }
        assert_eq!(failed, 1);
    }

    #[test]
    fn test_short_format_negotiation() {
        let mut conn = conn_with(-1, Vec::new(), Box::new(NoAuth));
        connect(&mut conn, T0 + 2);
        let hello = next_request(&mut conn);
        assert_eq!(hello.get("Short-rpc-fmt"), Some("1"));
        let seq = hello.get_i64_or(key::CSEQ, RpcFormat::Long, -1);
        // short-format reply: single-letter keys, hex integers
        let bytes = format!("OK\r\nc: {seq:x}\r\ns: 0\r\n\r\n");
        feed(&mut conn, T0 + 2, bytes.as_bytes());
        assert!(conn.handshake_done());

        conn.enqueue_op(Box::new(ProbeOp::default()));
        let probe = next_request(&mut conn);
        assert_eq!(probe.verb(), "PROBE");
        assert!(probe.get("Cseq").is_none());
        let short_seq = probe.get_i64_or(key::CSEQ, RpcFormat::Short, -1);
        assert_eq!(short_seq, seq + 1);
    }

    #[test]
    fn test_reply_body_is_routed_to_the_op() {
        let mut conn = conn_with(-1, Vec::new(), Box::new(NoAuth));
        handshake(&mut conn, T0 + 2);
        conn.enqueue_op(Box::new(ProbeOp::default()));
        let probe = next_request(&mut conn);
        let seq = probe.get_i64_or(key::CSEQ, RpcFormat::Long, -1);

        // headers first, body in a later read, to exercise body buffering
        let bytes = reply(seq, &[("Status", "0"), ("Content-length", "7")]);
        feed(&mut conn, T0 + 3, &bytes);
        assert!(conn.next_event().is_none());
        feed(&mut conn, T0 + 3, b"payload");

        let Some(ConnEvent::OpDone(op)) = conn.next_event() else {
            panic!("expected completion");
        };
        let probe = op.as_any().downcast_ref::<ProbeOp>().unwrap();
        assert_eq!(probe.base.status, 0);
        assert_eq!(probe.body, b"payload".to_vec());
    }

    #[test]
    fn test_inactivity_timeout_fails_dispatched_ops() {
        let mut conn = conn_with(-1, Vec::new(), Box::new(NoAuth));
        handshake(&mut conn, T0 + 2);
        conn.enqueue_op(Box::new(ProbeOp::default()));
        let _ = conn.take_output();

        assert!(!conn.is_stopped());
        conn.tick(T0 + 2 + 66);
        assert!(!conn.is_connected());
        let Some(ConnEvent::OpDone(op)) = conn.next_event() else {
            panic!("expected failed op");
        };
        assert_eq!(op.base().status, -errno::EHOSTUNREACH);
    }

    #[test]
    fn test_connect_attempts_are_throttled() {
        let mut conn = conn_with(-1, Vec::new(), Box::new(NoAuth));
        assert!(conn.tick(T0 + 2));
        // same second: no second dial
        assert!(!conn.tick(T0 + 2));
        assert!(!conn.tick(T0 + 3));
        assert!(conn.tick(T0 + 4));
        assert_eq!(conn.counters().connect_count, 2);
    }

    #[test]
    fn test_dispatch_window_bounds_in_flight_ops() {
        let mut conn = conn_with(-1, Vec::new(), Box::new(NoAuth));
        connect(&mut conn, T0 + 2);
        let hello = next_request(&mut conn);
        let seq = hello.get_i64_or(key::CSEQ, RpcFormat::Long, -1);
        feed(
            &mut conn,
            T0 + 2,
            &reply(seq, &[("Status", "0"), ("Max-pending", "2")]),
        );
        assert!(conn.handshake_done());

        for _ in 0..3 {
            conn.enqueue_op(Box::new(ProbeOp::default()));
        }
        let out = conn.take_output();
        let probes = out.windows(5).filter(|w| w == b"PROBE").count();
        assert_eq!(probes, 2);

        // a reply frees a window slot; the queued op goes out on the next
        // tick
        feed(&mut conn, T0 + 3, &reply(seq + 1, &[("Status", "0")]));
        conn.tick(T0 + 3);
        let out = conn.take_output();
        let probes = out.windows(5).filter(|w| w == b"PROBE").count();
        assert_eq!(probes, 1);
    }

    #[test]
    fn test_ops_enqueued_while_down_dispatch_after_handshake() {
        let mut conn = conn_with(-1, Vec::new(), Box::new(NoAuth));
        conn.enqueue_op(Box::new(ProbeOp::default()));
        assert!(conn.next_event().is_none());
        handshake(&mut conn, T0 + 2);
        conn.tick(T0 + 3);
        let probe = next_request(&mut conn);
        assert_eq!(probe.verb(), "PROBE");
    }

    fn psk() -> (Box<PskAuthBackend>, Vec<u8>) {
        let backend = PskAuthBackend::new("key1", b"secret".to_vec());
        let digest = backend.expected_digest();
        (Box::new(backend), digest)
    }

    fn auth_exchange(conn: &mut MetaServerConn, now: i64, digest: &[u8]) {
        let auth = next_request(conn);
        assert_eq!(auth.verb(), "AUTHENTICATE");
        let seq = auth.get_i64_or(key::CSEQ, RpcFormat::Long, -1);
        let mut bytes = reply(
            seq,
            &[
                ("Status", "0"),
                ("Auth-type", "4"),
                ("Content-length", &digest.len().to_string()),
            ],
        );
        bytes.extend_from_slice(digest);
        feed(conn, now, &bytes);
    }

    #[test]
    fn test_authenticated_handshake() {
        let (backend, digest) = psk();
        let mut conn = conn_with(-1, Vec::new(), backend);
        connect(&mut conn, T0 + 2);
        auth_exchange(&mut conn, T0 + 2, &digest);

        let hello = next_request(&mut conn);
        assert_eq!(hello.verb(), "HELLO");
        let seq = hello.get_i64_or(key::CSEQ, RpcFormat::Long, -1);
        feed(&mut conn, T0 + 2, &reply(seq, &[("Status", "0")]));
        assert!(conn.handshake_done());
    }

    #[test]
    fn test_bad_auth_digest_closes_connection() {
        let (backend, _) = psk();
        let mut conn = conn_with(-1, Vec::new(), backend);
        connect(&mut conn, T0 + 2);
        let auth = next_request(&mut conn);
        let seq = auth.get_i64_or(key::CSEQ, RpcFormat::Long, -1);
        let mut bytes = reply(
            seq,
            &[("Status", "0"), ("Auth-type", "4"), ("Content-length", "4")],
        );
        bytes.extend_from_slice(b"nope");
        feed(&mut conn, T0 + 2, &bytes);
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_heartbeat_reauth_queues_responses() {
        let (backend, digest) = psk();
        let mut conn = conn_with(-1, Vec::new(), backend);
        connect(&mut conn, T0 + 2);
        auth_exchange(&mut conn, T0 + 2, &digest);
        let hello = next_request(&mut conn);
        let seq = hello.get_i64_or(key::CSEQ, RpcFormat::Long, -1);
        feed(&mut conn, T0 + 2, &reply(seq, &[("Status", "0")]));
        assert!(conn.handshake_done());

        // heartbeat demanding re-authentication
        feed(
            &mut conn,
            T0 + 5,
            b"HEARTBEAT\r\nCseq: 7\r\nAuthenticate: 1\r\nMax-pending: 64\r\n\r\n",
        );
        let Some(ConnEvent::Command(mut heartbeat)) = conn.next_event() else {
            panic!("expected heartbeat delivery");
        };
        // the re-auth request went out
        let auth = next_request(&mut conn);
        assert_eq!(auth.verb(), "AUTHENTICATE");
        let auth_seq = auth.get_i64_or(key::CSEQ, RpcFormat::Long, -1);

        // responding while auth is in flight queues the response
        heartbeat.set_status(0, "");
        conn.send_response(heartbeat);
        assert!(!conn.has_output());

        // auth completes; the queued response flushes
        let mut bytes = reply(
            auth_seq,
            &[
                ("Status", "0"),
                ("Auth-type", "4"),
                ("Content-length", &digest.len().to_string()),
            ],
        );
        bytes.extend_from_slice(&digest);
        feed(&mut conn, T0 + 5, &bytes);
        let response = next_request(&mut conn);
        assert_eq!(response.verb(), "OK");
        assert_eq!(response.get("Cseq"), Some("7"));
    }

    #[test]
    fn test_stale_generation_response_is_discarded() {
        let mut conn = conn_with(-1, Vec::new(), Box::new(NoAuth));
        handshake(&mut conn, T0 + 2);
        feed(&mut conn, T0 + 3, b"HEARTBEAT\r\nCseq: 9\r\n\r\n");
        let Some(ConnEvent::Command(mut heartbeat)) = conn.next_event() else {
            panic!("expected heartbeat delivery");
        };

        // the connection drops and comes back before the response is ready
        conn.request_reconnect();
        conn.tick(T0 + 4);
        assert!(!conn.is_connected());
        handshake(&mut conn, T0 + 6);
        let _ = conn.take_output();

        heartbeat.set_status(0, "");
        conn.send_response(heartbeat);
        assert!(!conn.has_output());
    }

    #[test]
    fn test_stale_chunks_command_with_body() {
        let mut conn = conn_with(-1, Vec::new(), Box::new(NoAuth));
        handshake(&mut conn, T0 + 2);
        feed(
            &mut conn,
            T0 + 3,
            b"STALE_CHUNKS\r\nCseq: 11\r\nContent-length: 5\r\n\r\n1f 2a",
        );
        let Some(ConnEvent::Command(incoming)) = conn.next_event() else {
            panic!("expected command delivery");
        };
        let ServerCommand::StaleChunks(sc) = &incoming.cmd else {
            panic!("expected stale chunks");
        };
        assert_eq!(sc.chunk_ids, vec![0x1f, 0x2a]);
    }

    #[test]
    fn test_shutdown_fails_pending_ops() {
        let mut conn = conn_with(-1, Vec::new(), Box::new(NoAuth));
        handshake(&mut conn, T0 + 2);
        conn.enqueue_op(Box::new(ProbeOp::default()));
        let _ = conn.take_output();
        conn.shutdown();
        let Some(ConnEvent::OpDone(op)) = conn.next_event() else {
            panic!("expected failed op");
        };
        assert_eq!(op.base().status, -errno::EHOSTUNREACH);
        // further submissions fail immediately
        conn.enqueue_op(Box::new(ProbeOp::default()));
        let Some(ConnEvent::OpDone(op)) = conn.next_event() else {
            panic!("expected failed op");
        };
        assert_eq!(op.base().status, -errno::EHOSTUNREACH);
    }
}
