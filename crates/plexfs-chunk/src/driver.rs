//! Tokio driver for the connection state machine.
//!
//! Owns the socket, the clock, and the channels: ticks the machine once a
//! second, shovels bytes both ways (through the connection filter once one
//! is installed), and fans completed ops and incoming commands out to the
//! upper layer. The dialer is pluggable so tests can hand the session an
//! in-memory duplex stream.

use crate::cmd::IncomingCmd;
use crate::conn::{ConnEvent, MetaServerConn};
use crate::ops::ClientOp;
use bytes::BytesMut;
use plexfs_auth::ConnectionFilter;
use plexfs_common::ServerLocation;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::warn;

/// Requests from the upper layer into the session.
pub enum ClientMsg {
    Submit(Box<dyn ClientOp>),
    Respond(IncomingCmd),
    Reconnect,
    Shutdown,
}

/// Deliveries from the session to the upper layer.
pub enum SessionEvent {
    OpDone(Box<dyn ClientOp>),
    Command(IncomingCmd),
}

/// Handle for submitting work to a running session.
#[derive(Clone)]
pub struct MetaServerClient {
    tx: mpsc::UnboundedSender<ClientMsg>,
}

impl MetaServerClient {
    /// False when the session has already terminated.
    pub fn submit(&self, op: Box<dyn ClientOp>) -> bool {
        self.tx.send(ClientMsg::Submit(op)).is_ok()
    }

    pub fn respond(&self, cmd: IncomingCmd) -> bool {
        self.tx.send(ClientMsg::Respond(cmd)).is_ok()
    }

    pub fn reconnect(&self) {
        let _ = self.tx.send(ClientMsg::Reconnect);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ClientMsg::Shutdown);
    }
}

/// Create the client handle and the receiver `run_session` consumes.
pub fn client_channel() -> (MetaServerClient, mpsc::UnboundedReceiver<ClientMsg>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MetaServerClient { tx }, rx)
}

/// Dial the metadata server over TCP.
pub async fn tcp_dial(location: ServerLocation) -> io::Result<(TcpStream, SocketAddr)> {
    let stream = TcpStream::connect((location.host.as_str(), location.port)).await?;
    stream.set_nodelay(true)?;
    let local = stream.local_addr()?;
    Ok((stream, local))
}

/// Drive one meta-server connection until shutdown (or a fatal cluster-key
/// mismatch).
pub async fn run_session<S, D, F>(
    mut conn: MetaServerConn,
    mut dial: D,
    mut msg_rx: mpsc::UnboundedReceiver<ClientMsg>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    D: FnMut() -> F,
    F: Future<Output = io::Result<(S, SocketAddr)>>,
{
    let started = Instant::now();
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stream: Option<S> = None;
    let mut filter: Option<Box<dyn ConnectionFilter>> = None;
    let mut parse_buf = BytesMut::with_capacity(8 << 10);
    let mut read_buf = BytesMut::with_capacity(8 << 10);

    loop {
        let mut fatal = false;
        while let Some(event) = conn.next_event() {
            match event {
                ConnEvent::OpDone(op) => {
                    let _ = event_tx.send(SessionEvent::OpDone(op));
                }
                ConnEvent::Command(cmd) => {
                    let _ = event_tx.send(SessionEvent::Command(cmd));
                }
                ConnEvent::InstallFilter(new_filter) => filter = Some(new_filter),
                ConnEvent::ShutdownEventLoop => fatal = true,
            }
        }
        if fatal {
            return;
        }
        if !conn.is_connected() && stream.is_some() {
            stream = None;
            filter = None;
            parse_buf.clear();
            read_buf.clear();
        }
        if conn.has_output() {
            if let Some(s) = stream.as_mut() {
                let out = conn.take_output();
                let data = match filter.as_mut() {
                    Some(f) => f.seal(&out),
                    None => out.to_vec(),
                };
                if let Err(err) = s.write_all(&data).await {
                    warn!(%err, "meta connection write failed");
                    conn.socket_closed(elapsed(&started));
                    continue;
                }
            }
        }

        read_buf.reserve(conn.max_read_ahead());
        tokio::select! {
            _ = ticker.tick() => {
                if conn.tick(elapsed(&started)) {
                    match dial().await {
                        Ok((s, local_addr)) => {
                            stream = Some(s);
                            conn.connected(elapsed(&started), local_addr);
                        }
                        Err(err) => conn.connect_failed(&err),
                    }
                }
            }
            msg = msg_rx.recv() => {
                match msg {
                    None | Some(ClientMsg::Shutdown) => {
                        conn.shutdown();
                        while let Some(event) = conn.next_event() {
                            if let ConnEvent::OpDone(op) = event {
                                let _ = event_tx.send(SessionEvent::OpDone(op));
                            }
                        }
                        return;
                    }
                    Some(ClientMsg::Submit(op)) => conn.enqueue_op(op),
                    Some(ClientMsg::Respond(cmd)) => conn.send_response(cmd),
                    Some(ClientMsg::Reconnect) => conn.request_reconnect(),
                }
            }
            result = read_some(&mut stream, &mut read_buf) => {
                match result {
                    Ok(0) => conn.socket_closed(elapsed(&started)),
                    Ok(_) => {
                        let chunk = read_buf.split();
                        match filter.as_mut() {
                            Some(f) => match f.open(&chunk) {
                                Ok(opened) => parse_buf.extend_from_slice(&opened),
                                Err(err) => {
                                    warn!(%err, "connection filter error");
                                    conn.force_down();
                                    continue;
                                }
                            },
                            None => parse_buf.extend_from_slice(&chunk),
                        }
                        conn.handle_read(elapsed(&started), &mut parse_buf);
                    }
                    Err(err) => {
                        warn!(%err, "meta connection read failed");
                        conn.socket_closed(elapsed(&started));
                    }
                }
            }
        }
    }
}

fn elapsed(started: &Instant) -> i64 {
    started.elapsed().as_secs() as i64
}

async fn read_some<S: AsyncRead + Unpin>(
    stream: &mut Option<S>,
    buf: &mut BytesMut,
) -> io::Result<usize> {
    match stream.as_mut() {
        Some(s) => s.read_buf(buf).await,
        None => std::future::pending().await,
    }
}
