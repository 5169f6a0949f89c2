//! Session driver test: a full handshake and a served heartbeat over an
//! in-memory duplex stream, with the tokio clock paused.

use plexfs_auth::NoAuth;
use plexfs_chunk::{
    client_channel, run_session, ConnParams, HelloInventory, InventorySource, MetaClientConfig,
    MetaServerConn, ServerCommand, SessionEvent,
};
use plexfs_common::ServerLocation;
use plexfs_rpc::{find_header_block, key, HeaderBlock, RpcFormat};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

struct FixedInventory;

impl InventorySource for FixedInventory {
    fn file_system_id(&self) -> i64 {
        7
    }

    fn inventory(&self) -> HelloInventory {
        HelloInventory::default()
    }
}

async fn read_block(stream: &mut DuplexStream, buf: &mut Vec<u8>) -> HeaderBlock {
    loop {
        if let Some(len) = find_header_block(buf) {
            let hdr = HeaderBlock::parse(&buf[..len]);
            buf.drain(..len);
            return hdr;
        }
        let mut tmp = [0u8; 4096];
        let n = stream.read(&mut tmp).await.unwrap();
        assert!(n > 0, "session closed the stream early");
        buf.extend_from_slice(&tmp[..n]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_session_handshake_and_heartbeat() {
    let conn = MetaServerConn::new(
        ConnParams {
            meta_location: ServerLocation::new("10.0.0.1", 20000),
            cluster_key: "ck".into(),
            md5sum: "md5".into(),
            rack_id: 0,
            chunk_server_port: 30000,
        },
        MetaClientConfig::default(),
        Box::new(FixedInventory),
        Box::new(NoAuth),
    );

    let (mut server, client_side) = tokio::io::duplex(64 << 10);
    let mut client_side = Some(client_side);
    let (client, msg_rx) = client_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let session = tokio::spawn(run_session(
        conn,
        move || {
            let stream = client_side.take();
            async move {
                match stream {
                    Some(s) => Ok((s, "10.0.0.9:41000".parse().unwrap())),
                    None => Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "refused",
                    )),
                }
            }
        },
        msg_rx,
        event_tx,
    ));

    let mut rbuf = Vec::new();
    let hello = read_block(&mut server, &mut rbuf).await;
    assert_eq!(hello.verb(), "HELLO");
    assert_eq!(hello.get("Chunk-server-name"), Some("10.0.0.9"));
    let seq = hello.get_i64_or(key::CSEQ, RpcFormat::Long, -1);
    server
        .write_all(format!("OK\r\nCseq: {seq}\r\nStatus: 0\r\n\r\n").as_bytes())
        .await
        .unwrap();

    server
        .write_all(b"HEARTBEAT\r\nCseq: 5\r\nMax-pending: 16\r\n\r\n")
        .await
        .unwrap();
    let SessionEvent::Command(mut heartbeat) = event_rx.recv().await.unwrap() else {
        panic!("expected a command delivery");
    };
    assert!(matches!(heartbeat.cmd, ServerCommand::Heartbeat(_)));
    heartbeat.set_status(0, "");
    assert!(client.respond(heartbeat));

    let response = read_block(&mut server, &mut rbuf).await;
    assert_eq!(response.verb(), "OK");
    assert_eq!(response.get("Cseq"), Some("5"));
    assert_eq!(response.get("Status"), Some("0"));

    client.shutdown();
    session.await.unwrap();
}
