//! End-to-end coverage of the host file gateway (C7) against a real
//! temporary directory, complementing the lexical-path-only unit tests in
//! `src/host.rs` with actual filesystem reads/writes and a fake remote peer
//! standing in for the legacy client.

use std::sync::Arc;

use ptybridge::host;
use ptybridge::ops;
use ptybridge::session::{self, Session};
use ptybridge::stream::StatusCode;
use ptybridge::wire::{self, PacketType};
use tempfile::tempdir;
use tokio::io::{split, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};

type TestSession = Session<WriteHalf<DuplexStream>>;

async fn handshake_pair(remote_cwd: &str, remote_window: u32) -> (Arc<TestSession>, DuplexStream) {
    let (mut client, mut server) = tokio::io::duplex(1024 * 1024);

    let mut hello = vec![session::PROTOCOL_VERSION, 0];
    wire::put_u32(&mut hello, remote_window);
    wire::encode_string(&mut hello, remote_cwd);
    wire::write_packet(&mut client, PacketType::Hello, &hello)
        .await
        .unwrap();

    let info = session::handshake(&mut server).await.unwrap();
    let _ack = wire::decode_packet(&mut client).await.unwrap().unwrap();

    let (server_read, server_write): (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) =
        split(server);
    let (term_tx, _term_rx) = mpsc::unbounded_channel();
    let (resize_tx, _resize_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    let session = Arc::new(Session::new(server_write, info, term_tx, resize_tx, shutdown_tx));

    let reader_session = session.clone();
    tokio::spawn(async move {
        let _ = session::run_reader(reader_session, server_read).await;
    });

    (session, client)
}

/// `download_from_host`: a real host file gets read and written to the
/// (faked) remote client via FILE_WRITE.
#[tokio::test]
async fn download_from_host_writes_real_file_contents_to_remote() {
    let dir = tempdir().unwrap();
    let host_file = dir.path().join("notes.txt");
    tokio::fs::write(&host_file, b"from the host\n").await.unwrap();

    let (session, mut client) = handshake_pair("/work", 0x00040000).await;

    let peer = tokio::spawn(async move {
        // download_from_host checks file_exists first when overwrite=false.
        let exists_open = wire::decode_packet(&mut client).await.unwrap().unwrap();
        let (exists_id, _) = wire::read_u32(&exists_open.payload, 0);
        let _our_end = wire::decode_packet(&mut client).await.unwrap().unwrap();
        let mut exists_data = Vec::new();
        wire::put_u32(&mut exists_data, exists_id);
        exists_data.push(0); // does not yet exist remotely
        wire::write_packet(&mut client, PacketType::StreamData, &exists_data)
            .await
            .unwrap();
        let mut exists_end = Vec::new();
        wire::put_u32(&mut exists_end, exists_id);
        exists_end.push(StatusCode::Ok as u8);
        wire::write_packet(&mut client, PacketType::StreamEnd, &exists_end)
            .await
            .unwrap();

        // Then the FILE_WRITE leg carrying the uploaded bytes.
        let write_open = wire::decode_packet(&mut client).await.unwrap().unwrap();
        let (write_id, off) = wire::read_u32(&write_open.payload, 0);
        assert_eq!(write_open.payload[off], 0x02); // FILE_WRITE
        let mut received = Vec::new();
        loop {
            let pkt = wire::decode_packet(&mut client).await.unwrap().unwrap();
            match pkt.typ {
                PacketType::StreamData => {
                    let (_, off) = wire::read_u32(&pkt.payload, 0);
                    received.extend_from_slice(&pkt.payload[off..]);
                }
                PacketType::StreamEnd => break,
                other => panic!("unexpected packet {other:?}"),
            }
        }
        assert_eq!(received, b"from the host\n");
        let mut end = Vec::new();
        wire::put_u32(&mut end, write_id);
        end.push(StatusCode::Ok as u8);
        wire::write_packet(&mut client, PacketType::StreamEnd, &end)
            .await
            .unwrap();
    });

    host::download_from_host(&session, dir.path(), "notes.txt", "/work/notes.txt", false)
        .await
        .unwrap();

    peer.await.unwrap();
}

/// `upload_to_host`: bytes read from the (faked) remote land on the real
/// host filesystem, confined under the temp base directory.
#[tokio::test]
async fn upload_to_host_writes_remote_bytes_under_confined_base() {
    let dir = tempdir().unwrap();
    let (session, mut client) = handshake_pair("/work", 0x00040000).await;

    let peer = tokio::spawn(async move {
        let open = wire::decode_packet(&mut client).await.unwrap().unwrap();
        let (id, _) = wire::read_u32(&open.payload, 0);
        let _our_end = wire::decode_packet(&mut client).await.unwrap().unwrap();
        let mut data = Vec::new();
        wire::put_u32(&mut data, id);
        data.extend_from_slice(b"from the remote\n");
        wire::write_packet(&mut client, PacketType::StreamData, &data)
            .await
            .unwrap();
        let mut end = Vec::new();
        wire::put_u32(&mut end, id);
        end.push(StatusCode::Ok as u8);
        wire::write_packet(&mut client, PacketType::StreamEnd, &end)
            .await
            .unwrap();
    });

    host::upload_to_host(&session, dir.path(), "/work/out.txt", "uploaded/out.txt", false)
        .await
        .unwrap();
    peer.await.unwrap();

    let written = tokio::fs::read(dir.path().join("uploaded/out.txt"))
        .await
        .unwrap();
    assert_eq!(written, b"from the remote\n");
}

/// Overwrite protection refuses without touching the wire at all.
#[tokio::test]
async fn upload_to_host_refuses_overwrite_of_existing_host_file() {
    let dir = tempdir().unwrap();
    let existing = dir.path().join("already-there.txt");
    tokio::fs::write(&existing, b"old").await.unwrap();

    let (session, _client) = handshake_pair("/work", 0x00040000).await;

    let err = host::upload_to_host(&session, dir.path(), "/work/x.txt", "already-there.txt", false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("refusing to overwrite"));

    let unchanged = tokio::fs::read(&existing).await.unwrap();
    assert_eq!(unchanged, b"old");
}

/// §4.7 scenario 6 exercised against the real confinement check with a
/// live (but unused) session in scope.
#[test]
fn resolve_host_path_confines_to_base_dir_created_at_test_time() {
    let dir = tempdir().unwrap();
    let err = ops::resolve_remote_path("/work", "../../etc/passwd");
    // Remote path normalization has no confinement (remote fs isn't ours);
    // host confinement is what actually blocks escapes (this assertion
    // documents the distinction rather than testing it twice).
    assert_eq!(err, "/etc/passwd");

    let blocked = host::resolve_host_path(dir.path(), "../../etc/passwd").unwrap_err();
    assert!(blocked.to_string().contains(&dir.path().display().to_string()));
}
