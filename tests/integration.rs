//! End-to-end tests driving the wire protocol and the tool dispatcher
//! together, with an in-process fake remote client standing in for the
//! legacy Unix peer (no real TCP socket or PTY child needed to exercise
//! C1-C5 and C8 against each other).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ptybridge::ops;
use ptybridge::session::{self, Session};
use ptybridge::stream::StatusCode;
use ptybridge::wire::{self, PacketType};
use tokio::io::{split, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};

type TestSession = Session<WriteHalf<DuplexStream>>;

/// Run the HELLO/HELLO_ACK handshake over an in-memory duplex pair. Returns
/// the server-side `Session` (already driving its own reader task in the
/// background) and the client-side duplex stream a test drives directly to
/// play the part of the remote client.
async fn handshake_pair(
    remote_cwd: &str,
    remote_window: u32,
    peer_flags: u8,
) -> (Arc<TestSession>, DuplexStream) {
    let (mut client, mut server) = tokio::io::duplex(8 * 1024 * 1024);

    let mut hello = vec![session::PROTOCOL_VERSION, peer_flags];
    wire::put_u32(&mut hello, remote_window);
    wire::encode_string(&mut hello, remote_cwd);
    wire::write_packet(&mut client, PacketType::Hello, &hello)
        .await
        .unwrap();

    let info = session::handshake(&mut server).await.unwrap();

    let ack = wire::decode_packet(&mut client).await.unwrap().unwrap();
    assert!(matches!(ack.typ, PacketType::HelloAck));
    assert_eq!(ack.payload.len(), 6, "HELLO_ACK is 6 bytes on the wire, not 8");

    let (server_read, server_write): (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) =
        split(server);
    let (term_tx, _term_rx) = mpsc::unbounded_channel();
    let (resize_tx, _resize_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    let session = Arc::new(Session::new(
        server_write,
        info,
        term_tx,
        resize_tx,
        shutdown_tx,
    ));

    let reader_session = session.clone();
    tokio::spawn(async move {
        let _ = session::run_reader(reader_session, server_read).await;
    });

    (session, client)
}

/// Scenario 2 of §8: a single-chunk `FILE_READ` round trip.
#[tokio::test]
async fn file_read_round_trips_single_chunk_response() {
    let (session, mut client) = handshake_pair("/work", 0x00040000, 0).await;

    let peer = tokio::spawn(async move {
        let open = wire::decode_packet(&mut client).await.unwrap().unwrap();
        assert!(matches!(open.typ, PacketType::StreamOpen));
        let (id, off) = wire::read_u32(&open.payload, 0);
        assert_eq!(open.payload[off], 0x01); // FILE_READ
        let (path, _) = wire::decode_string(&open.payload, off + 1);
        assert_eq!(path, "/work/foo.txt");

        // The initiator's own STREAM_END(OK) signalling "request fully sent".
        let our_end = wire::decode_packet(&mut client).await.unwrap().unwrap();
        assert!(matches!(our_end.typ, PacketType::StreamEnd));

        let mut data = Vec::new();
        wire::put_u32(&mut data, id);
        data.extend_from_slice(b"hello\nworld\n");
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

    let bytes = ops::file_read(&session, "/work/foo.txt").await.unwrap();
    assert_eq!(bytes, b"hello\nworld\n");

    peer.await.unwrap();
}

/// Scenario 3 of §8: EXEC demultiplexes stdout/stderr chunks and a negative
/// exit code, and a non-zero exit is not itself an error.
#[tokio::test]
async fn exec_demultiplexes_channels_and_nonzero_exit_is_not_an_error() {
    let (session, mut client) = handshake_pair("/work", 0x00040000, 0).await;

    let peer = tokio::spawn(async move {
        let open = wire::decode_packet(&mut client).await.unwrap().unwrap();
        let (id, _) = wire::read_u32(&open.payload, 0);
        let _our_end = wire::decode_packet(&mut client).await.unwrap().unwrap();

        let mut stdout_chunk = Vec::new();
        wire::put_u32(&mut stdout_chunk, id);
        stdout_chunk.push(0x01);
        stdout_chunk.extend_from_slice(b"ls: /nope: No such file");
        wire::write_packet(&mut client, PacketType::StreamData, &stdout_chunk)
            .await
            .unwrap();

        let mut stderr_chunk = Vec::new();
        wire::put_u32(&mut stderr_chunk, id);
        stderr_chunk.push(0x02);
        stderr_chunk.extend_from_slice(b"error\n");
        wire::write_packet(&mut client, PacketType::StreamData, &stderr_chunk)
            .await
            .unwrap();

        let mut end = Vec::new();
        wire::put_u32(&mut end, id);
        end.push(StatusCode::Ok as u8);
        end.extend_from_slice(&(-1i32).to_be_bytes());
        wire::write_packet(&mut client, PacketType::StreamEnd, &end)
            .await
            .unwrap();
    });

    let result = ops::exec(&session, "ls /nope").await.unwrap();
    assert_eq!(result.stdout, b"ls: /nope: No such file");
    assert_eq!(result.stderr, b"error\n");
    assert_eq!(result.exit_code, -1);

    peer.await.unwrap();
}

/// Scenario 4 of §8: `edit_file` uniqueness checking and `replace_all`.
#[tokio::test]
async fn edit_file_rejects_ambiguous_match_then_replace_all_succeeds() {
    let (session, mut client) = handshake_pair("/work", 0x00040000, 0).await;

    // First attempt: replace_all=false against a file with two occurrences.
    let peer = tokio::spawn(async move {
        let open = wire::decode_packet(&mut client).await.unwrap().unwrap();
        let (id, _) = wire::read_u32(&open.payload, 0);
        let _our_end = wire::decode_packet(&mut client).await.unwrap().unwrap();

        let mut data = Vec::new();
        wire::put_u32(&mut data, id);
        data.extend_from_slice(b"foo\nfoo\n");
        wire::write_packet(&mut client, PacketType::StreamData, &data)
            .await
            .unwrap();

        let mut end = Vec::new();
        wire::put_u32(&mut end, id);
        end.push(StatusCode::Ok as u8);
        wire::write_packet(&mut client, PacketType::StreamEnd, &end)
            .await
            .unwrap();
        client
    });

    let err = ops::edit_file(&session, "/work/f.txt", "foo", "bar", false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("found 2 times"));

    let mut client = peer.await.unwrap();

    // Second attempt: replace_all=true rewrites every occurrence.
    let peer = tokio::spawn(async move {
        let open = wire::decode_packet(&mut client).await.unwrap().unwrap();
        let (id, _) = wire::read_u32(&open.payload, 0);
        let _our_end = wire::decode_packet(&mut client).await.unwrap().unwrap();
        let mut data = Vec::new();
        wire::put_u32(&mut data, id);
        data.extend_from_slice(b"foo\nfoo\n");
        wire::write_packet(&mut client, PacketType::StreamData, &data)
            .await
            .unwrap();
        let mut end = Vec::new();
        wire::put_u32(&mut end, id);
        end.push(StatusCode::Ok as u8);
        wire::write_packet(&mut client, PacketType::StreamEnd, &end)
            .await
            .unwrap();

        // edit_file's write leg: a fresh stream, content arrives as DATA.
        let write_open = wire::decode_packet(&mut client).await.unwrap().unwrap();
        let (write_id, off) = wire::read_u32(&write_open.payload, 0);
        assert_eq!(write_open.payload[off], 0x02); // FILE_WRITE
        let mut written = Vec::new();
        loop {
            let pkt = wire::decode_packet(&mut client).await.unwrap().unwrap();
            match pkt.typ {
                PacketType::StreamData => {
                    let (_, off) = wire::read_u32(&pkt.payload, 0);
                    written.extend_from_slice(&pkt.payload[off..]);
                }
                PacketType::StreamEnd => break,
                other => panic!("unexpected packet {other:?}"),
            }
        }
        assert_eq!(written, b"bar\nbar\n");

        let mut write_ack = Vec::new();
        wire::put_u32(&mut write_ack, write_id);
        write_ack.push(StatusCode::Ok as u8);
        wire::write_packet(&mut client, PacketType::StreamEnd, &write_ack)
            .await
            .unwrap();
    });

    ops::edit_file(&session, "/work/f.txt", "foo", "bar", true)
        .await
        .unwrap();

    peer.await.unwrap();
}

/// §8 invariant 1: `bytes_in_flight` never exceeds `remote_window`, and a
/// chunk larger than the window is split so it can still make progress
/// (rather than hanging forever, which a single 64 KiB chunk would under a
/// 1 KiB window).
#[tokio::test]
async fn file_write_respects_a_window_smaller_than_the_chunk_size() {
    let (session, mut client) = handshake_pair("/work", 1024, 0).await;

    let content = vec![b'x'; 4096];
    let session_for_write = session.clone();
    let write_task = tokio::spawn(async move {
        ops::file_write(&session_for_write, "/work/big.bin", &content, 0o644)
            .await
            .unwrap();
    });

    let open = wire::decode_packet(&mut client).await.unwrap().unwrap();
    let (id, _) = wire::read_u32(&open.payload, 0);

    let mut received = 0usize;
    while received < 4096 {
        let pkt = wire::decode_packet(&mut client).await.unwrap().unwrap();
        assert!(matches!(pkt.typ, PacketType::StreamData));
        let (_, off) = wire::read_u32(&pkt.payload, 0);
        let n = pkt.payload.len() - off;
        assert!(n as u64 <= 1024, "chunk of {n} bytes exceeds the 1024-byte window");
        received += n;

        if received < 4096 {
            // Confirm the sender is genuinely blocked, not racing ahead.
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!write_task.is_finished());

            let mut wu = Vec::new();
            wire::put_u32(&mut wu, n as u32);
            wire::write_packet(&mut client, PacketType::WindowUpdate, &wu)
                .await
                .unwrap();
        }
    }
    assert_eq!(received, 4096);

    let our_end = wire::decode_packet(&mut client).await.unwrap().unwrap();
    assert!(matches!(our_end.typ, PacketType::StreamEnd));

    let mut end = Vec::new();
    wire::put_u32(&mut end, id);
    end.push(StatusCode::Ok as u8);
    wire::write_packet(&mut client, PacketType::StreamEnd, &end)
        .await
        .unwrap();

    write_task.await.unwrap();
}

/// §5 shutdown ordering: closing the peer side resolves every pending stream
/// as cancelled rather than leaving the waiting tool call hanging forever.
#[tokio::test]
async fn peer_disconnect_cancels_pending_operations() {
    let (session, client) = handshake_pair("/work", 0x00040000, 0).await;

    let session_for_read = session.clone();
    let read_task = tokio::spawn(async move { ops::file_read(&session_for_read, "/work/x").await });

    // Give the read a moment to open its stream, then drop the peer end
    // entirely (simulating an unexpected disconnect).
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(client);

    let result = tokio::time::timeout(Duration::from_secs(5), read_task)
        .await
        .expect("shutdown must resolve pending operations promptly")
        .unwrap();
    assert!(result.is_err());
}

/// §4.4/§8 invariant 4: STREAM_DATA for a stream id that is already
/// retired (or was never opened by us) is dropped at the stream-table level,
/// but the peer still spent window budget sending those bytes and must get
/// credit back regardless — the charge is not conditioned on the id being
/// live.
#[tokio::test]
async fn stream_data_for_unknown_id_still_credits_inbound_window() {
    let (session, mut client) = handshake_pair("/work", 0x00040000, 0).await;

    let mut data = Vec::new();
    wire::put_u32(&mut data, 9999); // never opened by this session
    data.extend(std::iter::repeat(b'x').take(ptybridge::flow::WINDOW_UPDATE_THRESHOLD as usize));
    wire::write_packet(&mut client, PacketType::StreamData, &data)
        .await
        .unwrap();

    let update = tokio::time::timeout(Duration::from_secs(5), wire::decode_packet(&mut client))
        .await
        .expect("WINDOW_UPDATE must still be sent for dropped STREAM_DATA")
        .unwrap()
        .unwrap();
    assert!(matches!(update.typ, PacketType::WindowUpdate));
    let (credit, _) = wire::read_u32(&update.payload, 0);
    assert_eq!(credit as u64, ptybridge::flow::WINDOW_UPDATE_THRESHOLD);

    drop(session);
}

/// The host file gateway's confinement check runs before any wire activity
/// (§4.7 scenario 6) — exercised here at the `host::resolve_host_path` level
/// since it requires no session at all.
#[test]
fn host_path_confinement_rejects_escape_without_touching_the_session() {
    let base = PathBuf::from("/srv/work");
    let err = ptybridge::host::resolve_host_path(&base, "/etc/passwd").unwrap_err();
    assert!(err.to_string().contains("/srv/work"));
}
