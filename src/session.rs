//! Transport session (§4.2): the HELLO handshake, the inbound packet
//! reader, liveness (ping/pong), and orderly shutdown.

use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::error::{ErrorKind, RelayError};
use crate::flow::{InboundWindow, OutboundWindow, INITIAL_WINDOW};
use crate::stream::{StatusCode, StreamEntry, StreamRegistry, StreamType};
use crate::wire::{self, decode_string, read_u32, PacketType};
use std::sync::Arc;
use tokio::sync::oneshot;

bitflags! {
    /// Flags negotiated in HELLO/HELLO_ACK (§3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PeerFlags: u8 {
        /// Resume a previous assistant session rather than starting fresh.
        const RESUME = 0b0000_0001;
        /// Peer wants "simple mode" (reduced terminal rendering).
        const SIMPLE_MODE = 0b0000_0010;
    }
}

/// Protocol version this relay speaks; HELLO must advertise exactly this.
pub const PROTOCOL_VERSION: u8 = 2;

/// Information recorded from the HELLO handshake (§4.2 step 1-2).
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub remote_cwd: String,
    pub remote_window: u32,
    pub peer_flags: PeerFlags,
}

/// Run the HELLO / HELLO_ACK handshake on a freshly accepted socket.
///
/// On a version mismatch, sends `GOODBYE` and returns an error — the caller
/// is expected to drop the connection in response.
pub async fn handshake<S>(socket: &mut S) -> color_eyre::Result<HandshakeInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let pkt = wire::decode_packet(socket)
        .await?
        .ok_or_else(|| RelayError::Protocol("connection closed before HELLO".into()))?;
    if !matches!(pkt.typ, PacketType::Hello) {
        return Err(RelayError::Protocol(format!("expected HELLO, got {:?}", pkt.typ)).into());
    }
    if pkt.payload.len() < 6 {
        return Err(RelayError::Protocol("HELLO payload shorter than 6 bytes".into()).into());
    }
    let version = pkt.payload[0];
    let flags_byte = pkt.payload[1];
    let (window, cwd_offset) = read_u32(&pkt.payload, 2);
    let (cwd, _) = decode_string(&pkt.payload, cwd_offset);

    if version != PROTOCOL_VERSION {
        let reason = format!("unsupported protocol version {version}");
        let mut goodbye = Vec::new();
        wire::encode_string(&mut goodbye, &reason);
        wire::write_packet(socket, PacketType::Goodbye, &goodbye).await?;
        return Err(RelayError::VersionMismatch { got: version }.into());
    }

    let peer_flags = PeerFlags::from_bits_truncate(flags_byte);

    // HELLO_ACK is only ever 6 bytes on the wire even though the payload
    // layout reserves 4 trailing reserved bytes the peer must tolerate being
    // absent. We deliberately reproduce that rather than "fixing" it.
    let mut ack = Vec::with_capacity(6);
    ack.push(PROTOCOL_VERSION);
    ack.push(0u8);
    wire::put_u32(&mut ack, INITIAL_WINDOW);
    wire::write_packet(socket, PacketType::HelloAck, &ack).await?;

    info!(
        "handshake complete: cwd={cwd:?} remote_window={window} flags={peer_flags:?}"
    );

    Ok(HandshakeInfo {
        remote_cwd: cwd,
        remote_window: window,
        peer_flags,
    })
}

/// Shared state for one multiplexed TCP session, generic over the writer
/// half of the transport so tests can drive it over an in-memory duplex
/// pair instead of a real socket.
pub struct Session<W> {
    writer: AsyncMutex<W>,
    pub out_window: OutboundWindow,
    pub in_window: InboundWindow,
    pub streams: StreamRegistry,
    pub remote_cwd: String,
    pub peer_flags: PeerFlags,
    term_input_tx: mpsc::UnboundedSender<Vec<u8>>,
    resize_tx: mpsc::UnboundedSender<(u16, u16)>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl<W> Session<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(
        writer: W,
        info: HandshakeInfo,
        term_input_tx: mpsc::UnboundedSender<Vec<u8>>,
        resize_tx: mpsc::UnboundedSender<(u16, u16)>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            writer: AsyncMutex::new(writer),
            out_window: OutboundWindow::new(info.remote_window),
            in_window: InboundWindow::new(),
            streams: StreamRegistry::new(),
            remote_cwd: info.remote_cwd,
            peer_flags: info.peer_flags,
            term_input_tx,
            resize_tx,
            shutdown_tx,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a packet under the single send lock (§5: "a single send lock
    /// serializes writes ... headers and payloads are never interleaved").
    /// Control packets bypass flow control entirely; only [`Self::send_data`]
    /// applies it.
    pub async fn send_control(&self, typ: PacketType, payload: &[u8]) -> color_eyre::Result<()> {
        let mut w = self.writer.lock().await;
        wire::write_packet(&mut *w, typ, payload).await
    }

    /// Send a flow-controlled DATA-class packet (`STREAM_DATA` or
    /// `TERM_OUTPUT`), blocking for window credit first (§4.3).
    pub async fn send_data(&self, typ: PacketType, payload: &[u8]) -> color_eyre::Result<()> {
        debug_assert!(matches!(typ, PacketType::StreamData | PacketType::TermOutput));
        self.out_window.reserve(payload.len() as u64).await;
        let mut w = self.writer.lock().await;
        wire::write_packet(&mut *w, typ, payload).await
    }

    /// Record that we just consumed `n` bytes from the peer as
    /// STREAM_DATA/TERM_INPUT, flushing a `WINDOW_UPDATE` once the 8 KiB
    /// threshold is crossed (§4.3).
    async fn charge_inbound(&self, n: usize) -> color_eyre::Result<()> {
        if let Some(credit) = self.in_window.consume(n as u64) {
            let mut payload = Vec::new();
            wire::put_u32(&mut payload, credit as u32);
            self.send_control(PacketType::WindowUpdate, &payload).await?;
        }
        Ok(())
    }

    /// Begin orderly shutdown (§4.2, §9): cancel every pending stream
    /// *before* signalling shutdown watchers, so in-flight tool calls never
    /// deadlock waiting on a stream the peer will never complete.
    pub fn begin_shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.streams.cancel_all();
        let _ = self.shutdown_tx.send(true);
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Allocate a stream id and emit its `STREAM_OPEN` (§4.4 step 1-3). The
    /// returned handle and receiver are what the operation engine waits on.
    pub async fn open_stream(
        &self,
        stream_type: StreamType,
        metadata: &[u8],
    ) -> color_eyre::Result<(u32, Arc<StreamEntry>, oneshot::Receiver<crate::stream::StreamOutcome>)>
    {
        let (id, entry, rx) = self.streams.open(stream_type);
        let mut payload = Vec::with_capacity(5 + metadata.len());
        wire::put_u32(&mut payload, id);
        payload.push(stream_type.into());
        payload.extend_from_slice(metadata);
        self.send_control(PacketType::StreamOpen, &payload).await?;
        Ok((id, entry, rx))
    }

    /// Send one `STREAM_DATA` chunk for `id`, applying outbound flow control.
    pub async fn send_stream_data(&self, id: u32, chunk: &[u8]) -> color_eyre::Result<()> {
        let mut payload = Vec::with_capacity(4 + chunk.len());
        wire::put_u32(&mut payload, id);
        payload.extend_from_slice(chunk);
        self.send_data(PacketType::StreamData, &payload).await
    }

    /// Send our own `STREAM_END` for `id` — marks "request fully sent" per
    /// the generic operation shape in §4.4/§4.5.
    pub async fn send_stream_end(
        &self,
        id: u32,
        status: StatusCode,
        extra: &[u8],
    ) -> color_eyre::Result<()> {
        let mut payload = Vec::with_capacity(5 + extra.len());
        wire::put_u32(&mut payload, id);
        payload.push(status.into());
        payload.extend_from_slice(extra);
        self.send_control(PacketType::StreamEnd, &payload).await
    }

    /// The peer's fixed outbound window ceiling, for callers that need to
    /// size outbound chunks so they can ever actually be sent (§4.3, §4.5).
    pub fn out_window_capacity(&self) -> u64 {
        self.out_window.capacity()
    }

    /// Send `STREAM_CANCEL` for `id` (advisory; §4.4, §5).
    pub async fn send_stream_cancel(&self, id: u32) -> color_eyre::Result<()> {
        let mut payload = Vec::new();
        wire::put_u32(&mut payload, id);
        self.send_control(PacketType::StreamCancel, &payload).await
    }
}

/// Drive the inbound packet reader until EOF or GOODBYE (§4.2, §5).
///
/// Dispatches each packet type per §4.4 (stream routing) and §4.3 (inbound
/// flow-control charging), and is the sole place that resolves stream
/// completions — see the registry's own single-resolution guarantee.
pub async fn run_reader<R, W>(
    session: std::sync::Arc<Session<W>>,
    mut reader: R,
) -> color_eyre::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let pkt = match wire::decode_packet(&mut reader).await {
            Ok(Some(pkt)) => pkt,
            Ok(None) => {
                info!("peer closed connection");
                session.begin_shutdown();
                return Ok(());
            }
            Err(e) => {
                warn!("protocol error reading packet: {e:#}");
                session.begin_shutdown();
                return Err(e);
            }
        };

        match pkt.typ {
            PacketType::Goodbye => {
                info!("received GOODBYE");
                session.begin_shutdown();
                return Ok(());
            }
            PacketType::Ping => {
                session.send_control(PacketType::Pong, &pkt.payload).await?;
            }
            PacketType::Pong => {
                debug!("received unsolicited PONG");
            }
            PacketType::TermInput => {
                session.charge_inbound(pkt.payload.len()).await?;
                let _ = session.term_input_tx.send(pkt.payload);
            }
            PacketType::TermOutput => {
                warn!("unexpected TERM_OUTPUT from peer, ignoring");
            }
            PacketType::TermResize => {
                if pkt.payload.len() != 4 {
                    warn!("malformed TERM_RESIZE payload, ignoring");
                    continue;
                }
                let rows = u16::from_be_bytes([pkt.payload[0], pkt.payload[1]]);
                let cols = u16::from_be_bytes([pkt.payload[2], pkt.payload[3]]);
                let _ = session.resize_tx.send((rows, cols));
            }
            PacketType::StreamOpen => {
                // This relay only ever acts as stream initiator; the peer
                // opening a stream toward us is not a served request.
                if pkt.payload.len() >= 4 {
                    let (id, _) = read_u32(&pkt.payload, 0);
                    warn!("peer opened unsupported stream {id}, rejecting");
                    let mut resp = Vec::new();
                    wire::put_u32(&mut resp, id);
                    resp.push(ErrorKind::Invalid.into());
                    wire::encode_string(&mut resp, "relay does not accept peer-initiated streams");
                    session
                        .send_control(PacketType::StreamError, &resp)
                        .await?;
                }
            }
            PacketType::StreamData => {
                if pkt.payload.len() < 4 {
                    warn!("malformed STREAM_DATA, ignoring");
                    continue;
                }
                let (id, off) = read_u32(&pkt.payload, 0);
                let data = pkt.payload[off..].to_vec();
                let consumed = data.len();
                // Charge inbound window credit unconditionally, even when the
                // id is already retired (late DATA after END/ERROR is dropped
                // at the stream-table level, but the peer still paid for
                // those bytes out of its window and must get credit back).
                session.streams.on_data(id, data);
                session.charge_inbound(consumed).await?;
            }
            PacketType::StreamEnd => {
                if pkt.payload.len() < 5 {
                    warn!("malformed STREAM_END, ignoring");
                    continue;
                }
                let (id, off) = read_u32(&pkt.payload, 0);
                let status = StatusCode::try_from(pkt.payload[off]).unwrap_or(StatusCode::Error);
                let extra = pkt.payload[off + 1..].to_vec();
                session.streams.on_end(id, status, extra);
            }
            PacketType::StreamError => {
                if pkt.payload.len() < 5 {
                    warn!("malformed STREAM_ERROR, ignoring");
                    continue;
                }
                let (id, off) = read_u32(&pkt.payload, 0);
                let kind = ErrorKind::try_from(pkt.payload[off]).unwrap_or(ErrorKind::Unknown);
                let (message, _) = decode_string(&pkt.payload, off + 1);
                session.streams.on_error(id, kind, message);
            }
            PacketType::StreamCancel => {
                debug!("received STREAM_CANCEL for a peer-initiated stream we never served");
            }
            PacketType::WindowUpdate => {
                if pkt.payload.len() != 4 {
                    warn!("malformed WINDOW_UPDATE, ignoring");
                    continue;
                }
                let (increment, _) = read_u32(&pkt.payload, 0);
                session.out_window.credit(increment as u64);
            }
            PacketType::Hello | PacketType::HelloAck => {
                warn!("unexpected {:?} after handshake, treating as protocol error", pkt.typ);
                session.begin_shutdown();
                return Err(RelayError::Protocol(format!(
                    "unexpected {:?} packet after handshake",
                    pkt.typ
                ))
                .into());
            }
        }
    }
}
