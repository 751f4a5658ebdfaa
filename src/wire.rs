//! Packet framing and primitive payload encodings (§3, §4.1).
//!
//! A packet on the wire is a fixed 5-byte header — 1-byte type, 4-byte
//! big-endian length — followed by `length` payload bytes. All multi-byte
//! integers in payloads are big-endian; strings are NUL-terminated UTF-8.

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::RelayError;

/// Maximum payload size accepted by the decoder (16 MiB).
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Packet type tag occupying the first header byte (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Hello = 0x00,
    HelloAck = 0x01,
    Goodbye = 0x0D,
    Ping = 0x0E,
    Pong = 0x0F,
    TermInput = 0x10,
    TermOutput = 0x11,
    TermResize = 0x12,
    StreamOpen = 0x20,
    StreamData = 0x21,
    StreamEnd = 0x22,
    StreamError = 0x23,
    StreamCancel = 0x24,
    WindowUpdate = 0x28,
}

/// A decoded but not-yet-interpreted packet: type tag plus raw payload.
#[derive(Debug)]
pub struct Packet {
    pub typ: PacketType,
    pub payload: Vec<u8>,
}

/// Build the 5-byte header + payload for `typ`/`payload`.
///
/// Payloads are produced locally and are never expected to exceed
/// [`MAX_PAYLOAD`]; callers that assemble arbitrarily large payloads (none do
/// today) should chunk before calling this.
pub fn encode_packet(typ: PacketType, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(typ.into());
    buf.write_u32::<BE>(payload.len() as u32)
        .expect("writing to a Vec<u8> never fails");
    buf.extend_from_slice(payload);
    buf
}

/// Read one packet from an async byte stream.
///
/// Returns `Ok(None)` on a clean EOF before any header bytes arrive (the
/// peer closed the connection). A partial header or oversize length is a
/// protocol error.
pub async fn decode_packet<R>(r: &mut R) -> color_eyre::Result<Option<Packet>>
where
    R: AsyncReadExt + Unpin,
{
    let mut header = [0u8; 5];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let typ_byte = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(RelayError::PayloadTooLarge { len }.into());
    }
    let typ = PacketType::try_from(typ_byte)
        .map_err(|_| RelayError::Protocol(format!("unknown packet type 0x{typ_byte:02x}")))?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Some(Packet { typ, payload }))
}

/// Write a fully assembled packet to an async byte stream.
pub async fn write_packet<W>(w: &mut W, typ: PacketType, payload: &[u8]) -> color_eyre::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let framed = encode_packet(typ, payload);
    w.write_all(&framed).await?;
    Ok(())
}

/// Append `s` to `buf` followed by a NUL terminator.
pub fn encode_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Scan `buf[offset..]` for a NUL terminator and decode the preceding bytes
/// as UTF-8 (lossily — malformed UTF-8 is replaced rather than rejected,
/// since remote filenames are not guaranteed to be valid UTF-8).
///
/// If no NUL is found before the end of the buffer, the remainder is taken
/// as an implicit terminator and `new_offset` is set to `buf.len()`.
pub fn decode_string(buf: &[u8], offset: usize) -> (String, usize) {
    let rest = &buf[offset..];
    match rest.iter().position(|&b| b == 0) {
        Some(nul) => (
            String::from_utf8_lossy(&rest[..nul]).into_owned(),
            offset + nul + 1,
        ),
        None => (String::from_utf8_lossy(rest).into_owned(), buf.len()),
    }
}

/// Read a big-endian `u32` out of `buf` at `offset`, returning the new
/// offset. Panics on a short buffer — callers validate lengths up front.
pub fn read_u32(buf: &[u8], offset: usize) -> (u32, usize) {
    let bytes: [u8; 4] = buf[offset..offset + 4].try_into().unwrap();
    (u32::from_be_bytes(bytes), offset + 4)
}

/// Read a big-endian `u64` out of `buf` at `offset`, returning the new
/// offset.
pub fn read_u64(buf: &[u8], offset: usize) -> (u64, usize) {
    let bytes: [u8; 8] = buf[offset..offset + 8].try_into().unwrap();
    (u64::from_be_bytes(bytes), offset + 8)
}

/// A small growable buffer used when assembling payloads out of a mix of
/// integers and strings, mirroring the `byteorder::WriteBytesExt` style used
/// elsewhere in this codebase for synchronous framing.
pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.write_u32::<BE>(v).expect("Vec<u8> write cannot fail");
}

pub fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.write_u16::<BE>(v).expect("Vec<u8> write cannot fail");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_string_with_nul() {
        let mut buf = Vec::new();
        encode_string(&mut buf, "/home/me");
        encode_string(&mut buf, "trailing");
        let (s, off) = decode_string(&buf, 0);
        assert_eq!(s, "/home/me");
        let (s2, off2) = decode_string(&buf, off);
        assert_eq!(s2, "trailing");
        assert_eq!(off2, buf.len());
    }

    #[test]
    fn decode_string_without_nul_takes_rest_of_buffer() {
        let buf = b"no-terminator".to_vec();
        let (s, off) = decode_string(&buf, 0);
        assert_eq!(s, "no-terminator");
        assert_eq!(off, buf.len());
    }

    #[test]
    fn packet_roundtrip_header() {
        let framed = encode_packet(PacketType::Ping, b"abc");
        assert_eq!(framed[0], 0x0E);
        let len = u32::from_be_bytes([framed[1], framed[2], framed[3], framed[4]]);
        assert_eq!(len, 3);
        assert_eq!(&framed[5..], b"abc");
    }

    #[tokio::test]
    async fn decode_packet_rejects_oversize_length() {
        let mut header = vec![PacketType::StreamData.into()];
        header.extend_from_slice(&((MAX_PAYLOAD as u32) + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(header);
        let err = decode_packet(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[tokio::test]
    async fn decode_packet_accepts_exact_max_payload_header() {
        let mut header = vec![PacketType::StreamData.into()];
        header.extend_from_slice(&(MAX_PAYLOAD as u32).to_be_bytes());
        header.extend(std::iter::repeat(0u8).take(MAX_PAYLOAD));
        let mut cursor = std::io::Cursor::new(header);
        let pkt = decode_packet(&mut cursor).await.unwrap().unwrap();
        assert_eq!(pkt.payload.len(), MAX_PAYLOAD);
    }

    #[tokio::test]
    async fn decode_packet_returns_none_on_clean_eof() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = decode_packet(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }
}
