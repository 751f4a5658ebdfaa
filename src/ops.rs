//! Operation engine (§4.5): typed stream initiators for every remote
//! operation, built on the generic "open, optionally push data, send our own
//! END, wait for the peer's completion" shape described in §4.4/§4.5.

use std::time::Duration;

use tokio::io::AsyncWrite;

use crate::error::{ErrorKind, RelayError};
use crate::stream::{StatusCode, StreamOutcome, StreamType, DEFAULT_STREAM_TIMEOUT};
use crate::wire::{self, decode_string, read_u32, read_u64};
use crate::session::Session;

/// Maximum bytes per outbound `STREAM_DATA` chunk (§3, §4.5).
pub const CHUNK_SIZE: usize = 64 * 1024;

/// One entry from a directory listing (`DIR_LIST`, §4.5).
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: u64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

impl EntryKind {
    fn from_byte(b: u8) -> color_eyre::Result<Self> {
        match b {
            b'f' => Ok(EntryKind::File),
            b'd' => Ok(EntryKind::Dir),
            b'l' => Ok(EntryKind::Symlink),
            other => Err(RelayError::Protocol(format!("unknown DIR_LIST entry kind {other:?}")).into()),
        }
    }
}

/// Result of `FILE_STAT` (§4.5).
#[derive(Debug, Clone)]
pub struct FileStat {
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    pub mtime: u64,
}

/// Result of `EXEC` (§4.5): demultiplexed stdout/stderr plus exit code.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// One match line from `FILE_SEARCH` (§4.5).
#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub line_no: u32,
    pub path: String,
    pub line: String,
}

/// Drive the generic request/response shape for one operation: open the
/// stream, optionally stream `outbound` data in ≤64 KiB chunks, send our own
/// `STREAM_END(OK)`, then wait for the peer's completion (with the default
/// 300 s timeout and advisory cancel on expiry per §4.4).
async fn call_stream<W>(
    session: &Session<W>,
    stream_type: StreamType,
    metadata: Vec<u8>,
    outbound: Option<&[u8]>,
) -> color_eyre::Result<(std::sync::Arc<crate::stream::StreamEntry>, StreamOutcome)>
where
    W: AsyncWrite + Unpin,
{
    let (id, entry, rx) = session.open_stream(stream_type, &metadata).await?;

    if let Some(data) = outbound {
        // Cap each outbound chunk at the peer's advertised window as well as
        // the nominal 64 KiB chunk size: the window is fixed for the life of
        // the session (WINDOW_UPDATE only ever moves `in_flight` back down
        // within it, §4.3), so a chunk larger than the window could never
        // satisfy `reserve` and would hang forever.
        let max_chunk = CHUNK_SIZE.min(session.out_window_capacity().max(1) as usize);
        for chunk in data.chunks(max_chunk) {
            session.send_stream_data(id, chunk).await?;
        }
    }
    session.send_stream_end(id, StatusCode::Ok, &[]).await?;

    match tokio::time::timeout(DEFAULT_STREAM_TIMEOUT, rx).await {
        Ok(Ok(outcome)) => Ok((entry, outcome)),
        Ok(Err(_)) => Err(RelayError::NotConnected.into()),
        Err(_) => {
            session.streams.retire(id);
            let _ = session.send_stream_cancel(id).await;
            Ok((entry, StreamOutcome::Cancelled))
        }
    }
}

/// Turn a non-OK outcome into a `RelayError`; `Ok` outcomes pass through
/// untouched for the caller to interpret.
fn outcome_to_result(outcome: StreamOutcome) -> color_eyre::Result<(StatusCode, Vec<u8>)> {
    match outcome {
        StreamOutcome::End { status, extra } => Ok((status, extra)),
        StreamOutcome::Error { kind, message } => Err(RelayError::Operation { kind, message }.into()),
        StreamOutcome::Cancelled => Err(RelayError::Operation {
            kind: ErrorKind::Timeout,
            message: "operation timed out".into(),
        }
        .into()),
    }
}

/// `FILE_READ`: result is the raw concatenated file bytes.
pub async fn file_read<W: AsyncWrite + Unpin>(session: &Session<W>, path: &str) -> color_eyre::Result<Vec<u8>> {
    let mut metadata = Vec::new();
    wire::encode_string(&mut metadata, path);
    let (entry, outcome) = call_stream(session, StreamType::FileRead, metadata, None).await?;
    outcome_to_result(outcome)?;
    Ok(entry.take_concat())
}

/// `FILE_WRITE`: streams `content` to the peer; returns nothing on success.
pub async fn file_write<W: AsyncWrite + Unpin>(
    session: &Session<W>,
    path: &str,
    content: &[u8],
    mode: u16,
) -> color_eyre::Result<()> {
    let mut metadata = Vec::new();
    wire::encode_string(&mut metadata, path);
    wire::put_u16(&mut metadata, mode);
    let (_entry, outcome) = call_stream(session, StreamType::FileWrite, metadata, Some(content)).await?;
    outcome_to_result(outcome)?;
    Ok(())
}

/// `EXEC`: demultiplexes the channel-tagged chunk list into stdout/stderr
/// and reads the exit code out of `End.extra` (§4.5 table; scenario 3).
pub async fn exec<W: AsyncWrite + Unpin>(session: &Session<W>, command: &str) -> color_eyre::Result<ExecResult> {
    let mut metadata = Vec::new();
    wire::encode_string(&mut metadata, command);
    let (entry, outcome) = call_stream(session, StreamType::Exec, metadata, None).await?;
    let (_status, extra) = outcome_to_result(outcome)?;
    let exit_code = if extra.len() >= 4 {
        i32::from_be_bytes([extra[0], extra[1], extra[2], extra[3]])
    } else {
        0
    };
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    for chunk in entry.take_chunks() {
        if chunk.is_empty() {
            continue;
        }
        match chunk[0] {
            0x01 => stdout.extend_from_slice(&chunk[1..]),
            0x02 => stderr.extend_from_slice(&chunk[1..]),
            other => {
                return Err(RelayError::Protocol(format!("unknown EXEC channel tag {other}")).into())
            }
        }
    }
    Ok(ExecResult {
        stdout,
        stderr,
        exit_code,
    })
}

/// `DIR_LIST`: parses repeated `u8 type u64 size u64 mtime name\0` records.
pub async fn dir_list<W: AsyncWrite + Unpin>(session: &Session<W>, path: &str) -> color_eyre::Result<Vec<DirEntry>> {
    let mut metadata = Vec::new();
    wire::encode_string(&mut metadata, path);
    let (entry, outcome) = call_stream(session, StreamType::DirList, metadata, None).await?;
    outcome_to_result(outcome)?;
    let buf = entry.take_concat();
    let mut entries = Vec::new();
    let mut off = 0;
    while off < buf.len() {
        let kind = EntryKind::from_byte(buf[off])?;
        off += 1;
        let (size, o) = read_u64(&buf, off);
        off = o;
        let (mtime, o) = read_u64(&buf, off);
        off = o;
        let (name, o) = decode_string(&buf, off);
        off = o;
        entries.push(DirEntry { kind, size, mtime, name });
    }
    Ok(entries)
}

/// `FILE_STAT`: `u8 exists` then, if present, `u8 type u32 mode u64 size u64 mtime`.
pub async fn file_stat<W: AsyncWrite + Unpin>(
    session: &Session<W>,
    path: &str,
) -> color_eyre::Result<Option<FileStat>> {
    let mut metadata = Vec::new();
    wire::encode_string(&mut metadata, path);
    let (entry, outcome) = call_stream(session, StreamType::FileStat, metadata, None).await?;
    outcome_to_result(outcome)?;
    let buf = entry.take_concat();
    if buf.is_empty() || buf[0] == 0 {
        return Ok(None);
    }
    let kind = EntryKind::from_byte(buf[1])?;
    let (mode, off) = read_u32(&buf, 2);
    let (size, off) = read_u64(&buf, off);
    let (mtime, _) = read_u64(&buf, off);
    Ok(Some(FileStat { kind, mode, size, mtime }))
}

/// `FILE_EXISTS`: `u8 exists`.
pub async fn file_exists<W: AsyncWrite + Unpin>(session: &Session<W>, path: &str) -> color_eyre::Result<bool> {
    let mut metadata = Vec::new();
    wire::encode_string(&mut metadata, path);
    let (entry, outcome) = call_stream(session, StreamType::FileExists, metadata, None).await?;
    outcome_to_result(outcome)?;
    let buf = entry.take_concat();
    Ok(buf.first().copied().unwrap_or(0) != 0)
}

/// `FILE_FIND`: repeated `name\0`.
pub async fn file_find<W: AsyncWrite + Unpin>(
    session: &Session<W>,
    path: &str,
    pattern: &str,
) -> color_eyre::Result<Vec<String>> {
    let mut metadata = Vec::new();
    wire::encode_string(&mut metadata, path);
    wire::encode_string(&mut metadata, pattern);
    let (entry, outcome) = call_stream(session, StreamType::FileFind, metadata, None).await?;
    outcome_to_result(outcome)?;
    let buf = entry.take_concat();
    let mut names = Vec::new();
    let mut off = 0;
    while off < buf.len() {
        let (name, o) = decode_string(&buf, off);
        off = o;
        names.push(name);
    }
    Ok(names)
}

/// `FILE_SEARCH`: repeated `u32 line_no path\0 line\0`.
pub async fn file_search<W: AsyncWrite + Unpin>(
    session: &Session<W>,
    path: &str,
    pattern: &str,
    file_pattern: Option<&str>,
) -> color_eyre::Result<Vec<SearchMatch>> {
    let mut metadata = Vec::new();
    wire::encode_string(&mut metadata, path);
    wire::encode_string(&mut metadata, pattern);
    if let Some(fp) = file_pattern {
        wire::encode_string(&mut metadata, fp);
    }
    let (entry, outcome) = call_stream(session, StreamType::FileSearch, metadata, None).await?;
    outcome_to_result(outcome)?;
    let buf = entry.take_concat();
    let mut matches = Vec::new();
    let mut off = 0;
    while off < buf.len() {
        let (line_no, o) = read_u32(&buf, off);
        off = o;
        let (path, o) = decode_string(&buf, off);
        off = o;
        let (line, o) = decode_string(&buf, off);
        off = o;
        matches.push(SearchMatch { line_no, path, line });
    }
    Ok(matches)
}

/// `MKDIR`.
pub async fn mkdir<W: AsyncWrite + Unpin>(session: &Session<W>, path: &str) -> color_eyre::Result<()> {
    let mut metadata = Vec::new();
    wire::encode_string(&mut metadata, path);
    let (_entry, outcome) = call_stream(session, StreamType::Mkdir, metadata, None).await?;
    outcome_to_result(outcome)?;
    Ok(())
}

/// `REMOVE`.
pub async fn remove<W: AsyncWrite + Unpin>(session: &Session<W>, path: &str) -> color_eyre::Result<()> {
    let mut metadata = Vec::new();
    wire::encode_string(&mut metadata, path);
    let (_entry, outcome) = call_stream(session, StreamType::Remove, metadata, None).await?;
    outcome_to_result(outcome)?;
    Ok(())
}

/// `MOVE`.
pub async fn move_file<W: AsyncWrite + Unpin>(session: &Session<W>, src: &str, dst: &str) -> color_eyre::Result<()> {
    let mut metadata = Vec::new();
    wire::encode_string(&mut metadata, src);
    wire::encode_string(&mut metadata, dst);
    let (_entry, outcome) = call_stream(session, StreamType::Move, metadata, None).await?;
    outcome_to_result(outcome)?;
    Ok(())
}

/// `REALPATH`: resolved `path\0`.
pub async fn realpath<W: AsyncWrite + Unpin>(session: &Session<W>, path: &str) -> color_eyre::Result<String> {
    let mut metadata = Vec::new();
    wire::encode_string(&mut metadata, path);
    let (entry, outcome) = call_stream(session, StreamType::Realpath, metadata, None).await?;
    outcome_to_result(outcome)?;
    let buf = entry.take_concat();
    let (resolved, _) = decode_string(&buf, 0);
    Ok(resolved)
}

/// Read-modify-write substitution used by the `edit_file` tool (§4.5).
///
/// There is deliberately no locking across the FILE_READ/FILE_WRITE legs —
/// concurrent remote modification is an accepted, undetectable limitation.
pub async fn edit_file<W: AsyncWrite + Unpin>(
    session: &Session<W>,
    path: &str,
    old_string: &str,
    new_string: &str,
    replace_all: bool,
) -> color_eyre::Result<()> {
    let bytes = file_read(session, path).await?;
    let content = String::from_utf8_lossy(&bytes).into_owned();
    let count = content.matches(old_string).count();
    if count == 0 {
        return Err(RelayError::Operation {
            kind: ErrorKind::Invalid,
            message: format!("old_string not found in {path}"),
        }
        .into());
    }
    if count > 1 && !replace_all {
        return Err(RelayError::Operation {
            kind: ErrorKind::Invalid,
            message: format!("old_string found {count} times"),
        }
        .into());
    }
    let updated = if replace_all {
        content.replace(old_string, new_string)
    } else {
        content.replacen(old_string, new_string, 1)
    };
    file_write(session, path, updated.as_bytes(), 0o644).await
}

/// POSIX-style `normpath(join(cwd, p))` (§4.5, §9): always `/`-separated
/// regardless of host OS, since these are remote paths on the legacy client.
/// Absolute `p` passes through untouched (after normalization).
pub fn resolve_remote_path(cwd: &str, p: &str) -> String {
    let joined = if p.starts_with('/') {
        p.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), p)
    };
    normalize_posix_path(&joined)
}

fn normalize_posix_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if !stack.is_empty() && *stack.last().unwrap() != ".." {
                    stack.pop();
                } else if !absolute {
                    stack.push("..");
                }
            }
            other => stack.push(other),
        }
    }
    let joined = stack.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_relative_against_cwd() {
        assert_eq!(resolve_remote_path("/work", "foo.txt"), "/work/foo.txt");
    }

    #[test]
    fn resolve_absolute_passes_through() {
        assert_eq!(resolve_remote_path("/work", "/etc/passwd"), "/etc/passwd");
    }

    #[test]
    fn normalize_collapses_dot_dot_and_slashes() {
        assert_eq!(normalize_posix_path("/a/b/../c//d/./"), "/a/c/d");
        assert_eq!(normalize_posix_path("a/../../b"), "../b");
        assert_eq!(normalize_posix_path("/a/../.."), "/");
    }
}
