//! Tool dispatcher (§4.8): a JSON-RPC 2.0 server on `127.0.0.1:<mcp-port>`
//! that binds the assistant's tool calls onto the operation engine (C5) and
//! the host file gateway (C7), rendering their results as text the way the
//! spec's rendering rules describe.
//!
//! The HTTP surface is intentionally a hand-rolled request-line-plus-headers
//! reader rather than a pulled-in web framework (§4.8 design note) — it only
//! ever serves one path, to one local caller, one request at a time.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::RelayError;
use crate::host;
use crate::ops::{self, resolve_remote_path};
use crate::session::Session;

const SERVER_NAME: &str = "ptybridge";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Shared dispatcher state: the session it calls operations on, the base
/// directory host-gateway paths are confined to, and the MCP session id
/// minted on `initialize` (§4.8).
pub struct Dispatcher<W> {
    session: Arc<Session<W>>,
    base_dir: PathBuf,
    mcp_session_id: AsyncMutex<Option<String>>,
    closed: AtomicBool,
}

impl<W> Dispatcher<W>
where
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    pub fn new(session: Arc<Session<W>>, base_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            session,
            base_dir,
            mcp_session_id: AsyncMutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Stop accepting useful tool calls — used once the wire session has
    /// gone away so in-flight and future calls fail fast with "client not
    /// connected" instead of hanging on a dead stream (§7).
    pub fn mark_disconnected(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.session.is_closed()
    }

    /// Bind the loopback listener and serve forever (until the process
    /// exits); each connection is handled and closed independently
    /// (`Connection: close`, §4.8/§6).
    pub async fn serve(self: Arc<Self>, host: &str, port: u16) -> color_eyre::Result<()> {
        let listener = TcpListener::bind((host, port)).await?;
        info!("tool dispatcher listening on {host}:{port}/mcp");
        loop {
            let (stream, peer) = listener.accept().await?;
            let dispatcher = self.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.handle_connection(stream).await {
                    warn!("tool dispatcher connection from {peer} failed: {e:#}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: tokio::net::TcpStream) -> color_eyre::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(());
        }
        let mut parts = request_line.trim_end().split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").to_string();

        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
            if let Some(rest) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = rest.trim().parse().unwrap_or(0);
            }
        }

        if path != "/mcp" {
            return write_response(&mut write_half, 404, "Not Found", None, b"not found").await;
        }
        if method != "POST" {
            return write_response(&mut write_half, 405, "Method Not Allowed", None, b"method not allowed").await;
        }

        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;

        let request: Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => {
                let err = json!({
                    "jsonrpc": "2.0",
                    "id": Value::Null,
                    "error": {"code": -32700, "message": format!("parse error: {e}")},
                });
                return write_response(&mut write_half, 200, "OK", None, err.to_string().as_bytes()).await;
            }
        };

        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let rpc_method = request.get("method").and_then(Value::as_str).unwrap_or("");
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let response = self.dispatch_method(rpc_method, &params, id).await;
        let session_id_header = self.mcp_session_id.lock().await.clone();

        write_response(
            &mut write_half,
            200,
            "OK",
            session_id_header.as_deref(),
            response.to_string().as_bytes(),
        )
        .await
    }

    async fn dispatch_method(&self, method: &str, params: &Value, id: Value) -> Value {
        match method {
            "initialize" => {
                let sid = format!("{:032x}", rand::random::<u128>());
                *self.mcp_session_id.lock().await = Some(sid);
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": SERVER_NAME, "version": SERVER_VERSION},
                    },
                })
            }
            "initialized" => json!({"jsonrpc": "2.0", "id": id, "result": null}),
            "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
            "tools/list" => json!({"jsonrpc": "2.0", "id": id, "result": {"tools": tool_catalog()}}),
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                let args = params.get("arguments").cloned().unwrap_or(json!({}));
                let (is_error, text) = self.call_tool(name, &args).await;
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "content": [{"type": "text", "text": text}],
                        "isError": is_error,
                    },
                })
            }
            other => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("method not found: {other}")},
            }),
        }
    }

    /// Run one named tool and render its result (or failure) to text. Never
    /// returns a JSON-RPC-level error — tool failures are always surfaced as
    /// `isError: true` content per §7.
    async fn call_tool(&self, name: &str, args: &Value) -> (bool, String) {
        if !self.is_connected() {
            return (true, "Error: client not connected".to_string());
        }
        match self.run_tool(name, args).await {
            Ok(text) => (false, text),
            Err(e) => (true, format!("Error: {e}")),
        }
    }

    fn resolve(&self, raw: &str) -> String {
        resolve_remote_path(&self.session.remote_cwd, raw)
    }

    async fn run_tool(&self, name: &str, args: &Value) -> color_eyre::Result<String> {
        match name {
            "get_cwd" => Ok(self.session.remote_cwd.clone()),

            "read_file" => {
                let path = self.resolve(&require_str(args, "path")?);
                let offset = optional_usize(args, "offset").unwrap_or(0);
                let limit = optional_usize(args, "limit").unwrap_or(2000);
                let bytes = ops::file_read(&self.session, &path).await?;
                Ok(render_read_file(&bytes, offset, limit))
            }

            "write_file" => {
                let path = self.resolve(&require_str(args, "path")?);
                let content = require_str(args, "content")?;
                ops::file_write(&self.session, &path, content.as_bytes(), 0o644).await?;
                Ok(format!("Wrote {} bytes to {path}", content.len()))
            }

            "edit_file" => {
                let path = self.resolve(&require_str(args, "path")?);
                let old_string = require_str(args, "old_string")?;
                let new_string = require_str(args, "new_string")?;
                let replace_all = optional_bool(args, "replace_all").unwrap_or(false);
                ops::edit_file(&self.session, &path, &old_string, &new_string, replace_all).await?;
                Ok(format!("Edited {path}"))
            }

            "list_directory" => {
                let path = self.resolve(&optional_str(args, "path").unwrap_or_else(|| ".".to_string()));
                let entries = ops::dir_list(&self.session, &path).await?;
                Ok(render_list_directory(&entries))
            }

            "file_info" => {
                let path = self.resolve(&require_str(args, "path")?);
                let stat = ops::file_stat(&self.session, &path).await?;
                Ok(render_file_info(stat))
            }

            "file_exists" => {
                let path = self.resolve(&require_str(args, "path")?);
                let exists = ops::file_exists(&self.session, &path).await?;
                Ok(exists.to_string())
            }

            "search_files" => {
                let pattern = require_str(args, "pattern")?;
                let path = self.resolve(&require_str(args, "path")?);
                let file_pattern = optional_str(args, "file_pattern");
                let matches =
                    ops::file_search(&self.session, &path, &pattern, file_pattern.as_deref()).await?;
                Ok(render_search_matches(&matches))
            }

            "find_files" => {
                let pattern = require_str(args, "pattern")?;
                let path = self.resolve(&optional_str(args, "path").unwrap_or_else(|| ".".to_string()));
                let names = ops::file_find(&self.session, &path, &pattern).await?;
                Ok(names.join("\n"))
            }

            "execute_command" => {
                let command = require_str(args, "command")?;
                let result = ops::exec(&self.session, &command).await?;
                Ok(render_execute_command(&result))
            }

            "make_directory" => {
                let path = self.resolve(&require_str(args, "path")?);
                ops::mkdir(&self.session, &path).await?;
                Ok(format!("Created directory {path}"))
            }

            "remove_file" => {
                let path = self.resolve(&require_str(args, "path")?);
                ops::remove(&self.session, &path).await?;
                Ok(format!("Removed {path}"))
            }

            "move_file" => {
                let source = self.resolve(&require_str(args, "source")?);
                let destination = self.resolve(&require_str(args, "destination")?);
                ops::move_file(&self.session, &source, &destination).await?;
                Ok(format!("Moved {source} to {destination}"))
            }

            "download_url" => {
                let url = require_str(args, "url")?;
                let path = require_str(args, "path")?;
                host::download_url(&self.session, &url, &path).await?;
                Ok(format!("Downloaded {url} to {path}"))
            }

            "upload_to_host" => {
                let remote_path = self.resolve(&require_str(args, "remote_path")?);
                let host_path = require_str(args, "host_path")?;
                let overwrite = optional_bool(args, "overwrite").unwrap_or(false);
                host::upload_to_host(&self.session, &self.base_dir, &remote_path, &host_path, overwrite)
                    .await?;
                Ok(format!("Uploaded {remote_path} to {host_path}"))
            }

            "download_from_host" => {
                let host_path = require_str(args, "host_path")?;
                let remote_path = self.resolve(&require_str(args, "remote_path")?);
                let overwrite = optional_bool(args, "overwrite").unwrap_or(false);
                host::download_from_host(&self.session, &self.base_dir, &host_path, &remote_path, overwrite)
                    .await?;
                Ok(format!("Downloaded {host_path} to {remote_path}"))
            }

            other => Err(RelayError::Operation {
                kind: crate::error::ErrorKind::Invalid,
                message: format!("unknown tool {other}"),
            }
            .into()),
        }
    }
}

fn require_str(args: &Value, key: &str) -> color_eyre::Result<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            RelayError::Operation {
                kind: crate::error::ErrorKind::Invalid,
                message: format!("missing required argument: {key}"),
            }
            .into()
        })
}

fn optional_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

fn optional_usize(args: &Value, key: &str) -> Option<usize> {
    args.get(key).and_then(Value::as_u64).map(|v| v as usize)
}

fn optional_bool(args: &Value, key: &str) -> Option<bool> {
    args.get(key).and_then(Value::as_bool)
}

const TRUNCATE_LINE_AT: usize = 2000;

/// `read_file` rendering rule (§4.8): UTF-8 decode with replacement, split
/// into lines, apply offset/limit, truncate long lines, right-justify a
/// 1-based line number, and append a footer if lines remain. The asymmetry
/// between the 0-based `offset` parameter and the 1-based rendered line
/// numbers is intentional (§9 open question) — not "fixed" here.
fn render_read_file(bytes: &[u8], offset: usize, limit: usize) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.split('\n').collect();
    let total = lines.len();
    let start = offset.min(total);
    let end = (offset.saturating_add(limit)).min(total);

    let mut out = String::new();
    for (i, line) in lines[start..end].iter().enumerate() {
        let line_no = start + i + 1;
        let rendered: String = if line.chars().count() > TRUNCATE_LINE_AT {
            let truncated: String = line.chars().take(TRUNCATE_LINE_AT).collect();
            format!("{truncated}… (truncated)")
        } else {
            line.to_string()
        };
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("{line_no:>6}\t{rendered}"));
    }
    if end < total {
        out.push_str(&format!("\n[Lines {}–{} of {}]", start + 1, end, total));
    }
    out
}

fn render_list_directory(entries: &[ops::DirEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            let suffix = match e.kind {
                ops::EntryKind::Dir => "/",
                ops::EntryKind::Symlink => "@",
                ops::EntryKind::File => "",
            };
            format!("{}{suffix}", e.name)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_file_info(stat: Option<ops::FileStat>) -> String {
    match stat {
        None => "No such file or directory".to_string(),
        Some(s) => {
            let kind = match s.kind {
                ops::EntryKind::File => "file",
                ops::EntryKind::Dir => "directory",
                ops::EntryKind::Symlink => "symlink",
            };
            let mtime = chrono::DateTime::from_timestamp(s.mtime as i64, 0)
                .map(|d| d.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "size: {} bytes\ntype: {kind}\nmode: {:o}\nmtime: {mtime}",
                s.size, s.mode
            )
        }
    }
}

fn render_search_matches(matches: &[ops::SearchMatch]) -> String {
    matches
        .iter()
        .map(|m| format!("{}:{}: {}", m.path, m.line_no, m.line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `execute_command` rendering rule (§4.8, scenario 3): stdout, then a
/// `[stderr]` block if stderr is non-empty, then `[exit status: N]` if the
/// exit code is non-zero.
fn render_execute_command(result: &ops::ExecResult) -> String {
    let mut out = String::from_utf8_lossy(&result.stdout).into_owned();
    if !result.stderr.is_empty() {
        out.push_str("\n[stderr]\n");
        out.push_str(&String::from_utf8_lossy(&result.stderr));
    }
    if result.exit_code != 0 {
        out.push('\n');
        out.push_str(&format!("[exit status: {}]", result.exit_code));
    }
    out
}

/// The static tool catalog returned from `tools/list` (§4.8, §6).
fn tool_catalog() -> Value {
    json!([
        {"name": "get_cwd", "description": "Return the remote client's current working directory", "inputSchema": {"type": "object", "properties": {}}},
        {"name": "read_file", "description": "Read a file from the remote client", "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}, "offset": {"type": "integer"}, "limit": {"type": "integer"}}, "required": ["path"]}},
        {"name": "write_file", "description": "Write a file on the remote client", "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}, "content": {"type": "string"}}, "required": ["path", "content"]}},
        {"name": "edit_file", "description": "Replace a substring in a remote file", "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}, "old_string": {"type": "string"}, "new_string": {"type": "string"}, "replace_all": {"type": "boolean"}}, "required": ["path", "old_string", "new_string"]}},
        {"name": "list_directory", "description": "List a directory on the remote client", "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}}},
        {"name": "file_info", "description": "Stat a file on the remote client", "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}, "required": ["path"]}},
        {"name": "file_exists", "description": "Check whether a remote path exists", "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}, "required": ["path"]}},
        {"name": "search_files", "description": "Search remote file contents for a pattern", "inputSchema": {"type": "object", "properties": {"pattern": {"type": "string"}, "path": {"type": "string"}, "file_pattern": {"type": "string"}}, "required": ["pattern", "path"]}},
        {"name": "find_files", "description": "Find remote files matching a name pattern", "inputSchema": {"type": "object", "properties": {"pattern": {"type": "string"}, "path": {"type": "string"}}, "required": ["pattern"]}},
        {"name": "execute_command", "description": "Execute a command on the remote client", "inputSchema": {"type": "object", "properties": {"command": {"type": "string"}}, "required": ["command"]}},
        {"name": "make_directory", "description": "Create a directory on the remote client", "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}, "required": ["path"]}},
        {"name": "remove_file", "description": "Remove a remote file or directory", "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}, "required": ["path"]}},
        {"name": "move_file", "description": "Move or rename a remote path", "inputSchema": {"type": "object", "properties": {"source": {"type": "string"}, "destination": {"type": "string"}}, "required": ["source", "destination"]}},
        {"name": "download_url", "description": "Fetch a URL on the host and write it to the remote client", "inputSchema": {"type": "object", "properties": {"url": {"type": "string"}, "path": {"type": "string"}}, "required": ["url", "path"]}},
        {"name": "upload_to_host", "description": "Copy a remote file to the host, confined to the relay's base directory", "inputSchema": {"type": "object", "properties": {"remote_path": {"type": "string"}, "host_path": {"type": "string"}, "overwrite": {"type": "boolean"}}, "required": ["remote_path", "host_path"]}},
        {"name": "download_from_host", "description": "Copy a host file to the remote client, confined to the relay's base directory", "inputSchema": {"type": "object", "properties": {"host_path": {"type": "string"}, "remote_path": {"type": "string"}, "overwrite": {"type": "boolean"}}, "required": ["host_path", "remote_path"]}},
    ])
}

async fn write_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: u16,
    reason: &str,
    mcp_session_id: Option<&str>,
    body: &[u8],
) -> color_eyre::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    if let Some(sid) = mcp_session_id {
        head.push_str(&format!("Mcp-Session-Id: {sid}\r\n"));
    }
    head.push_str("\r\n");
    w.write_all(head.as_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}
