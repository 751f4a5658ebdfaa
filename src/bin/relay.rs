//! Relay CLI and composition root (§4.9): parses arguments, binds the
//! single-client TCP listener and the loopback tool-dispatcher, and wires
//! the transport session, PTY mediator, and operation engine together for
//! the lifetime of one remote connection.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use ptybridge::dispatcher::Dispatcher;
use ptybridge::pty::{self, PtyChild, SpawnConfig};
use ptybridge::session::{self, PeerFlags, Session};
use ptybridge::wire::PacketType;

/// Bootstrap config the assistant reads on startup, written per session
/// (§6 "Persisted state").
const MCP_BOOTSTRAP_PATH: &str = "/tmp/telepresence-mcp-v2.json";

#[derive(Parser, Debug)]
#[clap(version, about = "Relay bridging a local PTY-hosted assistant to a legacy Unix client", long_about = None)]
struct Args {
    /// Address the relay's TCP listener binds.
    #[clap(long, default_value = "0.0.0.0")]
    host: String,

    /// TCP port for the remote client.
    #[clap(long, default_value_t = 5000)]
    port: u16,

    /// Loopback port for the tool-dispatch HTTP surface.
    #[clap(long = "mcp-port", default_value_t = 5001)]
    mcp_port: u16,

    /// Command used to exec the assistant inside the PTY.
    #[clap(long, default_value = "claude")]
    claude: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();
    let base_dir = std::env::current_dir().wrap_err("resolving relay startup directory")?;

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .wrap_err_with(|| format!("binding {}:{}", args.host, args.port))?;
    info!("relay listening on {}:{}", args.host, args.port);

    loop {
        let (socket, peer) = listener.accept().await.wrap_err("accepting TCP client")?;
        info!("accepted remote client {peer}");
        socket
            .set_nodelay(true)
            .wrap_err("disabling Nagle's algorithm")?;

        // Exactly one client session at a time (§4.9): the accept loop only
        // advances to the next iteration once this session has fully ended.
        if let Err(e) = run_session(socket, &args, &base_dir).await {
            error!("session with {peer} ended with error: {e:#}");
        }
        info!("session with {peer} ended, awaiting next client");
    }
}

async fn run_session(
    mut socket: tokio::net::TcpStream,
    args: &Args,
    base_dir: &PathBuf,
) -> Result<()> {
    let handshake_info = session::handshake(&mut socket).await.wrap_err("HELLO handshake")?;

    let (read_half, write_half) = socket.into_split();

    let (term_input_tx, mut term_input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (resize_tx, mut resize_rx) = mpsc::unbounded_channel::<(u16, u16)>();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let session = Arc::new(Session::new(
        write_half,
        handshake_info.clone(),
        term_input_tx,
        resize_tx,
        shutdown_tx,
    ));

    let dispatcher_url = format!("http://127.0.0.1:{}/mcp", args.mcp_port);
    let dispatcher = Dispatcher::new(session.clone(), base_dir.clone());
    write_mcp_bootstrap(&dispatcher_url).wrap_err("writing MCP bootstrap config")?;

    let dispatcher_task = {
        let dispatcher = dispatcher.clone();
        let mcp_port = args.mcp_port;
        tokio::spawn(async move {
            if let Err(e) = dispatcher.serve("127.0.0.1", mcp_port).await {
                warn!("tool dispatcher stopped: {e:#}");
            }
        })
    };

    let mut argv = vec![args.claude.clone()];
    if handshake_info.peer_flags.contains(PeerFlags::RESUME) {
        argv.push("--resume".to_string());
    }
    let pty_child = PtyChild::spawn(&SpawnConfig {
        argv,
        dispatcher_url,
        rows: 24,
        cols: 80,
    })
    .wrap_err("spawning assistant inside PTY")?;
    let pty_child = Arc::new(pty_child);

    let (master_tx, mut master_rx) = mpsc::channel::<Vec<u8>>(64);
    let _master_reader = pty::spawn_master_reader(pty_child.master_raw_fd(), master_tx);

    let forward_task = {
        let session = session.clone();
        tokio::spawn(async move {
            'outer: while let Some(chunk) = master_rx.recv().await {
                // Split further by the peer's fixed window ceiling: a single
                // TERM_OUTPUT payload larger than the window could never
                // satisfy flow control (§4.3), the same hazard FILE_WRITE
                // chunking guards against in `ops::call_stream`.
                let cap = session.out_window_capacity().max(1) as usize;
                for piece in chunk.chunks(cap) {
                    if session
                        .send_data(PacketType::TermOutput, piece)
                        .await
                        .is_err()
                    {
                        break 'outer;
                    }
                }
            }
        })
    };

    let input_task = {
        let pty_child = pty_child.clone();
        tokio::spawn(async move {
            while let Some(data) = term_input_rx.recv().await {
                if let Err(e) = pty_child.write_input(&data) {
                    warn!("writing TERM_INPUT to PTY master failed: {e}");
                    break;
                }
            }
        })
    };

    let resize_task = {
        let pty_child = pty_child.clone();
        tokio::spawn(async move {
            while let Some((rows, cols)) = resize_rx.recv().await {
                if let Err(e) = pty_child.resize(rows, cols) {
                    warn!("TERM_RESIZE ioctl failed: {e:#}");
                }
            }
        })
    };

    let reader_result = session::run_reader(session.clone(), read_half).await;

    // Shutdown ordering (§4.2, §9): pending stream futures are cancelled by
    // `begin_shutdown` (called from within `run_reader` on EOF/GOODBYE, or
    // here defensively) before we touch the assistant process.
    session.begin_shutdown();
    dispatcher.mark_disconnected();
    let _ = shutdown_rx.changed().await;

    dispatcher_task.abort();
    forward_task.abort();
    input_task.abort();
    resize_task.abort();

    if let Err(e) = nix::sys::signal::kill(pty_child.child_pid, nix::sys::signal::Signal::SIGTERM) {
        warn!("failed to signal assistant process: {e}");
    }

    reader_result
}

fn write_mcp_bootstrap(dispatcher_url: &str) -> Result<()> {
    let body = serde_json::json!({
        "mcpServers": {
            "ptybridge": {
                "url": dispatcher_url,
            }
        }
    });
    std::fs::write(MCP_BOOTSTRAP_PATH, serde_json::to_vec_pretty(&body)?)?;
    Ok(())
}
