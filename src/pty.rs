//! PTY mediator (§4.6): fork+exec the assistant under a pseudo-terminal,
//! forward bytes in both directions, and apply resizes.
//!
//! Grounded on the broker's own FD-borrowing write and `ioctl(TIOCSWINSZ)`
//! resize pattern (see `other_examples/.../broker/mod.rs`), adapted here to
//! spawn the child ourselves via `nix::pty::openpty` + `fork` rather than
//! receiving an already-open master FD over a Unix socket.

use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::io::FromRawFd;

use log::{debug, info, warn};
use nix::pty::{openpty, Winsize};
use nix::unistd::{close, dup2, execvpe, fork, setsid, ForkResult};
use tokio::sync::mpsc;

use crate::error::RelayError;

/// Highest file descriptor the child closes before exec (§4.6 step 2).
const MAX_CLOSE_FD: RawFd = 256;

/// Handle to a running assistant process and its PTY master.
pub struct PtyChild {
    master: OwnedFd,
    pub child_pid: nix::unistd::Pid,
}

/// Parameters for spawning the assistant (§4.6, §4.9).
pub struct SpawnConfig {
    /// Full argv for the assistant, e.g. `["claude"]` or `["claude", "--resume"]`.
    pub argv: Vec<String>,
    /// URL of this relay's tool-dispatcher HTTP surface (§4.8), passed to the
    /// assistant so it knows where to reach host tools.
    pub dispatcher_url: String,
    pub rows: u16,
    pub cols: u16,
}

impl PtyChild {
    /// Fork and exec the assistant inside a fresh pseudo-terminal (§4.6).
    pub fn spawn(config: &SpawnConfig) -> color_eyre::Result<Self> {
        let winsize = Winsize {
            ws_row: config.rows,
            ws_col: config.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None)
            .map_err(|e| RelayError::Protocol(format!("openpty failed: {e}")))?;
        let master = pty.master;
        let slave = pty.slave;

        // SAFETY: between fork and exec the child only calls async-signal-safe
        // functions (setsid, dup2, close, execvpe) per §4.6.
        match unsafe { fork() }.map_err(|e| RelayError::Protocol(format!("fork failed: {e}")))? {
            ForkResult::Parent { child } => {
                // The slave end belongs to the child now; the parent never
                // touches it again.
                drop(slave);
                debug!("spawned assistant pid={child}");
                Ok(PtyChild {
                    master,
                    child_pid: child,
                })
            }
            ForkResult::Child => {
                drop(master);
                if let Err(e) = run_child(slave, config) {
                    // execvpe only returns on failure; nothing downstream can
                    // observe normal Rust error propagation past exec, so we
                    // report and exit directly.
                    eprintln!("relay: failed to exec assistant: {e}");
                    std::process::exit(127);
                }
                unreachable!("run_child only returns on exec failure");
            }
        }
    }

    /// Apply a `TERM_RESIZE` to the PTY via `TIOCSWINSZ` (§4.6).
    pub fn resize(&self, rows: u16, cols: u16) -> color_eyre::Result<()> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe { set_winsize(self.master.as_raw_fd(), &winsize) }
            .map_err(|e| RelayError::Protocol(format!("TIOCSWINSZ failed: {e}")).into())
    }

    /// Write bytes verbatim to the PTY master (`TERM_INPUT`, §4.6).
    pub fn write_input(&self, data: &[u8]) -> std::io::Result<()> {
        use std::io::Write;
        // Borrow the FD for the write rather than taking ownership, since the
        // `OwnedFd` must keep closing it exactly once on drop.
        let borrowed: BorrowedFd<'_> = self.master.as_fd();
        let raw = borrowed.as_raw_fd();
        let mut file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(raw) });
        file.write_all(data)
    }

    pub fn master_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

/// Spawn the dedicated blocking reader task that drains the PTY master in
/// 64 KiB chunks and forwards them over `tx` (§4.6: "isolated on a dedicated
/// blocking task... never integrated directly into the async reactor").
///
/// The channel is bounded so a slow peer applies backpressure all the way
/// back to the blocking read rather than buffering unboundedly in memory.
pub fn spawn_master_reader(
    master_fd: RawFd,
    tx: mpsc::Sender<Vec<u8>>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        const CHUNK: usize = 64 * 1024;
        let mut buf = vec![0u8; CHUNK];
        loop {
            let n = unsafe {
                libc_read(master_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            match n {
                0 => {
                    info!("PTY master reached EOF, assistant exited");
                    return;
                }
                n if n < 0 => {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    warn!("PTY master read error: {err}");
                    return;
                }
                n => {
                    let chunk = buf[..n as usize].to_vec();
                    if tx.blocking_send(chunk).is_err() {
                        return;
                    }
                }
            }
        }
    })
}

unsafe fn libc_read(fd: RawFd, buf: *mut libc::c_void, count: usize) -> isize {
    libc::read(fd, buf, count)
}

unsafe fn set_winsize(fd: RawFd, ws: &Winsize) -> nix::Result<()> {
    nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);
    tiocswinsz(fd, ws as *const Winsize).map(|_| ())
}

/// Runs entirely in the forked child, up to the point of `execvpe`.
fn run_child(slave: OwnedFd, config: &SpawnConfig) -> color_eyre::Result<()> {
    setsid().map_err(|e| RelayError::Protocol(format!("setsid failed: {e}")))?;

    let slave_fd = slave.as_raw_fd();
    // Make the slave the controlling terminal and stdio (§4.6 step 1).
    unsafe {
        make_controlling_terminal(slave_fd)?;
    }
    dup2(slave_fd, 0).map_err(|e| RelayError::Protocol(format!("dup2 stdin failed: {e}")))?;
    dup2(slave_fd, 1).map_err(|e| RelayError::Protocol(format!("dup2 stdout failed: {e}")))?;
    dup2(slave_fd, 2).map_err(|e| RelayError::Protocol(format!("dup2 stderr failed: {e}")))?;
    if slave_fd > 2 {
        let _ = close(slave_fd);
    }

    // Close every other inherited descriptor to avoid leaking the listening
    // socket or tool-dispatcher listener into the assistant (§4.6 step 2).
    for fd in 3..MAX_CLOSE_FD {
        let _ = close(fd);
    }

    let argv: Vec<CString> = config
        .argv
        .iter()
        .map(|a| CString::new(a.as_str()).expect("argv entries must not contain NUL"))
        .collect();

    let mut env: Vec<CString> = std::env::vars()
        .filter(|(k, _)| k != "TERM")
        .map(|(k, v)| CString::new(format!("{k}={v}")).expect("env must not contain NUL"))
        .collect();
    env.push(CString::new("TERM=xterm-256color").unwrap());
    env.push(CString::new(format!("CLAUDE_TOOL_DISPATCHER_URL={}", config.dispatcher_url)).unwrap());

    execvpe(&argv[0], &argv, &env).map_err(|e| RelayError::Protocol(format!("execvpe failed: {e}")).into())
}

unsafe fn make_controlling_terminal(slave_fd: RawFd) -> color_eyre::Result<()> {
    nix::ioctl_write_int_bad!(tiocsctty, libc::TIOCSCTTY);
    tiocsctty(slave_fd, 0).map_err(|e| RelayError::Protocol(format!("TIOCSCTTY failed: {e}")))?;
    Ok(())
}
