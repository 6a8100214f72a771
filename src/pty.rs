//! PTY adapter: spawns a child process attached to a pseudo-terminal and
//! exposes a small byte-stream interface over it.
//!
//! # Architecture
//!
//! Each [`PtyHandle`] owns three things behind `Arc<Mutex<..>>` so the
//! handle can be cloned and shared across the output-pump task, the
//! input-forwarding path, and the exit-watcher task without any of them
//! blocking the others for longer than a single syscall:
//!
//! - the boxed [`portable_pty::Child`], used for `kill`/`wait`/`try_wait`;
//! - the boxed [`portable_pty::MasterPty`], kept alive for the lifetime of
//!   the session purely so `resize` keeps working (letting it drop after
//!   spawn, as a naive port would, silently turns every later resize into
//!   a no-op);
//! - a pair of duplicated raw file descriptors used for actual read/write
//!   I/O, independent from the `MasterPty` box so reads never contend with
//!   a concurrent resize call.
//!
//! # Thread Safety
//!
//! All operations are `async` and safe to call concurrently from multiple
//! tasks. Contention is minimal: each lock is held only for the duration
//! of a single syscall.

use anyhow::{anyhow, Result};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, trace, warn};

/// Smallest and largest terminal dimension accepted by [`PtyHandle::resize`].
pub const MIN_DIMENSION: u16 = 1;
pub const MAX_DIMENSION: u16 = 1000;

/// Parameters for [`PtyHandle::spawn`].
pub struct PtySpawnConfig<'a> {
    pub shell: &'a str,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub env: &'a [(String, String)],
    pub cols: u16,
    pub rows: u16,
}

/// Outcome of a child process exit, mirroring the adapter's `onExit` payload.
#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    pub exit_code: i32,
    pub signal: Option<i32>,
}

/// Wrapper around a duplicated PTY master file descriptor providing
/// `Read`/`Write` without contending with the `MasterPty` box used for
/// control operations (resize).
#[cfg(unix)]
struct PtyIo {
    read_fd: std::os::unix::io::OwnedFd,
    write_fd: std::os::unix::io::OwnedFd,
}

#[cfg(unix)]
impl PtyIo {
    fn from_master(master: &(dyn MasterPty + Send)) -> Result<Self> {
        use std::os::unix::io::{AsRawFd, FromRawFd};

        let master_fd_raw = master
            .as_raw_fd()
            .ok_or_else(|| anyhow!("PTY master has no raw file descriptor"))?;

        let read_fd_raw = unsafe { libc::dup(master_fd_raw) };
        if read_fd_raw < 0 {
            return Err(anyhow!(
                "failed to duplicate PTY master fd for reading: {}",
                std::io::Error::last_os_error()
            ));
        }
        let write_fd_raw = unsafe { libc::dup(master_fd_raw) };
        if write_fd_raw < 0 {
            unsafe { libc::close(read_fd_raw) };
            return Err(anyhow!(
                "failed to duplicate PTY master fd for writing: {}",
                std::io::Error::last_os_error()
            ));
        }

        Ok(unsafe {
            PtyIo {
                read_fd: std::os::unix::io::OwnedFd::from_raw_fd(read_fd_raw),
                write_fd: std::os::unix::io::OwnedFd::from_raw_fd(write_fd_raw),
            }
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        use std::os::unix::io::AsRawFd;
        let n = unsafe {
            libc::read(
                self.read_fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        use std::os::unix::io::AsRawFd;
        let n = unsafe {
            libc::write(
                self.write_fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// A running PTY-hosted child process.
///
/// Cloneable: all clones share the same underlying process and master.
#[derive(Clone)]
pub struct PtyHandle {
    child: Arc<Mutex<Option<Box<dyn portable_pty::Child + Send + Sync>>>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    #[cfg(unix)]
    io: Arc<Mutex<PtyIo>>,
}

impl PtyHandle {
    /// Spawn a child process attached to a freshly allocated PTY.
    ///
    /// Failure to create the PTY or spawn the child is reported as `Err`,
    /// matching the adapter's `SpawnFailed` contract — callers must not
    /// treat this as a successful session with a subsequent exit.
    pub fn spawn(config: PtySpawnConfig<'_>) -> Result<Self> {
        let cols = config.cols.clamp(MIN_DIMENSION, MAX_DIMENSION);
        let rows = config.rows.clamp(MIN_DIMENSION, MAX_DIMENSION);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow!("failed to allocate PTY: {e}"))?;

        let mut cmd = CommandBuilder::new(config.shell);
        for arg in config.args {
            cmd.arg(arg);
        }
        cmd.cwd(config.cwd);
        for (k, v) in config.env {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| anyhow!("failed to spawn shell: {e}"))?;

        drop(pair.slave);

        #[cfg(unix)]
        {
            let io = PtyIo::from_master(&*pair.master)?;
            Ok(PtyHandle {
                child: Arc::new(Mutex::new(Some(child))),
                master: Arc::new(Mutex::new(pair.master)),
                io: Arc::new(Mutex::new(io)),
            })
        }

        #[cfg(not(unix))]
        {
            let _ = child;
            Err(anyhow!("PTY sessions are only supported on Unix-like systems"))
        }
    }

    /// Enqueue bytes for the PTY. Non-blocking: loops on partial writes
    /// until the full buffer is accepted or the PTY is closed, in which
    /// case the write is silently dropped (no error propagated to the
    /// caller — the session's exit watcher is the authority on closure).
    #[cfg(unix)]
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut io = self.io.lock().await;
        let mut written = 0;
        while written < data.len() {
            match io.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    trace!("PTY write would block, retrying");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "PTY write failed, dropping (PTY likely closed)");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Non-blocking read of available output. Returns `Ok(0)` when no data
    /// is currently available (not an error condition).
    #[cfg(unix)]
    pub async fn try_read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut io = self.io.lock().await;
        match io.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(anyhow!("PTY read failed: {e}")),
        }
    }

    /// Resize the PTY. Idempotent; dimensions are clamped to
    /// `[MIN_DIMENSION, MAX_DIMENSION]` rather than rejected.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let cols = cols.clamp(MIN_DIMENSION, MAX_DIMENSION);
        let rows = rows.clamp(MIN_DIMENSION, MAX_DIMENSION);
        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow!("failed to resize PTY: {e}"))
    }

    /// Request graceful termination. Idempotent: a second call on an
    /// already-killed handle is a no-op.
    pub async fn kill(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if let Some(mut c) = child.take() {
            c.kill().map_err(|e| anyhow!("failed to kill shell: {e}"))?;
            let _ = c.wait();
        }
        Ok(())
    }

    /// Non-blocking liveness check.
    pub async fn is_running(&self) -> bool {
        let mut child = self.child.lock().await;
        match child.as_mut() {
            Some(c) => matches!(c.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Block (on a dedicated blocking thread) until the child exits, then
    /// return its exit status exactly once. Intended to be awaited from a
    /// single dedicated task per session.
    pub async fn wait_exit(&self) -> ExitInfo {
        loop {
            {
                let mut child = self.child.lock().await;
                if let Some(c) = child.as_mut() {
                    match c.try_wait() {
                        Ok(Some(status)) => {
                            return ExitInfo {
                                exit_code: status.exit_code() as i32,
                                signal: None,
                            };
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(error = %e, "error polling child status, treating as exited");
                            return ExitInfo {
                                exit_code: -1,
                                signal: None,
                            };
                        }
                    }
                } else {
                    return ExitInfo {
                        exit_code: 0,
                        signal: None,
                    };
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}

/// Probe `$SHELL`, then a fixed fallback list, returning the first entry
/// that exists on disk.
pub fn detect_shell(fallbacks: &[&str]) -> Result<String> {
    if let Ok(shell) = std::env::var("SHELL") {
        if Path::new(&shell).exists() {
            return Ok(shell);
        }
    }
    for candidate in fallbacks {
        if Path::new(candidate).exists() {
            return Ok((*candidate).to_string());
        }
    }
    Err(anyhow!(
        "no suitable shell found (checked SHELL and {:?})",
        fallbacks
    ))
}
