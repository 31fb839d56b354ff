//! PTY (pseudo-terminal) process handle.
//!
//! The master side is split three ways: a reader thread that forwards output
//! into a bounded channel, a waiter thread that reaps the child and reports its
//! exit exactly once, and the handle itself which keeps the writer, the master
//! (for resizing) and a killer.

use crate::shell::{SpawnConfig, TermSize};
use portable_pty::{ChildKiller, MasterPty, PtySize, native_pty_system};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// How long `kill` waits for the child to go away before escalating.
const KILL_GRACE: Duration = Duration::from_millis(500);
const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    Open(#[source] anyhow::Error),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),
    #[error("failed to get writer: {0}")]
    Writer(#[source] anyhow::Error),
    #[error("failed to resize PTY: {0}")]
    Resize(#[source] anyhow::Error),
    #[error("invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },
    #[error("process has already exited")]
    Exited,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PtyError {
    /// Whether this error only says the process is gone, as opposed to a real
    /// I/O failure on a live PTY.
    pub fn is_exited(&self) -> bool {
        matches!(self, PtyError::Exited)
    }
}

/// How a shell process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: u32,
    /// Name of the terminating signal, if the platform reports one.
    pub signal: Option<String>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

impl From<portable_pty::ExitStatus> for ProcessExit {
    fn from(status: portable_pty::ExitStatus) -> Self {
        Self {
            code: status.exit_code(),
            signal: status.signal().map(str::to_owned),
        }
    }
}

/// Receiving halves for a process's output and exit.
///
/// Output chunks arrive in the order the process wrote them. The channel closes
/// once the PTY reports EOF. `exit` resolves exactly once.
pub struct ProcessEvents {
    pub output: mpsc::Receiver<Vec<u8>>,
    pub exit: oneshot::Receiver<ProcessExit>,
}

/// One shell process attached to a pseudo-terminal.
///
/// Writer and master are behind separate locks so a resize never waits for a
/// write stuck on a full PTY buffer. Both are taken out on `kill`, which closes
/// the master file descriptors.
pub struct ProcessHandle {
    pid: Option<u32>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    size: Mutex<TermSize>,
    exited: Arc<AtomicBool>,
    killed: AtomicBool,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("size", &self.size())
            .field("exited", &self.has_exited())
            .field("killed", &self.killed.load(Ordering::Acquire))
            .finish()
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessHandle {
    /// Spawn the configured shell on a new PTY.
    ///
    /// Starts the reader and waiter threads before returning, so output is
    /// buffered (up to `output_capacity` chunks) even if the caller is slow to
    /// start consuming [`ProcessEvents`].
    pub fn spawn(config: &SpawnConfig) -> Result<(Self, ProcessEvents), PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(config.size.into())
            .map_err(PtyError::Open)?;

        let mut child = pair
            .slave
            .spawn_command(config.command())
            .map_err(|source| PtyError::Spawn {
                program: config.program.display().to_string(),
                source,
            })?;
        // Only the child may hold the slave side, otherwise the reader never
        // sees EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let mut killer = child.clone_killer();

        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.kill();
                return Err(PtyError::CloneReader(e));
            }
        };
        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                let _ = child.kill();
                return Err(PtyError::Writer(e));
            }
        };

        debug!(pid, program = %config.program.display(), size = %config.size, "PTY process spawned");

        let (output_tx, output_rx) = mpsc::channel(config.output_capacity.max(1));
        let (exit_tx, exit_rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));

        if let Err(e) = spawn_reader(reader, output_tx, pid) {
            let _ = child.kill();
            return Err(PtyError::Io(e));
        }

        let exited_flag = Arc::clone(&exited);
        let waiter = thread::Builder::new()
            .name(format!("pty-wait-{}", pid.unwrap_or_default()))
            .spawn(move || {
                let exit = match child.wait() {
                    Ok(status) => ProcessExit::from(status),
                    Err(e) => {
                        warn!(pid, error = %e, "Failed to wait for PTY process");
                        ProcessExit {
                            code: 1,
                            signal: None,
                        }
                    }
                };
                exited_flag.store(true, Ordering::Release);
                debug!(pid, code = exit.code, signal = ?exit.signal, "PTY process exited");
                let _ = exit_tx.send(exit);
            });
        // The child moved into the failed closure, so only the killer can reach it.
        if let Err(e) = waiter {
            let _ = killer.kill();
            return Err(PtyError::Io(e));
        }

        let handle = Self {
            pid,
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            killer: Mutex::new(killer),
            size: Mutex::new(config.size),
            exited,
            killed: AtomicBool::new(false),
        };

        Ok((
            handle,
            ProcessEvents {
                output: output_rx,
                exit: exit_rx,
            },
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True once the child has been reaped.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// True while the process can still accept input.
    pub fn is_alive(&self) -> bool {
        !self.has_exited() && !self.killed.load(Ordering::Acquire)
    }

    /// Forward raw bytes to the shell's input.
    ///
    /// Blocks while the PTY input buffer is full.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if !self.is_alive() {
            return Err(PtyError::Exited);
        }
        let mut guard = lock(&self.writer);
        let writer = guard.as_mut().ok_or(PtyError::Exited)?;
        let result = writer.write_all(data).and_then(|()| writer.flush());
        match result {
            Ok(()) => Ok(()),
            Err(_) if !self.is_alive() => Err(PtyError::Exited),
            Err(e) => Err(PtyError::Io(e)),
        }
    }

    /// Change the PTY window size. The recorded size only changes on success.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let size = TermSize::new(rows, cols).ok_or(PtyError::InvalidSize { rows, cols })?;
        if !self.is_alive() {
            return Err(PtyError::Exited);
        }
        let guard = lock(&self.master);
        let master = guard.as_ref().ok_or(PtyError::Exited)?;
        master.resize(size.into()).map_err(PtyError::Resize)?;
        *lock(&self.size) = size;
        trace!(pid = self.pid, %size, "PTY resized");
        Ok(())
    }

    /// The most recently applied size.
    pub fn size(&self) -> TermSize {
        *lock(&self.size)
    }

    /// Ask the PTY device for its current window size.
    pub fn query_size(&self) -> Result<PtySize, PtyError> {
        let guard = lock(&self.master);
        let master = guard.as_ref().ok_or(PtyError::Exited)?;
        master
            .get_size()
            .map_err(|e| PtyError::Io(io::Error::other(e.to_string())))
    }

    /// Terminate the process and release the PTY.
    ///
    /// Idempotent, and a no-op apart from releasing the PTY when the process
    /// already exited. Sends SIGHUP first and escalates to SIGKILL on the
    /// process group if the child is still around after a short grace period,
    /// so this may block briefly. Never waits behind a `write` stuck on a full
    /// PTY: such a write fails once the child is gone and drops the writer
    /// with the handle.
    pub fn kill(&self) -> Result<(), PtyError> {
        if self.killed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = if self.has_exited() {
            Ok(())
        } else {
            match lock(&self.killer).kill() {
                Ok(()) => Ok(()),
                Err(_) if self.has_exited() => Ok(()),
                Err(e) if e.raw_os_error() == Some(libc_esrch()) => Ok(()),
                Err(e) => Err(PtyError::Io(e)),
            }
        };

        // Closing the master hangs up the slave side as well.
        lock(&self.master).take();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        if !self.wait_exited(KILL_GRACE) {
            self.force_kill();
        }

        debug!(pid = self.pid, "PTY process killed");
        result
    }

    fn wait_exited(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.has_exited() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.has_exited()
    }

    #[cfg(unix)]
    fn force_kill(&self) {
        use nix::sys::signal::{Signal, kill, killpg};
        use nix::unistd::Pid;

        if let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) {
            warn!(pid, "PTY process ignored SIGHUP, sending SIGKILL");
            // The shell leads its own session, so its pid is also the group id.
            let pid = Pid::from_raw(pid);
            if let Err(e) = killpg(pid, Signal::SIGKILL).or_else(|_| kill(pid, Signal::SIGKILL)) {
                debug!(%pid, error = %e, "SIGKILL failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn force_kill(&self) {
        warn!(pid = self.pid, "PTY process still running after kill");
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.killed.load(Ordering::Acquire) && !self.has_exited() {
            let _ = lock(&self.killer).kill();
        }
    }
}

#[cfg(unix)]
fn libc_esrch() -> i32 {
    nix::errno::Errno::ESRCH as i32
}

#[cfg(not(unix))]
fn libc_esrch() -> i32 {
    -1
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<Vec<u8>>,
    pid: Option<u32>,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("pty-read-{}", pid.unwrap_or_default()))
        .spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        trace!(pid, "PTY reader: EOF");
                        break;
                    }
                    Ok(n) => {
                        // Blocks when the consumer is behind, which in turn
                        // stops us draining the PTY and stalls the shell.
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is how Linux reports a hung-up slave.
                        trace!(pid, error = %e, "PTY reader stopped");
                        break;
                    }
                }
            }
        })?;
    Ok(())
}
