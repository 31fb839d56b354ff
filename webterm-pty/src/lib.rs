//! PTY-backed shell processes for webterm.
//!
//! A [`ProcessHandle`] owns one shell attached to a pseudo-terminal. Output and
//! exit notifications are delivered through [`ProcessEvents`] so the caller can
//! drive them from async code without touching the blocking PTY file
//! descriptors.

mod pty;
mod shell;

pub use pty::{ProcessEvents, ProcessExit, ProcessHandle, PtyError};
pub use shell::{
    COLORTERM, DEFAULT_COLS, DEFAULT_OUTPUT_CAPACITY, DEFAULT_ROWS, SpawnConfig, TERM, TermSize,
    default_shell,
};

// Returned by `ProcessHandle::query_size`
pub use portable_pty::PtySize;
