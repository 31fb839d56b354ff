use portable_pty::{CommandBuilder, PtySize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Terminal type advertised to every spawned shell.
pub const TERM: &str = "xterm-256color";
/// Colour capability advertised to every spawned shell.
pub const COLORTERM: &str = "truecolor";

pub const DEFAULT_ROWS: u16 = 30;
pub const DEFAULT_COLS: u16 = 80;

/// Number of output chunks that may be queued before the reader thread blocks.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 64;

/// Terminal geometry in character cells. Both dimensions are non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TermSize {
    rows: u16,
    cols: u16,
}

impl TermSize {
    /// Returns `None` when either dimension is zero.
    pub fn new(rows: u16, cols: u16) -> Option<Self> {
        (rows > 0 && cols > 0).then_some(Self { rows, cols })
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }
}

impl fmt::Display for TermSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// The shell used when none is configured.
///
/// On POSIX hosts this is `bash` from `PATH`, falling back to `/bin/sh`.
pub fn default_shell() -> PathBuf {
    #[cfg(unix)]
    {
        which::which("bash").unwrap_or_else(|_| PathBuf::from("/bin/sh"))
    }

    #[cfg(not(unix))]
    {
        PathBuf::from("powershell.exe")
    }
}

/// Everything needed to start one shell on a fresh PTY.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory. Falls back to `$HOME`, then to the server's cwd.
    pub cwd: Option<PathBuf>,
    /// Extra variables layered over the inherited environment and the
    /// terminal overrides.
    pub env: BTreeMap<String, String>,
    pub size: TermSize,
    pub output_capacity: usize,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self::new(default_shell())
    }
}

impl SpawnConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            size: TermSize::default(),
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn size(mut self, size: TermSize) -> Self {
        self.size = size;
        self
    }

    fn working_dir(&self) -> Option<PathBuf> {
        self.cwd
            .clone()
            .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
            .filter(|dir| dir.is_dir())
            .or_else(|| std::env::current_dir().ok())
    }

    /// Build the command. `CommandBuilder::new` already copies the server's
    /// environment.
    pub(crate) fn command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);

        if let Some(dir) = self.working_dir() {
            cmd.cwd(dir);
        }

        cmd.env("TERM", TERM);
        cmd.env("COLORTERM", COLORTERM);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}
