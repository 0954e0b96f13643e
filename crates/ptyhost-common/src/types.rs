use crate::error::{PtyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
}

impl Size {
    pub const DEFAULT_COLS: u16 = 80;
    pub const DEFAULT_ROWS: u16 = 24;

    pub fn new(cols: u16, rows: u16) -> Self {
        Self { rows, cols }
    }

    /// Build a size, rejecting zero columns or rows.
    pub fn try_new(cols: u16, rows: u16) -> Result<Self> {
        if cols == 0 || rows == 0 {
            return Err(PtyError::InvalidArgument(
                "resizing must be done using positive cols and rows".to_string(),
            ));
        }
        Ok(Self::new(cols, rows))
    }

    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

impl Default for Size {
    fn default() -> Self {
        Self::new(Self::DEFAULT_COLS, Self::DEFAULT_ROWS)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Signals that can be delivered to the child's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Signal {
    #[default]
    Hup,
    Int,
    Quit,
    Kill,
    Term,
    Usr1,
    Usr2,
    Winch,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Hup => "SIGHUP",
            Signal::Int => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Kill => "SIGKILL",
            Signal::Term => "SIGTERM",
            Signal::Usr1 => "SIGUSR1",
            Signal::Usr2 => "SIGUSR2",
            Signal::Winch => "SIGWINCH",
        }
    }

    pub fn is_default(&self) -> bool {
        *self == Signal::default()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Signal {
    type Err = PtyError;

    /// Accepts `SIGHUP`, `HUP` or `hup` style names.
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        let signal = match bare {
            "HUP" => Signal::Hup,
            "INT" => Signal::Int,
            "QUIT" => Signal::Quit,
            "KILL" => Signal::Kill,
            "TERM" => Signal::Term,
            "USR1" => Signal::Usr1,
            "USR2" => Signal::Usr2,
            "WINCH" => Signal::Winch,
            _ => return Err(PtyError::InvalidArgument(format!("unknown signal: {s}"))),
        };
        Ok(signal)
    }
}

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i32,
    /// Terminating signal number. Always `None` on Windows.
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn new(code: i32, signal: Option<i32>) -> Self {
        Self { code, signal }
    }

    pub fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal {
            Some(signal) => write!(f, "exit code {} (signal {})", self.code, signal),
            None => write!(f, "exit code {}", self.code),
        }
    }
}

/// Write-once slot for an agent's exit status.
#[derive(Debug, Default)]
pub struct ExitCell(OnceLock<ExitStatus>);

impl ExitCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the exit status. Returns `false` if one was already recorded,
    /// in which case the stored value is left untouched.
    pub fn set(&self, status: ExitStatus) -> bool {
        self.0.set(status).is_ok()
    }

    pub fn get(&self) -> Option<ExitStatus> {
        self.0.get().copied()
    }
}

/// Text encoding applied to the data stream.
///
/// With an encoding set, data notifications never split a character across
/// two chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    Utf8,
    Latin1,
}

impl FromStr for Encoding {
    type Err = PtyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "latin1" | "binary" | "iso-8859-1" => Ok(Encoding::Latin1),
            other => Err(PtyError::InvalidArgument(format!("unknown encoding: {other}"))),
        }
    }
}
