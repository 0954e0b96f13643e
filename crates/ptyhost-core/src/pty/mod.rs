use ptyhost_common::error::{PtyError, Result};
use ptyhost_common::traits::PtyAgent;
use ptyhost_common::types::Size;
use portable_pty::{native_pty_system, MasterPty, PtySize, SlavePty};
use std::path::PathBuf;
use tracing::{debug, instrument};

use crate::options::{Args, TerminalOptions};

#[cfg(unix)]
mod unix;

#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::{UnixAgent, UnixPlatform};

#[cfg(windows)]
pub use windows::{WindowsAgent, WindowsPlatform};

/// What a platform's pty backend can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub platform: &'static str,
    /// Arbitrary signals can be delivered to the child.
    pub signals: bool,
    /// The data stream can carry an encoding.
    pub encoding: bool,
    /// Master and slave handles are exposed.
    pub endpoints: bool,
}

impl Capabilities {
    pub const UNIX: Capabilities = Capabilities {
        platform: "unix",
        signals: true,
        encoding: true,
        endpoints: true,
    };

    pub const WINDOWS: Capabilities = Capabilities {
        platform: "windows",
        signals: false,
        encoding: false,
        endpoints: false,
    };
}

/// Per-platform pty backend, chosen by [`native_platform`]
pub trait PtyTerminal: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Program launched when none is given.
    fn default_program(&self) -> String;

    /// Terminal name used when neither the options nor `TERM` provide one.
    fn default_name(&self) -> &'static str;

    /// Create the agent for `program`. `options.name` is already resolved.
    fn spawn_agent(
        &self,
        program: &str,
        args: &Args,
        options: &TerminalOptions,
    ) -> Result<Box<dyn PtyAgent>>;

    /// Allocate a pty pair with no process attached.
    fn open_pair(&self, size: Size) -> Result<PtyPair>;
}

/// The backend for the platform this binary was built for.
pub fn native_platform() -> &'static dyn PtyTerminal {
    #[cfg(unix)]
    {
        &UnixPlatform
    }
    #[cfg(windows)]
    {
        &WindowsPlatform
    }
}

/// A pty master/slave pair without a child process
pub struct PtyPair {
    master: Box<dyn MasterPty + Send>,
    #[allow(dead_code)]
    slave: Box<dyn SlavePty + Send>,
    size: Size,
}

impl PtyPair {
    #[instrument]
    pub(crate) fn open(size: Size) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| PtyError::Agent(format!("Failed to open PTY: {}", e)))?;
        debug!("Opened PTY pair");
        Ok(Self {
            master: pair.master,
            slave: pair.slave,
            size,
        })
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Raw descriptor of the master side.
    pub fn master_fd(&self) -> Option<i64> {
        #[cfg(unix)]
        {
            self.master.as_raw_fd().map(i64::from)
        }
        #[cfg(not(unix))]
        {
            None
        }
    }

    /// Device path of the slave side.
    pub fn slave_name(&self) -> Option<PathBuf> {
        #[cfg(unix)]
        {
            self.master.tty_name()
        }
        #[cfg(not(unix))]
        {
            None
        }
    }

    pub fn resize(&mut self, size: Size) -> Result<()> {
        let size = Size::try_new(size.cols, size.rows)?;
        self.master
            .resize(pty_size(size))
            .map_err(|e| PtyError::Agent(format!("Failed to resize PTY: {}", e)))?;
        self.size = size;
        Ok(())
    }
}

pub(crate) fn pty_size(size: Size) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Allocate a bare pty pair on the native platform.
pub fn open_pair(size: Size) -> Result<PtyPair> {
    native_platform().open_pair(size)
}
