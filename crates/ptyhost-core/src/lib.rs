//! Spawn processes on pseudoterminals and drive them as async byte streams.
//!
//! ```no_run
//! # async fn demo() -> ptyhost_common::Result<()> {
//! use ptyhost_core::{spawn, TerminalOptions};
//!
//! let terminal = spawn("/bin/sh", vec!["-c".to_string(), "echo hello".to_string()], TerminalOptions::default())?;
//! let mut data = terminal.on_data();
//! while let Some(chunk) = data.recv().await {
//!     print!("{}", String::from_utf8_lossy(&chunk));
//! }
//! let status = terminal.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod events;
pub mod flow;
pub mod options;
pub mod outbound;
pub mod pty;
pub mod queue;
pub mod terminal;
pub mod text;

use ptyhost_common::error::Result;
use tracing::instrument;

pub use events::{ErrorNotice, Subscription};
pub use flow::FlowControlConfig;
pub use options::{Args, TerminalOptions};
pub use pty::{native_platform, open_pair, Capabilities, PtyPair, PtyTerminal};
pub use ptyhost_common::error::PtyError;
pub use ptyhost_common::types::{Encoding, ExitStatus, Signal, Size};
pub use terminal::{LifecycleState, PtyEndpoint, Socket, Terminal, WriteReceipt};

/// Spawn `program` on a pty of the native platform.
///
/// Must be called from within a tokio runtime.
#[instrument(skip(args, options))]
pub fn spawn(program: &str, args: impl Into<Args>, options: TerminalOptions) -> Result<Terminal> {
    Terminal::spawn_with(native_platform(), program, args, options)
}
