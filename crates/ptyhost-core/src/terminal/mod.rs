mod driver;
pub mod lifecycle;

pub use lifecycle::{Lifecycle, LifecycleState};

use bytes::Bytes;
use parking_lot::Mutex;
use ptyhost_common::error::{PtyError, Result};
use ptyhost_common::traits::PtyAgent;
use ptyhost_common::types::{Encoding, ExitCell, ExitStatus, Signal, Size};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use crate::events::{ErrorNotice, EventHub, Subscription};
use crate::options::{Args, TerminalOptions};
use crate::pty::{Capabilities, PtyTerminal};
use crate::queue::PendingCommand;
use driver::Driver;

/// Messages from the handle to its driver task
#[derive(Debug)]
pub(crate) enum Request {
    Command(PendingCommand),
    Pause,
    Resume,
    SetEncoding(Option<Encoding>),
}

/// How a terminal ended, published once by the driver.
#[derive(Debug, Clone)]
pub(crate) struct Outcome {
    status: ExitStatus,
    errors: Vec<ErrorNotice>,
}

/// State readable from the handle while the driver runs
#[derive(Debug)]
pub(crate) struct Shared {
    lifecycle: Lifecycle,
    size: Mutex<Size>,
    encoding: Mutex<Option<Encoding>>,
    exit: ExitCell,
    destroyed: watch::Sender<bool>,
    outcome: watch::Sender<Option<Outcome>>,
}

impl Shared {
    fn new(size: Size, encoding: Option<Encoding>) -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            size: Mutex::new(size),
            encoding: Mutex::new(encoding),
            exit: ExitCell::new(),
            destroyed: watch::channel(false).0,
            outcome: watch::channel(None).0,
        }
    }
}

/// Resolves to whether a write went straight to the kernel.
///
/// `false` means part of the payload was queued (a `drain` notification will
/// follow) or that the terminal closed before the write was made.
#[derive(Debug)]
pub struct WriteReceipt {
    rx: oneshot::Receiver<bool>,
}

impl Future for WriteReceipt {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.rx).poll(cx).map(|flushed| flushed.unwrap_or(false))
    }
}

/// The I/O channel underneath a terminal
#[derive(Debug, Clone)]
pub struct Socket {
    handle: Option<i64>,
    destroyed: watch::Receiver<bool>,
}

impl Socket {
    /// Raw descriptor (Unix) or handle of the channel.
    pub fn handle(&self) -> Option<i64> {
        self.handle
    }

    pub fn is_destroyed(&self) -> bool {
        *self.destroyed.borrow()
    }

    /// Wait until every handle of the channel has been released.
    pub async fn destroyed(&self) {
        let mut rx = self.destroyed.clone();
        let _ = rx.wait_for(|destroyed| *destroyed).await;
    }
}

/// One side of the pty, as exposed by `master()` / `slave()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyEndpoint {
    pub fd: Option<i64>,
    pub path: Option<String>,
}

/// A child process running on a pseudoterminal.
///
/// Every operation returns immediately; the work is carried out by a driver
/// task that owns the agent. Dropping the handle tears the terminal down.
pub struct Terminal {
    requests: mpsc::UnboundedSender<Request>,
    hub: Arc<Mutex<EventHub>>,
    shared: Arc<Shared>,
    capabilities: Capabilities,
    name: String,
    pid: Option<u32>,
    handle: Option<i64>,
    pty_name: Option<String>,
}

impl Terminal {
    /// Spawn `program` on a new pty of the given platform.
    ///
    /// An empty `program` runs the platform's default shell. Must be called
    /// from within a tokio runtime.
    #[instrument(skip(platform, args, options))]
    pub fn spawn_with(
        platform: &dyn PtyTerminal,
        program: &str,
        args: impl Into<Args>,
        mut options: TerminalOptions,
    ) -> Result<Self> {
        options.validate()?;
        let capabilities = platform.capabilities();
        if options.encoding.is_some() && !capabilities.encoding {
            warn!(
                "Setting an encoding is not supported on {}, ignoring it",
                capabilities.platform
            );
            options.encoding = None;
        }

        let name = options
            .name
            .clone()
            .or_else(|| std::env::var("TERM").ok())
            .unwrap_or_else(|| platform.default_name().to_string());
        options.name = Some(name);

        let program = if program.is_empty() {
            platform.default_program()
        } else {
            program.to_string()
        };

        let agent = platform.spawn_agent(&program, &args.into(), &options)?;
        Self::with_agent(agent, capabilities, options)
    }

    /// Wrap an already spawned agent. Must be called from within a tokio runtime.
    pub fn with_agent(
        mut agent: Box<dyn PtyAgent>,
        capabilities: Capabilities,
        options: TerminalOptions,
    ) -> Result<Self> {
        options.validate()?;
        let endpoints = agent.take_endpoints()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Mutex::new(EventHub::new()));
        let shared = Arc::new(Shared::new(options.size, options.encoding));

        let terminal = Terminal {
            requests: tx,
            hub: Arc::clone(&hub),
            shared: Arc::clone(&shared),
            capabilities,
            name: options.name.clone().unwrap_or_default(),
            pid: agent.pid(),
            handle: agent.handle(),
            pty_name: agent.pty_name(),
        };

        shared.lifecycle.advance(LifecycleState::NotReady);
        let driver = Driver::new(agent, endpoints, rx, hub, shared, capabilities, &options);
        tokio::spawn(driver.run().instrument(info_span!("terminal", pid = ?terminal.pid)));

        info!(pid = ?terminal.pid, name = %terminal.name, "Terminal started");
        Ok(terminal)
    }

    /// Send `data` to the child.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<WriteReceipt> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.submit(PendingCommand::Write {
            data: data.into(),
            receipt: Some(tx),
        })?;
        Ok(WriteReceipt { rx })
    }

    /// Resize the pty. Zero columns or rows are rejected before anything
    /// reaches the agent.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let size = Size::try_new(cols, rows)?;
        self.ensure_open()?;
        self.submit(PendingCommand::Resize(size))
    }

    /// Tear the terminal down. Repeated calls do nothing.
    pub fn destroy(&self) {
        if !self.state().accepts_commands() {
            debug!("Terminal already closing, ignoring destroy");
            return;
        }
        let _ = self.submit(PendingCommand::Destroy);
    }

    /// Signal the child. `None` tears the terminal down like `destroy`.
    ///
    /// Platforms without signal delivery reject any non-default signal.
    pub fn kill(&self, signal: Option<Signal>) -> Result<()> {
        if let Some(signal) = signal {
            if !self.capabilities.signals && !signal.is_default() {
                return Err(PtyError::Unsupported("signal delivery"));
            }
        }
        if !self.state().accepts_commands() {
            return Ok(());
        }
        self.submit(PendingCommand::Kill(signal))
    }

    /// Stop reading from the child.
    pub fn pause(&self) {
        let _ = self.requests.send(Request::Pause);
    }

    /// Resume reading, releasing anything withheld while paused.
    pub fn resume(&self) {
        let _ = self.requests.send(Request::Resume);
    }

    /// Change how data chunks are split. Unix only.
    pub fn set_encoding(&self, encoding: Option<Encoding>) -> Result<()> {
        if !self.capabilities.encoding {
            return Err(PtyError::Unsupported("setting an encoding"));
        }
        self.ensure_open()?;
        *self.shared.encoding.lock() = encoding;
        self.requests
            .send(Request::SetEncoding(encoding))
            .map_err(|_| PtyError::Destroyed)
    }

    pub fn encoding(&self) -> Option<Encoding> {
        *self.shared.encoding.lock()
    }

    pub fn socket(&self) -> Socket {
        Socket {
            handle: self.handle,
            destroyed: self.shared.destroyed.subscribe(),
        }
    }

    /// Name of the process, as given by the `name` option.
    pub fn process(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn pty_name(&self) -> Option<&str> {
        self.pty_name.as_deref()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Geometry last accepted by the agent.
    pub fn size(&self) -> Size {
        *self.shared.size.lock()
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.current()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.shared.exit.get()
    }

    pub fn master(&self) -> Result<PtyEndpoint> {
        if !self.capabilities.endpoints {
            return Err(PtyError::Unsupported("accessing the pty master"));
        }
        Ok(PtyEndpoint {
            fd: self.handle,
            path: None,
        })
    }

    pub fn slave(&self) -> Result<PtyEndpoint> {
        if !self.capabilities.endpoints {
            return Err(PtyError::Unsupported("accessing the pty slave"));
        }
        Ok(PtyEndpoint {
            fd: None,
            path: self.pty_name.clone(),
        })
    }

    pub fn on_data(&self) -> Subscription<Bytes> {
        self.hub.lock().data.subscribe()
    }

    pub fn on_drain(&self) -> Subscription<()> {
        self.hub.lock().drain.subscribe()
    }

    pub fn on_pause(&self) -> Subscription<()> {
        self.hub.lock().pause.subscribe()
    }

    pub fn on_resume(&self) -> Subscription<()> {
        self.hub.lock().resume.subscribe()
    }

    pub fn on_exit(&self) -> Subscription<ExitStatus> {
        self.hub.lock().exit.subscribe()
    }

    pub fn on_error(&self) -> Subscription<ErrorNotice> {
        self.hub.lock().error.subscribe()
    }

    /// Wait for the terminal to be fully destroyed.
    ///
    /// Fails with [`PtyError::Unhandled`] if an error was reported that no
    /// listener acknowledged by the time the terminal finished.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let mut rx = self.shared.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        let outcome = outcome.ok_or(PtyError::Destroyed)?;
        if let Some(notice) = outcome.errors.iter().find(|n| !n.is_acknowledged()) {
            return Err(PtyError::Unhandled(notice.shared()));
        }
        Ok(outcome.status)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state().accepts_commands() {
            Ok(())
        } else {
            Err(PtyError::Destroyed)
        }
    }

    fn submit(&self, command: PendingCommand) -> Result<()> {
        self.requests
            .send(Request::Command(command))
            .map_err(|_| PtyError::Destroyed)
    }
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;

    fn terminal() -> (Terminal, crate::agent::MockController) {
        let (agent, controller) = MockAgent::new_ready();
        let terminal =
            Terminal::with_agent(Box::new(agent), Capabilities::UNIX, TerminalOptions::default())
                .unwrap();
        (terminal, controller)
    }

    #[tokio::test]
    async fn test_receipt_resolves_false_when_dropped() {
        let (tx, rx) = oneshot::channel::<bool>();
        drop(tx);
        assert!(!WriteReceipt { rx }.await);
    }

    #[tokio::test]
    async fn test_starts_not_ready() {
        let (agent, _controller) = MockAgent::new();
        let terminal =
            Terminal::with_agent(Box::new(agent), Capabilities::UNIX, TerminalOptions::default())
                .unwrap();
        assert_eq!(terminal.state(), LifecycleState::NotReady);
        assert_eq!(terminal.pid(), Some(4242));
        assert_eq!(terminal.pty_name(), Some("/dev/mock/0"));
    }

    #[tokio::test]
    async fn test_endpoints() {
        let (terminal, _controller) = terminal();
        assert_eq!(terminal.master().unwrap().fd, Some(3));
        assert_eq!(terminal.slave().unwrap().path.as_deref(), Some("/dev/mock/0"));
        assert!(!terminal.socket().is_destroyed());
    }

    #[tokio::test]
    async fn test_operations_after_destroy() {
        let (terminal, _controller) = terminal();
        terminal.destroy();
        terminal.wait().await.unwrap();

        assert_eq!(terminal.state(), LifecycleState::Destroyed);
        assert!(matches!(terminal.write("x"), Err(PtyError::Destroyed)));
        assert!(matches!(terminal.resize(10, 10), Err(PtyError::Destroyed)));
        assert!(terminal.kill(None).is_ok());
        terminal.destroy();
        assert!(terminal.socket().is_destroyed());
    }
}
