//! In-memory agent for exercising terminals without a real pty.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use ptyhost_common::error::{PtyError, Result};
use ptyhost_common::traits::{AgentEndpoints, AgentInbound, AgentOutbound, AgentSignal, PtyAgent};
use ptyhost_common::types::{ExitCell, ExitStatus, Signal, Size};
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tracing::debug;

/// Status reported when the mock is killed with the default signal.
pub const KILLED_STATUS: ExitStatus = ExitStatus {
    code: 0,
    signal: Some(1),
};

/// Status reported when the mock is killed with [`Signal::Kill`].
pub const SIGKILL_STATUS: ExitStatus = ExitStatus {
    code: 0,
    signal: Some(9),
};

#[derive(Debug, Default)]
struct MockState {
    written: Vec<u8>,
    /// Bytes the write side still accepts. `None` is unlimited.
    capacity: Option<usize>,
    echo: bool,
    resizes: Vec<Size>,
    kills: Vec<Option<Signal>>,
    /// The default signal is recorded but does not end the child.
    ignore_hangup: bool,
    released: bool,
}

struct Shared {
    state: Mutex<MockState>,
    signals: mpsc::UnboundedSender<AgentSignal>,
    writable: Notify,
    exit: watch::Sender<Option<ExitStatus>>,
}

impl Shared {
    fn send(&self, signal: AgentSignal) {
        let _ = self.signals.send(signal);
    }

    fn close(&self, status: ExitStatus) {
        self.exit.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(status);
            true
        });
        self.send(AgentSignal::Closed);
    }
}

/// Scripted agent. Drive it through the paired [`MockController`].
pub struct MockAgent {
    shared: Arc<Shared>,
    endpoints: Option<AgentEndpoints>,
    exit: ExitCell,
}

impl MockAgent {
    /// An agent that stays not-ready until [`MockController::ready`].
    pub fn new() -> (MockAgent, MockController) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (exit, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            state: Mutex::new(MockState::default()),
            signals: tx,
            writable: Notify::new(),
            exit,
        });
        let endpoints = AgentEndpoints {
            inbound: Box::new(MockInbound { rx }),
            outbound: Box::new(MockOutbound {
                shared: Arc::clone(&shared),
            }),
        };
        let agent = MockAgent {
            shared: Arc::clone(&shared),
            endpoints: Some(endpoints),
            exit: ExitCell::new(),
        };
        (agent, MockController { shared })
    }

    /// An agent whose readiness signal is already queued.
    pub fn new_ready() -> (MockAgent, MockController) {
        let (agent, controller) = Self::new();
        controller.ready();
        (agent, controller)
    }
}

#[async_trait]
impl PtyAgent for MockAgent {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn handle(&self) -> Option<i64> {
        Some(3)
    }

    fn pty_name(&self) -> Option<String> {
        Some("/dev/mock/0".to_string())
    }

    fn take_endpoints(&mut self) -> Result<AgentEndpoints> {
        self.endpoints
            .take()
            .ok_or_else(|| PtyError::Agent("mock endpoints already taken".to_string()))
    }

    fn resize(&mut self, size: Size) -> Result<()> {
        self.shared.state.lock().resizes.push(size);
        Ok(())
    }

    fn kill(&mut self, signal: Option<Signal>) -> Result<()> {
        let ignore_hangup = {
            let mut state = self.shared.state.lock();
            state.kills.push(signal);
            state.ignore_hangup
        };
        match signal {
            None if !ignore_hangup => {
                debug!("Mock agent killed");
                self.shared.close(KILLED_STATUS);
            }
            Some(Signal::Kill) => self.shared.close(SIGKILL_STATUS),
            _ => {}
        }
        Ok(())
    }

    async fn reap(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit.get() {
            return Ok(status);
        }
        let mut rx = self.shared.exit.subscribe();
        let status = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|slot| *slot)
            .unwrap_or_default();
        self.exit.set(status);
        Ok(status)
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.get()
    }

    fn release(&mut self) {
        self.endpoints = None;
        self.shared.state.lock().released = true;
    }
}

/// Test-side handle for a [`MockAgent`]
#[derive(Clone)]
pub struct MockController {
    shared: Arc<Shared>,
}

impl MockController {
    pub fn ready(&self) {
        self.shared.send(AgentSignal::Ready);
    }

    /// Produce output as if the child wrote it.
    pub fn send(&self, data: impl Into<Bytes>) {
        self.shared.send(AgentSignal::Data(data.into()));
    }

    /// End the channel, recording `status` as the exit status.
    pub fn close(&self, status: ExitStatus) {
        self.shared.close(status);
    }

    /// End the channel while the child keeps running, as when it closes
    /// its end of the pty.
    pub fn disconnect(&self) {
        self.shared.send(AgentSignal::Closed);
    }

    /// Fail the channel with `err`.
    pub fn fail(&self, err: io::Error) {
        self.shared.exit.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(ExitStatus::default());
            true
        });
        self.shared.send(AgentSignal::Failed(err));
    }

    /// Limit how many more bytes the write side accepts.
    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.shared.state.lock().capacity = capacity;
        self.shared.writable.notify_one();
    }

    /// Let `n` more bytes through a limited write side.
    pub fn free(&self, n: usize) {
        {
            let mut state = self.shared.state.lock();
            if let Some(capacity) = state.capacity.as_mut() {
                *capacity += n;
            }
        }
        self.shared.writable.notify_one();
    }

    /// Make the default signal a no-op, like a child that ignores SIGHUP.
    pub fn ignore_hangup(&self) {
        self.shared.state.lock().ignore_hangup = true;
    }

    /// Echo accepted writes back as output, like a tty in cooked mode.
    pub fn set_echo(&self, echo: bool) {
        self.shared.state.lock().echo = echo;
    }

    pub fn written(&self) -> Vec<u8> {
        self.shared.state.lock().written.clone()
    }

    pub fn resizes(&self) -> Vec<Size> {
        self.shared.state.lock().resizes.clone()
    }

    pub fn kills(&self) -> Vec<Option<Signal>> {
        self.shared.state.lock().kills.clone()
    }

    pub fn is_released(&self) -> bool {
        self.shared.state.lock().released
    }
}

struct MockInbound {
    rx: mpsc::UnboundedReceiver<AgentSignal>,
}

#[async_trait]
impl AgentInbound for MockInbound {
    async fn recv(&mut self) -> AgentSignal {
        self.rx.recv().await.unwrap_or(AgentSignal::Closed)
    }
}

struct MockOutbound {
    shared: Arc<Shared>,
}

#[async_trait]
impl AgentOutbound for MockOutbound {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        if state.released {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = match state.capacity {
            Some(capacity) => buf.len().min(capacity),
            None => buf.len(),
        };
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        if let Some(capacity) = state.capacity.as_mut() {
            *capacity -= n;
        }
        state.written.extend_from_slice(&buf[..n]);
        if state.echo && n > 0 {
            self.shared.send(AgentSignal::Data(Bytes::copy_from_slice(&buf[..n])));
        }
        Ok(n)
    }

    async fn write_ready(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.try_write(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.shared.writable.notified().await
                }
                result => return result,
            }
        }
    }
}
