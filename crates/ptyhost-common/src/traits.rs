use crate::error::Result;
use crate::types::{ExitStatus, Signal, Size};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;

/// Signals produced by an agent's inbound endpoint
#[derive(Debug)]
pub enum AgentSignal {
    /// The agent finished initializing. Sent at most once, before any data.
    Ready,
    /// Raw bytes read from the pty.
    Data(Bytes),
    /// The channel reached end of stream.
    Closed,
    /// The channel failed.
    Failed(io::Error),
}

/// Read side of an agent's channel
#[async_trait]
pub trait AgentInbound: Send {
    /// Wait for the next signal. Must be cancel safe.
    async fn recv(&mut self) -> AgentSignal;
}

/// Write side of an agent's channel
#[async_trait]
pub trait AgentOutbound: Send {
    /// Attempt a write without waiting. Returns `WouldBlock` when the
    /// kernel buffer is full.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Wait until at least part of `buf` can be written, then write it.
    /// Must be cancel safe.
    async fn write_ready(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// The two I/O endpoints of an agent. They may share one duplex channel.
pub struct AgentEndpoints {
    pub inbound: Box<dyn AgentInbound>,
    pub outbound: Box<dyn AgentOutbound>,
}

/// Native layer owning pty allocation and the child process
#[async_trait]
pub trait PtyAgent: Send {
    /// Process id of the child, once known.
    fn pid(&self) -> Option<u32>;

    /// Raw descriptor or handle of the pty master.
    fn handle(&self) -> Option<i64>;

    /// Device name of the pty, if the platform has one.
    fn pty_name(&self) -> Option<String>;

    /// Hand the I/O endpoints to the caller. Can only succeed once.
    fn take_endpoints(&mut self) -> Result<AgentEndpoints>;

    /// Resize the pty
    fn resize(&mut self, size: Size) -> Result<()>;

    /// Terminate the child. `None` means the platform's default teardown.
    fn kill(&mut self, signal: Option<Signal>) -> Result<()>;

    /// Wait for the child to exit and record its status.
    ///
    /// Must be cancel safe: a reap abandoned on timeout can be retried.
    async fn reap(&mut self) -> Result<ExitStatus>;

    /// The recorded exit status, set at most once by `reap`.
    fn exit_status(&self) -> Option<ExitStatus>;

    /// Release every native handle still held.
    fn release(&mut self);
}
