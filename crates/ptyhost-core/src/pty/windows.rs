use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty};
use ptyhost_common::error::{PtyError, Result};
use ptyhost_common::traits::{AgentEndpoints, AgentInbound, AgentOutbound, AgentSignal, PtyAgent};
use ptyhost_common::types::{ExitCell, ExitStatus, Signal, Size};
use std::io::{self, Read, Write};
use std::thread;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::{pty_size, Capabilities, PtyPair, PtyTerminal};
use crate::options::{Args, TerminalOptions};

const READ_CHUNK: usize = 8192;
/// Chunks the writer thread may lag behind before writes report backpressure.
const WRITE_QUEUE_DEPTH: usize = 64;

/// ConPTY backend. The console is only known to be usable once it has
/// produced output, so readiness is signalled asynchronously.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsPlatform;

impl PtyTerminal for WindowsPlatform {
    fn capabilities(&self) -> Capabilities {
        Capabilities::WINDOWS
    }

    fn default_program(&self) -> String {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }

    fn default_name(&self) -> &'static str {
        "Windows Shell"
    }

    fn spawn_agent(
        &self,
        program: &str,
        args: &Args,
        options: &TerminalOptions,
    ) -> Result<Box<dyn PtyAgent>> {
        Ok(Box::new(WindowsAgent::spawn(program, args, options)?))
    }

    fn open_pair(&self, _size: Size) -> Result<PtyPair> {
        Err(PtyError::Unsupported("opening a bare pty pair"))
    }
}

/// Child process attached to a pseudoconsole
pub struct WindowsAgent {
    master: Option<Box<dyn MasterPty + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    /// Blocking wait on the child, kept across cancelled `reap` calls.
    waiter: Option<JoinHandle<io::Result<portable_pty::ExitStatus>>>,
    pid: Option<u32>,
    endpoints: Option<AgentEndpoints>,
    exit: ExitCell,
}

impl WindowsAgent {
    #[instrument(skip(options))]
    pub fn spawn(program: &str, args: &Args, options: &TerminalOptions) -> Result<Self> {
        if options.use_conpty == Some(false) {
            return Err(PtyError::Unsupported("the winpty backend"));
        }
        if options.uid.is_some() || options.gid.is_some() {
            warn!("uid and gid are not supported on Windows, ignoring them");
        }

        let mut cmd = CommandBuilder::new(program);
        match args {
            Args::Argv(argv) => cmd.args(argv),
            Args::CommandLine(line) => cmd.args(split_command_line(line)),
        }
        cmd.env_clear();
        for (key, value) in options.resolved_env() {
            cmd.env(key, value);
        }
        cmd.cwd(options.resolved_cwd()?);

        let pair = native_pty_system()
            .openpty(pty_size(options.size))
            .map_err(|e| PtyError::Agent(format!("Failed to open pseudoconsole: {}", e)))?;
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Agent(format!("Failed to spawn {}: {}", program, e)))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Agent(format!("Failed to clone reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Agent(format!("Failed to take writer: {}", e)))?;

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name("ptyhost-reader".to_string())
            .spawn(move || read_loop(reader, signal_tx))?;

        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        thread::Builder::new()
            .name("ptyhost-writer".to_string())
            .spawn(move || write_loop(writer, write_rx))?;

        let pid = child.process_id();
        info!(?pid, "Spawned {} on a pseudoconsole", program);
        Ok(Self {
            master: Some(pair.master),
            killer: child.clone_killer(),
            child: Some(child),
            waiter: None,
            pid,
            endpoints: Some(AgentEndpoints {
                inbound: Box::new(WindowsInbound {
                    rx: signal_rx,
                    announced: false,
                    stashed: None,
                }),
                outbound: Box::new(WindowsOutbound { tx: write_tx }),
            }),
            exit: ExitCell::new(),
        })
    }
}

#[async_trait]
impl PtyAgent for WindowsAgent {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn handle(&self) -> Option<i64> {
        None
    }

    fn pty_name(&self) -> Option<String> {
        None
    }

    fn take_endpoints(&mut self) -> Result<AgentEndpoints> {
        self.endpoints
            .take()
            .ok_or_else(|| PtyError::Agent("pseudoconsole endpoints already taken".to_string()))
    }

    #[instrument(skip(self))]
    fn resize(&mut self, size: Size) -> Result<()> {
        let master = self.master.as_ref().ok_or(PtyError::Destroyed)?;
        master
            .resize(pty_size(size))
            .map_err(|e| PtyError::Agent(format!("Failed to resize pseudoconsole: {}", e)))
    }

    #[instrument(skip(self))]
    fn kill(&mut self, signal: Option<Signal>) -> Result<()> {
        if signal.is_some_and(|signal| !signal.is_default()) {
            return Err(PtyError::Unsupported("signal delivery"));
        }
        if self.exit.get().is_some() {
            return Ok(());
        }
        if let Err(e) = self.killer.kill() {
            // The process may already be gone; the pseudoconsole still closes below.
            debug!("Failed to terminate child: {}", e);
        }
        if self.master.take().is_some() {
            debug!("Closed pseudoconsole");
        }
        Ok(())
    }

    async fn reap(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit.get() {
            return Ok(status);
        }
        if self.waiter.is_none() {
            let mut child = self
                .child
                .take()
                .ok_or_else(|| PtyError::Agent("child was already reaped".to_string()))?;
            self.waiter = Some(tokio::task::spawn_blocking(move || child.wait()));
        }
        let Some(waiter) = self.waiter.as_mut() else {
            return Err(PtyError::Agent("child was already reaped".to_string()));
        };
        let joined = waiter.await;
        self.waiter = None;
        let status = joined.map_err(|e| PtyError::Agent(format!("Reaper task failed: {}", e)))??;
        let status = ExitStatus::new(status.exit_code() as i32, None);
        self.exit.set(status);
        Ok(status)
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.get()
    }

    fn release(&mut self) {
        self.endpoints = None;
        self.master = None;
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<AgentSignal>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let signal = match reader.read(&mut buf) {
            Ok(0) => AgentSignal::Closed,
            Ok(n) => AgentSignal::Data(Bytes::copy_from_slice(&buf[..n])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => AgentSignal::Failed(e),
        };
        let last = !matches!(signal, AgentSignal::Data(_));
        if tx.send(signal).is_err() || last {
            break;
        }
    }
    debug!("Reader thread stopped");
}

fn write_loop(mut writer: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(chunk) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
            error!("Pseudoconsole write failed: {}", e);
            break;
        }
    }
    debug!("Writer thread stopped");
}

struct WindowsInbound {
    rx: mpsc::UnboundedReceiver<AgentSignal>,
    announced: bool,
    stashed: Option<AgentSignal>,
}

#[async_trait]
impl AgentInbound for WindowsInbound {
    async fn recv(&mut self) -> AgentSignal {
        if let Some(signal) = self.stashed.take() {
            return signal;
        }
        let signal = self.rx.recv().await.unwrap_or(AgentSignal::Closed);
        if !self.announced && matches!(signal, AgentSignal::Data(_)) {
            self.announced = true;
            self.stashed = Some(signal);
            return AgentSignal::Ready;
        }
        signal
    }
}

struct WindowsOutbound {
    tx: mpsc::Sender<Bytes>,
}

#[async_trait]
impl AgentOutbound for WindowsOutbound {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.tx.try_send(Bytes::copy_from_slice(buf)) {
            Ok(()) => Ok(buf.len()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(io::ErrorKind::WouldBlock.into()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    async fn write_ready(&mut self, buf: &[u8]) -> io::Result<usize> {
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        permit.send(Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }
}

/// Split a command line the way the Microsoft C runtime does.
fn split_command_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_arg = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let mut backslashes = 1;
                while chars.peek() == Some(&'\\') {
                    chars.next();
                    backslashes += 1;
                }
                if chars.peek() == Some(&'"') {
                    current.extend(std::iter::repeat('\\').take(backslashes / 2));
                    if backslashes % 2 == 1 {
                        current.push('"');
                        chars.next();
                    }
                } else {
                    current.extend(std::iter::repeat('\\').take(backslashes));
                }
                has_arg = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                has_arg = true;
            }
            ' ' | '\t' if !in_quotes => {
                if has_arg {
                    args.push(std::mem::take(&mut current));
                    has_arg = false;
                }
            }
            c => {
                current.push(c);
                has_arg = true;
            }
        }
    }
    if has_arg {
        args.push(current);
    }
    args
}
