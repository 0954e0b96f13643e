use async_trait::async_trait;
use bytes::Bytes;
use ptyhost_common::error::{PtyError, Result};
use ptyhost_common::traits::{AgentEndpoints, AgentInbound, AgentOutbound, AgentSignal, PtyAgent};
use ptyhost_common::types::{ExitCell, ExitStatus, Signal, Size};
use portable_pty::MasterPty;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tracing::{debug, error, info, instrument, warn};

use super::{pty_size, Capabilities, PtyPair, PtyTerminal};
use crate::options::{Args, TerminalOptions};

const READ_CHUNK: usize = 8192;

/// Unix backend: a pty pair opened synchronously, so the agent is ready at once
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixPlatform;

impl PtyTerminal for UnixPlatform {
    fn capabilities(&self) -> Capabilities {
        Capabilities::UNIX
    }

    fn default_program(&self) -> String {
        std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string())
    }

    fn default_name(&self) -> &'static str {
        "xterm"
    }

    fn spawn_agent(
        &self,
        program: &str,
        args: &Args,
        options: &TerminalOptions,
    ) -> Result<Box<dyn PtyAgent>> {
        Ok(Box::new(UnixAgent::spawn(program, args, options)?))
    }

    fn open_pair(&self, size: Size) -> Result<PtyPair> {
        PtyPair::open(size)
    }
}

/// Child process attached to the slave side of a pty
pub struct UnixAgent {
    master: Option<Box<dyn MasterPty + Send>>,
    child: tokio::process::Child,
    pid: Option<u32>,
    fd: Option<RawFd>,
    tty: Option<PathBuf>,
    endpoints: Option<AgentEndpoints>,
    exit: ExitCell,
}

impl UnixAgent {
    /// Spawn `program` on a fresh pty. Must run inside a tokio runtime.
    #[instrument(skip(options))]
    pub fn spawn(program: &str, args: &Args, options: &TerminalOptions) -> Result<Self> {
        let argv = match args {
            Args::Argv(argv) => argv,
            Args::CommandLine(_) => {
                return Err(PtyError::InvalidArgument(
                    "a pre-escaped command line is only accepted on Windows".to_string(),
                ))
            }
        };

        let pair = PtyPair::open(options.size)?;
        let tty = pair
            .slave_name()
            .ok_or_else(|| PtyError::Agent("PTY has no slave device name".to_string()))?;
        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&tty)?;

        let cwd = options.resolved_cwd()?;
        let mut env = options.resolved_env();
        if let Some(name) = &options.name {
            env.insert("TERM".to_string(), name.clone());
        }
        env.insert("PWD".to_string(), cwd.display().to_string());

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(argv)
            .env_clear()
            .envs(&env)
            .current_dir(&cwd)
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave));
        if let Some(uid) = options.uid {
            cmd.uid(uid);
        }
        if let Some(gid) = options.gid {
            cmd.gid(gid);
        }
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        debug!("Spawning {} on {}", program, tty.display());
        let child = cmd
            .spawn()
            .map_err(|e| PtyError::Agent(format!("Failed to spawn {}: {}", program, e)))?;
        // The parent must not keep the slave open, or the master never sees EOF.
        drop(cmd);

        let PtyPair { master, slave, .. } = pair;
        drop(slave);

        let io = Arc::new(master_io(master.as_ref())?);
        let endpoints = AgentEndpoints {
            inbound: Box::new(UnixInbound {
                io: Arc::clone(&io),
                announced: false,
                buf: vec![0u8; READ_CHUNK],
            }),
            outbound: Box::new(UnixOutbound { io }),
        };

        let pid = child.id();
        info!(?pid, "Spawned {} on a pty", program);
        Ok(Self {
            fd: master.as_raw_fd(),
            master: Some(master),
            child,
            pid,
            tty: Some(tty),
            endpoints: Some(endpoints),
            exit: ExitCell::new(),
        })
    }
}

#[async_trait]
impl PtyAgent for UnixAgent {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn handle(&self) -> Option<i64> {
        self.fd.map(i64::from)
    }

    fn pty_name(&self) -> Option<String> {
        self.tty.as_ref().map(|tty| tty.display().to_string())
    }

    fn take_endpoints(&mut self) -> Result<AgentEndpoints> {
        self.endpoints
            .take()
            .ok_or_else(|| PtyError::Agent("PTY endpoints already taken".to_string()))
    }

    #[instrument(skip(self))]
    fn resize(&mut self, size: Size) -> Result<()> {
        let master = self.master.as_ref().ok_or(PtyError::Destroyed)?;
        master
            .resize(pty_size(size))
            .map_err(|e| PtyError::Agent(format!("Failed to resize PTY: {}", e)))?;
        debug!("PTY resized to {}", size);
        Ok(())
    }

    #[instrument(skip(self))]
    fn kill(&mut self, signal: Option<Signal>) -> Result<()> {
        let signal = signal.unwrap_or_default();
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if self.exit.get().is_some() {
            debug!("Child already reaped, not sending {}", signal);
            return Ok(());
        }
        // The child is a session leader, so its pid is also its process group.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, raw_signal(signal)) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                debug!("Process group {} already gone", pid);
                return Ok(());
            }
            error!("Failed to send {} to {}: {}", signal, pid, err);
            return Err(err.into());
        }
        debug!("Sent {} to process group {}", signal, pid);
        Ok(())
    }

    async fn reap(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit.get() {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        let status = ExitStatus::new(status.code().unwrap_or(0), status.signal());
        if !self.exit.set(status) {
            warn!("Exit status was already recorded");
        }
        Ok(self.exit.get().unwrap_or(status))
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.get()
    }

    fn release(&mut self) {
        self.endpoints = None;
        if self.master.take().is_some() {
            debug!("Released PTY master");
        }
    }
}

/// Non-blocking duplicate of the master descriptor registered with tokio.
fn master_io(master: &(dyn MasterPty + Send)) -> Result<AsyncFd<File>> {
    let fd = master
        .as_raw_fd()
        .ok_or_else(|| PtyError::Agent("Could not get raw file descriptor from master PTY".to_string()))?;

    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags == -1 {
            return Err(io::Error::last_os_error().into());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error().into());
        }
    }
    debug!("Set PTY master to non-blocking mode");

    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup == -1 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: `dup` is a fresh descriptor owned by nothing else.
    let file = unsafe { File::from_raw_fd(dup) };
    Ok(AsyncFd::new(file)?)
}

struct UnixInbound {
    io: Arc<AsyncFd<File>>,
    announced: bool,
    buf: Vec<u8>,
}

#[async_trait]
impl AgentInbound for UnixInbound {
    async fn recv(&mut self) -> AgentSignal {
        if !self.announced {
            self.announced = true;
            return AgentSignal::Ready;
        }
        loop {
            let mut guard = match self.io.readable().await {
                Ok(guard) => guard,
                Err(e) => return AgentSignal::Failed(e),
            };
            let buf = &mut self.buf;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(buf)
            }) {
                Ok(Ok(0)) => return AgentSignal::Closed,
                Ok(Ok(n)) => return AgentSignal::Data(Bytes::copy_from_slice(&buf[..n])),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return AgentSignal::Failed(e),
                Err(_would_block) => continue,
            }
        }
    }
}

struct UnixOutbound {
    io: Arc<AsyncFd<File>>,
}

#[async_trait]
impl AgentOutbound for UnixOutbound {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.io.get_ref();
        file.write(buf)
    }

    async fn write_ready(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.io.writable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn raw_signal(signal: Signal) -> libc::c_int {
    match signal {
        Signal::Hup => libc::SIGHUP,
        Signal::Int => libc::SIGINT,
        Signal::Quit => libc::SIGQUIT,
        Signal::Kill => libc::SIGKILL,
        Signal::Term => libc::SIGTERM,
        Signal::Usr1 => libc::SIGUSR1,
        Signal::Usr2 => libc::SIGUSR2,
        Signal::Winch => libc::SIGWINCH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_signals() {
        assert_eq!(raw_signal(Signal::default()), libc::SIGHUP);
        assert_eq!(raw_signal(Signal::Kill), libc::SIGKILL);
    }

    #[tokio::test]
    async fn test_command_line_rejected() {
        let result = UnixAgent::spawn(
            "sh",
            &Args::CommandLine("sh -c true".to_string()),
            &TerminalOptions::default(),
        );
        assert!(matches!(result, Err(PtyError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_spawn_and_reap() {
        let mut agent = UnixAgent::spawn(
            "/bin/sh",
            &Args::from(&["-c", "exit 3"][..]),
            &TerminalOptions::default(),
        )
        .expect("Failed to spawn");
        assert!(agent.pid().is_some());
        assert!(agent.pty_name().is_some());

        let status = agent.reap().await.unwrap();
        assert_eq!(status, ExitStatus::new(3, None));
        assert_eq!(agent.exit_status(), Some(status));
        // Killing a reaped child is a no-op.
        agent.kill(None).unwrap();
        agent.release();
        assert!(matches!(agent.resize(Size::new(10, 10)), Err(PtyError::Destroyed)));
    }
}
