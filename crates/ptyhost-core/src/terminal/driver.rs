use bytes::Bytes;
use parking_lot::Mutex;
use ptyhost_common::error::{is_benign_disconnect, PtyError};
use ptyhost_common::traits::{AgentEndpoints, AgentInbound, AgentOutbound, AgentSignal, PtyAgent};
use ptyhost_common::types::{ExitStatus, Signal};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{LifecycleState, Outcome, Request, Shared};
use crate::events::{ErrorNotice, EventHub};
use crate::flow::{FlowControl, FlowEvent};
use crate::options::TerminalOptions;
use crate::outbound::OutboundBuffer;
use crate::pty::Capabilities;
use crate::queue::{DeferredQueue, PendingCommand};
use crate::text::TextBoundary;

/// How long a child may outlive its closed pty before it is killed outright.
pub(crate) const REAP_GRACE: Duration = Duration::from_secs(2);

/// Task owning the agent of one terminal.
///
/// Everything that touches the agent or its endpoints runs here, so command
/// order, the deferred queue and teardown need no further locking.
pub(crate) struct Driver {
    agent: Box<dyn PtyAgent>,
    inbound: Option<Box<dyn AgentInbound>>,
    outbound: Option<Box<dyn AgentOutbound>>,
    requests: mpsc::UnboundedReceiver<Request>,
    hub: Arc<Mutex<EventHub>>,
    shared: Arc<Shared>,
    capabilities: Capabilities,
    queue: DeferredQueue<PendingCommand>,
    buffer: OutboundBuffer,
    flow: FlowControl,
    text: TextBoundary,
    /// Every reported error, with whether a listener received it.
    errors: Vec<(ErrorNotice, bool)>,
    requests_open: bool,
    channel_open: bool,
}

impl Driver {
    pub(crate) fn new(
        agent: Box<dyn PtyAgent>,
        endpoints: AgentEndpoints,
        requests: mpsc::UnboundedReceiver<Request>,
        hub: Arc<Mutex<EventHub>>,
        shared: Arc<Shared>,
        capabilities: Capabilities,
        options: &TerminalOptions,
    ) -> Self {
        Self {
            agent,
            inbound: Some(endpoints.inbound),
            outbound: Some(endpoints.outbound),
            requests,
            hub,
            shared,
            capabilities,
            queue: DeferredQueue::new(),
            buffer: OutboundBuffer::new(),
            flow: FlowControl::new(options.flow_control.clone()),
            text: TextBoundary::new(options.encoding),
            errors: Vec::new(),
            requests_open: true,
            channel_open: true,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Driver started");
        while self.channel_open {
            let pending = self.buffer.front();
            let reading = !self.flow.reading_suspended();

            tokio::select! {
                request = self.requests.recv(), if self.requests_open => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        debug!("Terminal handle dropped");
                        self.requests_open = false;
                        self.teardown();
                    }
                },
                signal = next_signal(&mut self.inbound), if reading => self.handle_signal(signal),
                written = write_front(&mut self.outbound, pending.clone()), if pending.is_some() => {
                    self.handle_written(written)
                }
                else => break,
            }
        }
        self.finish().await;
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Command(command) => {
                if !self.accepts_commands() {
                    debug!(kind = command.kind(), "Ignoring command on a closing terminal");
                    return;
                }
                if let Some(command) = self.queue.submit(command) {
                    self.execute(command);
                }
            }
            Request::Pause => {
                let events = self.flow.pause();
                self.emit_flow(events);
            }
            Request::Resume => {
                let events = self.flow.resume();
                self.emit_flow(events);
            }
            Request::SetEncoding(encoding) => {
                if let Some(rest) = self.text.set_encoding(encoding) {
                    self.hub.lock().data.emit(rest);
                }
            }
        }
    }

    fn execute(&mut self, command: PendingCommand) {
        // A replayed destroy may have closed the terminal already.
        if !self.accepts_commands() {
            debug!(kind = command.kind(), "Dropping command after teardown");
            return;
        }
        match command {
            PendingCommand::Write { data, receipt } => {
                let flushed = self.write(data);
                if let Some(receipt) = receipt {
                    let _ = receipt.send(flushed);
                }
            }
            PendingCommand::Resize(size) => match self.agent.resize(size) {
                Ok(()) => *self.shared.size.lock() = size,
                Err(e) => self.report(e),
            },
            PendingCommand::Kill(Some(signal)) if self.capabilities.signals => {
                if let Err(e) = self.agent.kill(Some(signal)) {
                    self.report(e);
                }
            }
            PendingCommand::Kill(_) | PendingCommand::Destroy => self.teardown(),
        }
    }

    fn write(&mut self, data: Bytes) -> bool {
        let Some(outbound) = self.outbound.as_mut() else {
            return false;
        };
        let result = self.buffer.write(outbound.as_mut(), data);
        match result {
            Ok(flushed) => flushed,
            Err(e) => {
                self.channel_failed(e);
                false
            }
        }
    }

    fn handle_written(&mut self, written: io::Result<usize>) {
        let n = match written {
            Ok(n) => n,
            Err(e) => return self.channel_failed(e),
        };
        self.buffer.advance(n);
        let Some(outbound) = self.outbound.as_mut() else {
            return;
        };
        let result = self.buffer.flush(outbound.as_mut());
        match result {
            Ok(true) => {
                debug!("Outbound buffer drained");
                self.hub.lock().drain.emit(());
            }
            Ok(false) => {}
            Err(e) => self.channel_failed(e),
        }
    }

    fn handle_signal(&mut self, signal: AgentSignal) {
        match signal {
            AgentSignal::Ready => self.become_ready(),
            AgentSignal::Data(data) => {
                self.become_ready();
                let events = self.flow.filter(data);
                self.emit_flow(events);
            }
            AgentSignal::Closed => {
                debug!("Agent channel closed");
                self.channel_open = false;
            }
            AgentSignal::Failed(e) => self.channel_failed(e),
        }
    }

    fn become_ready(&mut self) {
        if self.queue.is_ready() {
            return;
        }
        self.shared.lifecycle.advance(LifecycleState::Ready);
        let pending = self.queue.open();
        if !pending.is_empty() {
            debug!(count = pending.len(), "Replaying deferred commands");
        }
        for command in pending {
            self.execute(command);
        }
    }

    fn emit_flow(&mut self, events: Vec<FlowEvent>) {
        for event in events {
            match event {
                FlowEvent::Data(data) => {
                    if let Some(data) = self.text.push(data) {
                        self.hub.lock().data.emit(data);
                    }
                }
                FlowEvent::Pause => {
                    self.hub.lock().pause.emit(());
                }
                FlowEvent::Resume => {
                    self.hub.lock().resume.emit(());
                }
            }
        }
    }

    /// Begin closing. Only the first call has any effect.
    ///
    /// The child gets the default signal and our side of the pty is closed
    /// at once; output it prints afterwards is not delivered.
    fn teardown(&mut self) {
        if !self.shared.lifecycle.advance(LifecycleState::Closing) {
            return;
        }
        let dropped = self.queue.discard();
        let unsent = self.buffer.clear();
        if dropped > 0 || unsent > 0 {
            debug!(dropped, unsent, "Discarded pending work on teardown");
        }
        if let Err(e) = self.agent.kill(None) {
            self.report(e);
        }
        self.close_channel();
    }

    fn close_channel(&mut self) {
        self.inbound = None;
        self.outbound = None;
        self.agent.release();
        self.channel_open = false;
    }

    fn channel_failed(&mut self, err: io::Error) {
        if is_benign_disconnect(&err) {
            debug!("Agent channel disconnected: {}", err);
            self.channel_open = false;
            return;
        }
        warn!("Agent channel failed: {}", err);
        self.report(PtyError::Channel(err));
        self.teardown();
        self.close_channel();
    }

    fn report(&mut self, error: PtyError) {
        debug!(class = ?error.class(), "Reporting terminal error: {}", error);
        let notice = ErrorNotice::new(error);
        let delivered = self.hub.lock().emit_error(notice.clone());
        if delivered == 0 {
            error!("Unhandled terminal error: {}", notice);
        }
        self.errors.push((notice, delivered > 0));
    }

    fn accepts_commands(&self) -> bool {
        self.shared.lifecycle.current().accepts_commands()
    }

    /// Reap the child, emit `exit` once and release every handle.
    async fn finish(mut self) {
        self.shared.lifecycle.advance(LifecycleState::Closing);
        self.queue.discard();
        // Closing the pty hangs up the child if it is still around.
        self.close_channel();

        let status = self.reap().await;
        self.emit_exit(status);

        self.shared.destroyed.send_replace(true);
        self.shared.lifecycle.advance(LifecycleState::Destroyed);
        self.hub.lock().close_all();

        let errors: Vec<ErrorNotice> = std::mem::take(&mut self.errors)
            .into_iter()
            .map(|(notice, delivered)| {
                if delivered && !notice.is_acknowledged() {
                    error!("Terminal error was never acknowledged: {}", notice);
                }
                notice
            })
            .collect();
        self.shared.outcome.send_replace(Some(Outcome { status, errors }));
    }

    /// Wait for the child, killing it if it ignores the hangup.
    async fn reap(&mut self) -> ExitStatus {
        let result = match timeout(REAP_GRACE, self.agent.reap()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(grace = ?REAP_GRACE, "Child outlived its pty, killing it");
                let signal = self.capabilities.signals.then_some(Signal::Kill);
                if let Err(e) = self.agent.kill(signal) {
                    self.report(e);
                }
                self.agent.reap().await
            }
        };
        match result {
            Ok(status) => status,
            Err(e) => {
                self.report(e);
                self.agent.exit_status().unwrap_or_default()
            }
        }
    }

    fn emit_exit(&mut self, status: ExitStatus) {
        let partial = self.flow.finish();
        let mut rest: Vec<Bytes> = partial.and_then(|partial| self.text.push(partial)).into_iter().collect();
        rest.extend(self.text.finish());
        let mut hub = self.hub.lock();
        for rest in rest {
            hub.data.emit(rest);
        }
        self.shared.exit.set(status);
        info!(%status, "Terminal exited");
        hub.exit.emit(status);
    }
}

async fn next_signal(inbound: &mut Option<Box<dyn AgentInbound>>) -> AgentSignal {
    match inbound {
        Some(inbound) => inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_front(
    outbound: &mut Option<Box<dyn AgentOutbound>>,
    chunk: Option<Bytes>,
) -> io::Result<usize> {
    match (outbound, chunk) {
        (Some(outbound), Some(chunk)) => outbound.write_ready(&chunk).await,
        _ => std::future::pending().await,
    }
}
