use parking_lot::Mutex;
use proptest::prelude::*;
use ptyhost_core::agent::mock::{MockAgent, MockController, KILLED_STATUS, SIGKILL_STATUS};
use ptyhost_core::{
    Capabilities, Encoding, ExitStatus, LifecycleState, PtyError, Signal, Size, Terminal,
    TerminalOptions,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_test::{assert_pending, assert_ready};

const TIMEOUT: Duration = Duration::from_secs(2);

fn terminal_with(
    capabilities: Capabilities,
    options: TerminalOptions,
) -> (Terminal, MockController) {
    let (agent, controller) = MockAgent::new_ready();
    let terminal = Terminal::with_agent(Box::new(agent), capabilities, options)
        .expect("Failed to create terminal");
    (terminal, controller)
}

async fn ready_terminal() -> (Terminal, MockController) {
    let (terminal, controller) = terminal_with(Capabilities::UNIX, TerminalOptions::default());
    eventually(|| terminal.state() == LifecycleState::Ready).await;
    (terminal, controller)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Condition not reached in time");
}

#[tokio::test]
async fn test_deferred_commands_replay_on_ready() {
    let (agent, controller) = MockAgent::new();
    let terminal =
        Terminal::with_agent(Box::new(agent), Capabilities::UNIX, TerminalOptions::default())
            .unwrap();
    assert_eq!(terminal.state(), LifecycleState::NotReady);

    let first = terminal.write("echo ").unwrap();
    terminal.resize(100, 30).unwrap();
    let second = terminal.write("hi\n").unwrap();

    tokio::task::yield_now().await;
    assert!(controller.written().is_empty());
    assert!(controller.resizes().is_empty());
    assert_eq!(terminal.size(), Size::new(80, 24));

    controller.ready();
    assert!(first.await);
    assert!(second.await);
    assert_eq!(terminal.state(), LifecycleState::Ready);
    assert_eq!(controller.written(), b"echo hi\n");
    assert_eq!(controller.resizes(), vec![Size::new(100, 30)]);
    assert_eq!(terminal.size(), Size::new(100, 30));
}

#[tokio::test]
async fn test_first_data_counts_as_ready() {
    let (agent, controller) = MockAgent::new();
    let terminal =
        Terminal::with_agent(Box::new(agent), Capabilities::WINDOWS, TerminalOptions::default())
            .unwrap();
    let pending = terminal.write("dir\r\n").unwrap();

    controller.send("Microsoft Windows");
    assert!(pending.await);
    assert_eq!(terminal.state(), LifecycleState::Ready);

    // Emitted before anyone subscribed, so kept for the first data listener.
    let mut data = terminal.on_data();
    assert_eq!(data.recv().await.unwrap(), "Microsoft Windows");
}

#[tokio::test]
async fn test_resize_rejects_zero_dimensions() {
    let (terminal, controller) = ready_terminal().await;

    let err = terminal.resize(0, 24).unwrap_err();
    assert!(matches!(err, PtyError::InvalidArgument(_)));
    assert!(terminal.resize(80, 0).is_err());
    assert_eq!(terminal.size(), Size::new(80, 24));

    terminal.resize(120, 40).unwrap();
    eventually(|| terminal.size() == Size::new(120, 40)).await;
    assert_eq!(controller.resizes(), vec![Size::new(120, 40)]);
}

#[tokio::test]
async fn test_double_destroy_emits_one_exit() {
    let (terminal, controller) = ready_terminal().await;
    let mut exits = terminal.on_exit();

    terminal.destroy();
    terminal.destroy();

    assert_eq!(terminal.wait().await.unwrap(), KILLED_STATUS);
    assert_eq!(exits.recv().await, Some(KILLED_STATUS));
    assert_eq!(exits.recv().await, None);
    assert_eq!(controller.kills(), vec![None]);
    assert!(controller.is_released());
    assert_eq!(terminal.state(), LifecycleState::Destroyed);
    assert_eq!(terminal.exit_status(), Some(KILLED_STATUS));

    terminal.destroy();
    assert_eq!(controller.kills(), vec![None]);
}

#[tokio::test]
async fn test_exit_is_replayed_to_late_subscribers() {
    let (terminal, controller) = ready_terminal().await;
    controller.close(ExitStatus::new(7, None));
    terminal.wait().await.unwrap();

    let mut exits = terminal.on_exit();
    assert_eq!(exits.recv().await, Some(ExitStatus::new(7, None)));
    assert_eq!(exits.recv().await, None);
}

#[tokio::test]
async fn test_destroy_before_ready_is_deferred() {
    let (agent, controller) = MockAgent::new();
    let terminal =
        Terminal::with_agent(Box::new(agent), Capabilities::UNIX, TerminalOptions::default())
            .unwrap();

    let receipt = terminal.write("a").unwrap();
    terminal.destroy();
    tokio::task::yield_now().await;
    assert!(controller.kills().is_empty());

    controller.ready();
    assert!(receipt.await);
    assert_eq!(terminal.wait().await.unwrap(), KILLED_STATUS);
    assert_eq!(controller.written(), b"a");
    assert_eq!(controller.kills(), vec![None]);
}

#[tokio::test]
async fn test_writes_after_teardown_are_dropped() {
    let (agent, controller) = MockAgent::new();
    let terminal =
        Terminal::with_agent(Box::new(agent), Capabilities::UNIX, TerminalOptions::default())
            .unwrap();

    terminal.destroy();
    let late = terminal.write("late").unwrap();
    controller.ready();

    assert!(!late.await);
    terminal.wait().await.unwrap();
    assert!(controller.written().is_empty());
}

#[tokio::test]
async fn test_dropping_handle_tears_down() {
    let (terminal, controller) = ready_terminal().await;
    let socket = terminal.socket();
    drop(terminal);

    timeout(TIMEOUT, socket.destroyed()).await.unwrap();
    assert_eq!(controller.kills(), vec![None]);
    assert!(controller.is_released());
}

#[tokio::test]
async fn test_drain_follows_queued_write() {
    let (terminal, controller) = ready_terminal().await;
    let mut drains = terminal.on_drain();

    assert!(terminal.write("abc").unwrap().await);
    tokio::task::yield_now().await;
    assert_eq!(drains.try_recv(), None);

    controller.set_capacity(Some(2));
    assert!(!terminal.write("hello").unwrap().await);
    assert_eq!(drains.try_recv(), None);
    assert_eq!(controller.written(), b"abche");

    controller.free(16);
    assert_eq!(timeout(TIMEOUT, drains.recv()).await.unwrap(), Some(()));
    assert_eq!(controller.written(), b"abchello");

    // Writes behind a backlog keep their order.
    controller.set_capacity(Some(0));
    assert!(!terminal.write("1").unwrap().await);
    assert!(!terminal.write("2").unwrap().await);
    controller.set_capacity(None);
    assert_eq!(timeout(TIMEOUT, drains.recv()).await.unwrap(), Some(()));
    assert_eq!(controller.written(), b"abchello12");
    assert_eq!(drains.try_recv(), None);
}

#[tokio::test]
async fn test_flow_control_markers() {
    let options = TerminalOptions::new().flow_control("PAUSE", "RESUME");
    let (terminal, controller) = terminal_with(Capabilities::UNIX, options);
    controller.set_echo(true);

    let mut data = terminal.on_data();
    let mut pauses = terminal.on_pause();
    let mut resumes = terminal.on_resume();

    terminal.write("before").unwrap().await;
    assert_eq!(timeout(TIMEOUT, data.recv()).await.unwrap().unwrap(), "before");

    terminal.write("PAUSE").unwrap().await;
    assert_eq!(timeout(TIMEOUT, pauses.recv()).await.unwrap(), Some(()));

    terminal.write("withheld").unwrap().await;
    terminal.write("PAUSE").unwrap().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(data.try_recv(), None);
    assert_eq!(pauses.try_recv(), None);

    terminal.write("RESUME").unwrap().await;
    assert_eq!(timeout(TIMEOUT, resumes.recv()).await.unwrap(), Some(()));
    assert_eq!(timeout(TIMEOUT, data.recv()).await.unwrap().unwrap(), "withheld");
    assert_eq!(controller.written(), b"beforePAUSEwithheldPAUSERESUME");
}

#[tokio::test]
async fn test_manual_pause_stops_reading() {
    let (terminal, controller) = ready_terminal().await;
    let mut data = terminal.on_data();
    let mut pauses = terminal.on_pause();
    let mut resumes = terminal.on_resume();

    terminal.pause();
    assert_eq!(timeout(TIMEOUT, pauses.recv()).await.unwrap(), Some(()));
    controller.send("queued in the channel");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(data.try_recv(), None);

    terminal.resume();
    assert_eq!(timeout(TIMEOUT, resumes.recv()).await.unwrap(), Some(()));
    assert_eq!(
        timeout(TIMEOUT, data.recv()).await.unwrap().unwrap(),
        "queued in the channel"
    );
}

#[tokio::test]
async fn test_utf8_chunks_end_on_characters() {
    let options = TerminalOptions::new().encoding(Encoding::Utf8);
    let (terminal, controller) = terminal_with(Capabilities::UNIX, options);
    let mut data = terminal.on_data();
    let euro = "€".as_bytes();

    controller.send(euro[..1].to_vec());
    controller.send(euro[1..].to_vec());
    assert_eq!(timeout(TIMEOUT, data.recv()).await.unwrap().unwrap(), "€");

    terminal.set_encoding(None).unwrap();
    assert_eq!(terminal.encoding(), None);
    controller.send(euro[..1].to_vec());
    assert_eq!(timeout(TIMEOUT, data.recv()).await.unwrap().unwrap(), euro[..1]);
}

#[tokio::test]
async fn test_unacknowledged_error_escalates() {
    let (terminal, controller) = ready_terminal().await;
    let mut exits = terminal.on_exit();

    controller.fail(io::Error::new(io::ErrorKind::Other, "boom"));

    let err = terminal.wait().await.unwrap_err();
    assert!(matches!(err, PtyError::Unhandled(ref inner) if matches!(**inner, PtyError::Channel(_))));
    // The terminal still exits exactly once.
    assert!(exits.recv().await.is_some());
    assert_eq!(exits.recv().await, None);
}

#[tokio::test]
async fn test_acknowledged_error_is_handled() {
    let (terminal, controller) = ready_terminal().await;
    let mut errors = terminal.on_error();

    controller.fail(io::Error::new(io::ErrorKind::Other, "boom"));

    let notice = timeout(TIMEOUT, errors.recv()).await.unwrap().unwrap();
    assert!(matches!(notice.error(), PtyError::Channel(_)));
    notice.acknowledge();
    assert!(terminal.wait().await.is_ok());
    assert_eq!(terminal.state(), LifecycleState::Destroyed);
}

/// Log output of the current thread's subscriber.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_received_but_unacknowledged_error_is_logged() {
    let logs = CapturedLogs::default();
    let _guard = logs.install();
    let (terminal, controller) = ready_terminal().await;
    let mut errors = terminal.on_error();

    controller.fail(io::Error::new(io::ErrorKind::Other, "boom"));
    let notice = timeout(TIMEOUT, errors.recv()).await.unwrap().unwrap();
    drop(notice);

    let err = terminal.wait().await.unwrap_err();
    assert!(matches!(err, PtyError::Unhandled(ref inner) if matches!(**inner, PtyError::Channel(_))));
    let logs = logs.contents();
    assert!(
        logs.lines().any(|line| line.contains("ERROR") && line.contains("never acknowledged") && line.contains("boom")),
        "Missing error log: {}",
        logs
    );
}

#[tokio::test(start_paused = true)]
async fn test_ignored_hangup_escalates_to_kill() {
    let (terminal, controller) = ready_terminal().await;
    controller.ignore_hangup();
    let socket = terminal.socket();
    let mut exits = terminal.on_exit();

    terminal.destroy();
    timeout(Duration::from_secs(10), socket.destroyed()).await.unwrap();

    assert_eq!(controller.kills(), vec![None, Some(Signal::Kill)]);
    assert!(controller.is_released());
    assert_eq!(exits.recv().await, Some(SIGKILL_STATUS));
    assert_eq!(terminal.wait().await.unwrap(), SIGKILL_STATUS);
}

#[tokio::test(start_paused = true)]
async fn test_child_outliving_channel_is_killed() {
    let (terminal, controller) = ready_terminal().await;
    controller.disconnect();

    let status = timeout(Duration::from_secs(10), terminal.wait()).await.unwrap().unwrap();
    assert_eq!(status, SIGKILL_STATUS);
    assert_eq!(controller.kills(), vec![Some(Signal::Kill)]);
    assert_eq!(terminal.state(), LifecycleState::Destroyed);
}

#[tokio::test]
async fn test_benign_disconnect_is_swallowed() {
    let (terminal, controller) = ready_terminal().await;
    let mut errors = terminal.on_error();

    controller.fail(io::ErrorKind::BrokenPipe.into());

    assert_eq!(terminal.wait().await.unwrap(), ExitStatus::default());
    assert_eq!(errors.recv().await.map(|n| n.to_string()), None);
    assert!(controller.kills().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_eio_is_swallowed() {
    let (terminal, controller) = ready_terminal().await;
    // EIO, as read(2) on a pty master reports once the slave is gone.
    controller.fail(io::Error::from_raw_os_error(5));
    assert!(terminal.wait().await.is_ok());
}

#[tokio::test]
async fn test_signal_forwarded_without_teardown() {
    let (terminal, controller) = ready_terminal().await;
    terminal.kill(Some(Signal::Int)).unwrap();
    eventually(|| controller.kills() == vec![Some(Signal::Int)]).await;
    assert_eq!(terminal.state(), LifecycleState::Ready);

    terminal.kill(None).unwrap();
    assert_eq!(terminal.wait().await.unwrap(), KILLED_STATUS);
}

#[tokio::test]
async fn test_windows_capabilities() {
    let (terminal, controller) = terminal_with(Capabilities::WINDOWS, TerminalOptions::default());

    assert!(matches!(terminal.kill(Some(Signal::Int)), Err(PtyError::Unsupported(_))));
    assert!(matches!(terminal.master(), Err(PtyError::Unsupported(_))));
    assert!(matches!(terminal.slave(), Err(PtyError::Unsupported(_))));
    assert!(matches!(
        terminal.set_encoding(Some(Encoding::Utf8)),
        Err(PtyError::Unsupported(_))
    ));

    // The default signal just tears the agent down.
    terminal.kill(Some(Signal::Hup)).unwrap();
    assert_eq!(terminal.wait().await.unwrap(), KILLED_STATUS);
    assert_eq!(controller.kills(), vec![None]);
}

#[tokio::test]
async fn test_socket_reports_destroyed() {
    let (terminal, _controller) = ready_terminal().await;
    let socket = terminal.socket();
    assert_eq!(socket.handle(), Some(3));
    assert!(!socket.is_destroyed());

    terminal.destroy();
    timeout(TIMEOUT, socket.destroyed()).await.unwrap();
    assert!(socket.is_destroyed());
}

#[tokio::test]
async fn test_wait_pends_until_destroyed() {
    let (terminal, _controller) = ready_terminal().await;
    let socket = terminal.socket();

    let mut wait = tokio_test::task::spawn(terminal.wait());
    assert_pending!(wait.poll());

    terminal.destroy();
    timeout(TIMEOUT, socket.destroyed()).await.unwrap();
    // The outcome is published right after the socket closes.
    eventually(|| terminal.state() == LifecycleState::Destroyed).await;
    tokio::task::yield_now().await;

    assert!(wait.is_woken());
    let status = assert_ready!(wait.poll()).unwrap();
    assert_eq!(status, KILLED_STATUS);
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn deferred_writes_keep_call_order(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..16), 1..12)
    ) {
        block_on(async {
            let (agent, controller) = MockAgent::new();
            let terminal = Terminal::with_agent(
                Box::new(agent),
                Capabilities::UNIX,
                TerminalOptions::default(),
            )
            .unwrap();

            let receipts: Vec<_> = chunks
                .iter()
                .map(|chunk| terminal.write(chunk.clone()).unwrap())
                .collect();
            tokio::task::yield_now().await;
            assert!(controller.written().is_empty());

            controller.ready();
            for receipt in receipts {
                assert!(receipt.await);
            }
            assert_eq!(controller.written(), chunks.concat());
        });
    }

    #[test]
    fn zero_dimensions_never_reach_agent(cols in 0u16..4, rows in 0u16..4) {
        prop_assume!(cols == 0 || rows == 0);
        block_on(async {
            let (terminal, controller) = ready_terminal().await;
            assert!(matches!(terminal.resize(cols, rows), Err(PtyError::InvalidArgument(_))));
            tokio::task::yield_now().await;
            assert!(controller.resizes().is_empty());
            assert_eq!(terminal.size(), Size::default());
        });
    }
}
