use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// What happens to notifications emitted before anyone subscribes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Dropped.
    None,
    /// Buffered and handed to the first subscriber.
    UntilFirstSubscriber,
    /// The latest value is replayed to every new subscriber.
    Sticky,
}

/// Ordered listeners for one event kind
#[derive(Debug)]
pub struct Listeners<T> {
    senders: Vec<mpsc::UnboundedSender<T>>,
    retention: Retention,
    backlog: Vec<T>,
    subscribed: bool,
    closed: bool,
}

impl<T: Clone> Listeners<T> {
    pub fn new(retention: Retention) -> Self {
        Self {
            senders: Vec::new(),
            retention,
            backlog: Vec::new(),
            subscribed: false,
            closed: false,
        }
    }

    pub fn subscribe(&mut self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.retention {
            Retention::UntilFirstSubscriber if !self.subscribed => {
                for item in self.backlog.drain(..) {
                    let _ = tx.send(item);
                }
            }
            Retention::Sticky => {
                for item in &self.backlog {
                    let _ = tx.send(item.clone());
                }
            }
            _ => {}
        }
        self.subscribed = true;
        // After close, a late subscriber sees the replay and then the end.
        if !self.closed {
            self.senders.push(tx);
        }
        Subscription { rx }
    }

    /// Deliver to every live listener in subscription order.
    /// Returns how many listeners received it.
    pub fn emit(&mut self, item: T) -> usize {
        if self.closed {
            return 0;
        }
        self.senders.retain(|tx| !tx.is_closed());
        match self.retention {
            Retention::UntilFirstSubscriber if !self.subscribed => self.backlog.push(item.clone()),
            Retention::Sticky => {
                self.backlog.clear();
                self.backlog.push(item.clone());
            }
            _ => {}
        }
        let mut delivered = 0;
        for tx in &self.senders {
            if tx.send(item.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of listeners still attached.
    pub fn count(&mut self) -> usize {
        self.senders.retain(|tx| !tx.is_closed());
        self.senders.len()
    }

    /// Detach every listener; their streams end.
    pub fn close(&mut self) {
        self.closed = true;
        self.senders.clear();
    }
}

/// Receiving end of one listener
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Wait for the next notification. `None` once the terminal is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take a notification that has already arrived.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
