use std::fmt;
use tokio::sync::watch;
use tracing::info;

/// Lifecycle of a terminal. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Created,
    /// Waiting for the agent's first readiness or data signal.
    NotReady,
    Ready,
    /// Teardown requested or the channel closed; exit not yet emitted.
    Closing,
    Destroyed,
}

impl LifecycleState {
    /// Whether new commands are still accepted.
    pub fn accepts_commands(&self) -> bool {
        matches!(self, LifecycleState::NotReady | LifecycleState::Ready)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::NotReady => "not-ready",
            LifecycleState::Ready => "ready",
            LifecycleState::Closing => "closing",
            LifecycleState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Shared, observable lifecycle state
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Created);
        Self { tx }
    }

    pub fn current(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// Move to `next` if it lies ahead of the current state.
    /// Returns `false` (and changes nothing) otherwise.
    pub fn advance(&self, next: LifecycleState) -> bool {
        let moved = self.tx.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            info!(state = %next, "Terminal lifecycle transition");
        }
        moved
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Wait until the state reaches at least `target`.
    pub async fn reached(&self, target: LifecycleState) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|state| *state >= target).await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moves_forward_only() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.current(), LifecycleState::Created);
        assert!(lifecycle.advance(LifecycleState::NotReady));
        assert!(lifecycle.advance(LifecycleState::Ready));
        assert!(!lifecycle.advance(LifecycleState::NotReady));
        assert!(!lifecycle.advance(LifecycleState::Ready));
        assert_eq!(lifecycle.current(), LifecycleState::Ready);
    }

    #[test]
    fn test_can_skip_ahead() {
        let lifecycle = Lifecycle::new();
        lifecycle.advance(LifecycleState::NotReady);
        assert!(lifecycle.advance(LifecycleState::Closing));
        assert!(lifecycle.advance(LifecycleState::Destroyed));
        assert!(!lifecycle.advance(LifecycleState::Destroyed));
    }

    #[test]
    fn test_accepts_commands() {
        assert!(!LifecycleState::Created.accepts_commands());
        assert!(LifecycleState::NotReady.accepts_commands());
        assert!(LifecycleState::Ready.accepts_commands());
        assert!(!LifecycleState::Closing.accepts_commands());
        assert!(!LifecycleState::Destroyed.accepts_commands());
    }

    #[tokio::test]
    async fn test_reached_wakes_on_transition() {
        let lifecycle = std::sync::Arc::new(Lifecycle::new());
        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.reached(LifecycleState::Closing).await })
        };
        lifecycle.advance(LifecycleState::NotReady);
        lifecycle.advance(LifecycleState::Destroyed);
        waiter.await.unwrap();
    }
}
