use bytes::Bytes;
use ptyhost_common::types::ExitStatus;
use tracing::{debug, instrument};

use super::listeners::{Listeners, Retention};
use super::types::ErrorNotice;

/// Typed listeners for every notification a terminal emits
pub struct EventHub {
    pub data: Listeners<Bytes>,
    pub drain: Listeners<()>,
    pub pause: Listeners<()>,
    pub resume: Listeners<()>,
    pub exit: Listeners<ExitStatus>,
    pub error: Listeners<ErrorNotice>,
}

impl EventHub {
    /// Create a new hub
    pub fn new() -> Self {
        Self {
            data: Listeners::new(Retention::UntilFirstSubscriber),
            drain: Listeners::new(Retention::None),
            pause: Listeners::new(Retention::None),
            resume: Listeners::new(Retention::None),
            exit: Listeners::new(Retention::Sticky),
            error: Listeners::new(Retention::None),
        }
    }

    /// Deliver an error. Returns how many listeners received it.
    #[instrument(skip(self))]
    pub fn emit_error(&mut self, notice: ErrorNotice) -> usize {
        let delivered = self.error.emit(notice);
        debug!(delivered, "Error delivered to listeners");
        delivered
    }

    /// End every stream. The exit status is still replayed to late subscribers.
    pub fn close_all(&mut self) {
        self.data.close();
        self.drain.close();
        self.pause.close();
        self.resume.close();
        self.exit.close();
        self.error.close();
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
