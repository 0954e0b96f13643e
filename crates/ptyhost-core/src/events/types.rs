use ptyhost_common::error::PtyError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An asynchronous terminal error delivered to `error` listeners.
///
/// Listeners that handle the error call [`ErrorNotice::acknowledge`]. An
/// error nobody acknowledges escalates: it is logged and `Terminal::wait`
/// returns it instead of the exit status.
#[derive(Debug, Clone)]
pub struct ErrorNotice {
    error: Arc<PtyError>,
    acknowledged: Arc<AtomicBool>,
}

impl ErrorNotice {
    pub fn new(error: PtyError) -> Self {
        Self {
            error: Arc::new(error),
            acknowledged: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn error(&self) -> &PtyError {
        &self.error
    }

    pub fn shared(&self) -> Arc<PtyError> {
        Arc::clone(&self.error)
    }

    /// Mark the error as handled. Any clone of the notice may do this.
    pub fn acknowledge(&self) {
        self.acknowledged.store(true, Ordering::SeqCst);
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }
}

impl std::fmt::Display for ErrorNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}
