//! Content-driven flow control for the read direction.
//!
//! The filter watches inbound chunks for two application-level markers. A
//! pause marker withholds everything after it until a resume marker shows up;
//! both markers are stripped from the delivered stream. A marker may straddle
//! two reads, so a trailing partial marker is carried into the next chunk.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// XOFF
pub const DEFAULT_PAUSE: &[u8] = b"\x13";
/// XON
pub const DEFAULT_RESUME: &[u8] = b"\x11";
/// Withheld bytes after which a marker pause stops reading the agent.
pub const DEFAULT_HELD_LIMIT: usize = 4 << 20;

/// Marker configuration.
///
/// While paused by a marker the agent keeps being read so the resume marker
/// can be seen, and everything read is withheld in memory. Once more than
/// `held_limit` bytes are withheld reading stops as with a manual pause; the
/// child then blocks on a full pty and only [`FlowControl::resume`] (that is,
/// `Terminal::resume`) lets output flow again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowControlConfig {
    pub enabled: bool,
    pub pause: Vec<u8>,
    pub resume: Vec<u8>,
    #[serde(default = "default_held_limit")]
    pub held_limit: usize,
}

fn default_held_limit() -> usize {
    DEFAULT_HELD_LIMIT
}

impl FlowControlConfig {
    pub fn enabled(pause: impl Into<Vec<u8>>, resume: impl Into<Vec<u8>>) -> Self {
        Self {
            enabled: true,
            pause: pause.into(),
            resume: resume.into(),
            held_limit: DEFAULT_HELD_LIMIT,
        }
    }
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pause: DEFAULT_PAUSE.to_vec(),
            resume: DEFAULT_RESUME.to_vec(),
            held_limit: DEFAULT_HELD_LIMIT,
        }
    }
}

/// Why the read side is paused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseCause {
    /// `Terminal::pause()`; the agent is not read at all.
    Manual,
    /// A pause marker arrived; reading continues so the resume marker is seen.
    Marker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    Data(Bytes),
    Pause,
    Resume,
}

#[derive(Debug, Clone, Copy)]
enum Marker {
    Pause,
    Resume,
}

pub struct FlowControl {
    config: FlowControlConfig,
    paused: Option<PauseCause>,
    held: VecDeque<Bytes>,
    held_len: usize,
    /// Tail of the last chunk that may be the start of a marker.
    partial: Bytes,
}

impl FlowControl {
    pub fn new(config: FlowControlConfig) -> Self {
        Self {
            config,
            paused: None,
            held: VecDeque::new(),
            held_len: 0,
            partial: Bytes::new(),
        }
    }

    pub fn config(&self) -> &FlowControlConfig {
        &self.config
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    pub fn pause_cause(&self) -> Option<PauseCause> {
        self.paused
    }

    /// Whether the agent should stop being read.
    pub fn reading_suspended(&self) -> bool {
        match self.paused {
            Some(PauseCause::Manual) => true,
            Some(PauseCause::Marker) => self.held_len > self.config.held_limit,
            None => false,
        }
    }

    /// Number of withheld bytes.
    pub fn held_len(&self) -> usize {
        self.held_len
    }

    /// Run one inbound chunk through the filter, returning what to emit in order.
    pub fn filter(&mut self, chunk: Bytes) -> Vec<FlowEvent> {
        let mut out = Vec::new();
        if !self.config.enabled {
            self.deliver(chunk, &mut out);
            return out;
        }

        let mut rest = if self.partial.is_empty() {
            chunk
        } else {
            let mut joined = BytesMut::with_capacity(self.partial.len() + chunk.len());
            joined.extend_from_slice(&self.partial);
            joined.extend_from_slice(&chunk);
            self.partial = Bytes::new();
            joined.freeze()
        };
        while !rest.is_empty() {
            let Some((at, len, marker)) = self.next_marker(&rest) else {
                let split = rest.len() - self.partial_marker_len(&rest);
                self.partial = rest.split_off(split);
                self.deliver(rest, &mut out);
                break;
            };
            self.deliver(rest.slice(..at), &mut out);
            rest = rest.slice(at + len..);
            match marker {
                Marker::Pause => self.enter_pause(PauseCause::Marker, &mut out),
                Marker::Resume => self.leave_pause(&mut out),
            }
        }
        out
    }

    /// Manual pause. Upgrades a marker pause so reading stops too.
    pub fn pause(&mut self) -> Vec<FlowEvent> {
        let mut out = Vec::new();
        self.enter_pause(PauseCause::Manual, &mut out);
        out
    }

    /// Manual resume. Releases withheld data after the resume notification.
    pub fn resume(&mut self) -> Vec<FlowEvent> {
        let mut out = Vec::new();
        self.leave_pause(&mut out);
        out
    }

    /// Bytes still carried as a possible marker prefix, once no more input
    /// will come. Nothing is returned while paused.
    pub fn finish(&mut self) -> Option<Bytes> {
        let partial = std::mem::take(&mut self.partial);
        (self.paused.is_none() && !partial.is_empty()).then_some(partial)
    }

    fn enter_pause(&mut self, cause: PauseCause, out: &mut Vec<FlowEvent>) {
        match self.paused {
            None => {
                debug!(?cause, "Read side paused");
                self.paused = Some(cause);
                out.push(FlowEvent::Pause);
            }
            Some(PauseCause::Marker) if cause == PauseCause::Manual => {
                self.paused = Some(cause);
            }
            Some(_) => {}
        }
    }

    fn leave_pause(&mut self, out: &mut Vec<FlowEvent>) {
        if self.paused.take().is_none() {
            return;
        }
        debug!(held = self.held_len, "Read side resumed");
        out.push(FlowEvent::Resume);
        out.extend(self.held.drain(..).map(FlowEvent::Data));
        self.held_len = 0;
    }

    fn deliver(&mut self, bytes: Bytes, out: &mut Vec<FlowEvent>) {
        if bytes.is_empty() {
            return;
        }
        if self.paused.is_none() {
            out.push(FlowEvent::Data(bytes));
            return;
        }
        let limit = self.config.held_limit;
        let was_over = self.held_len > limit;
        self.held_len += bytes.len();
        self.held.push_back(bytes);
        if !was_over && self.held_len > limit && self.paused == Some(PauseCause::Marker) {
            warn!(held = self.held_len, limit, "Withheld output over limit, no longer reading");
        }
    }

    /// Earliest marker in `haystack`; the longer one wins a tie.
    fn next_marker(&self, haystack: &[u8]) -> Option<(usize, usize, Marker)> {
        let pause = find(haystack, &self.config.pause).map(|at| (at, self.config.pause.len(), Marker::Pause));
        let resume =
            find(haystack, &self.config.resume).map(|at| (at, self.config.resume.len(), Marker::Resume));
        match (pause, resume) {
            (Some(p), Some(r)) => {
                if p.0 < r.0 || (p.0 == r.0 && p.1 >= r.1) {
                    Some(p)
                } else {
                    Some(r)
                }
            }
            (p, r) => p.or(r),
        }
    }

    /// Length of the longest suffix of `haystack` that starts either marker.
    fn partial_marker_len(&self, haystack: &[u8]) -> usize {
        partial_prefix(haystack, &self.config.pause).max(partial_prefix(haystack, &self.config.resume))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn partial_prefix(haystack: &[u8], needle: &[u8]) -> usize {
    let longest = needle.len().saturating_sub(1).min(haystack.len());
    (1..=longest)
        .rev()
        .find(|&k| haystack.ends_with(&needle[..k]))
        .unwrap_or(0)
}
