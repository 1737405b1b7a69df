//! Multi-part payload reassembly
//!
//! Payloads too large for a single control-link message arrive as ordered
//! fragments. One session exists at a time.

use std::time::{Duration, Instant};

/// Inactivity after which a session is discarded
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of feeding one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyStatus {
    InProgress { received: u32, expected: u32 },
    /// Whole payload; the session has already been reset
    Complete(Vec<u8>),
    /// The previous session went stale and was discarded
    TimedOut,
    Rejected(String),
}

#[derive(Debug)]
struct ChunkSession {
    expected: u32,
    received: u32,
    buffer: Vec<u8>,
    last_activity: Instant,
}

/// Single-session fragment reassembler
#[derive(Debug)]
pub struct ChunkReassembler {
    session: Option<ChunkSession>,
    timeout: Duration,
}

impl Default for ChunkReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}

impl ChunkReassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            session: None,
            timeout,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Fragments received in the current session
    pub fn received(&self) -> u32 {
        self.session.as_ref().map(|s| s.received).unwrap_or(0)
    }

    /// Feed one fragment.
    ///
    /// A session idle for longer than the timeout is discarded first and the
    /// call reports `TimedOut` whatever the fragment was. The fragment is not
    /// kept, even a start fragment, so the sender resends it to open a fresh
    /// session.
    pub fn begin_or_continue(
        &mut self,
        index: u32,
        total_expected: u32,
        fragment: &[u8],
        is_first: bool,
        is_last: bool,
    ) -> ReassemblyStatus {
        self.accept_at(index, total_expected, fragment, is_first, is_last, Instant::now())
    }

    fn accept_at(
        &mut self,
        index: u32,
        total_expected: u32,
        fragment: &[u8],
        is_first: bool,
        is_last: bool,
        now: Instant,
    ) -> ReassemblyStatus {
        if let Some(session) = &self.session {
            if now.saturating_duration_since(session.last_activity) > self.timeout {
                log::warn!(
                    "Chunk session timed out after {}/{} fragments",
                    session.received,
                    session.expected
                );
                self.session = None;
                return ReassemblyStatus::TimedOut;
            }
        }

        let starts_session = is_first || (index == 0 && total_expected > 0);
        if starts_session {
            if self.session.is_some() {
                log::debug!("Chunk session restarted");
            }
            self.session = Some(ChunkSession {
                expected: total_expected,
                received: 0,
                buffer: Vec::new(),
                last_activity: now,
            });
        }

        let session = match self.session.as_mut() {
            Some(session) => session,
            None => {
                return ReassemblyStatus::Rejected(format!(
                    "Fragment {} without an active session",
                    index
                ))
            }
        };

        if index != session.received {
            let expected_index = session.received;
            self.session = None;
            return ReassemblyStatus::Rejected(format!(
                "Out-of-order fragment {} (expected {})",
                index, expected_index
            ));
        }

        if total_expected > 0 && session.expected == 0 {
            session.expected = total_expected;
        }

        session.buffer.extend_from_slice(fragment);
        session.received += 1;
        session.last_activity = now;

        let done = is_last || (session.expected > 0 && session.received >= session.expected);
        if done {
            let finished = self.session.take().map(|s| s.buffer).unwrap_or_default();
            log::debug!("Chunk session complete: {} bytes", finished.len());
            return ReassemblyStatus::Complete(finished);
        }

        ReassemblyStatus::InProgress {
            received: session.received,
            expected: session.expected,
        }
    }

    /// Discard any partial payload
    pub fn abandon(&mut self) {
        if self.session.take().is_some() {
            log::debug!("Chunk session abandoned");
        }
    }
}
