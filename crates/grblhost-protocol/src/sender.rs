//! Character-counting program sender
//!
//! Streams a loaded program under the Grbl character-counting flow
//! control discipline: a line of byte length L (including its newline)
//! may only leave while `data_length + L <= buffer_size`. Each `ok` or
//! `error` acknowledges the oldest in-flight line and credits its
//! length back. The credit ledger is a queue of in-flight byte lengths,
//! so `data_length` always equals the sum of lengths for lines in
//! `[received, sent)`.
//!
//! Lines suppressed by the preprocessor (directives, assignments) enter
//! the ledger with length zero and are acknowledged locally; the device
//! never sees them and sends no `ok` for them.

use crate::workflow::HoldReason;
use grblhost_core::machine::ExecutionContext;
use grblhost_core::{ProtocolError, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;

/// Startup buffer size: Grbl's 128-byte receive buffer minus an 8-byte
/// safety margin. Never shrinks; may grow via [`Sender::tune_buffer_size`].
pub const DEFAULT_BUFFER_SIZE: usize = 128 - 8;

/// Reserve kept back when adopting a device-reported receive-buffer size.
const BUFFER_MARGIN: usize = 8;

/// The program sender
#[derive(Debug)]
pub struct Sender {
    name: Option<String>,
    lines: Vec<String>,
    context: ExecutionContext,
    sent: usize,
    received: usize,
    hold: bool,
    hold_reason: Option<HoldReason>,
    buffer_size: usize,
    data_length: usize,
    in_flight: VecDeque<usize>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

/// Serializable sender snapshot for the fan-out layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SenderStatus {
    /// Loaded program name.
    pub name: Option<String>,
    /// Total number of program lines.
    pub total: usize,
    /// Lines handed to the wire.
    pub sent: usize,
    /// Lines acknowledged.
    pub received: usize,
    /// Whether the sender is held.
    pub hold: bool,
    /// Why it is held.
    pub hold_reason: Option<HoldReason>,
    /// Current flow-control window in bytes.
    pub buffer_size: usize,
    /// Bytes currently in flight.
    pub data_length: usize,
}

impl Default for Sender {
    fn default() -> Self {
        Self {
            name: None,
            lines: Vec::new(),
            context: ExecutionContext::new(),
            sent: 0,
            received: 0,
            hold: false,
            hold_reason: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            data_length: 0,
            in_flight: VecDeque::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

impl Sender {
    /// Create an unloaded sender
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a program, replacing any previous one. Returns false when
    /// the text contains no lines.
    pub fn load(&mut self, name: impl Into<String>, text: &str, context: ExecutionContext) -> bool {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        if lines.is_empty() {
            return false;
        }

        self.name = Some(name.into());
        self.lines = lines;
        self.context = context;
        self.reset_run();
        true
    }

    /// Drop the loaded program
    pub fn unload(&mut self) {
        self.name = None;
        self.lines.clear();
        self.context = ExecutionContext::new();
        self.reset_run();
    }

    fn reset_run(&mut self) {
        self.sent = 0;
        self.received = 0;
        self.hold = false;
        self.hold_reason = None;
        self.data_length = 0;
        self.in_flight.clear();
        self.started_at = None;
        self.finished_at = None;
    }

    /// Whether a program is loaded
    pub fn is_loaded(&self) -> bool {
        !self.lines.is_empty()
    }

    /// Next unsent line, if any and regardless of hold
    pub fn peek(&self) -> Option<&str> {
        self.lines.get(self.sent).map(String::as_str)
    }

    /// The raw program line at an index
    pub fn line_at(&self, index: usize) -> Option<&str> {
        self.lines.get(index).map(String::as_str)
    }

    /// Mutable access to the program context
    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }

    /// Total program lines
    pub fn total(&self) -> usize {
        self.lines.len()
    }

    /// Lines handed to the wire
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Lines acknowledged
    pub fn received(&self) -> usize {
        self.received
    }

    /// Bytes currently in flight
    pub fn data_length(&self) -> usize {
        self.data_length
    }

    /// Current flow-control window
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Whether the sender is held
    pub fn is_held(&self) -> bool {
        self.hold
    }

    /// All lines sent and acknowledged
    pub fn is_finished(&self) -> bool {
        self.is_loaded() && self.received >= self.lines.len()
    }

    /// Whether a line of `len` bytes (newline included) fits the window
    pub fn can_send(&self, len: usize) -> bool {
        self.data_length + len <= self.buffer_size
    }

    /// Account for a line handed to the wire
    pub fn mark_sent(&mut self, len: usize, now: Instant) {
        debug_assert!(self.can_send(len));
        if self.sent == 0 {
            self.started_at = Some(now);
        }
        self.sent += 1;
        self.data_length += len;
        self.in_flight.push_back(len);
    }

    /// Account for a suppressed line: advances `sent` with a zero-byte
    /// ledger entry and acknowledges it locally when it reaches the
    /// front (the device never sees it).
    pub fn mark_suppressed(&mut self, now: Instant) {
        if self.sent == 0 {
            self.started_at = Some(now);
        }
        self.sent += 1;
        self.in_flight.push_back(0);
        self.drain_suppressed(now);
    }

    /// Acknowledge the oldest in-flight line, crediting its length
    /// back. Fails when nothing is in flight.
    pub fn ack(&mut self, now: Instant) -> Result<()> {
        let Some(len) = self.in_flight.pop_front() else {
            return Err(ProtocolError::UnexpectedAck.into());
        };
        self.data_length -= len;
        self.received += 1;
        self.drain_suppressed(now);
        Ok(())
    }

    // Zero-length ledger entries never receive a device ok; collapse
    // them as soon as they reach the front.
    fn drain_suppressed(&mut self, now: Instant) {
        while self.in_flight.front() == Some(&0) {
            self.in_flight.pop_front();
            self.received += 1;
        }
        if self.is_finished() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
    }

    /// Set the held flag
    pub fn hold(&mut self, reason: HoldReason) {
        self.hold = true;
        self.hold_reason = Some(reason);
    }

    /// Clear the held flag
    pub fn unhold(&mut self) {
        self.hold = false;
        self.hold_reason = None;
    }

    /// Reset the run to the beginning, clearing the hold
    pub fn rewind(&mut self) {
        self.reset_run();
    }

    /// Adopt a device-reported receive-buffer size, keeping the margin.
    /// The window never shrinks, and only grows while nothing is in
    /// flight.
    pub fn tune_buffer_size(&mut self, rx_free: u32) {
        if self.data_length != 0 || rx_free == 0 {
            return;
        }
        let candidate = (rx_free as usize).saturating_sub(BUFFER_MARGIN);
        if candidate > self.buffer_size {
            tracing::debug!(
                "adjusting sender window {} -> {}",
                self.buffer_size,
                candidate
            );
            self.buffer_size = candidate;
        }
    }

    /// Snapshot for the fan-out layer
    pub fn status(&self) -> SenderStatus {
        SenderStatus {
            name: self.name.clone(),
            total: self.lines.len(),
            sent: self.sent,
            received: self.received,
            hold: self.hold,
            hold_reason: self.hold_reason.clone(),
            buffer_size: self.buffer_size,
            data_length: self.data_length,
        }
    }

    /// Elapsed run time, if the run has started
    pub fn elapsed(&self, now: Instant) -> Option<std::time::Duration> {
        let start = self.started_at?;
        Some(self.finished_at.unwrap_or(now).duration_since(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_sum(sender: &Sender) -> usize {
        sender.in_flight.iter().sum()
    }

    #[test]
    fn load_rejects_empty_text() {
        let mut sender = Sender::new();
        assert!(!sender.load("empty", "", ExecutionContext::new()));
        assert!(sender.load("one", "G0 X0\n", ExecutionContext::new()));
        assert_eq!(sender.total(), 1);
    }

    #[test]
    fn credit_ledger_matches_data_length() {
        let mut sender = Sender::new();
        sender.load("p", "G0 X0\nG1 Y1\nG1 Z2\n", ExecutionContext::new());
        let now = Instant::now();

        sender.mark_sent(6, now);
        sender.mark_sent(7, now);
        assert_eq!(sender.data_length(), 13);
        assert_eq!(ledger_sum(&sender), sender.data_length());

        sender.ack(now).unwrap();
        assert_eq!(sender.data_length(), 7);
        assert_eq!(sender.received(), 1);
        assert_eq!(ledger_sum(&sender), sender.data_length());
    }

    #[test]
    fn ack_without_in_flight_fails() {
        let mut sender = Sender::new();
        sender.load("p", "G0 X0\n", ExecutionContext::new());
        assert!(sender.ack(Instant::now()).is_err());
    }

    #[test]
    fn backpressure_respects_the_window() {
        let mut sender = Sender::new();
        sender.load("p", "G0 X0\n", ExecutionContext::new());
        sender.tune_buffer_size(0); // no-op
        assert_eq!(sender.buffer_size(), DEFAULT_BUFFER_SIZE);

        assert!(sender.can_send(DEFAULT_BUFFER_SIZE));
        assert!(!sender.can_send(DEFAULT_BUFFER_SIZE + 1));
        sender.mark_sent(100, Instant::now());
        assert!(sender.can_send(20));
        assert!(!sender.can_send(21));
    }

    #[test]
    fn suppressed_lines_do_not_wait_for_acks() {
        let mut sender = Sender::new();
        sender.load("p", "%x=1\nG0 X1\n%y=2\n", ExecutionContext::new());
        let now = Instant::now();

        sender.mark_suppressed(now);
        assert_eq!((sender.sent(), sender.received()), (1, 1));

        sender.mark_sent(6, now);
        sender.mark_suppressed(now);
        // The trailing suppressed line waits behind the real in-flight one.
        assert_eq!((sender.sent(), sender.received()), (3, 1));

        sender.ack(now).unwrap();
        assert_eq!(sender.received(), 3);
        assert!(sender.is_finished());
        assert_eq!(sender.data_length(), 0);
    }

    #[test]
    fn rewind_resets_progress_and_hold() {
        let mut sender = Sender::new();
        sender.load("p", "G0 X0\nG0 X1\n", ExecutionContext::new());
        let now = Instant::now();
        sender.mark_sent(6, now);
        sender.hold(HoldReason::new("%wait"));
        sender.rewind();
        assert_eq!((sender.sent(), sender.received()), (0, 0));
        assert_eq!(sender.data_length(), 0);
        assert!(!sender.is_held());
    }

    #[test]
    fn buffer_tuning_never_shrinks_and_needs_an_empty_window() {
        let mut sender = Sender::new();
        sender.load("p", "G0 X0\n", ExecutionContext::new());

        sender.tune_buffer_size(256);
        assert_eq!(sender.buffer_size(), 248);

        // Smaller report: ignored.
        sender.tune_buffer_size(64);
        assert_eq!(sender.buffer_size(), 248);

        // In-flight data: ignored.
        sender.mark_sent(6, Instant::now());
        sender.tune_buffer_size(1024);
        assert_eq!(sender.buffer_size(), 248);
    }
}
