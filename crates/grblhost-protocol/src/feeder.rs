//! Ad-hoc command feeder
//!
//! An ordered queue of one-off command lines fed by the user, macros
//! and event triggers. Lines are grouped in batches that share one
//! execution context, so a `%`-assignment earlier in a batch is visible
//! to later lines of the same batch. While held, `pop()` is a no-op;
//! items are only dropped by an explicit `clear()`.

use crate::workflow::HoldReason;
use grblhost_core::machine::ExecutionContext;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug)]
struct Batch {
    lines: VecDeque<String>,
    context: ExecutionContext,
}

/// The feeder queue
#[derive(Debug, Default)]
pub struct Feeder {
    batches: VecDeque<Batch>,
    held: bool,
    hold_reason: Option<HoldReason>,
}

/// Serializable feeder snapshot for the fan-out layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeederStatus {
    /// Whether the feeder is held.
    pub hold: bool,
    /// Why it is held.
    pub hold_reason: Option<HoldReason>,
    /// Number of queued lines.
    pub queue: usize,
}

impl Feeder {
    /// Create an empty feeder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append lines sharing one context
    pub fn feed(&mut self, lines: Vec<String>, context: ExecutionContext) {
        let lines: VecDeque<String> = lines
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .collect();
        if lines.is_empty() {
            return;
        }
        self.batches.push_back(Batch { lines, context });
    }

    /// Number of queued lines
    pub fn size(&self) -> usize {
        self.batches.iter().map(|b| b.lines.len()).sum()
    }

    /// Head of the queue without removal
    pub fn peek(&self) -> Option<&str> {
        self.batches
            .front()
            .and_then(|b| b.lines.front())
            .map(String::as_str)
    }

    /// Pop the head together with mutable access to its batch context;
    /// a no-op while held.
    pub fn pop(&mut self) -> Option<(String, &mut ExecutionContext)> {
        if self.held {
            return None;
        }
        while let Some(front) = self.batches.front() {
            if front.lines.is_empty() {
                self.batches.pop_front();
                continue;
            }
            let batch = self.batches.front_mut()?;
            let line = batch.lines.pop_front()?;
            return Some((line, &mut batch.context));
        }
        None
    }

    /// Set the held flag
    pub fn hold(&mut self, reason: HoldReason) {
        self.held = true;
        self.hold_reason = Some(reason);
    }

    /// Clear the held flag; the engine follows up with `pop()`
    pub fn unhold(&mut self) {
        self.held = false;
        self.hold_reason = None;
    }

    /// Drop all queued items and clear the hold
    pub fn clear(&mut self) {
        self.batches.clear();
        self.held = false;
        self.hold_reason = None;
    }

    /// Whether the feeder is held
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Non-empty and not held
    pub fn is_pending(&self) -> bool {
        !self.held && self.size() > 0
    }

    /// Snapshot for the fan-out layer
    pub fn status(&self) -> FeederStatus {
        FeederStatus {
            hold: self.held,
            hold_reason: self.hold_reason.clone(),
            queue: self.size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pops_in_order() {
        let mut feeder = Feeder::new();
        feeder.feed(lines(&["G0 X0", "G0 X1"]), ExecutionContext::new());
        assert_eq!(feeder.size(), 2);
        assert_eq!(feeder.pop().unwrap().0, "G0 X0");
        assert_eq!(feeder.pop().unwrap().0, "G0 X1");
        assert!(feeder.pop().is_none());
    }

    #[test]
    fn hold_makes_pop_a_noop() {
        let mut feeder = Feeder::new();
        feeder.feed(lines(&["M5"]), ExecutionContext::new());
        feeder.hold(HoldReason::new("M6"));
        assert!(feeder.pop().is_none());
        assert!(!feeder.is_pending());
        assert_eq!(feeder.size(), 1);
        feeder.unhold();
        assert_eq!(feeder.pop().unwrap().0, "M5");
    }

    #[test]
    fn clear_empties_and_unholds() {
        let mut feeder = Feeder::new();
        feeder.feed(lines(&["G4 P1"]), ExecutionContext::new());
        feeder.hold(HoldReason::new("M0"));
        feeder.clear();
        assert_eq!(feeder.size(), 0);
        assert!(!feeder.is_held());
    }

    #[test]
    fn batches_keep_their_own_context() {
        let mut feeder = Feeder::new();
        let mut first = ExecutionContext::new();
        first.set("xmax", 10.0);
        feeder.feed(lines(&["G0 X[xmax]"]), first);
        feeder.feed(lines(&["G0 X[xmax]"]), ExecutionContext::new());

        let (_, ctx) = feeder.pop().unwrap();
        assert_eq!(ctx.get("xmax"), 10.0);
        let (_, ctx) = feeder.pop().unwrap();
        assert_eq!(ctx.get("xmax"), 0.0);
    }

    #[test]
    fn blank_lines_are_not_queued() {
        let mut feeder = Feeder::new();
        feeder.feed(lines(&["", "  ", "G0 X0"]), ExecutionContext::new());
        assert_eq!(feeder.size(), 1);
    }
}
