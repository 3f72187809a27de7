//! Workflow state machine
//!
//! Three states: Idle, Running, Paused. Legal transitions are
//! `start` (Idle -> Running), `pause` (Running -> Paused),
//! `resume` (Paused -> Running) and `stop` (any -> Idle). Illegal
//! transitions are rejected and logged; side effects on the feeder and
//! sender are applied by the engine, not here.

use serde::Serialize;

/// Workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkflowState {
    /// No program run in progress.
    Idle,
    /// Streaming the loaded program.
    Running,
    /// Run suspended; in-flight lines may still drain.
    Paused,
}

/// Why a queue or the workflow was put on hold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HoldReason {
    /// Machine-readable marker (`M0`, `M6`, `%wait`, an error line, …).
    pub data: String,
    /// Optional human-readable detail.
    pub message: Option<String>,
}

impl HoldReason {
    /// Create a reason from its marker
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            message: None,
        }
    }

    /// Create a reason with a message
    pub fn with_message(data: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            message: Some(message.into()),
        }
    }
}

/// The workflow state machine
#[derive(Debug, Default)]
pub struct Workflow {
    state: WorkflowStateInner,
    context: Option<HoldReason>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum WorkflowStateInner {
    #[default]
    Idle,
    Running,
    Paused,
}

impl Workflow {
    /// Create a workflow in the Idle state
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> WorkflowState {
        match self.state {
            WorkflowStateInner::Idle => WorkflowState::Idle,
            WorkflowStateInner::Running => WorkflowState::Running,
            WorkflowStateInner::Paused => WorkflowState::Paused,
        }
    }

    /// Pause context, when paused with a reason
    pub fn context(&self) -> Option<&HoldReason> {
        self.context.as_ref()
    }

    /// Whether the workflow is Running
    pub fn is_running(&self) -> bool {
        self.state == WorkflowStateInner::Running
    }

    /// Whether the workflow is Idle
    pub fn is_idle(&self) -> bool {
        self.state == WorkflowStateInner::Idle
    }

    /// Whether the workflow is Paused
    pub fn is_paused(&self) -> bool {
        self.state == WorkflowStateInner::Paused
    }

    /// Idle -> Running; returns false on an illegal transition
    pub fn start(&mut self) -> bool {
        if self.state != WorkflowStateInner::Idle {
            tracing::warn!("workflow start rejected in state {:?}", self.state);
            return false;
        }
        self.state = WorkflowStateInner::Running;
        self.context = None;
        true
    }

    /// Running -> Paused; returns false on an illegal transition
    pub fn pause(&mut self, reason: Option<HoldReason>) -> bool {
        if self.state != WorkflowStateInner::Running {
            tracing::warn!("workflow pause rejected in state {:?}", self.state);
            return false;
        }
        self.state = WorkflowStateInner::Paused;
        self.context = reason;
        true
    }

    /// Paused -> Running; returns false on an illegal transition
    pub fn resume(&mut self) -> bool {
        if self.state != WorkflowStateInner::Paused {
            tracing::warn!("workflow resume rejected in state {:?}", self.state);
            return false;
        }
        self.state = WorkflowStateInner::Running;
        self.context = None;
        true
    }

    /// Any -> Idle; returns false when already Idle
    pub fn stop(&mut self) -> bool {
        if self.state == WorkflowStateInner::Idle {
            return false;
        }
        self.state = WorkflowStateInner::Idle;
        self.context = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_legal_transitions_are_accepted() {
        let mut wf = Workflow::new();
        assert!(!wf.pause(None));
        assert!(!wf.resume());
        assert!(wf.start());
        assert!(!wf.start());
        assert!(wf.pause(Some(HoldReason::new("M0"))));
        assert_eq!(wf.context().unwrap().data, "M0");
        assert!(!wf.pause(None));
        assert!(wf.resume());
        assert!(wf.stop());
        assert_eq!(wf.state(), WorkflowState::Idle);
        assert!(!wf.stop());
    }

    #[test]
    fn stop_works_from_any_state() {
        let mut wf = Workflow::new();
        wf.start();
        wf.pause(None);
        assert!(wf.stop());
        assert!(wf.is_idle());
    }

    #[test]
    fn resume_clears_the_pause_context() {
        let mut wf = Workflow::new();
        wf.start();
        wf.pause(Some(HoldReason::with_message("M6", "Tool change")));
        assert!(wf.context().is_some());
        wf.resume();
        assert!(wf.context().is_none());
    }
}
