//! Named event hooks
//!
//! Binds engine events (`gcode:start`, `feedhold`, `homing`, …) to
//! actions: either a host-side shell command executed by the external
//! task runner, or G-code enqueued on the engine's command bus. The
//! registry itself is passive; the engine fires it and feeds any
//! returned G-code through the feeder.

use crate::external::TaskRunner;

/// What a hook does when its event fires
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerAction {
    /// Run a host-side shell command through the task runner.
    System {
        /// The shell command line.
        command: String,
    },
    /// Enqueue G-code on the engine's command bus.
    Gcode {
        /// One or more newline-separated G-code lines.
        commands: String,
    },
}

/// One event binding
#[derive(Debug, Clone, PartialEq)]
pub struct EventHook {
    /// Event name, e.g. `gcode:start`.
    pub event: String,
    /// Disabled hooks are skipped.
    pub enabled: bool,
    /// The bound action.
    pub action: TriggerAction,
}

/// Registry of event hooks
#[derive(Debug, Default)]
pub struct EventTrigger {
    hooks: Vec<EventHook>,
}

impl EventTrigger {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook
    pub fn add(&mut self, hook: EventHook) {
        self.hooks.push(hook);
    }

    /// Number of registered hooks
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Fire all hooks bound to `event`. System hooks run through the
    /// task runner (skipped with a warning when none is installed);
    /// G-code hooks are collected and returned for the caller to feed.
    pub fn fire(&self, event: &str, task_runner: Option<&dyn TaskRunner>) -> Vec<String> {
        let mut gcode = Vec::new();

        for hook in self.hooks.iter().filter(|h| h.enabled && h.event == event) {
            match &hook.action {
                TriggerAction::System { command } => match task_runner {
                    Some(runner) => {
                        if let Err(err) = runner.run(command) {
                            tracing::error!("task runner failed for {}: {:#}", event, err);
                        }
                    }
                    None => {
                        tracing::warn!("no task runner installed; dropping hook for {}", event);
                    }
                },
                TriggerAction::Gcode { commands } => {
                    gcode.extend(commands.lines().map(str::to_string));
                }
            }
        }

        gcode
    }
}
