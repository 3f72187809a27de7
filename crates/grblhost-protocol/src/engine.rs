//! Protocol engine
//!
//! Owns the feeder, sender, workflow, device model and serial
//! transport; routes inbound response records, dispatches command-bus
//! commands and drives the periodic housekeeping tick. All state is
//! mutated from a single task: the engine itself is synchronous and the
//! async service (see [`crate::service`]) serializes line handling,
//! command dispatch and ticks onto it.
//!
//! Acknowledgment routing follows the workflow state: while Running,
//! every `ok`/`error` advances the sender; while Idle they advance the
//! feeder; while Paused they drain the sender's residual in-flight
//! lines first.

use crate::device::{DeviceModel, DeviceSnapshot};
use crate::event::EngineEvent;
use crate::external::{MacroStore, TaskRunner, WatchDirLoader};
use crate::feeder::Feeder;
use crate::parser::{parse_line, Response, StatusReport};
use crate::preprocessor::{self, format_number};
use crate::realtime;
use crate::sender::Sender;
use crate::transport::Transport;
use crate::trigger::EventTrigger;
use crate::workflow::{HoldReason, Workflow, WorkflowState};
use grblhost_core::decoder;
use grblhost_core::machine::{ExecutionContext, MachineState};
use grblhost_core::settings_db::setting_info;
use grblhost_core::{CommandError, Error, EventDispatcher, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long an unanswered `?` blocks re-polling before being abandoned.
const STATUS_QUERY_TOLERANCE: Duration = Duration::from_secs(5);
/// How long an unanswered `$G` blocks re-polling before being abandoned.
const PARSER_STATE_TOLERANCE: Duration = Duration::from_secs(10);
/// Minimum gap between `$G` queries (leading-edge throttle).
const PARSER_STATE_GAP: Duration = Duration::from_millis(500);
/// Quiescence window after the final ack before issuing `gcode:stop`.
const FINISH_TOLERANCE: Duration = Duration::from_millis(500);
/// Delay between `!` and the conditional `\x18` of a forced stop.
const FORCE_STOP_DELAY: Duration = Duration::from_millis(500);

/// One-shot flags coupling queries to their responses
///
/// The `query_*` flags mark an engine-initiated poll in flight; the
/// `reply_*` flags mark that the next matching response was requested
/// by a user `?`/`$G` and must be forwarded upstream.
#[derive(Debug, Default, Clone, Copy)]
struct ActionMasks {
    query_parser_state_state: bool,
    query_parser_state_reply: bool,
    query_status_report: bool,
    reply_parser_state: bool,
    reply_status_report: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct ActionTimes {
    query_parser_state: Option<Instant>,
    query_status_report: Option<Instant>,
    sender_finish: Option<Instant>,
}

/// Command-bus commands
#[derive(Debug, Clone)]
pub enum Command {
    /// Load a program into the sender.
    GcodeLoad {
        /// Program name.
        name: String,
        /// Program text.
        gcode: String,
        /// Caller-supplied context (bounding box, user variables).
        context: ExecutionContext,
    },
    /// Drop the loaded program.
    GcodeUnload,
    /// Start streaming the loaded program.
    GcodeStart,
    /// Stop the run; `force` adds the `!` / delayed `\x18` sequence.
    GcodeStop {
        /// Force an immediate device stop.
        force: bool,
    },
    /// Pause the run.
    GcodePause,
    /// Resume a paused run.
    GcodeResume,
    /// Feed ad-hoc lines through the feeder.
    Gcode {
        /// The lines to feed.
        lines: Vec<String>,
        /// Shared context for the batch.
        context: ExecutionContext,
    },
    /// Resume a held feeder.
    FeederStart,
    /// Hold the feeder.
    FeederPause,
    /// Drop all queued feeder lines.
    FeederStop,
    /// Real-time feed hold (`!`).
    Feedhold,
    /// Real-time cycle start (`~`).
    Cyclestart,
    /// User status query (`?`); the next report is forwarded upstream.
    StatusReport,
    /// Run the homing cycle (`$H`).
    Homing,
    /// Enter sleep mode (`$SLP`).
    Sleep,
    /// Clear an alarm lockout (`$X`).
    Unlock,
    /// Soft reset (`\x18`).
    Reset,
    /// Feed override step: 0 resets, +-10 coarse, +-1 fine.
    FeedOverride {
        /// The step value.
        value: i32,
    },
    /// Spindle override step: 0 resets, +-10 coarse, +-1 fine.
    SpindleOverride {
        /// The step value.
        value: i32,
    },
    /// Rapid override level: 0 resets, 50 or 25.
    RapidOverride {
        /// The level value.
        value: i32,
    },
    /// Fire the spindle/laser at a power percentage for a test.
    LasertestOn {
        /// Power percentage.
        power: f64,
        /// Test duration in milliseconds; 0 leaves the laser on.
        duration_ms: u64,
        /// S-value corresponding to 100% power.
        max_s: f64,
    },
    /// Turn the laser test off.
    LasertestOff,
    /// Feed a stored macro through the feeder.
    MacroRun {
        /// Macro id.
        id: String,
        /// Caller-supplied context.
        context: ExecutionContext,
    },
    /// Load a stored macro into the sender.
    MacroLoad {
        /// Macro id.
        id: String,
        /// Caller-supplied context.
        context: ExecutionContext,
    },
    /// Load a file from the watch directory into the sender.
    WatchdirLoad {
        /// Watch-directory relative path.
        path: String,
    },
}

impl Command {
    /// Build a command from a string key and JSON arguments, as the
    /// socket front-end delivers them. Legacy `start`/`stop`/`pause`/
    /// `resume` keys are accepted with a deprecation warning.
    pub fn from_key(key: &str, args: serde_json::Value) -> Result<Command> {
        let key = match key {
            "start" | "stop" | "pause" | "resume" => {
                let canonical = match key {
                    "start" => "gcode:start",
                    "stop" => "gcode:stop",
                    "pause" => "gcode:pause",
                    _ => "gcode:resume",
                };
                tracing::warn!("'{}' is deprecated, use '{}'", key, canonical);
                canonical
            }
            other => other,
        };

        let str_arg = |name: &str| -> Result<String> {
            args.get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    CommandError::InvalidArguments {
                        key: key.to_string(),
                        reason: format!("missing '{}'", name),
                    }
                    .into()
                })
        };

        let command = match key {
            "gcode:load" => Command::GcodeLoad {
                name: str_arg("name")?,
                gcode: str_arg("gcode")?,
                context: context_from_json(args.get("context")),
            },
            "gcode:unload" => Command::GcodeUnload,
            "gcode:start" => Command::GcodeStart,
            "gcode:stop" => Command::GcodeStop {
                force: args
                    .get("force")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            },
            "gcode:pause" => Command::GcodePause,
            "gcode:resume" => Command::GcodeResume,
            "gcode" | "feeder:feed" => Command::Gcode {
                lines: match args.get("lines") {
                    Some(serde_json::Value::Array(items)) => items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(str::to_string)
                        .collect(),
                    Some(serde_json::Value::String(text)) => {
                        text.lines().map(str::to_string).collect()
                    }
                    _ => {
                        return Err(CommandError::InvalidArguments {
                            key: key.to_string(),
                            reason: "missing 'lines'".to_string(),
                        }
                        .into())
                    }
                },
                context: context_from_json(args.get("context")),
            },
            "feeder:start" => Command::FeederStart,
            "feeder:pause" => Command::FeederPause,
            "feeder:stop" => Command::FeederStop,
            "feedhold" => Command::Feedhold,
            "cyclestart" => Command::Cyclestart,
            "statusreport" => Command::StatusReport,
            "homing" => Command::Homing,
            "sleep" => Command::Sleep,
            "unlock" => Command::Unlock,
            "reset" => Command::Reset,
            "feedOverride" => Command::FeedOverride {
                value: int_arg(key, &args, "value")?,
            },
            "spindleOverride" => Command::SpindleOverride {
                value: int_arg(key, &args, "value")?,
            },
            "rapidOverride" => Command::RapidOverride {
                value: int_arg(key, &args, "value")?,
            },
            "lasertest:on" => Command::LasertestOn {
                power: args.get("power").and_then(|v| v.as_f64()).unwrap_or(0.0),
                duration_ms: args.get("duration").and_then(|v| v.as_u64()).unwrap_or(0),
                max_s: args.get("maxS").and_then(|v| v.as_f64()).unwrap_or(1000.0),
            },
            "lasertest:off" => Command::LasertestOff,
            "macro:run" => Command::MacroRun {
                id: str_arg("id")?,
                context: context_from_json(args.get("context")),
            },
            "macro:load" => Command::MacroLoad {
                id: str_arg("id")?,
                context: context_from_json(args.get("context")),
            },
            "watchdir:load" => Command::WatchdirLoad {
                path: str_arg("path")?,
            },
            unknown => {
                return Err(CommandError::UnknownCommand {
                    key: unknown.to_string(),
                }
                .into())
            }
        };
        Ok(command)
    }
}

fn int_arg(key: &str, args: &serde_json::Value, name: &str) -> Result<i32> {
    args.get(name)
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .ok_or_else(|| {
            CommandError::InvalidArguments {
                key: key.to_string(),
                reason: format!("missing '{}'", name),
            }
            .into()
        })
}

fn context_from_json(value: Option<&serde_json::Value>) -> ExecutionContext {
    let mut ctx = ExecutionContext::new();
    if let Some(serde_json::Value::Object(map)) = value {
        for (name, v) in map {
            if let Some(n) = v.as_f64() {
                ctx.set(name.clone(), n);
            }
        }
    }
    ctx
}

/// The protocol engine
pub struct Engine {
    transport: Option<Box<dyn Transport>>,
    events: EventDispatcher<EngineEvent>,
    device: DeviceModel,
    feeder: Feeder,
    sender: Sender,
    workflow: Workflow,
    trigger: EventTrigger,
    task_runner: Option<Arc<dyn TaskRunner>>,
    macros: Option<Arc<dyn MacroStore>>,
    watch_dir: Option<Arc<dyn WatchDirLoader>>,
    masks: ActionMasks,
    times: ActionTimes,
    ready: bool,
    initialized: bool,
    pending_force_stop: Option<Instant>,
    last_state: DeviceSnapshot,
    last_settings: BTreeMap<u16, String>,
}

impl Engine {
    /// Create an engine publishing to `events`
    pub fn new(events: EventDispatcher<EngineEvent>) -> Self {
        Self {
            transport: None,
            events,
            device: DeviceModel::new(),
            feeder: Feeder::new(),
            sender: Sender::new(),
            workflow: Workflow::new(),
            trigger: EventTrigger::new(),
            task_runner: None,
            macros: None,
            watch_dir: None,
            masks: ActionMasks::default(),
            times: ActionTimes::default(),
            ready: false,
            initialized: false,
            pending_force_stop: None,
            last_state: DeviceSnapshot::default(),
            last_settings: BTreeMap::new(),
        }
    }

    /// Install the task runner collaborator
    pub fn set_task_runner(&mut self, runner: Arc<dyn TaskRunner>) {
        self.task_runner = Some(runner);
    }

    /// Install the macro store collaborator
    pub fn set_macro_store(&mut self, store: Arc<dyn MacroStore>) {
        self.macros = Some(store);
    }

    /// Install the watch-directory loader collaborator
    pub fn set_watch_dir_loader(&mut self, loader: Arc<dyn WatchDirLoader>) {
        self.watch_dir = Some(loader);
    }

    /// Event hook registry
    pub fn trigger_mut(&mut self) -> &mut EventTrigger {
        &mut self.trigger
    }

    /// Attach an open transport
    pub fn open(&mut self, transport: Box<dyn Transport>, baud_rate: u32) {
        if self.transport.is_some() {
            tracing::warn!("port already open; ignoring");
            return;
        }
        let port = transport.port_name().to_string();
        self.transport = Some(transport);
        self.publish(EngineEvent::PortOpen {
            port: port.clone(),
            baud_rate,
        });
        self.publish(EngineEvent::PortChange { port, inuse: true });
    }

    /// Close the port and drop readiness
    pub fn close(&mut self) {
        self.ready = false;
        self.initialized = false;
        self.masks = ActionMasks::default();
        self.times = ActionTimes::default();
        self.pending_force_stop = None;
        if let Some(mut transport) = self.transport.take() {
            let port = transport.port_name().to_string();
            transport.close();
            self.publish(EngineEvent::PortClose { port: port.clone() });
            self.publish(EngineEvent::PortChange { port, inuse: false });
        }
    }

    /// Transport-level failure: surface and close
    pub fn handle_disconnect(&mut self, reason: &str) {
        self.publish(EngineEvent::PortError {
            message: reason.to_string(),
        });
        self.close();
    }

    /// Whether the startup banner has been seen
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Device model accessor
    pub fn device(&self) -> &DeviceModel {
        &self.device
    }

    /// Workflow accessor
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Feeder accessor
    pub fn feeder(&self) -> &Feeder {
        &self.feeder
    }

    /// Sender accessor
    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    fn publish(&self, event: EngineEvent) {
        self.events.publish(event);
    }

    fn publish_read(&self, line: &str) {
        self.publish(EngineEvent::PortRead {
            line: line.to_string(),
        });
    }

    // -- wire helpers -----------------------------------------------------

    fn transport_write(&mut self, bytes: &[u8]) {
        let result = match self.transport.as_mut() {
            Some(transport) => transport.write_bytes(bytes),
            None => return,
        };
        if let Err(err) = result {
            self.handle_disconnect(&err.to_string());
        }
    }

    /// Internal poll write: no masks, no events
    fn send_raw(&mut self, bytes: &[u8]) {
        self.transport_write(bytes);
    }

    /// Queue line write: newline-terminated, surfaced as a write event
    fn send_line(&mut self, text: &str) {
        let data = format!("{}\n", text);
        self.publish(EngineEvent::PortWrite { data: data.clone() });
        self.transport_write(data.as_bytes());
    }

    /// User-facing write: arms the reply masks for `?`/`$G` and mirrors
    /// `$n=v` into the local settings map before the device confirms.
    pub fn write(&mut self, data: &str) {
        if self.transport.is_none() {
            tracing::warn!("write while port closed: {:?}", data);
            return;
        }
        let cmd = data.trim();
        if cmd == "?" {
            self.masks.reply_status_report = true;
        }
        if cmd == "$G" {
            self.masks.reply_parser_state = true;
        }
        if let Some(rest) = cmd.strip_prefix('$') {
            if let Some((num, value)) = rest.split_once('=') {
                if let Ok(number) = num.trim().parse::<u16>() {
                    self.device.apply_setting(number, value.trim());
                }
            }
        }
        self.publish(EngineEvent::PortWrite {
            data: data.to_string(),
        });
        // Real-time commands are single raw bytes on the wire, not the
        // UTF-8 encoding of their code point.
        if realtime::is_realtime(data) {
            let byte = data.chars().next().map(|c| c as u8).unwrap_or_default();
            self.transport_write(&[byte]);
        } else {
            self.transport_write(data.as_bytes());
        }
    }

    /// User-facing write with newline, except for real-time bytes
    pub fn writeln(&mut self, data: &str) {
        if realtime::is_realtime(data) {
            self.write(data);
        } else {
            self.write(&format!("{}\n", data));
        }
    }

    // -- queue advancement ------------------------------------------------

    /// Advance the feeder by one line (plus any suppressed directives)
    fn feeder_next(&mut self, _now: Instant) {
        if self.transport.is_none() {
            return;
        }
        loop {
            if self.feeder.is_held() {
                return;
            }
            let mpos = self.device.mpos();
            let wpos = self.device.wpos();
            let processed = {
                let Some((raw, ctx)) = self.feeder.pop() else {
                    return;
                };
                ctx.set_positions(&mpos, &wpos);
                preprocessor::rewrite(&raw, ctx)
            };

            if let Some(mnemonic) = processed.pause.as_deref() {
                // Hold before the line goes out; the operator resumes
                // with feeder:start once the tool change is done.
                self.feeder.hold(HoldReason::new(mnemonic));
                self.publish(EngineEvent::FeederStatus {
                    status: self.feeder.status(),
                });
            }

            match processed.text {
                Some(text) if !text.trim().is_empty() => {
                    self.send_line(&text);
                    return;
                }
                _ => {
                    // Suppressed: nothing reached the wire and no ok
                    // will come, so keep draining.
                    continue;
                }
            }
        }
    }

    /// Stream as many program lines as credit allows
    fn sender_next(&mut self, now: Instant) {
        if self.transport.is_none() {
            return;
        }
        loop {
            if !self.workflow.is_running() || self.sender.is_held() {
                return;
            }
            let Some(raw) = self.sender.peek().map(str::to_string) else {
                return;
            };

            let mpos = self.device.mpos();
            let wpos = self.device.wpos();
            let ctx = self.sender.context_mut();
            ctx.set_positions(&mpos, &wpos);
            let processed = preprocessor::rewrite(&raw, ctx);

            let text = processed.text.unwrap_or_default();
            let suppressed = text.trim().is_empty();
            if !suppressed && !self.sender.can_send(text.len() + 1) {
                // At buffer capacity; the next ack retries.
                return;
            }

            // Committed to this line: apply its side effects.
            if let Some(mnemonic) = processed.pause.as_deref() {
                self.pause_workflow(Some(HoldReason::new(mnemonic)));
            }
            if processed.wait {
                self.sender.hold(HoldReason::new(preprocessor::WAIT));
            }

            let starting = self.sender.sent() == 0;
            if suppressed {
                let was_finished = self.sender.is_finished();
                self.sender.mark_suppressed(now);
                if starting {
                    self.times.sender_finish = None;
                }
                if !was_finished && self.sender.is_finished() {
                    self.finish_sender(now);
                }
                continue;
            }

            self.sender.mark_sent(text.len() + 1, now);
            if starting {
                self.times.sender_finish = None;
            }
            self.send_line(&text);
        }
    }

    fn finish_sender(&mut self, now: Instant) {
        self.times.sender_finish = Some(now);
        self.publish(EngineEvent::SenderStatus {
            status: self.sender.status(),
        });
    }

    // -- workflow side effects --------------------------------------------

    fn start_workflow(&mut self, now: Instant) {
        if self.workflow.start() {
            self.sender.rewind();
            self.publish(EngineEvent::WorkflowState {
                state: self.workflow.state(),
            });
            self.sender_next(now);
        }
    }

    fn pause_workflow(&mut self, reason: Option<HoldReason>) {
        if self.workflow.pause(reason.clone()) {
            self.sender
                .hold(reason.unwrap_or_else(|| HoldReason::new("pause")));
            self.publish(EngineEvent::WorkflowState {
                state: self.workflow.state(),
            });
        }
    }

    fn resume_workflow(&mut self, now: Instant) {
        if self.workflow.resume() {
            self.feeder.clear();
            self.sender.unhold();
            self.publish(EngineEvent::WorkflowState {
                state: self.workflow.state(),
            });
            self.sender_next(now);
        }
    }

    fn stop_workflow(&mut self) {
        if self.workflow.stop() {
            self.publish(EngineEvent::WorkflowState {
                state: self.workflow.state(),
            });
        }
        self.sender.rewind();
    }

    // -- event hooks ------------------------------------------------------

    fn fire_event(&mut self, name: &str, now: Instant) {
        let runner = self.task_runner.clone();
        let lines = self.trigger.fire(name, runner.as_deref());
        if !lines.is_empty() {
            let _ = self.dispatch(
                Command::Gcode {
                    lines,
                    context: ExecutionContext::new(),
                },
                now,
            );
        }
    }

    // -- command bus ------------------------------------------------------

    /// Dispatch one command-bus command
    pub fn dispatch(&mut self, command: Command, now: Instant) -> Result<()> {
        match command {
            Command::GcodeLoad {
                name,
                gcode,
                context,
            } => {
                if !self.sender.load(&name, &gcode, context) {
                    return Err(CommandError::EmptyProgram.into());
                }
                self.fire_event("gcode:load", now);
                self.publish(EngineEvent::GcodeLoad {
                    name,
                    total: self.sender.total(),
                });
                self.publish(EngineEvent::SenderStatus {
                    status: self.sender.status(),
                });
                Ok(())
            }
            Command::GcodeUnload => {
                self.stop_workflow();
                self.sender.unload();
                self.fire_event("gcode:unload", now);
                self.publish(EngineEvent::GcodeUnload);
                Ok(())
            }
            Command::GcodeStart => {
                if !self.sender.is_loaded() {
                    return Err(CommandError::NoProgram.into());
                }
                self.fire_event("gcode:start", now);
                self.start_workflow(now);
                Ok(())
            }
            Command::GcodeStop { force } => {
                self.fire_event("gcode:stop", now);
                self.stop_workflow();
                if force {
                    if self.device.state() == Some(MachineState::Run) {
                        self.write("!");
                    }
                    self.pending_force_stop = Some(now);
                }
                Ok(())
            }
            Command::GcodePause => {
                self.fire_event("gcode:pause", now);
                self.pause_workflow(None);
                self.write("!");
                Ok(())
            }
            Command::GcodeResume => {
                self.fire_event("gcode:resume", now);
                self.write("~");
                self.resume_workflow(now);
                Ok(())
            }
            Command::Gcode { lines, context } => {
                self.feeder.feed(lines, context);
                if !self.workflow.is_running() {
                    self.feeder_next(now);
                }
                Ok(())
            }
            Command::FeederStart => {
                self.feeder.unhold();
                self.publish(EngineEvent::FeederStatus {
                    status: self.feeder.status(),
                });
                self.feeder_next(now);
                Ok(())
            }
            Command::FeederPause => {
                self.feeder.hold(HoldReason::new("pause"));
                self.publish(EngineEvent::FeederStatus {
                    status: self.feeder.status(),
                });
                Ok(())
            }
            Command::FeederStop => {
                self.feeder.clear();
                self.publish(EngineEvent::FeederStatus {
                    status: self.feeder.status(),
                });
                Ok(())
            }
            Command::Feedhold => {
                self.fire_event("feedhold", now);
                self.write("!");
                Ok(())
            }
            Command::Cyclestart => {
                self.fire_event("cyclestart", now);
                self.write("~");
                Ok(())
            }
            Command::StatusReport => {
                self.write("?");
                Ok(())
            }
            Command::Homing => {
                self.fire_event("homing", now);
                self.writeln("$H");
                Ok(())
            }
            Command::Sleep => {
                self.fire_event("sleep", now);
                self.writeln("$SLP");
                Ok(())
            }
            Command::Unlock => {
                self.writeln("$X");
                Ok(())
            }
            Command::Reset => {
                self.stop_workflow();
                self.feeder.clear();
                self.write("\u{18}");
                Ok(())
            }
            Command::FeedOverride { value } => {
                match realtime::feed_override_byte(value) {
                    Some(byte) => {
                        self.write(&char::from(byte).to_string());
                        Ok(())
                    }
                    None => Err(invalid_override("feedOverride", value)),
                }
            }
            Command::SpindleOverride { value } => {
                match realtime::spindle_override_byte(value) {
                    Some(byte) => {
                        self.write(&char::from(byte).to_string());
                        Ok(())
                    }
                    None => Err(invalid_override("spindleOverride", value)),
                }
            }
            Command::RapidOverride { value } => {
                match realtime::rapid_override_byte(value) {
                    Some(byte) => {
                        self.write(&char::from(byte).to_string());
                        Ok(())
                    }
                    None => Err(invalid_override("rapidOverride", value)),
                }
            }
            Command::LasertestOn {
                power,
                duration_ms,
                max_s,
            } => {
                let s = (max_s * power / 100.0).max(0.0);
                let mut lines = vec!["G1F1".to_string(), format!("M3S{}", format_number(s))];
                if duration_ms > 0 {
                    lines.push(format!(
                        "G4P{}",
                        format_number(duration_ms as f64 / 1000.0)
                    ));
                    lines.push("M5S0".to_string());
                }
                self.dispatch(
                    Command::Gcode {
                        lines,
                        context: ExecutionContext::new(),
                    },
                    now,
                )
            }
            Command::LasertestOff => self.dispatch(
                Command::Gcode {
                    lines: vec!["M5S0".to_string()],
                    context: ExecutionContext::new(),
                },
                now,
            ),
            Command::MacroRun { id, context } => {
                let store = self
                    .macros
                    .clone()
                    .ok_or(CommandError::CollaboratorMissing {
                        name: "macro store",
                    })?;
                let m = store
                    .get(&id)
                    .ok_or(CommandError::MacroNotFound { id })?;
                self.fire_event("macro:run", now);
                self.dispatch(
                    Command::Gcode {
                        lines: m.content.lines().map(str::to_string).collect(),
                        context,
                    },
                    now,
                )
            }
            Command::MacroLoad { id, context } => {
                let store = self
                    .macros
                    .clone()
                    .ok_or(CommandError::CollaboratorMissing {
                        name: "macro store",
                    })?;
                let m = store
                    .get(&id)
                    .ok_or(CommandError::MacroNotFound { id })?;
                self.fire_event("macro:load", now);
                self.dispatch(
                    Command::GcodeLoad {
                        name: m.name,
                        gcode: m.content,
                        context,
                    },
                    now,
                )
            }
            Command::WatchdirLoad { path } => {
                let loader = self
                    .watch_dir
                    .clone()
                    .ok_or(CommandError::CollaboratorMissing {
                        name: "watch-directory loader",
                    })?;
                let gcode = loader
                    .load(&path)
                    .map_err(|e| Error::other(format!("watchdir load failed: {:#}", e)))?;
                self.dispatch(
                    Command::GcodeLoad {
                        name: path,
                        gcode,
                        context: ExecutionContext::new(),
                    },
                    now,
                )
            }
        }
    }

    // -- inbound routing --------------------------------------------------

    /// Route one inbound line
    pub fn handle_line(&mut self, line: &str, now: Instant) {
        if line.trim().is_empty() {
            return;
        }
        let record = parse_line(line);
        tracing::debug!("rx: {}", record.raw);

        match record.response.clone() {
            Response::Status(report) => self.handle_status(&report, &record.raw),
            Response::Ok => self.handle_ok(&record.raw, now),
            Response::Error { code } => self.handle_error(code, &record.raw, now),
            Response::Alarm { code, .. } => self.handle_alarm(code, &record.raw),
            Response::ParserState(modal) => {
                self.masks.query_parser_state_state = false;
                self.masks.query_parser_state_reply = true;
                self.device.apply_parser_state(&modal);
                if self.masks.reply_parser_state {
                    self.publish_read(&record.raw);
                }
            }
            Response::Parameters { name, value } => {
                self.device.apply_parameter(&name, &value);
                self.publish_read(&record.raw);
            }
            Response::Feedback { .. } => self.publish_read(&record.raw),
            Response::Setting { number, value } => {
                self.device.apply_setting(number, &value);
                match setting_info(number) {
                    Some(info) => self.publish_read(&format!(
                        "{} ({}, {})",
                        record.raw.trim(),
                        info.name,
                        info.units
                    )),
                    None => self.publish_read(&record.raw),
                }
            }
            Response::Startup { version } => self.handle_startup(&version, &record.raw),
            Response::Other => self.publish_read(&record.raw),
        }
    }

    fn handle_status(&mut self, report: &StatusReport, raw: &str) {
        self.masks.query_status_report = false;
        if self.masks.reply_status_report {
            self.masks.reply_status_report = false;
            self.publish_read(raw);
        }
        self.device.apply_status(report, raw);

        // Window tuning: only between runs, only growing.
        if self.workflow.is_idle() {
            if let Some(rx_free) = report.rx_free {
                self.sender.tune_buffer_size(rx_free);
            }
        }
    }

    fn handle_ok(&mut self, raw: &str, now: Instant) {
        if self.masks.query_parser_state_reply {
            if self.masks.reply_parser_state {
                self.masks.reply_parser_state = false;
                self.publish_read(raw);
            }
            self.masks.query_parser_state_reply = false;
            return;
        }

        match self.workflow.state() {
            WorkflowState::Running => {
                let was_finished = self.sender.is_finished();
                if let Err(err) = self.sender.ack(now) {
                    tracing::warn!("stray ok while running: {}", err);
                }
                if self.sender.is_held() && self.sender.received() >= self.sender.sent() {
                    self.sender.unhold();
                }
                if !was_finished && self.sender.is_finished() {
                    self.finish_sender(now);
                }
                self.sender_next(now);
                return;
            }
            WorkflowState::Paused => {
                // Drain residual in-flight acks without advancing.
                if self.sender.received() < self.sender.sent() {
                    let was_finished = self.sender.is_finished();
                    if let Err(err) = self.sender.ack(now) {
                        tracing::warn!("stray ok while paused: {}", err);
                    }
                    if !was_finished && self.sender.is_finished() {
                        self.finish_sender(now);
                    }
                    return;
                }
            }
            WorkflowState::Idle => {}
        }

        self.publish_read(raw);
        self.feeder_next(now);
    }

    fn handle_error(&mut self, code: u8, raw: &str, now: Instant) {
        let message = decoder::format_error(code);

        if self.workflow.is_running() {
            let index = self.sender.received();
            let line = self
                .sender
                .line_at(index)
                .unwrap_or("")
                .trim()
                .to_string();
            self.publish_read(&format!("> {} (line={})", line, index + 1));
            self.publish_read(&message);
            self.pause_workflow(Some(HoldReason::with_message(raw, &message)));

            // The error still acknowledges its line; credit accounting
            // must not skew.
            let was_finished = self.sender.is_finished();
            if let Err(err) = self.sender.ack(now) {
                tracing::warn!("stray error while running: {}", err);
            }
            if !was_finished && self.sender.is_finished() {
                self.finish_sender(now);
            }
            self.sender_next(now);
            return;
        }

        self.publish_read(&message);
        self.feeder_next(now);
    }

    fn handle_alarm(&mut self, code: Option<u8>, raw: &str) {
        // The device has already halted; recovery is the operator's
        // unlock, so the workflow is left untouched.
        match code {
            Some(code) => self.publish_read(&decoder::format_alarm(code)),
            None => self.publish_read(raw),
        }
    }

    fn handle_startup(&mut self, version: &str, raw: &str) {
        tracing::info!("Grbl {} ready", version);
        self.publish_read(raw);
        self.masks = ActionMasks::default();
        self.times = ActionTimes::default();
        self.ready = true;
        if !self.initialized {
            self.initialized = true;
            self.writeln("$$");
        }
    }

    // -- periodic housekeeping --------------------------------------------

    /// The 250 ms housekeeping tick; idempotent while closed
    pub fn tick(&mut self, now: Instant) {
        if self.transport.is_none() {
            return;
        }

        if self.feeder.peek().is_some() {
            self.publish(EngineEvent::FeederStatus {
                status: self.feeder.status(),
            });
        }
        if self.sender.peek().is_some() {
            self.publish(EngineEvent::SenderStatus {
                status: self.sender.status(),
            });
        }

        let settings = self.device.settings().clone();
        if settings != self.last_settings {
            self.last_settings = settings.clone();
            self.publish(EngineEvent::ControllerSettings { settings });
        }

        let previous_wpos = self.last_state.wpos;
        let state = self.device.snapshot();
        if state != self.last_state {
            self.last_state = state.clone();
            self.publish(EngineEvent::ControllerState { state });
        }

        if self.ready {
            self.query_status_report(now);
            self.query_parser_state(now);
        }

        // Quiescence after the final ack: only declare the run finished
        // once the machine has settled back to Idle.
        if let Some(finish) = self.times.sender_finish {
            let position_settled = previous_wpos == self.device.wpos();
            let machine_idle = self.device.is_idle() && position_settled;
            if !machine_idle {
                self.times.sender_finish = Some(now);
            } else if now.duration_since(finish) > FINISH_TOLERANCE {
                self.times.sender_finish = None;
                let _ = self.dispatch(Command::GcodeStop { force: false }, now);
            }
        }

        if let Some(requested) = self.pending_force_stop {
            if now.duration_since(requested) >= FORCE_STOP_DELAY {
                self.pending_force_stop = None;
                if self.device.state() == Some(MachineState::Hold) {
                    self.write("\u{18}");
                }
            }
        }
    }

    fn query_status_report(&mut self, now: Instant) {
        if self.masks.query_status_report {
            let stale = self
                .times
                .query_status_report
                .map(|t| now.duration_since(t) >= STATUS_QUERY_TOLERANCE)
                .unwrap_or(false);
            if !stale {
                return;
            }
            tracing::warn!("status query unanswered for 5s; re-arming");
            self.masks.query_status_report = false;
        }

        self.masks.query_status_report = true;
        self.times.query_status_report = Some(now);
        self.send_raw(&[realtime::STATUS_QUERY]);
    }

    fn query_parser_state(&mut self, now: Instant) {
        if self.masks.query_parser_state_state || self.masks.query_parser_state_reply {
            let stale = self
                .times
                .query_parser_state
                .map(|t| now.duration_since(t) >= PARSER_STATE_TOLERANCE)
                .unwrap_or(false);
            if !stale {
                return;
            }
            tracing::warn!("parser-state query unanswered for 10s; re-arming");
            self.masks.query_parser_state_state = false;
            self.masks.query_parser_state_reply = false;
        }

        // Leading-edge throttle; never while a run is in progress.
        if let Some(last) = self.times.query_parser_state {
            if now.duration_since(last) < PARSER_STATE_GAP {
                return;
            }
        }
        if !self.workflow.is_idle() || !self.device.is_idle() {
            return;
        }

        self.masks.query_parser_state_state = true;
        self.times.query_parser_state = Some(now);
        self.send_raw(b"$G\n");
    }
}

fn invalid_override(key: &str, value: i32) -> Error {
    CommandError::InvalidArguments {
        key: key.to_string(),
        reason: format!("unsupported override step {}", value),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_keys_resolve_with_legacy_aliases() {
        let cmd = Command::from_key("start", serde_json::json!({})).unwrap();
        assert!(matches!(cmd, Command::GcodeStart));

        let cmd = Command::from_key(
            "gcode:stop",
            serde_json::json!({ "force": true }),
        )
        .unwrap();
        assert!(matches!(cmd, Command::GcodeStop { force: true }));

        let err = Command::from_key("warp:engage", serde_json::json!({})).unwrap_err();
        assert!(matches!(
            err,
            Error::Command(CommandError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn gcode_key_accepts_string_or_array_lines() {
        let cmd = Command::from_key(
            "gcode",
            serde_json::json!({ "lines": "G0 X0\nG0 X1" }),
        )
        .unwrap();
        let Command::Gcode { lines, .. } = cmd else {
            panic!("expected gcode");
        };
        assert_eq!(lines.len(), 2);

        let cmd = Command::from_key(
            "gcode",
            serde_json::json!({ "lines": ["M5"], "context": { "xmax": 20 } }),
        )
        .unwrap();
        let Command::Gcode { lines, context } = cmd else {
            panic!("expected gcode");
        };
        assert_eq!(lines, vec!["M5".to_string()]);
        assert_eq!(context.get("xmax"), 20.0);
    }
}
