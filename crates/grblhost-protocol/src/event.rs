//! Outbound engine events
//!
//! Everything the engine tells the world, shaped for the socket fan-out
//! layer: serial port lifecycle and traffic, controller state and
//! settings snapshots, queue status, workflow transitions and program
//! load/unload notifications. Events are serializable so the fan-out
//! layer can ship them to clients verbatim.

use crate::device::DeviceSnapshot;
use crate::feeder::FeederStatus;
use crate::sender::SenderStatus;
use crate::workflow::WorkflowState;
use serde::Serialize;
use std::collections::BTreeMap;

/// Events published by the protocol engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Serial port opened.
    PortOpen {
        /// Port path.
        port: String,
        /// Baud rate in effect.
        baud_rate: u32,
    },
    /// Serial port closed.
    PortClose {
        /// Port path.
        port: String,
    },
    /// Connection-state change notification for port listings.
    PortChange {
        /// Port path.
        port: String,
        /// Whether the port is now in use.
        inuse: bool,
    },
    /// Transport failure.
    PortError {
        /// Failure description.
        message: String,
    },
    /// A line surfaced to clients (responses, decoded errors, alarms).
    PortRead {
        /// The line as shown to clients.
        line: String,
    },
    /// Data written to the wire.
    PortWrite {
        /// The written data, newline included where applicable.
        data: String,
    },
    /// Controller settings snapshot changed.
    ControllerSettings {
        /// `$n` -> value map.
        settings: BTreeMap<u16, String>,
    },
    /// Controller state snapshot changed.
    ControllerState {
        /// The device snapshot.
        state: DeviceSnapshot,
    },
    /// Feeder queue status.
    FeederStatus {
        /// The feeder snapshot.
        status: FeederStatus,
    },
    /// Sender progress status.
    SenderStatus {
        /// The sender snapshot.
        status: SenderStatus,
    },
    /// Workflow transition.
    WorkflowState {
        /// The new workflow state.
        state: WorkflowState,
    },
    /// A program was loaded into the sender.
    GcodeLoad {
        /// Program name.
        name: String,
        /// Number of lines.
        total: usize,
    },
    /// The loaded program was dropped.
    GcodeUnload,
}
