//! Last-known device state
//!
//! A mutable snapshot of the controller fed by parsed status, setting
//! and parser-state reports. The model never issues I/O; change
//! detection is structural, by comparing snapshots taken before and
//! after an update.

use crate::parser::{ModalState, StatusReport};
use grblhost_core::machine::{MachineState, Position};
use serde::Serialize;
use std::collections::BTreeMap;

/// Mutable last-known machine state
#[derive(Debug, Clone, Default)]
pub struct DeviceModel {
    state: Option<MachineState>,
    sub_state: Option<u8>,
    mpos: Position,
    wpos: Position,
    wco: Option<Position>,
    modal: ModalState,
    settings: BTreeMap<u16, String>,
    parameters: BTreeMap<String, String>,
    fields: BTreeMap<String, String>,
    last_status: Option<String>,
}

/// Serializable snapshot of the device state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    /// Active machine state, if a status report has arrived.
    pub state: Option<MachineState>,
    /// Sub-state code for `Hold:n` / `Door:n` reports.
    pub sub_state: Option<u8>,
    /// Machine position.
    pub mpos: Position,
    /// Work position.
    pub wpos: Position,
    /// Modal parser state.
    pub modal: ModalState,
    /// Unmodeled status fields, verbatim.
    pub fields: BTreeMap<String, String>,
}

impl DeviceModel {
    /// Create an empty model
    pub fn new() -> Self {
        Self::default()
    }

    /// Active state is `Idle`
    pub fn is_idle(&self) -> bool {
        self.state == Some(MachineState::Idle)
    }

    /// Active state is `Alarm`
    pub fn is_alarm(&self) -> bool {
        self.state == Some(MachineState::Alarm)
    }

    /// Active state, if known
    pub fn state(&self) -> Option<MachineState> {
        self.state
    }

    /// Machine position
    pub fn mpos(&self) -> Position {
        self.mpos
    }

    /// Work position (machine position minus WCO; equal to machine
    /// position while the offset is unknown)
    pub fn wpos(&self) -> Position {
        self.wpos
    }

    /// Settings map (`$n` -> value)
    pub fn settings(&self) -> &BTreeMap<u16, String> {
        &self.settings
    }

    /// Last raw status line
    pub fn last_status(&self) -> Option<&str> {
        self.last_status.as_deref()
    }

    /// Apply a parsed status report; returns true when anything changed
    pub fn apply_status(&mut self, report: &StatusReport, raw: &str) -> bool {
        let before = self.snapshot();

        self.state = Some(report.state);
        self.sub_state = report.sub_state;
        if let Some(wco) = report.wco {
            self.wco = Some(wco);
        }
        if let Some(mpos) = report.mpos {
            self.mpos = mpos;
        }
        if let Some(wpos) = report.wpos {
            self.wpos = wpos;
        } else {
            self.wpos = match self.wco {
                Some(wco) => self.mpos.minus(&wco),
                None => self.mpos,
            };
        }
        self.fields = report.fields.clone();
        self.last_status = Some(raw.to_string());

        before != self.snapshot()
    }

    /// Record a `$n=value` report; returns true when the value changed
    pub fn apply_setting(&mut self, number: u16, value: &str) -> bool {
        self.settings.insert(number, value.to_string()) != Some(value.to_string())
    }

    /// Record a `[GC:…]` modal report; returns true when it changed
    pub fn apply_parser_state(&mut self, modal: &ModalState) -> bool {
        if self.modal == *modal {
            return false;
        }
        self.modal = modal.clone();
        true
    }

    /// Record a `[G54:…]`-style parameter report
    pub fn apply_parameter(&mut self, name: &str, value: &str) {
        self.parameters.insert(name.to_string(), value.to_string());
    }

    /// Take a structural snapshot for change detection and fan-out
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            state: self.state,
            sub_state: self.sub_state,
            mpos: self.mpos,
            wpos: self.wpos,
            modal: self.modal.clone(),
            fields: self.fields.clone(),
        }
    }
}

impl Default for DeviceSnapshot {
    fn default() -> Self {
        DeviceModel::default().snapshot()
    }
}
