//! Machine-state primitives shared across the engine
//!
//! The active-state enum mirrors the states Grbl reports in the first
//! field of a status report. Positions carry the full six-axis set; a
//! machine that reports fewer axes leaves the remainder at zero.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Active machine state as reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    /// Ready and waiting for commands.
    Idle,
    /// Executing motion.
    Run,
    /// Feed hold in progress or complete.
    Hold,
    /// Executing a jog motion.
    Jog,
    /// Alarm lockout; requires an unlock.
    Alarm,
    /// Safety door open.
    Door,
    /// G-code check mode.
    Check,
    /// Homing cycle in progress.
    Home,
    /// Sleep mode.
    Sleep,
}

impl MachineState {
    /// Parse a state token from a status report, e.g. `Idle` or `Hold`
    /// (the `Hold:0` sub-code is handled by the caller).
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "Idle" => Some(Self::Idle),
            "Run" => Some(Self::Run),
            "Hold" => Some(Self::Hold),
            "Jog" => Some(Self::Jog),
            "Alarm" => Some(Self::Alarm),
            "Door" => Some(Self::Door),
            "Check" => Some(Self::Check),
            "Home" => Some(Self::Home),
            "Sleep" => Some(Self::Sleep),
            _ => None,
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Run => "Run",
            Self::Hold => "Hold",
            Self::Jog => "Jog",
            Self::Alarm => "Alarm",
            Self::Door => "Door",
            Self::Check => "Check",
            Self::Home => "Home",
            Self::Sleep => "Sleep",
        };
        write!(f, "{}", name)
    }
}

/// A six-axis position in millimetres
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X axis.
    pub x: f64,
    /// Y axis.
    pub y: f64,
    /// Z axis.
    pub z: f64,
    /// A axis (4th).
    pub a: f64,
    /// B axis (5th).
    pub b: f64,
    /// C axis (6th).
    pub c: f64,
}

impl Position {
    /// Component-wise subtraction; used to derive work position from
    /// machine position and the work-coordinate offset.
    pub fn minus(&self, other: &Position) -> Position {
        Position {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
            a: self.a - other.a,
            b: self.b - other.b,
            c: self.c - other.c,
        }
    }
}

/// Named variables consumed by the expression preprocessor
///
/// Missing values coerce to `0`, matching how unresolved identifiers
/// behave inside bracketed expressions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    vars: HashMap<String, f64>,
}

impl ExecutionContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a variable, coercing missing values to zero
    pub fn get(&self, name: &str) -> f64 {
        self.vars.get(name).copied().unwrap_or(0.0)
    }

    /// Whether a variable has been assigned
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Assign a variable
    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.vars.insert(name.into(), value);
    }

    /// Merge another context into this one, overwriting on conflict
    pub fn merge(&mut self, other: &ExecutionContext) {
        for (k, v) in &other.vars {
            self.vars.insert(k.clone(), *v);
        }
    }

    /// Inject live machine and work positions under the standard keys
    /// (`mposx`..`mposc`, `posx`..`posc`).
    pub fn set_positions(&mut self, mpos: &Position, wpos: &Position) {
        self.set("mposx", mpos.x);
        self.set("mposy", mpos.y);
        self.set("mposz", mpos.z);
        self.set("mposa", mpos.a);
        self.set("mposb", mpos.b);
        self.set("mposc", mpos.c);
        self.set("posx", wpos.x);
        self.set("posy", wpos.y);
        self.set("posz", wpos.z);
        self.set("posa", wpos.a);
        self.set("posb", wpos.b);
        self.set("posc", wpos.c);
    }
}

impl FromIterator<(String, f64)> for ExecutionContext {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}
