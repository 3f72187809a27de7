//! Grbl response line parser
//!
//! Classifies one inbound line (newline already stripped) into a tagged
//! response record: status reports, acknowledgments, errors, alarms,
//! parser state, parameters, feedback, settings, the startup banner, or
//! a raw passthrough. The parser is stateless; every record carries the
//! original line.

use grblhost_core::machine::{MachineState, Position};
use serde::Serialize;
use std::collections::BTreeMap;

/// Tagged response variants
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Response {
    /// Status report (`<Idle|MPos:…|…>`)
    Status(StatusReport),
    /// `ok` acknowledgment
    Ok,
    /// `error:<n>` rejection
    Error {
        /// The numeric error code.
        code: u8,
    },
    /// `ALARM:<n>` or `ALARM:<message>`
    Alarm {
        /// The numeric alarm code, when the report carried one.
        code: Option<u8>,
        /// Raw text after the `ALARM:` prefix.
        text: String,
    },
    /// `[GC:…]` modal parser state
    ParserState(ModalState),
    /// `[G54:…]`, `[TLO:…]`, `[PRB:…]` and friends
    Parameters {
        /// Parameter name (`G54`, `TLO`, `PRB`, …).
        name: String,
        /// Raw value text after the colon.
        value: String,
    },
    /// `[MSG:…]` or other bracketed feedback
    Feedback {
        /// Feedback text without the brackets or `MSG:` prefix.
        text: String,
    },
    /// `$n=value` settings report
    Setting {
        /// Setting number.
        number: u16,
        /// Value text.
        value: String,
    },
    /// `Grbl 1.1f ['$' for help]` startup banner
    Startup {
        /// Firmware version, e.g. `1.1f`.
        version: String,
    },
    /// Anything else
    Other,
}

/// One parsed line together with its original text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseRecord {
    /// The original line, newline stripped.
    pub raw: String,
    /// The classified response.
    pub response: Response,
}

/// Parsed status report fields
///
/// Grbl can be configured (via `$10`) to report `MPos` or `WPos`; the
/// missing coordinate space is derived from `WCO` when possible. Fields
/// the engine does not model are retained verbatim in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// Active machine state.
    pub state: MachineState,
    /// Sub-state code for `Hold:n` / `Door:n` style reports.
    pub sub_state: Option<u8>,
    /// Machine position.
    pub mpos: Option<Position>,
    /// Work position.
    pub wpos: Option<Position>,
    /// Work-coordinate offset.
    pub wco: Option<Position>,
    /// Planner blocks free (first half of `Bf:`).
    pub planner_free: Option<u32>,
    /// Receive-buffer bytes free (`Bf:` second half, or legacy `RX:`).
    pub rx_free: Option<u32>,
    /// Feed rate (`F:` or first half of `FS:`).
    pub feed_rate: Option<f64>,
    /// Spindle speed (second half of `FS:`).
    pub spindle_speed: Option<f64>,
    /// All fields verbatim, keyed by prefix.
    pub fields: BTreeMap<String, String>,
}

/// Modal groups decoded from a `[GC:…]` report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModalState {
    /// Motion mode (`G0`, `G1`, `G2`, `G3`, `G38.2`, `G80`, …).
    pub motion: String,
    /// Work coordinate system (`G54`–`G59`).
    pub wcs: String,
    /// Plane selection (`G17`/`G18`/`G19`).
    pub plane: String,
    /// Units (`G20`/`G21`).
    pub units: String,
    /// Distance mode (`G90`/`G91`).
    pub distance: String,
    /// Feed-rate mode (`G93`/`G94`).
    pub feedrate: String,
    /// Spindle state (`M3`/`M4`/`M5`).
    pub spindle: String,
    /// Coolant state (`M7`/`M8`/`M9`).
    pub coolant: String,
    /// Active tool number.
    pub tool: u32,
    /// Programmed feed rate.
    pub feed: f64,
    /// Programmed spindle speed.
    pub rpm: f64,
}

impl Default for ModalState {
    fn default() -> Self {
        Self {
            motion: "G0".to_string(),
            wcs: "G54".to_string(),
            plane: "G17".to_string(),
            units: "G21".to_string(),
            distance: "G90".to_string(),
            feedrate: "G94".to_string(),
            spindle: "M5".to_string(),
            coolant: "M9".to_string(),
            tool: 0,
            feed: 0.0,
            rpm: 0.0,
        }
    }
}

/// Parse one line into a response record
pub fn parse_line(line: &str) -> ResponseRecord {
    let raw = line.to_string();
    let trimmed = line.trim();
    let response = classify(trimmed);
    ResponseRecord { raw, response }
}

fn classify(line: &str) -> Response {
    if line.starts_with('<') && line.ends_with('>') {
        if let Some(report) = parse_status(&line[1..line.len() - 1]) {
            return Response::Status(report);
        }
        return Response::Other;
    }

    if line == "ok" {
        return Response::Ok;
    }

    if let Some(rest) = line.strip_prefix("error:") {
        if let Ok(code) = rest.trim().parse::<u8>() {
            return Response::Error { code };
        }
        return Response::Other;
    }

    if let Some(rest) = line.strip_prefix("ALARM:") {
        let text = rest.trim().to_string();
        return Response::Alarm {
            code: text.parse::<u8>().ok(),
            text,
        };
    }

    if let Some(inner) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return classify_bracketed(inner);
    }

    if let Some(rest) = line.strip_prefix('$') {
        if let Some((num, value)) = rest.split_once('=') {
            if let Ok(number) = num.trim().parse::<u16>() {
                return Response::Setting {
                    number,
                    value: value.trim().to_string(),
                };
            }
        }
    }

    if let Some(rest) = line.strip_prefix("Grbl ") {
        let token = rest.split_whitespace().next().unwrap_or("");
        let version = token.strip_prefix('v').unwrap_or(token);
        if version
            .chars()
            .next()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false)
        {
            return Response::Startup {
                version: version.to_string(),
            };
        }
    }

    Response::Other
}

/// Parameter report names (`$#` output plus tool-length and probe data)
const PARAMETER_NAMES: [&str; 10] = [
    "G54", "G55", "G56", "G57", "G58", "G59", "G28", "G30", "G92", "TLO",
];

fn classify_bracketed(inner: &str) -> Response {
    if let Some(modals) = inner.strip_prefix("GC:") {
        return Response::ParserState(parse_modal_state(modals));
    }

    if let Some((name, value)) = inner.split_once(':') {
        if PARAMETER_NAMES.contains(&name) || name == "PRB" {
            return Response::Parameters {
                name: name.to_string(),
                value: value.to_string(),
            };
        }
        if name == "MSG" {
            return Response::Feedback {
                text: value.trim().to_string(),
            };
        }
    }

    Response::Feedback {
        text: inner.trim().to_string(),
    }
}

fn parse_modal_state(modals: &str) -> ModalState {
    let mut state = ModalState::default();
    for word in modals.split_whitespace() {
        match word {
            "G0" | "G1" | "G2" | "G3" | "G38.2" | "G38.3" | "G38.4" | "G38.5" | "G80" => {
                state.motion = word.to_string();
            }
            "G54" | "G55" | "G56" | "G57" | "G58" | "G59" => {
                state.wcs = word.to_string();
            }
            "G17" | "G18" | "G19" => {
                state.plane = word.to_string();
            }
            "G20" | "G21" => {
                state.units = word.to_string();
            }
            "G90" | "G91" => {
                state.distance = word.to_string();
            }
            "G93" | "G94" => {
                state.feedrate = word.to_string();
            }
            "M3" | "M4" | "M5" => {
                state.spindle = word.to_string();
            }
            "M7" | "M8" | "M9" => {
                state.coolant = word.to_string();
            }
            _ => {
                if let Some(rest) = word.strip_prefix('T') {
                    if let Ok(tool) = rest.parse::<u32>() {
                        state.tool = tool;
                    }
                } else if let Some(rest) = word.strip_prefix('F') {
                    if let Ok(feed) = rest.parse::<f64>() {
                        state.feed = feed;
                    }
                } else if let Some(rest) = word.strip_prefix('S') {
                    if let Ok(rpm) = rest.parse::<f64>() {
                        state.rpm = rpm;
                    }
                }
            }
        }
    }
    state
}

fn parse_status(body: &str) -> Option<StatusReport> {
    let mut parts = body.split('|');

    let state_token = parts.next()?.trim();
    let (state_name, sub) = match state_token.split_once(':') {
        Some((name, sub)) => (name, sub.parse::<u8>().ok()),
        None => (state_token, None),
    };
    let state = MachineState::parse(state_name)?;

    let mut report = StatusReport {
        state,
        sub_state: sub,
        mpos: None,
        wpos: None,
        wco: None,
        planner_free: None,
        rx_free: None,
        feed_rate: None,
        spindle_speed: None,
        fields: BTreeMap::new(),
    };

    for part in parts {
        let part = part.trim();
        let Some((key, value)) = part.split_once(':') else {
            continue;
        };
        report.fields.insert(key.to_string(), value.to_string());

        match key {
            "MPos" => report.mpos = parse_position(value),
            "WPos" => report.wpos = parse_position(value),
            "WCO" => report.wco = parse_position(value),
            "Bf" => {
                let mut nums = value.split(',');
                report.planner_free = nums.next().and_then(|s| s.trim().parse().ok());
                report.rx_free = nums.next().and_then(|s| s.trim().parse().ok());
            }
            "RX" => report.rx_free = value.trim().parse().ok(),
            "F" => report.feed_rate = value.trim().parse().ok(),
            "FS" => {
                let mut nums = value.split(',');
                report.feed_rate = nums.next().and_then(|s| s.trim().parse().ok());
                report.spindle_speed = nums.next().and_then(|s| s.trim().parse().ok());
            }
            _ => {}
        }
    }

    // Derive the missing coordinate space: WPos = MPos - WCO.
    if report.wpos.is_none() {
        if let (Some(mpos), Some(wco)) = (report.mpos, report.wco) {
            report.wpos = Some(mpos.minus(&wco));
        }
    }

    Some(report)
}

fn parse_position(value: &str) -> Option<Position> {
    let coords: Vec<f64> = value
        .split(',')
        .filter_map(|s| s.trim().parse::<f64>().ok())
        .collect();

    if coords.len() < 3 {
        return None;
    }

    Some(Position {
        x: coords[0],
        y: coords[1],
        z: coords[2],
        a: coords.get(3).copied().unwrap_or(0.0),
        b: coords.get(4).copied().unwrap_or(0.0),
        c: coords.get(5).copied().unwrap_or(0.0),
    })
}
