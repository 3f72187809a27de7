//! Grbl error and alarm code decoding
//!
//! Converts the numeric codes in `error:<n>` and `ALARM:<n>` reports to
//! the human-readable messages published with Grbl v1.1.

/// Decode a Grbl error code to its published message
pub fn decode_error(code: u8) -> Option<&'static str> {
    match code {
        1 => Some("G-code words consist of a letter and a value. Letter was not found."),
        2 => Some("Numeric value format is not valid or missing an expected value."),
        3 => Some("Grbl '$' system command was not recognized or supported."),
        4 => Some("Negative value received for an expected positive value."),
        5 => Some("Homing cycle is not enabled via settings."),
        6 => Some("Minimum step pulse time must be greater than 3usec."),
        7 => Some("EEPROM read failed. Reset and restored to default values."),
        8 => Some("Grbl '$' command cannot be used unless Grbl is IDLE. Ensures smooth operation during a job."),
        9 => Some("G-code locked out during alarm or jog state."),
        10 => Some("Soft limits cannot be enabled without homing also enabled."),
        11 => Some("Max characters per line exceeded. Line was not processed and executed."),
        12 => Some("Grbl '$' setting value exceeds the maximum step rate supported."),
        13 => Some("Safety door detected as opened and door state initiated."),
        14 => Some("Build info or startup line exceeded EEPROM line length limit."),
        15 => Some("Jog target exceeds machine travel. Command ignored."),
        16 => Some("Jog command with no '=' or contains prohibited g-code."),
        17 => Some("Laser mode requires PWM output."),
        20 => Some("Unsupported or invalid g-code command found in block."),
        21 => Some("More than one g-code command from same modal group found in block."),
        22 => Some("Feed rate has not yet been set or is undefined."),
        23 => Some("G-code command in block requires an integer value."),
        24 => Some("Two G-code commands that both require the use of the XYZ axis words were detected in the block."),
        25 => Some("A G-code word was repeated in the block."),
        26 => Some("A G-code command implicitly or explicitly requires XYZ axis words in the block, but none were detected."),
        27 => Some("N line number value is not within the valid range of 1 - 9,999,999."),
        28 => Some("A G-code command was sent, but is missing some required P or L value words in the line."),
        29 => Some("Grbl supports six work coordinate systems G54-G59. G59.1, G59.2, and G59.3 are not supported."),
        30 => Some("The G53 G-code command requires either a G0 seek or G1 feed motion mode to be active. A different motion was active."),
        31 => Some("There are unused axis words in the block and G80 motion mode cancel is active."),
        32 => Some("A G2 or G3 arc was commanded but there are no XYZ axis words in the selected plane to trace the arc."),
        33 => Some("The motion command has an invalid target. G2, G3, and G38.2 generates this error, if the arc is impossible to generate or if the probe target is the current position."),
        34 => Some("A G2 or G3 arc, traced with the radius definition, had a mathematical error when computing its geometry."),
        35 => Some("A G2 or G3 arc, traced with the offset definition, is missing the IJK offset word in the selected plane to trace the arc."),
        36 => Some("There are unused, leftover G-code words that aren't used by any command in the block."),
        37 => Some("The G43.1 dynamic tool length offset command cannot apply an offset to an axis other than its configured axis."),
        38 => Some("Tool number greater than max supported value."),
        _ => None,
    }
}

/// Decode a Grbl alarm code to its published message
pub fn decode_alarm(code: u8) -> Option<&'static str> {
    match code {
        1 => Some("Hard limit triggered. Machine position is likely lost due to sudden and immediate halt. Re-homing is highly recommended."),
        2 => Some("G-code motion target exceeds machine travel. Machine position safely retained. Alarm may be unlocked."),
        3 => Some("Reset while in motion. Grbl cannot guarantee position. Lost steps are likely. Re-homing is highly recommended."),
        4 => Some("Probe fail. The probe is not in the expected initial state before starting probe cycle, where G38.2 and G38.3 is not triggered and G38.4 and G38.5 is triggered."),
        5 => Some("Probe fail. Probe did not contact the workpiece within the programmed travel for G38.2 and G38.4."),
        6 => Some("Homing fail. Reset during active homing cycle."),
        7 => Some("Homing fail. Safety door was opened during active homing cycle."),
        8 => Some("Homing fail. Cycle failed to clear limit switch when pulling off. Try increasing pull-off setting or check wiring."),
        9 => Some("Homing fail. Could not find limit switch within search distance. Defined as 1.5 * max_travel on search and 5 * pulloff on locate phases."),
        _ => None,
    }
}

/// Decorate an error report line for upstream clients,
/// e.g. `error:20 (Unsupported or invalid g-code command found in block.)`
pub fn format_error(code: u8) -> String {
    match decode_error(code) {
        Some(message) => format!("error:{} ({})", code, message),
        None => format!("error:{}", code),
    }
}

/// Decorate an alarm report line for upstream clients,
/// e.g. `ALARM:1 (Hard limit triggered. ...)`
pub fn format_alarm(code: u8) -> String {
    match decode_alarm(code) {
        Some(message) => format!("ALARM:{} ({})", code, message),
        None => format!("ALARM:{}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_error_codes() {
        assert_eq!(
            decode_error(20),
            Some("Unsupported or invalid g-code command found in block.")
        );
        assert_eq!(
            decode_error(9),
            Some("G-code locked out during alarm or jog state.")
        );
        assert!(decode_error(200).is_none());
    }

    #[test]
    fn decodes_known_alarm_codes() {
        assert!(decode_alarm(1).unwrap().contains("Hard limit"));
        assert!(decode_alarm(9).unwrap().contains("limit switch"));
        assert!(decode_alarm(42).is_none());
    }

    #[test]
    fn formats_with_parenthesized_message() {
        assert_eq!(
            format_error(20),
            "error:20 (Unsupported or invalid g-code command found in block.)"
        );
        assert_eq!(format_error(200), "error:200");
        assert!(format_alarm(2).starts_with("ALARM:2 ("));
    }
}
