//! Grbl real-time commands
//!
//! Single-byte commands the device consumes immediately, bypassing its
//! line buffer. They are written as-is, never newline-terminated.

/// Status report query
pub const STATUS_QUERY: u8 = b'?';
/// Feed hold
pub const FEED_HOLD: u8 = b'!';
/// Cycle start / resume
pub const CYCLE_START: u8 = b'~';
/// Soft reset (Ctrl-X)
pub const SOFT_RESET: u8 = 0x18;

/// Feed override: reset to 100%
pub const FEED_OVR_RESET: u8 = 0x90;
/// Feed override: +10%
pub const FEED_OVR_COARSE_PLUS: u8 = 0x91;
/// Feed override: -10%
pub const FEED_OVR_COARSE_MINUS: u8 = 0x92;
/// Feed override: +1%
pub const FEED_OVR_FINE_PLUS: u8 = 0x93;
/// Feed override: -1%
pub const FEED_OVR_FINE_MINUS: u8 = 0x94;

/// Rapid override: 100%
pub const RAPID_OVR_RESET: u8 = 0x95;
/// Rapid override: 50%
pub const RAPID_OVR_MEDIUM: u8 = 0x96;
/// Rapid override: 25%
pub const RAPID_OVR_LOW: u8 = 0x97;

/// Spindle override: reset to 100%
pub const SPINDLE_OVR_RESET: u8 = 0x99;
/// Spindle override: +10%
pub const SPINDLE_OVR_COARSE_PLUS: u8 = 0x9a;
/// Spindle override: -10%
pub const SPINDLE_OVR_COARSE_MINUS: u8 = 0x9b;
/// Spindle override: +1%
pub const SPINDLE_OVR_FINE_PLUS: u8 = 0x9c;
/// Spindle override: -1%
pub const SPINDLE_OVR_FINE_MINUS: u8 = 0x9d;

/// Whether `data` is a single real-time command byte
///
/// Covers the full set: `?`, `!`, `~`, `\x18` and the override bytes
/// `\x90`-`\x97`, `\x99`-`\x9d`. Real-time commands are single raw
/// bytes on the wire and are never newline-terminated.
pub fn is_realtime(data: &str) -> bool {
    let mut chars = data.chars();
    let Some(c) = chars.next() else {
        return false;
    };
    if chars.next().is_some() {
        return false;
    }
    matches!(
        c,
        '?' | '!' | '~' | '\u{18}' | '\u{90}'..='\u{97}' | '\u{99}'..='\u{9d}'
    )
}

/// Map a feed-override step (0 = reset, +-10, +-1) to its command byte
pub fn feed_override_byte(value: i32) -> Option<u8> {
    match value {
        0 => Some(FEED_OVR_RESET),
        10 => Some(FEED_OVR_COARSE_PLUS),
        -10 => Some(FEED_OVR_COARSE_MINUS),
        1 => Some(FEED_OVR_FINE_PLUS),
        -1 => Some(FEED_OVR_FINE_MINUS),
        _ => None,
    }
}

/// Map a spindle-override step (0 = reset, +-10, +-1) to its command byte
pub fn spindle_override_byte(value: i32) -> Option<u8> {
    match value {
        0 => Some(SPINDLE_OVR_RESET),
        10 => Some(SPINDLE_OVR_COARSE_PLUS),
        -10 => Some(SPINDLE_OVR_COARSE_MINUS),
        1 => Some(SPINDLE_OVR_FINE_PLUS),
        -1 => Some(SPINDLE_OVR_FINE_MINUS),
        _ => None,
    }
}

/// Map a rapid-override level (0 = reset, 50, 25) to its command byte
pub fn rapid_override_byte(value: i32) -> Option<u8> {
    match value {
        0 => Some(RAPID_OVR_RESET),
        50 => Some(RAPID_OVR_MEDIUM),
        25 => Some(RAPID_OVR_LOW),
        _ => None,
    }
}
