// src/protocol.rs - DexArm ASCII command dialect and acknowledgement discipline
//
// The arm speaks Marlin-flavoured G-code over the serial line: one command
// per CR-terminated line, answered (for most commands) by a line containing
// "ok". Vendor M-codes cover the DexArm extras: homing (M1112), front module
// select (M888), pneumatic control (M1000/M1002/M1003), motor lock (M17/M84),
// encoder readout and replay (M893/M894), and straight-line smoothing (M2000).

use crate::transport::{SerialLink, TransportError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};

pub const ABSOLUTE_MODE: &str = "G90";
pub const RELATIVE_MODE: &str = "G91";
pub const WAIT_MOTION_DONE: &str = "M400";
pub const GO_HOME: &str = "M1112";
pub const SUCTION_ON: &str = "M1000";
pub const SUCTION_RELEASE: &str = "M1002";
pub const SUCTION_PUMP_STOP: &str = "M1003";
pub const MOTORS_OFF: &str = "M84";
pub const MOTORS_ON: &str = "M17";
pub const REPORT_POSITION: &str = "M114";
pub const REPORT_ENCODER: &str = "M893";
pub const STRAIGHT_LINE_MODE: &str = "M2000";

/// Front module slots on the arm's tool carriage.
pub const MODULE_PNEUMATIC: u8 = 2;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no acknowledgement for '{command}' within {timeout_ms}ms")]
    AckTimeout { command: String, timeout_ms: u64 },
    #[error("no encoder report after {attempts} read attempts")]
    EncoderTimeout { attempts: u32 },
    #[error("unparseable position report: '{line}'")]
    MalformedReport { line: String },
}

/// Acknowledgement wait parameters.
///
/// The firmware never replies with an error token, so a lost or garbled
/// command would otherwise hang the exchange forever; the hard deadline turns
/// that hang into a distinct [`ProtocolError::AckTimeout`].
#[derive(Debug, Clone, Copy)]
pub struct AckPolicy {
    pub timeout: Duration,
    pub poll: Duration,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
            Axis::Z => write!(f, "Z"),
        }
    }
}

impl std::str::FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x" => Ok(Axis::X),
            "y" => Ok(Axis::Y),
            "z" => Ok(Axis::Z),
            other => Err(format!("unknown axis '{other}', expected x, y or z")),
        }
    }
}

/// Per-axis values scanned out of an encoder report; axes the arm did not
/// mention stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AxisReadout {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

// --- Command builders ---

/// Absolute straight-line move at the given feedrate.
pub fn move_to(feedrate: u32, x: f64, y: f64, z: f64) -> String {
    format!("G1 F{feedrate} X{x:.2} Y{y:.2} Z{z:.2}")
}

/// Z-only move, X and Y held at their current values.
pub fn move_z(feedrate: u32, z: f64) -> String {
    format!("G1 F{feedrate} Z{z:.2}")
}

/// Single-axis relative move; only meaningful between `G91`/`G90`.
pub fn jog_axis(feedrate: u32, axis: Axis, distance: f64) -> String {
    format!("G1 F{feedrate} {axis}{distance}")
}

pub fn select_module(module: u8) -> String {
    format!("M888 P{module}")
}

// --- Response parsing ---

/// Acknowledgement is any line containing "ok", matched case-insensitively.
pub fn is_ack(line: &str) -> bool {
    line.to_ascii_lowercase().contains("ok")
}

/// Parse an `M114` report: `X:<v> Y:<v> Z:<v> E:<v>`.
pub fn parse_position_report(line: &str) -> Result<(f64, f64, f64), ProtocolError> {
    let mut x = None;
    let mut y = None;
    let mut z = None;
    for token in line.split_whitespace() {
        if let Some((axis, value)) = token.split_once(':') {
            let slot = match axis {
                "X" => &mut x,
                "Y" => &mut y,
                "Z" => &mut z,
                _ => continue,
            };
            if let Ok(v) = value.parse::<f64>() {
                *slot = Some(v);
            }
        }
    }
    match (x, y, z) {
        (Some(x), Some(y), Some(z)) => Ok((x, y, z)),
        _ => Err(ProtocolError::MalformedReport {
            line: line.to_string(),
        }),
    }
}

/// Scan an encoder report (`M894 X<v> Y<v> Z<v>` or bare `X<v> Y<v> Z<v>`)
/// into per-axis values. Axes without a parseable token are left unset.
pub fn parse_encoder_report(line: &str) -> AxisReadout {
    let mut readout = AxisReadout::default();
    let stripped = line.replace("M894", "");
    for token in stripped.split_whitespace() {
        let (axis, rest) = match token.split_at_checked(1) {
            Some(parts) => parts,
            None => continue,
        };
        let Ok(value) = rest.parse::<f64>() else {
            continue;
        };
        match axis {
            "X" => readout.x = Some(value),
            "Y" => readout.y = Some(value),
            "Z" => readout.z = Some(value),
            _ => {}
        }
    }
    readout
}

/// Does this line look like the reply to an `M893` encoder query?
pub fn is_encoder_report(line: &str) -> bool {
    line.contains("M894") || (line.contains('X') && line.contains('Y') && line.contains('Z'))
}

/// Normalize a captured encoder string into a replayable `M894` command:
/// collapse whitespace and prepend the `M894` prefix when the capture lacks
/// one. The token is otherwise replayed verbatim, because it encodes the
/// arm's exact joint configuration.
pub fn normalize_replay(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.starts_with("M894") {
        collapsed
    } else {
        format!("M894 {collapsed}")
    }
}

// --- Exchange discipline ---

/// Send a command and collect response lines until the acknowledgement
/// arrives. Returns every line seen, the ack last; intermediate lines matter
/// for queries like `M114` whose payload may precede the `ok`.
pub async fn exchange(
    link: &mut dyn SerialLink,
    command: &str,
    policy: &AckPolicy,
) -> Result<Vec<String>, ProtocolError> {
    link.write_line(command).await?;
    let deadline = Instant::now() + policy.timeout;
    let mut lines = Vec::new();
    loop {
        // The deadline binds every iteration: a line that keeps producing
        // non-ack chatter must time out just like a silent one.
        if Instant::now() >= deadline {
            return Err(ProtocolError::AckTimeout {
                command: command.to_string(),
                timeout_ms: policy.timeout.as_millis() as u64,
            });
        }
        match link.read_line(policy.poll).await? {
            Some(line) => {
                let done = is_ack(&line);
                lines.push(line);
                if done {
                    return Ok(lines);
                }
            }
            None => sleep(policy.poll).await,
        }
    }
}

/// Send a command and block until it is acknowledged.
pub async fn send(
    link: &mut dyn SerialLink,
    command: &str,
    policy: &AckPolicy,
) -> Result<String, ProtocolError> {
    let mut lines = exchange(link, command, policy).await?;
    // exchange never returns an empty vec on success
    Ok(lines.pop().unwrap_or_default())
}

/// Fire-and-forget send: write the line, then discard any late response so
/// it cannot be mistaken for the reply to a later command.
pub async fn send_unacked(link: &mut dyn SerialLink, command: &str) -> Result<(), ProtocolError> {
    link.write_line(command).await?;
    link.clear_input();
    Ok(())
}
