use bytes::Bytes;
use model::Pedal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::InvalidInputError;

/// Which calibration routine to start on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationTarget {
    Full,
    Pedal(Pedal),
}

impl CalibrationTarget {
    pub fn code(self) -> char {
        match self {
            CalibrationTarget::Full => 'c',
            CalibrationTarget::Pedal(p) => p.calibration_code(),
        }
    }

    /// Title shown on the calibration prompt.
    pub fn title(self) -> &'static str {
        match self {
            CalibrationTarget::Full => "FULL CALIBRATION",
            CalibrationTarget::Pedal(p) => p.label(),
        }
    }
}

impl fmt::Display for CalibrationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// A validated `setDZ` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadzoneUpdate {
    pub pedal: Pedal,
    pub low: u32,
    pub high: u32,
}

impl DeadzoneUpdate {
    pub fn new(pedal: Pedal, low: i64, high: i64) -> Result<Self, InvalidInputError> {
        Ok(Self {
            pedal,
            low: in_range("low", low, pedal.full_scale())?,
            high: in_range("high", high, pedal.full_scale())?,
        })
    }

    /// Parses operator text; anything but a base-10 integer in the
    /// channel's output range is rejected.
    pub fn parse(pedal: Pedal, low: &str, high: &str) -> Result<Self, InvalidInputError> {
        Self::new(pedal, parse_int("low", low)?, parse_int("high", high)?)
    }
}

fn parse_int(field: &'static str, input: &str) -> Result<i64, InvalidInputError> {
    input.trim().parse::<i64>().map_err(|_| InvalidInputError::NotAnInteger {
        field,
        input: input.to_string(),
    })
}

fn in_range(field: &'static str, value: i64, max: u32) -> Result<u32, InvalidInputError> {
    if (0..=max as i64).contains(&value) {
        Ok(value as u32)
    } else {
        Err(InvalidInputError::OutOfRange { field, value, max })
    }
}

#[derive(Serialize)]
struct SetDeadzoneWire {
    cmd: &'static str,
    p: String,
    low: u32,
    high: u32,
}

/// Host → device requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Calibrate(CalibrationTarget),
    Diagnostics,
    /// Asks the device to resend its calibration snapshot.
    Sync,
    FactoryReset,
    /// Confirms the current calibration step.
    Advance,
    SetDeadzone(DeadzoneUpdate),
}

impl Command {
    /// Wire form, always terminated by exactly one `\n`.
    pub fn encode(&self) -> Bytes {
        let line = match self {
            Command::Calibrate(target) => target.code().to_string(),
            Command::Diagnostics => "d".to_string(),
            Command::Sync => "m".to_string(),
            Command::FactoryReset => "r".to_string(),
            Command::Advance => String::new(),
            Command::SetDeadzone(dz) => {
                let wire = SetDeadzoneWire {
                    cmd: "setDZ",
                    p: dz.pedal.wire_code().to_string(),
                    low: dz.low,
                    high: dz.high,
                };
                // a struct of strings and integers cannot fail to serialize
                serde_json::to_string(&wire).unwrap_or_default()
            }
        };
        let mut out = line.into_bytes();
        out.push(b'\n');
        Bytes::from(out)
    }
}
