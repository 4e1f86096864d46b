use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Full-scale output of the gas and clutch channels.
pub const GAS_FULL_SCALE: u32 = 4095;
pub const CLUTCH_FULL_SCALE: u32 = 4095;
/// Full-scale output of the load-cell brake channel.
pub const BRAKE_FULL_SCALE: u32 = 16384;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Pedal {
    Gas,
    Brake,
    Clutch,
}

impl Pedal {
    pub const ALL: [Pedal; 3] = [Pedal::Gas, Pedal::Brake, Pedal::Clutch];

    /// Channel letter used in telemetry keys and the `p` field of `setDZ`.
    pub fn wire_code(self) -> char {
        match self {
            Pedal::Gas => 'g',
            Pedal::Brake => 'b',
            Pedal::Clutch => 'c',
        }
    }

    /// Single-character command that starts calibration of this pedal.
    /// The clutch uses `e` because `c` is taken by full calibration.
    pub fn calibration_code(self) -> char {
        match self {
            Pedal::Gas => 'g',
            Pedal::Brake => 'b',
            Pedal::Clutch => 'e',
        }
    }

    pub fn full_scale(self) -> u32 {
        match self {
            Pedal::Gas => GAS_FULL_SCALE,
            Pedal::Brake => BRAKE_FULL_SCALE,
            Pedal::Clutch => CLUTCH_FULL_SCALE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Pedal::Gas => "GAS",
            Pedal::Brake => "BRAKE",
            Pedal::Clutch => "CLUTCH",
        }
    }
}

impl fmt::Display for Pedal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownPedal(pub String);

impl fmt::Display for UnknownPedal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown pedal `{}` (expected gas, brake or clutch)", self.0)
    }
}

impl std::error::Error for UnknownPedal {}

impl FromStr for Pedal {
    type Err = UnknownPedal;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "g" | "gas" | "throttle" => Ok(Pedal::Gas),
            "b" | "brake" => Ok(Pedal::Brake),
            "c" | "clutch" => Ok(Pedal::Clutch),
            _ => Err(UnknownPedal(s.to_string())),
        }
    }
}

/// One decoded device frame. Every field is optional: an absent field
/// means "no update this tick".
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct TelemetryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub g: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<i32>,

    // raw sensor readings before calibration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rg: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cal: Option<CalibrationSnapshot>,
}

impl TelemetryRecord {
    pub fn from_json(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn scaled(&self, pedal: Pedal) -> Option<i32> {
        match pedal {
            Pedal::Gas => self.g,
            Pedal::Brake => self.b,
            Pedal::Clutch => self.c,
        }
    }

    pub fn has_raw(&self) -> bool {
        self.rg.is_some()
    }

    /// A record carrying `cal` marks the end of a calibration sequence.
    pub fn is_calibration(&self) -> bool {
        self.cal.is_some()
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct CalibrationSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gmin: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gmax: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmax: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmin: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmax: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gdzl: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gdzh: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bdzl: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bdzh: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdzl: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdzh: Option<i32>,
}

impl CalibrationSnapshot {
    pub fn deadzone(&self, pedal: Pedal) -> Deadzone {
        let (low, high) = match pedal {
            Pedal::Gas => (self.gdzl, self.gdzh),
            Pedal::Brake => (self.bdzl, self.bdzh),
            Pedal::Clutch => (self.cdzl, self.cdzh),
        };
        Deadzone { low, high }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct Deadzone {
    pub low: Option<i32>,
    pub high: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_state_frame() {
        let rec = TelemetryRecord::from_json(r#"{"g":100,"b":8192,"c":0}"#).unwrap();
        assert_eq!(rec.g, Some(100));
        assert_eq!(rec.b, Some(8192));
        assert_eq!(rec.c, Some(0));
        assert!(rec.cal.is_none());
        assert!(!rec.is_calibration());
    }

    #[test]
    fn decodes_partial_calibration_frame() {
        let rec = TelemetryRecord::from_json(
            r#"{"cal":{"gmin":120,"gmax":3900,"bmax":8192,"cmin":80,"cmax":4000}}"#,
        )
        .unwrap();
        let cal = rec.cal.as_ref().unwrap();
        assert!(rec.is_calibration());
        assert_eq!(cal.gmin, Some(120));
        assert_eq!(cal.bmax, Some(8192.0));
        assert_eq!(cal.deadzone(Pedal::Brake), Deadzone::default());
        assert_eq!(rec.g, None);
    }

    #[test]
    fn decodes_raw_readings_and_deadzones() {
        let rec = TelemetryRecord::from_json(
            r#"{"g":1,"b":2,"c":3,"rg":1500,"rb":20431.7,"rc":900,"cal":{"gdzl":5,"gdzh":10}}"#,
        )
        .unwrap();
        assert!(rec.has_raw());
        assert_eq!(rec.rb, Some(20431.7));
        let dz = rec.cal.unwrap().deadzone(Pedal::Gas);
        assert_eq!(dz.low, Some(5));
        assert_eq!(dz.high, Some(10));
    }

    #[test]
    fn ignores_unknown_fields() {
        let rec = TelemetryRecord::from_json(r#"{"g":7,"fw":"1.2"}"#).unwrap();
        assert_eq!(rec.scaled(Pedal::Gas), Some(7));
    }

    #[test]
    fn rejects_mistyped_fields() {
        assert!(TelemetryRecord::from_json(r#"{"g":"full"}"#).is_err());
    }

    #[test]
    fn pedal_codes() {
        assert_eq!(Pedal::Clutch.wire_code(), 'c');
        assert_eq!(Pedal::Clutch.calibration_code(), 'e');
        assert_eq!(Pedal::Brake.full_scale(), BRAKE_FULL_SCALE);
        assert_eq!("Brake".parse::<Pedal>().unwrap(), Pedal::Brake);
        assert_eq!("g".parse::<Pedal>().unwrap(), Pedal::Gas);
        assert!("handbrake".parse::<Pedal>().is_err());
    }
}
