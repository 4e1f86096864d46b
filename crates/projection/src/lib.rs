use model::*;
use serde::Serialize;
use serde_json::{json, Value};
use std::{collections::VecDeque, fmt};

/// Samples kept per channel by [`SignalHistory`].
pub const HISTORY_LEN: usize = 200;

/// Normalized level of a scaled channel value, clamped to 0..=1.
pub fn level(pedal: Pedal, value: i32) -> f64 {
    (value as f64 / pedal.full_scale() as f64).clamp(0.0, 1.0)
}

/// Whole-number percentage shown next to a pedal bar.
pub fn percent(pedal: Pedal, value: i32) -> u32 {
    (level(pedal, value) * 100.0).round() as u32
}

/// Brake output scale derived from the calibrated maximum force.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "factor", rename_all = "lowercase")]
pub enum BrakeScale {
    Factor(f64),
    /// `bmax` was zero, negative or not a number.
    Undefined,
}

impl BrakeScale {
    pub fn from_bmax(bmax: f64) -> Self {
        if bmax > 0.0 {
            BrakeScale::Factor(BRAKE_FULL_SCALE as f64 / bmax)
        } else {
            BrakeScale::Undefined
        }
    }

    pub fn factor(&self) -> Option<f64> {
        match self {
            BrakeScale::Factor(f) => Some(*f),
            BrakeScale::Undefined => None,
        }
    }
}

impl fmt::Display for BrakeScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrakeScale::Factor(v) => write!(f, "{:.4}", v),
            BrakeScale::Undefined => f.write_str("--"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PedalLevels {
    pub gas: Option<f64>,
    pub brake: Option<f64>,
    pub clutch: Option<f64>,
}

impl PedalLevels {
    pub fn get(&self, pedal: Pedal) -> Option<f64> {
        match pedal {
            Pedal::Gas => self.gas,
            Pedal::Brake => self.brake,
            Pedal::Clutch => self.clutch,
        }
    }

    fn slot(&mut self, pedal: Pedal) -> &mut Option<f64> {
        match pedal {
            Pedal::Gas => &mut self.gas,
            Pedal::Brake => &mut self.brake,
            Pedal::Clutch => &mut self.clutch,
        }
    }

    pub fn apply(&mut self, rec: &TelemetryRecord) {
        for pedal in Pedal::ALL {
            if let Some(v) = rec.scaled(pedal) {
                *self.slot(pedal) = Some(level(pedal, v));
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct RawReadings {
    pub gas: Option<i32>,
    pub brake: Option<i64>,
    pub clutch: Option<i32>,
}

impl RawReadings {
    pub fn apply(&mut self, rec: &TelemetryRecord) {
        if !rec.has_raw() {
            return;
        }
        self.gas = rec.rg;
        self.brake = Some(rec.rb.map(|v| v.round() as i64).unwrap_or(0));
        self.clutch = rec.rc;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CalibrationView {
    pub gas_min: Option<i32>,
    pub gas_max: Option<i32>,
    pub brake_max: Option<f64>,
    pub brake_scale: Option<BrakeScale>,
    pub clutch_min: Option<i32>,
    pub clutch_max: Option<i32>,
    pub deadzones: [(Pedal, Deadzone); 3],
}

impl Default for CalibrationView {
    fn default() -> Self {
        Self {
            gas_min: None,
            gas_max: None,
            brake_max: None,
            brake_scale: None,
            clutch_min: None,
            clutch_max: None,
            deadzones: Pedal::ALL.map(|p| (p, Deadzone::default())),
        }
    }
}

impl CalibrationView {
    /// Merge a snapshot; fields the device left out keep their last value.
    pub fn apply(&mut self, snap: &CalibrationSnapshot) {
        if snap.gmin.is_some() { self.gas_min = snap.gmin; }
        if snap.gmax.is_some() { self.gas_max = snap.gmax; }
        if snap.cmin.is_some() { self.clutch_min = snap.cmin; }
        if snap.cmax.is_some() { self.clutch_max = snap.cmax; }
        if let Some(bmax) = snap.bmax {
            self.brake_max = Some(bmax);
            self.brake_scale = Some(BrakeScale::from_bmax(bmax));
        }
        for (pedal, dz) in self.deadzones.iter_mut() {
            let incoming = snap.deadzone(*pedal);
            if incoming.low.is_some() { dz.low = incoming.low; }
            if incoming.high.is_some() { dz.high = incoming.high; }
        }
    }

    pub fn deadzone(&self, pedal: Pedal) -> Deadzone {
        self.deadzones
            .iter()
            .find(|(p, _)| *p == pedal)
            .map(|(_, dz)| *dz)
            .unwrap_or_default()
    }
}

/// Rolling per-channel history behind the live signal monitor.
#[derive(Clone, Debug)]
pub struct SignalHistory {
    gas: VecDeque<f64>,
    brake: VecDeque<f64>,
    clutch: VecDeque<f64>,
    running: bool,
}

impl Default for SignalHistory {
    fn default() -> Self {
        Self {
            gas: zeros(),
            brake: zeros(),
            clutch: zeros(),
            running: false,
        }
    }
}

fn zeros() -> VecDeque<f64> {
    std::iter::repeat(0.0).take(HISTORY_LEN).collect()
}

impl SignalHistory {
    pub fn start(&mut self) { self.running = true; }
    pub fn stop(&mut self) { self.running = false; }
    pub fn is_running(&self) -> bool { self.running }

    pub fn clear(&mut self) {
        self.gas = zeros();
        self.brake = zeros();
        self.clutch = zeros();
    }

    pub fn push(&mut self, g: i32, b: i32, c: i32) {
        if !self.running {
            return;
        }
        for (buf, v) in [
            (&mut self.gas, level(Pedal::Gas, g)),
            (&mut self.brake, level(Pedal::Brake, b)),
            (&mut self.clutch, level(Pedal::Clutch, c)),
        ] {
            buf.push_back(v);
            if buf.len() > HISTORY_LEN {
                buf.pop_front();
            }
        }
    }

    pub fn channel(&self, pedal: Pedal) -> &VecDeque<f64> {
        match pedal {
            Pedal::Gas => &self.gas,
            Pedal::Brake => &self.brake,
            Pedal::Clutch => &self.clutch,
        }
    }

    pub fn latest(&self, pedal: Pedal) -> f64 {
        self.channel(pedal).back().copied().unwrap_or(0.0)
    }
}

/// Everything the console displays, folded from decoded records.
#[derive(Clone, Debug, Default)]
pub struct Dashboard {
    pub levels: PedalLevels,
    pub raw: RawReadings,
    pub calibration: CalibrationView,
    pub history: SignalHistory,
}

impl Dashboard {
    pub fn apply(&mut self, rec: &TelemetryRecord) {
        self.levels.apply(rec);
        self.raw.apply(rec);
        if rec.has_raw() {
            if let (Some(g), Some(b), Some(c)) = (rec.g, rec.b, rec.c) {
                self.history.push(g, b, c);
            }
        }
        if let Some(cal) = &rec.cal {
            self.calibration.apply(cal);
        }
    }

    pub fn on_connected(&mut self) {
        self.history.start();
    }

    pub fn on_disconnected(&mut self) {
        self.history.stop();
        self.history.clear();
    }

    pub fn summary(&self) -> Value {
        let pct = |p: Pedal| self.levels.get(p).map(|l| (l * 100.0).round() as u32);
        json!({
            "gas_pct": pct(Pedal::Gas),
            "brake_pct": pct(Pedal::Brake),
            "clutch_pct": pct(Pedal::Clutch),
            "raw": self.raw,
            "calibration": self.calibration,
            "brake_scale": self.calibration.brake_scale.map(|s| s.to_string()),
        })
    }
}
