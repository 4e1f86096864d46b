use model::TelemetryRecord;
use serde::Serialize;

use crate::{calibration::CalibrationPrompt, transport::TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectReason {
    User,
    /// Unplugged, link dropped or the stream failed.
    Lost,
}

/// Everything the console layer observes from the link.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LinkEvent {
    Connected(TransportKind),
    Disconnected(DisconnectReason),
    Telemetry(TelemetryRecord),
    /// A free-text line from the device.
    LogLine(String),
    /// A host-side message; never fed to the calibration prompt watcher.
    Notice(String),
    /// `None` closes the prompt.
    CalibrationPrompt(Option<CalibrationPrompt>),
}

pub type EventTx = crossbeam_channel::Sender<LinkEvent>;
pub type EventRx = crossbeam_channel::Receiver<LinkEvent>;

pub fn channel() -> (EventTx, EventRx) {
    crossbeam_channel::unbounded()
}
