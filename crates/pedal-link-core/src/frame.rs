use model::TelemetryRecord;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Telemetry(TelemetryRecord),
    Log(String),
}

/// Routes one trimmed line. Empty lines and lines that start with `{` but
/// do not decode yield `None`: the protocol tolerates corrupted frames.
pub fn classify(line: &str) -> Option<Frame> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.starts_with('{') {
        return match TelemetryRecord::from_json(line) {
            Ok(rec) => Some(Frame::Telemetry(rec)),
            Err(err) => {
                tracing::trace!(%err, line, "dropping malformed telemetry frame");
                None
            }
        };
    }
    Some(Frame::Log(line.to_string()))
}
