use parking_lot::Mutex;
use serde_json::json;
use std::{sync::Arc, thread};

use model::{Pedal, TelemetryRecord};
use pedal_link_core::{
    CalibrationPrompt, ConnectionStatus, DisconnectReason, EventRx, LinkEvent, TransportKind,
};
use projection::Dashboard;

pub struct ConsoleSession {
    pub inner: Mutex<Inner>,
    json: bool,
}

#[derive(Default)]
pub struct Inner {
    pub dashboard: Dashboard,
    pub link: Option<TransportKind>,
    pub prompt: Option<CalibrationPrompt>,
    // last percentages printed, so steady pedals do not flood the terminal
    shown: Option<[Option<u32>; 3]>,
}

impl ConsoleSession {
    pub fn new(json: bool) -> Self {
        Self { inner: Mutex::new(Inner::default()), json }
    }

    pub fn json(&self) -> bool {
        self.json
    }

    /// Operator-facing text for one line of output.
    pub fn say(&self, text: &str) {
        if self.json {
            println!("{}", json!({ "message": text }));
        } else {
            println!("{text}");
        }
    }

    pub fn error(&self, err: &dyn std::fmt::Display) {
        if self.json {
            println!("{}", json!({ "error": err.to_string() }));
        } else {
            eprintln!("error: {err}");
        }
    }

    pub fn status_report(&self, status: ConnectionStatus) -> String {
        let inner = self.inner.lock();
        if self.json {
            return json!({
                "connection": status,
                "prompt": inner.prompt,
                "dashboard": inner.dashboard.summary(),
            })
            .to_string();
        }
        inner.describe(status)
    }
}

impl Inner {
    /// Folds one event into the dashboard and returns what to print, if anything.
    pub fn feed_event(&mut self, ev: &LinkEvent, json: bool) -> Option<String> {
        match ev {
            LinkEvent::Connected(kind) => {
                self.link = Some(*kind);
                self.dashboard.on_connected();
            }
            LinkEvent::Disconnected(_) => {
                self.link = None;
                self.prompt = None;
                self.shown = None;
                self.dashboard.on_disconnected();
            }
            LinkEvent::Telemetry(rec) => self.dashboard.apply(rec),
            LinkEvent::CalibrationPrompt(prompt) => self.prompt = *prompt,
            LinkEvent::LogLine(_) | LinkEvent::Notice(_) => {}
        }
        if json {
            return serde_json::to_string(ev).ok();
        }
        self.render(ev)
    }

    fn render(&mut self, ev: &LinkEvent) -> Option<String> {
        match ev {
            LinkEvent::Connected(kind) => Some(format!("connected over {kind}")),
            LinkEvent::Disconnected(DisconnectReason::User) => Some("disconnected".into()),
            LinkEvent::Disconnected(DisconnectReason::Lost) => Some("connection lost".into()),
            LinkEvent::LogLine(line) => Some(format!("device: {line}")),
            LinkEvent::Notice(text) => Some(format!("* {text}")),
            LinkEvent::CalibrationPrompt(Some(p)) => {
                Some(format!("[{}] {}  (Enter to continue)", p.title, p.text))
            }
            LinkEvent::CalibrationPrompt(None) => Some("[calibration closed]".into()),
            LinkEvent::Telemetry(rec) if rec.is_calibration() => Some(self.calibration_line()),
            LinkEvent::Telemetry(rec) => self.levels_line(rec),
        }
    }

    fn levels_line(&mut self, rec: &TelemetryRecord) -> Option<String> {
        if rec.g.is_none() && rec.b.is_none() && rec.c.is_none() {
            return None;
        }
        let now = Pedal::ALL.map(|p| self.dashboard.levels.get(p).map(|l| (l * 100.0).round() as u32));
        if self.shown == Some(now) {
            return None;
        }
        self.shown = Some(now);
        let cell = |v: Option<u32>| v.map_or("  --".to_string(), |v| format!("{v:>3}%"));
        Some(format!(
            "GAS {}  BRAKE {}  CLUTCH {}",
            cell(now[0]),
            cell(now[1]),
            cell(now[2])
        ))
    }

    fn calibration_line(&self) -> String {
        let cal = &self.dashboard.calibration;
        let n = |v: Option<i32>| v.map_or("--".to_string(), |v| v.to_string());
        let scale = cal.brake_scale.map_or("--".to_string(), |s| s.to_string());
        format!(
            "calibration: gas {}..{}  brake max {} (scale {})  clutch {}..{}",
            n(cal.gas_min),
            n(cal.gas_max),
            cal.brake_max.map_or("--".to_string(), |b| format!("{b:.0}")),
            scale,
            n(cal.clutch_min),
            n(cal.clutch_max),
        )
    }

    fn describe(&self, status: ConnectionStatus) -> String {
        let conn = match status {
            ConnectionStatus::Disconnected => "disconnected".to_string(),
            ConnectionStatus::Connecting(kind) => format!("connecting over {kind}"),
            ConnectionStatus::Connected(kind) => format!("connected over {kind}"),
        };
        let mut out = vec![format!("link: {conn}")];
        for pedal in Pedal::ALL {
            let level = self.dashboard.levels.get(pedal);
            let pct = level.map_or("--".to_string(), |l| format!("{}%", (l * 100.0).round() as u32));
            let dz = self.dashboard.calibration.deadzone(pedal);
            let bound = |v: Option<i32>| v.map_or("--".to_string(), |v| v.to_string());
            out.push(format!(
                "{:<6} {:>4}  deadzone {}..{}",
                pedal.label(),
                pct,
                bound(dz.low),
                bound(dz.high)
            ));
        }
        let raw = &self.dashboard.raw;
        if raw.gas.is_some() {
            let v = |v: Option<i64>| v.map_or("--".to_string(), |v| v.to_string());
            out.push(format!(
                "raw: gas {} brake {} clutch {}",
                v(raw.gas.map(i64::from)),
                v(raw.brake),
                v(raw.clutch.map(i64::from))
            ));
        }
        out.push(self.calibration_line());
        if let Some(p) = &self.prompt {
            out.push(format!("prompt: [{}] {}", p.title, p.text));
        }
        out.join("\n")
    }
}

/// Drains link events on a plain thread, the way the desktop shell pumped
/// telemetry into its session. Ends when every sender is gone.
pub fn spawn_pump(rx: EventRx, sess: Arc<ConsoleSession>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(ev) = rx.recv() {
            let line = sess.inner.lock().feed_event(&ev, sess.json);
            if let Some(line) = line {
                println!("{line}");
            }
        }
    })
}
