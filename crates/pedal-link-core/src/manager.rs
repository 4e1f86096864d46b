//! Owns the single active link and everything that hangs off it.

use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use model::Pedal;

use crate::{
    calibration::{CalibrationPrompt, CalibrationSession, CalibrationState},
    classify,
    command::{CalibrationTarget, Command, DeadzoneUpdate},
    event::{DisconnectReason, EventTx, LinkEvent},
    transport::{ChunkEvent, ChunkRx, Link, LinkSink, Transport, TransportKind},
    Frame, LineFramer, LinkError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "transport", rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting(TransportKind),
    Connected(TransportKind),
}

struct ActiveSession {
    id: u64,
    kind: TransportKind,
    sink: Arc<dyn LinkSink>,
    reader: Option<JoinHandle<()>>,
}

struct LinkState {
    status: ConnectionStatus,
    session: Option<ActiveSession>,
    calibration: CalibrationSession,
    next_id: u64,
    /// Id reserved by the connect that is still opening, if any.
    pending: Option<u64>,
}

impl LinkState {
    fn is_current(&self, id: u64) -> bool {
        self.session.as_ref().map(|s| s.id) == Some(id)
    }

    fn connected_sink(&self) -> Option<Arc<dyn LinkSink>> {
        match self.status {
            ConnectionStatus::Connected(_) => self.session.as_ref().map(|s| s.sink.clone()),
            _ => None,
        }
    }
}

struct Shared {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    state: Mutex<LinkState>,
    events: EventTx,
}

impl Shared {
    fn emit(&self, event: LinkEvent) {
        // the console may already be gone during shutdown
        let _ = self.events.send(event);
    }

    fn dispatch(&self, st: &mut LinkState, line: &str) {
        match classify(line) {
            None => {}
            Some(Frame::Telemetry(rec)) => {
                let finished = st.calibration.on_record(&rec);
                self.emit(LinkEvent::Telemetry(rec));
                if finished {
                    self.emit(LinkEvent::CalibrationPrompt(None));
                }
            }
            Some(Frame::Log(text)) => {
                let prompt = st.calibration.on_log(&text);
                self.emit(LinkEvent::LogLine(text));
                if let Some(p) = prompt {
                    self.emit(LinkEvent::CalibrationPrompt(Some(p)));
                }
            }
        }
    }

    /// Tears down session `id` after its stream ended on its own.
    async fn lose(&self, id: u64, cause: Option<String>) {
        let failure = cause.map(LinkError::Stream);
        let session = {
            let mut st = self.state.lock();
            if !st.is_current(id) {
                return;
            }
            st.status = ConnectionStatus::Disconnected;
            if st.calibration.reset() {
                self.emit(LinkEvent::CalibrationPrompt(None));
            }
            self.emit(LinkEvent::Disconnected(DisconnectReason::Lost));
            if let Some(err) = &failure {
                self.emit(LinkEvent::Notice(err.to_string()));
            }
            st.session.take()
        };
        match &failure {
            Some(err) => warn!(session = id, %err, "link failed"),
            None => warn!(session = id, "link lost"),
        }
        if let Some(session) = session {
            if let Err(err) = session.sink.close().await {
                debug!(%err, kind = %session.kind, "close after loss failed");
            }
        }
    }
}

async fn read_loop(shared: Arc<Shared>, id: u64, mut chunks: ChunkRx) {
    // one framer per session: nothing buffered survives a reconnect
    let mut framer = LineFramer::new();
    let cause = loop {
        match chunks.recv().await {
            Some(ChunkEvent::Data(bytes)) => {
                let lines = framer.feed(&bytes);
                if lines.is_empty() {
                    continue;
                }
                let mut st = shared.state.lock();
                if !st.is_current(id) {
                    return;
                }
                for line in &lines {
                    shared.dispatch(&mut st, line);
                }
            }
            Some(ChunkEvent::Closed) | None => break None,
            Some(ChunkEvent::Failed(err)) => break Some(err),
        }
    };
    shared.lose(id, cause).await;
}

/// Resets `Connecting` if `connect` bails out or is dropped mid-open.
struct ConnectingGuard<'a> {
    shared: &'a Shared,
    id: u64,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = self.shared.state.lock();
        if st.pending == Some(self.id) {
            st.pending = None;
            st.status = ConnectionStatus::Disconnected;
        }
    }
}

/// Single owner of the device link. Cheap to clone; clones share the link.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(events: EventTx, transports: impl IntoIterator<Item = Arc<dyn Transport>>) -> Self {
        let transports = transports.into_iter().map(|t| (t.kind(), t)).collect();
        Self {
            shared: Arc::new(Shared {
                transports,
                state: Mutex::new(LinkState {
                    status: ConnectionStatus::Disconnected,
                    session: None,
                    calibration: CalibrationSession::new(),
                    next_id: 0,
                    pending: None,
                }),
                events,
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.status(), ConnectionStatus::Connected(_))
    }

    pub fn calibration(&self) -> CalibrationState {
        self.shared.state.lock().calibration.state().clone()
    }

    pub fn prompt(&self) -> Option<CalibrationPrompt> {
        self.shared.state.lock().calibration.prompt()
    }

    /// Opens `kind` and sends the sync request once the link is up.
    /// Rejected without side effects while another link is open or opening.
    /// A `disconnect` issued while the transport is still opening wins: the
    /// fresh link is closed and `LinkError::Cancelled` is returned.
    pub async fn connect(&self, kind: TransportKind) -> Result<(), LinkError> {
        let transport = self
            .shared
            .transports
            .get(&kind)
            .cloned()
            .ok_or(LinkError::Unavailable(kind))?;
        let id = {
            let mut st = self.shared.state.lock();
            if st.status != ConnectionStatus::Disconnected {
                debug!(status = ?st.status, "connect rejected");
                return Err(LinkError::AlreadyConnected);
            }
            st.next_id += 1;
            st.pending = Some(st.next_id);
            st.status = ConnectionStatus::Connecting(kind);
            st.next_id
        };
        let mut guard = ConnectingGuard { shared: &self.shared, id, armed: true };

        debug!(%kind, "opening transport");
        let Link { sink, chunks } = match transport.open().await {
            Ok(link) => link,
            Err(err) => {
                warn!(%kind, %err, "open failed");
                return Err(err);
            }
        };
        let sink: Arc<dyn LinkSink> = Arc::from(sink);
        guard.armed = false;
        let cancelled = {
            let mut st = self.shared.state.lock();
            if st.pending != Some(id) {
                true
            } else {
                st.pending = None;
                let reader = tokio::spawn(read_loop(self.shared.clone(), id, chunks));
                st.session = Some(ActiveSession { id, kind, sink: sink.clone(), reader: Some(reader) });
                st.status = ConnectionStatus::Connected(kind);
                st.calibration.reset();
                self.shared.emit(LinkEvent::Connected(kind));
                info!(%kind, session = id, "connected");
                false
            }
        };
        if cancelled {
            debug!(%kind, session = id, "disconnect arrived while opening");
            if let Err(err) = sink.close().await {
                debug!(%err, "close of cancelled link failed");
            }
            return Err(LinkError::Cancelled);
        }

        if let Err(err) = self.write(sink, Command::Sync).await {
            debug!(%err, "initial sync failed");
        }
        Ok(())
    }

    /// User-initiated teardown. Stops the reader before the handle is
    /// released; no command is sent to the device. While a connect is still
    /// opening, this abandons it instead.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let session = {
            let mut st = self.shared.state.lock();
            if let Some(id) = st.pending.take() {
                st.status = ConnectionStatus::Disconnected;
                info!(session = id, "pending connect abandoned");
                return Ok(());
            }
            let Some(session) = st.session.take() else {
                return Ok(());
            };
            st.status = ConnectionStatus::Disconnected;
            if st.calibration.reset() {
                self.shared.emit(LinkEvent::CalibrationPrompt(None));
            }
            session
        };
        if let Some(reader) = session.reader {
            reader.abort();
            let _ = reader.await;
        }
        let closed = session.sink.close().await;
        self.shared.emit(LinkEvent::Disconnected(DisconnectReason::User));
        info!(kind = %session.kind, session = session.id, "disconnected");
        closed
    }

    /// Fire-and-forget: without an open link this is a silent no-op.
    pub async fn send(&self, cmd: Command) -> Result<(), LinkError> {
        self.send_announced(cmd, None).await
    }

    /// Like `send`, posting `notice` once the write went through.
    async fn send_announced(&self, cmd: Command, notice: Option<&str>) -> Result<(), LinkError> {
        let sink = self.shared.state.lock().connected_sink();
        let Some(sink) = sink else {
            trace!(?cmd, "not connected, command dropped");
            return Ok(());
        };
        self.write(sink, cmd).await?;
        if let Some(text) = notice {
            self.shared.emit(LinkEvent::Notice(text.to_string()));
        }
        Ok(())
    }

    async fn write(&self, sink: Arc<dyn LinkSink>, cmd: Command) -> Result<(), LinkError> {
        let bytes = cmd.encode();
        match sink.send(&bytes).await {
            Ok(()) => {
                trace!(?cmd, len = bytes.len(), "sent");
                Ok(())
            }
            Err(err) => {
                warn!(?cmd, %err, "send failed");
                self.shared.emit(LinkEvent::Notice(err.to_string()));
                Err(err)
            }
        }
    }

    /// Opens the calibration prompt and asks the device to start.
    pub async fn send_calibration(&self, target: CalibrationTarget) -> Result<(), LinkError> {
        let sink = {
            let mut st = self.shared.state.lock();
            let Some(sink) = st.connected_sink() else {
                trace!(%target, "not connected, calibration ignored");
                return Ok(());
            };
            let prompt = st.calibration.begin(target);
            self.shared.emit(LinkEvent::CalibrationPrompt(Some(prompt)));
            sink
        };
        self.shared.emit(LinkEvent::Notice(format!("Starting {target} calibration...")));
        self.write(sink, Command::Calibrate(target)).await
    }

    pub async fn send_diagnostics(&self) -> Result<(), LinkError> {
        self.send_announced(Command::Diagnostics, Some("Requesting hardware diagnostics...")).await
    }

    pub async fn send_sync(&self) -> Result<(), LinkError> {
        self.send(Command::Sync).await
    }

    pub async fn send_reset(&self) -> Result<(), LinkError> {
        self.send_announced(Command::FactoryReset, Some("Factory reset sent")).await
    }

    /// Validates before anything is written; bad input never reaches the wire.
    pub async fn send_deadzone(&self, pedal: Pedal, low: &str, high: &str) -> Result<(), LinkError> {
        let update = DeadzoneUpdate::parse(pedal, low, high)?;
        self.send(Command::SetDeadzone(update)).await
    }

    /// Sends the advance newline. The device decides whether its own step
    /// moves on, so local state is untouched.
    pub async fn confirm_calibration_step(&self) -> Result<(), LinkError> {
        self.send(Command::Advance).await
    }
}
