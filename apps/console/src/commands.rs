// apps/console/src/commands.rs
use std::{future::Future, sync::Arc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use model::{Pedal, UnknownPedal};
use pedal_link_core::{CalibrationTarget, ConnectionManager, LinkError, TransportKind};

use crate::session::ConsoleSession;

pub const HELP: &str = "\
commands:
  connect serial|ble     open a link
  disconnect             close the link
  cal [gas|brake|clutch] start full or single-pedal calibration
  next                   confirm the current calibration step (or press Enter)
  dz <pedal> <low> <high> set a deadzone
  diag                   run device diagnostics
  sync                   request the stored calibration
  reset                  factory reset (asks for confirmation)
  status                 show link and pedal state
  help                   this text
  quit                   disconnect and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Connect(TransportKind),
    Disconnect,
    Calibrate(CalibrationTarget),
    Advance,
    Deadzone { pedal: Pedal, low: String, high: String },
    Diagnostics,
    Sync,
    Reset,
    Status,
    Help,
    Quit,
    /// Empty input line.
    Blank,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command `{0}` (try `help`)")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error(transparent)]
    Pedal(#[from] UnknownPedal),
}

pub fn parse(line: &str) -> Result<Action, ParseError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&head, rest)) = words.split_first() else {
        return Ok(Action::Blank);
    };
    let action = match (head.to_ascii_lowercase().as_str(), rest) {
        ("connect", [kind]) => match kind.to_ascii_lowercase().as_str() {
            "serial" => Action::Connect(TransportKind::Serial),
            "ble" => Action::Connect(TransportKind::Ble),
            _ => return Err(ParseError::Usage("connect serial|ble")),
        },
        ("connect", _) => return Err(ParseError::Usage("connect serial|ble")),
        ("disconnect", []) => Action::Disconnect,
        ("cal", []) => Action::Calibrate(CalibrationTarget::Full),
        ("cal", [pedal]) => Action::Calibrate(CalibrationTarget::Pedal(pedal.parse()?)),
        ("cal", _) => return Err(ParseError::Usage("cal [gas|brake|clutch]")),
        ("next", []) => Action::Advance,
        ("dz", [pedal, low, high]) => Action::Deadzone {
            pedal: pedal.parse()?,
            low: low.to_string(),
            high: high.to_string(),
        },
        ("dz", _) => return Err(ParseError::Usage("dz <gas|brake|clutch> <low> <high>")),
        ("diag", []) => Action::Diagnostics,
        ("sync", []) => Action::Sync,
        ("reset", []) => Action::Reset,
        ("status", []) => Action::Status,
        ("help" | "?", _) => Action::Help,
        ("quit" | "exit", _) => Action::Quit,
        _ => return Err(ParseError::Unknown(line.trim().to_string())),
    };
    Ok(action)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Operator loop state on top of the connection manager.
pub struct Repl {
    manager: ConnectionManager,
    session: Arc<ConsoleSession>,
    confirming_reset: bool,
}

impl Repl {
    pub fn new(manager: ConnectionManager, session: Arc<ConsoleSession>) -> Self {
        Self { manager, session, confirming_reset: false }
    }

    pub async fn handle_line(&mut self, line: &str) -> Flow {
        if std::mem::take(&mut self.confirming_reset) {
            if line.trim().eq_ignore_ascii_case("y") {
                self.report(self.manager.send_reset().await);
            } else {
                self.session.say("reset cancelled");
            }
            return Flow::Continue;
        }

        let action = match parse(line) {
            Ok(action) => action,
            Err(e) => {
                self.session.error(&e);
                return Flow::Continue;
            }
        };
        self.run(action).await
    }

    async fn run(&mut self, action: Action) -> Flow {
        let m = &self.manager;
        let result = match action {
            Action::Blank => {
                // Enter only advances while a prompt is on screen
                if m.prompt().is_none() {
                    return Flow::Continue;
                }
                m.confirm_calibration_step().await
            }
            Action::Advance => m.confirm_calibration_step().await,
            Action::Connect(kind) => m.connect(kind).await,
            Action::Disconnect => m.disconnect().await,
            Action::Calibrate(target) => {
                if !m.is_connected() {
                    self.session.say("not connected");
                    return Flow::Continue;
                }
                m.send_calibration(target).await
            }
            Action::Deadzone { pedal, low, high } => m.send_deadzone(pedal, &low, &high).await,
            Action::Diagnostics => m.send_diagnostics().await,
            Action::Sync => m.send_sync().await,
            Action::Reset => {
                self.confirming_reset = true;
                self.session
                    .say("Factory reset erases the stored calibration. Type y to confirm.");
                return Flow::Continue;
            }
            Action::Status => {
                let report = self.session.status_report(m.status());
                println!("{report}");
                return Flow::Continue;
            }
            Action::Help => {
                self.session.say(HELP);
                return Flow::Continue;
            }
            Action::Quit => {
                self.report(m.disconnect().await);
                return Flow::Quit;
            }
        };
        self.report(result);
        Flow::Continue
    }

    fn report(&self, result: Result<(), LinkError>) {
        match result {
            Err(e) if needs_report(&e) => self.session.error(&e),
            _ => {}
        }
    }

    pub fn confirming_reset(&self) -> bool {
        self.confirming_reset
    }
}

/// Write failures already reach the operator as a link notice.
fn needs_report(err: &LinkError) -> bool {
    !matches!(err, LinkError::Write(_))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Quit,
    EndOfInput,
    Interrupted,
}

/// Feeds operator lines to `repl` until `quit`, end of input, or
/// `interrupt` fires. The interrupt stays live while a command runs.
pub async fn drive<R, I>(repl: &mut Repl, input: R, interrupt: I) -> std::io::Result<Exit>
where
    R: AsyncBufRead + Unpin,
    I: Future<Output = ()>,
{
    tokio::pin!(interrupt);
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut interrupt => return Ok(Exit::Interrupted),
        };
        let Some(line) = line else {
            return Ok(Exit::EndOfInput);
        };
        let flow = tokio::select! {
            flow = repl.handle_line(&line) => flow,
            _ = &mut interrupt => return Ok(Exit::Interrupted),
        };
        if flow == Flow::Quit {
            return Ok(Exit::Quit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pedal_link_core::{chunk_channel, channel, ChunkTx, ConnectionStatus, EventRx, Link, LinkSink, Transport};
    use std::time::Duration;
    use tokio::io::BufReader;

    #[test]
    fn parses_operator_commands() {
        assert_eq!(parse("connect serial"), Ok(Action::Connect(TransportKind::Serial)));
        assert_eq!(parse("  CONNECT BLE "), Ok(Action::Connect(TransportKind::Ble)));
        assert_eq!(parse("cal"), Ok(Action::Calibrate(CalibrationTarget::Full)));
        assert_eq!(
            parse("cal clutch"),
            Ok(Action::Calibrate(CalibrationTarget::Pedal(Pedal::Clutch)))
        );
        assert_eq!(
            parse("dz brake 100 250"),
            Ok(Action::Deadzone { pedal: Pedal::Brake, low: "100".into(), high: "250".into() })
        );
        assert_eq!(parse(""), Ok(Action::Blank));
        assert_eq!(parse("   "), Ok(Action::Blank));
        assert_eq!(parse("quit"), Ok(Action::Quit));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(parse("connect usb"), Err(ParseError::Usage("connect serial|ble")));
        assert_eq!(parse("dz gas 1"), Err(ParseError::Usage("dz <gas|brake|clutch> <low> <high>")));
        assert_eq!(parse("cal wiper"), Err(ParseError::Pedal(UnknownPedal("wiper".into()))));
        assert_eq!(parse("launch"), Err(ParseError::Unknown("launch".into())));
    }

    struct Recorder(Arc<Mutex<Vec<Vec<u8>>>>);

    #[async_trait]
    impl LinkSink for Recorder {
        async fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
            self.0.lock().push(bytes.to_vec());
            Ok(())
        }
        async fn close(&self) -> Result<(), LinkError> {
            Ok(())
        }
    }

    struct Loopback {
        wire: Arc<Mutex<Vec<Vec<u8>>>>,
        // chunk senders held so each link stays up
        held: Mutex<Vec<ChunkTx>>,
        open_delay: Duration,
    }

    #[async_trait]
    impl Transport for Loopback {
        fn kind(&self) -> TransportKind {
            TransportKind::Serial
        }
        async fn open(&self) -> Result<Link, LinkError> {
            tokio::time::sleep(self.open_delay).await;
            let (tx, rx) = chunk_channel();
            self.held.lock().push(tx);
            Ok(Link { sink: Box::new(Recorder(self.wire.clone())), chunks: rx })
        }
    }

    fn repl() -> (Repl, Arc<Mutex<Vec<Vec<u8>>>>, EventRx) {
        slow_repl(Duration::ZERO)
    }

    fn slow_repl(open_delay: Duration) -> (Repl, Arc<Mutex<Vec<Vec<u8>>>>, EventRx) {
        let wire = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = channel();
        let transport: Arc<dyn Transport> = Arc::new(Loopback {
            wire: wire.clone(),
            held: Mutex::new(Vec::new()),
            open_delay,
        });
        let manager = ConnectionManager::new(tx, [transport]);
        (Repl::new(manager, Arc::new(ConsoleSession::new(false))), wire, rx)
    }

    #[tokio::test]
    async fn reset_needs_confirmation() {
        let (mut repl, wire, _events) = repl();
        repl.handle_line("connect serial").await;
        wire.lock().clear();

        repl.handle_line("reset").await;
        assert!(repl.confirming_reset());
        repl.handle_line("n").await;
        assert!(wire.lock().is_empty());

        repl.handle_line("reset").await;
        repl.handle_line("y").await;
        assert_eq!(*wire.lock(), vec![b"r\n".to_vec()]);
    }

    #[tokio::test]
    async fn enter_advances_only_during_calibration() {
        let (mut repl, wire, _events) = repl();
        repl.handle_line("connect serial").await;
        wire.lock().clear();

        repl.handle_line("").await;
        assert!(wire.lock().is_empty());

        repl.handle_line("cal gas").await;
        repl.handle_line("").await;
        assert_eq!(*wire.lock(), vec![b"g\n".to_vec(), b"\n".to_vec()]);
    }

    #[tokio::test]
    async fn quit_closes_the_link() {
        let (mut repl, _wire, _events) = repl();
        repl.handle_line("connect serial").await;
        assert_eq!(repl.handle_line("quit").await, Flow::Quit);
        assert!(!repl.manager.is_connected());
    }

    #[test]
    fn write_failures_are_left_to_the_notice() {
        assert!(!needs_report(&LinkError::Write("broken pipe".into())));
        assert!(needs_report(&LinkError::Connection("port busy".into())));
        assert!(needs_report(&LinkError::AlreadyConnected));
    }

    #[tokio::test]
    async fn interrupt_cuts_a_slow_connect_short() {
        let (mut repl, wire, _events) = slow_repl(Duration::from_secs(5));
        let input = BufReader::new(&b"connect serial\n"[..]);
        let interrupt = tokio::time::sleep(Duration::from_millis(20));

        let exit = tokio::time::timeout(Duration::from_secs(1), drive(&mut repl, input, interrupt))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, Exit::Interrupted);
        assert_eq!(repl.manager.status(), ConnectionStatus::Disconnected);
        assert!(wire.lock().is_empty());
    }

    #[tokio::test]
    async fn drive_stops_at_quit_or_end_of_input() {
        let (mut repl, _wire, _events) = repl();
        let input = BufReader::new(&b"help\nquit\nstatus\n"[..]);
        let exit = drive(&mut repl, input, std::future::pending()).await.unwrap();
        assert_eq!(exit, Exit::Quit);

        let input = BufReader::new(&b"help\n"[..]);
        let exit = drive(&mut repl, input, std::future::pending()).await.unwrap();
        assert_eq!(exit, Exit::EndOfInput);
    }
}
