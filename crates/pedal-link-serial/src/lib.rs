//! USB-serial link to the pedal controller.

use anyhow::Context;
use bytes::Bytes;
use parking_lot::Mutex;
use serialport::{SerialPort, SerialPortType};
use std::{
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use tracing::{debug, trace};

use pedal_link_core::{chunk_channel, ChunkEvent, ChunkTx, Link, LinkError, LinkSink, Transport, TransportKind};

#[derive(Clone, Debug)]
pub struct SerialConfig {
    pub port: String,       // e.g. "/dev/ttyUSB0" or "COM3"
    pub baud_rate: u32,     // firmware runs at 115200
    /// How long one blocking read waits before rechecking for shutdown.
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(50),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSummary {
    pub name: String,
    pub description: String,
}

/// Serial ports the OS currently knows about.
pub fn available_ports() -> Result<Vec<PortSummary>, LinkError> {
    let ports = serialport::available_ports().context("enumerate serial ports")?;
    Ok(ports
        .into_iter()
        .map(|p| PortSummary { description: describe(&p.port_type), name: p.port_name })
        .collect())
}

fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(info) => {
            let product = info.product.as_deref().unwrap_or_default();
            format!("USB {:04x}:{:04x} {}", info.vid, info.pid, product).trim_end().to_string()
        }
        SerialPortType::BluetoothPort => "Bluetooth".into(),
        SerialPortType::PciPort => "PCI".into(),
        SerialPortType::Unknown => "unknown".into(),
    }
}

pub struct SerialTransport {
    cfg: SerialConfig,
}

impl SerialTransport {
    pub fn new(cfg: SerialConfig) -> Self { Self { cfg } }
}

#[async_trait::async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn open(&self) -> Result<Link, LinkError> {
        let cfg = self.cfg.clone();
        let port = tokio::task::spawn_blocking(move || open_port(&cfg))
            .await
            .map_err(|e| LinkError::Connection(e.to_string()))?
            .map_err(|e| LinkError::Connection(format!("{e:#}")))?;
        let reader = port
            .try_clone()
            .map_err(|e| LinkError::Connection(format!("clone {}: {e}", self.cfg.port)))?;

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = chunk_channel();
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("serial-rx {}", self.cfg.port))
            .spawn(move || pump(reader, &thread_stop, &tx))
            .map_err(|e| LinkError::Connection(format!("spawn reader: {e}")))?;
        debug!(port = %self.cfg.port, baud = self.cfg.baud_rate, "serial port open");

        Ok(Link {
            sink: Box::new(SerialSink {
                port: Arc::new(Mutex::new(Some(port))),
                stop,
                reader: Mutex::new(Some(handle)),
            }),
            chunks: rx,
        })
    }
}

fn open_port(cfg: &SerialConfig) -> anyhow::Result<Box<dyn SerialPort>> {
    let mut port = serialport::new(&cfg.port, cfg.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .flow_control(serialport::FlowControl::None)
        .timeout(cfg.read_timeout)
        .open()
        .with_context(|| format!("failed to open serial port {} @ {}", cfg.port, cfg.baud_rate))?;

    // Keep lines low so attaching does not reset the board.
    let _ = port.write_data_terminal_ready(false);
    let _ = port.write_request_to_send(false);
    Ok(port)
}

/// Blocking read loop run on the reader thread. Read timeouts only exist
/// to poll `stop`; a zero-length read or an I/O error means the device is
/// gone.
fn pump<R: Read>(mut reader: R, stop: &AtomicBool, tx: &ChunkTx) {
    let mut buf = [0u8; 1024];
    while !stop.load(Ordering::Acquire) {
        match reader.read(&mut buf) {
            Ok(0) => {
                let _ = tx.send(ChunkEvent::Closed);
                return;
            }
            Ok(n) => {
                trace!(len = n, "serial chunk");
                if tx.send(ChunkEvent::Data(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    return;
                }
            }
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) => continue,
            Err(e) => {
                if !stop.load(Ordering::Acquire) {
                    let _ = tx.send(ChunkEvent::Failed(e.to_string()));
                }
                return;
            }
        }
    }
}

struct SerialSink {
    port: Arc<Mutex<Option<Box<dyn SerialPort>>>>,
    stop: Arc<AtomicBool>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl LinkSink for SerialSink {
    async fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let port = self.port.clone();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut guard = port.lock();
            let Some(port) = guard.as_mut() else {
                return Ok(());
            };
            port.write_all(&bytes)?;
            port.flush()
        })
        .await
        .map_err(|e| LinkError::Write(e.to_string()))?
        .map_err(|e| LinkError::Write(e.to_string()))
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.stop.store(true, Ordering::Release);
        let reader = self.reader.lock().take();
        let port = self.port.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(handle) = reader {
                let _ = handle.join();
            }
            port.lock().take();
        })
        .await
        .context("serial close")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pedal_link_core::ChunkRx;
    use std::collections::VecDeque;

    struct Script(VecDeque<io::Result<Vec<u8>>>);

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    fn drain(rx: &mut ChunkRx) -> Vec<ChunkEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn default_matches_firmware() {
        let cfg = SerialConfig::default();
        assert_eq!(cfg.baud_rate, 115_200);
        assert_eq!(cfg.read_timeout, Duration::from_millis(50));
    }

    #[test]
    fn timeouts_are_skipped_and_eof_is_a_loss() {
        let script = Script(VecDeque::from(vec![
            Ok(b"{\"g\":1".to_vec()),
            Err(io::Error::new(io::ErrorKind::TimedOut, "timeout")),
            Ok(b"}\n".to_vec()),
        ]));
        let (tx, mut rx) = chunk_channel();
        pump(script, &AtomicBool::new(false), &tx);
        assert_eq!(
            drain(&mut rx),
            vec![
                ChunkEvent::Data(Bytes::from_static(b"{\"g\":1")),
                ChunkEvent::Data(Bytes::from_static(b"}\n")),
                ChunkEvent::Closed,
            ]
        );
    }

    #[test]
    fn unplug_error_is_reported() {
        let script = Script(VecDeque::from(vec![Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "device disconnected",
        ))]));
        let (tx, mut rx) = chunk_channel();
        pump(script, &AtomicBool::new(false), &tx);
        assert_eq!(drain(&mut rx), vec![ChunkEvent::Failed("device disconnected".into())]);
    }

    #[test]
    fn stopped_reader_emits_nothing() {
        let script = Script(VecDeque::from(vec![Ok(b"late\n".to_vec())]));
        let (tx, mut rx) = chunk_channel();
        pump(script, &AtomicBool::new(true), &tx);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn closed_sink_swallows_writes() {
        let sink = SerialSink {
            port: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        };
        sink.close().await.unwrap();
        assert!(sink.stop.load(Ordering::Acquire));
        sink.send(b"m\n").await.unwrap();
        sink.close().await.unwrap();
    }
}
