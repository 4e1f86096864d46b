//! BLE link to the pedal controller over a UART-style GATT service: the
//! host writes commands to one characteristic and receives the device's
//! text stream as notifications on another.

use anyhow::{anyhow, bail, Context};
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use tracing::{debug, trace};
use uuid::Uuid;

use pedal_link_core::{chunk_channel, ChunkEvent, ChunkTx, Link, LinkError, LinkSink, Transport, TransportKind};

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Host → device commands.
pub const WRITE_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// Device → host telemetry and log text.
pub const NOTIFY_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

#[derive(Clone, Debug)]
pub struct BleConfig {
    /// Advertised local name used as the discovery filter.
    pub device_name: String,
    pub service_uuid: Uuid,
    pub write_uuid: Uuid,
    pub notify_uuid: Uuid,
    pub scan_timeout: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            device_name: "PedalMaster BLE".into(),
            service_uuid: SERVICE_UUID,
            write_uuid: WRITE_UUID,
            notify_uuid: NOTIFY_UUID,
            scan_timeout: Duration::from_secs(5),
        }
    }
}

pub struct BleTransport {
    cfg: BleConfig,
}

impl BleTransport {
    pub fn new(cfg: BleConfig) -> Self { Self { cfg } }

    async fn discover(&self) -> anyhow::Result<(Adapter, Peripheral)> {
        let manager = Manager::new().await.context("bluetooth manager")?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no Bluetooth adapter found"))?;

        debug!(name = %self.cfg.device_name, "scanning");
        adapter
            .start_scan(ScanFilter { services: vec![self.cfg.service_uuid] })
            .await
            .context("start scan")?;
        let found = self.wait_for_device(&adapter).await;
        let _ = adapter.stop_scan().await;
        Ok((adapter, found?))
    }

    async fn wait_for_device(&self, adapter: &Adapter) -> anyhow::Result<Peripheral> {
        let deadline = Instant::now() + self.cfg.scan_timeout;
        loop {
            for p in adapter.peripherals().await.context("list peripherals")? {
                let name = p.properties().await.ok().flatten().and_then(|props| props.local_name);
                if name_matches(name.as_deref(), &self.cfg.device_name) {
                    return Ok(p);
                }
            }
            if Instant::now() >= deadline {
                bail!(
                    "no device named {:?} found within {:?}",
                    self.cfg.device_name,
                    self.cfg.scan_timeout
                );
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn attach(&self, peripheral: &Peripheral) -> anyhow::Result<(Characteristic, Characteristic)> {
        if !peripheral.is_connected().await? {
            peripheral.connect().await.context("connect to GATT server")?;
        }
        peripheral.discover_services().await.context("discover services")?;
        let chars: Vec<Characteristic> = peripheral.characteristics().into_iter().collect();
        let write = find_characteristic(&chars, self.cfg.service_uuid, self.cfg.write_uuid)
            .ok_or_else(|| anyhow!("write characteristic {} missing", self.cfg.write_uuid))?;
        let notify = find_characteristic(&chars, self.cfg.service_uuid, self.cfg.notify_uuid)
            .ok_or_else(|| anyhow!("notify characteristic {} missing", self.cfg.notify_uuid))?;
        if !notify.properties.contains(CharPropFlags::NOTIFY) {
            bail!("characteristic {} does not notify", notify.uuid);
        }
        Ok((write.clone(), notify.clone()))
    }
}

#[async_trait::async_trait]
impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn open(&self) -> Result<Link, LinkError> {
        let connection = |e: anyhow::Error| LinkError::Connection(format!("{e:#}"));
        let (adapter, peripheral) = self.discover().await.map_err(connection)?;
        let device = &peripheral;
        let hang_up = move || async move {
            let _ = device.disconnect().await;
        };
        let (write_char, notify_char) =
            release_on_error(self.attach(device), hang_up()).await.map_err(connection)?;
        let (events, notes) =
            release_on_error(open_streams(&adapter, device, &notify_char), hang_up())
                .await
                .map_err(connection)?;

        let id = peripheral.id();
        let drops = Box::pin(events.filter_map(move |ev| {
            let dropped = matches!(ev, CentralEvent::DeviceDisconnected(ref pid) if *pid == id);
            async move { dropped.then_some(()) }
        }));
        let notes = notes.map(|n| (n.uuid, n.value));

        let (tx, rx) = chunk_channel();
        let shutdown = Arc::new(Notify::new());
        let listener = tokio::spawn(listen(notes, drops, notify_char.uuid, tx, shutdown.clone()));
        debug!(name = %self.cfg.device_name, "ble link open");

        Ok(Link {
            sink: Box::new(BleSink {
                write_type: write_type_for(write_char.properties),
                peripheral,
                write_char,
                notify_char,
                shutdown,
                listener: Mutex::new(Some(listener)),
                closed: AtomicBool::new(false),
            }),
            chunks: rx,
        })
    }
}

type EventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;
type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

async fn open_streams(
    adapter: &Adapter,
    peripheral: &Peripheral,
    notify: &Characteristic,
) -> anyhow::Result<(EventStream, NotificationStream)> {
    let events = adapter.events().await.context("adapter events")?;
    let notes = peripheral.notifications().await.context("notification stream")?;
    peripheral.subscribe(notify).await.context("subscribe")?;
    Ok((events, notes))
}

/// Runs `setup`; if it fails, `release` runs before the error is returned.
async fn release_on_error<T, S, R>(setup: S, release: R) -> anyhow::Result<T>
where
    S: Future<Output = anyhow::Result<T>>,
    R: Future<Output = ()>,
{
    match setup.await {
        Ok(value) => Ok(value),
        Err(e) => {
            release.await;
            Err(e)
        }
    }
}

pub fn name_matches(advertised: Option<&str>, wanted: &str) -> bool {
    advertised.map(str::trim) == Some(wanted.trim())
}

fn find_characteristic(chars: &[Characteristic], service: Uuid, uuid: Uuid) -> Option<&Characteristic> {
    chars.iter().find(|c| c.service_uuid == service && c.uuid == uuid)
}

fn write_type_for(props: CharPropFlags) -> WriteType {
    if props.contains(CharPropFlags::WRITE) {
        WriteType::WithResponse
    } else {
        WriteType::WithoutResponse
    }
}

/// Forwards notifications until shutdown, until the device drops off, or
/// until the notification stream ends.
async fn listen<N, D>(mut notes: N, mut drops: D, notify_uuid: Uuid, tx: ChunkTx, shutdown: Arc<Notify>)
where
    N: Stream<Item = (Uuid, Vec<u8>)> + Unpin,
    D: Stream<Item = ()> + Unpin,
{
    let mut drops_open = true;
    loop {
        tokio::select! {
            _ = shutdown.notified() => return,
            note = notes.next() => match note {
                Some((uuid, value)) if uuid == notify_uuid => {
                    trace!(len = value.len(), "ble chunk");
                    if tx.send(ChunkEvent::Data(Bytes::from(value))).is_err() {
                        return;
                    }
                }
                Some(_) => {}
                None => {
                    let _ = tx.send(ChunkEvent::Closed);
                    return;
                }
            },
            dropped = drops.next(), if drops_open => match dropped {
                Some(()) => {
                    let _ = tx.send(ChunkEvent::Closed);
                    return;
                }
                None => drops_open = false,
            },
        }
    }
}

struct BleSink {
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_char: Characteristic,
    write_type: WriteType,
    shutdown: Arc<Notify>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl LinkSink for BleSink {
    async fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.peripheral
            .write(&self.write_char, bytes, self.write_type)
            .await
            .map_err(|e| LinkError::Write(e.to_string()))
    }

    async fn close(&self) -> Result<(), LinkError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // stop delivering before the link goes away
        self.shutdown.notify_one();
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }
        if let Err(e) = self.peripheral.unsubscribe(&self.notify_char).await {
            debug!(%e, "unsubscribe failed");
        }
        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral
                .disconnect()
                .await
                .context("ble disconnect")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use pedal_link_core::ChunkRx;

    fn drain(rx: &mut ChunkRx) -> Vec<ChunkEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn defaults_describe_the_pedal_service() {
        let cfg = BleConfig::default();
        assert_eq!(cfg.device_name, "PedalMaster BLE");
        assert_eq!(cfg.service_uuid.to_string(), "6e400001-b5a3-f393-e0a9-e50e24dcca9e");
        assert_eq!(cfg.write_uuid.to_string(), "6e400002-b5a3-f393-e0a9-e50e24dcca9e");
        assert_eq!(cfg.notify_uuid.to_string(), "6e400003-b5a3-f393-e0a9-e50e24dcca9e");
    }

    #[test]
    fn discovery_name_filter() {
        assert!(name_matches(Some("PedalMaster BLE"), "PedalMaster BLE"));
        assert!(name_matches(Some("PedalMaster BLE "), "PedalMaster BLE"));
        assert!(!name_matches(Some("PedalMaster"), "PedalMaster BLE"));
        assert!(!name_matches(None, "PedalMaster BLE"));
    }

    #[test]
    fn write_type_prefers_acknowledged_writes() {
        assert!(matches!(
            write_type_for(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
            WriteType::WithResponse
        ));
        assert!(matches!(
            write_type_for(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            WriteType::WithoutResponse
        ));
    }

    #[tokio::test]
    async fn failed_setup_hangs_up() {
        let released = AtomicBool::new(false);
        let out: anyhow::Result<()> = release_on_error(
            async { Err(anyhow!("subscribe refused")) },
            async { released.store(true, Ordering::SeqCst) },
        )
        .await;
        assert!(out.is_err());
        assert!(released.load(Ordering::SeqCst));

        let released = AtomicBool::new(false);
        let out = release_on_error(async { Ok(7) }, async { released.store(true, Ordering::SeqCst) }).await;
        assert_eq!(out.unwrap(), 7);
        assert!(!released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn forwards_notify_characteristic_only() {
        let (note_tx, note_rx) = mpsc::unbounded();
        let (_drop_tx, drop_rx) = mpsc::unbounded::<()>();
        let (tx, mut rx) = chunk_channel();

        note_tx.unbounded_send((NOTIFY_UUID, b"{\"g\":1}\n".to_vec())).unwrap();
        note_tx.unbounded_send((WRITE_UUID, b"echo".to_vec())).unwrap();
        note_tx.unbounded_send((NOTIFY_UUID, b"hi".to_vec())).unwrap();
        drop(note_tx);

        listen(note_rx, drop_rx, NOTIFY_UUID, tx, Arc::new(Notify::new())).await;
        assert_eq!(
            drain(&mut rx),
            vec![
                ChunkEvent::Data(Bytes::from_static(b"{\"g\":1}\n")),
                ChunkEvent::Data(Bytes::from_static(b"hi")),
                ChunkEvent::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn device_drop_ends_the_stream() {
        let (_note_tx, note_rx) = mpsc::unbounded::<(Uuid, Vec<u8>)>();
        let (drop_tx, drop_rx) = mpsc::unbounded();
        let (tx, mut rx) = chunk_channel();
        drop_tx.unbounded_send(()).unwrap();

        listen(note_rx, drop_rx, NOTIFY_UUID, tx, Arc::new(Notify::new())).await;
        assert_eq!(drain(&mut rx), vec![ChunkEvent::Closed]);
    }

    #[tokio::test]
    async fn shutdown_is_silent() {
        let (_note_tx, note_rx) = mpsc::unbounded::<(Uuid, Vec<u8>)>();
        let (_drop_tx, drop_rx) = mpsc::unbounded::<()>();
        let (tx, mut rx) = chunk_channel();
        let shutdown = Arc::new(Notify::new());
        shutdown.notify_one();

        listen(note_rx, drop_rx, NOTIFY_UUID, tx, shutdown).await;
        assert!(drain(&mut rx).is_empty());
    }
}
