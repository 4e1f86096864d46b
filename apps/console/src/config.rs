//! Console settings: built-in defaults, then the TOML file, then flags.

use anyhow::Context;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use pedal_link_ble::BleConfig;
use pedal_link_serial::SerialConfig;

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub serial: SerialSection,
    pub ble: BleSection,
    pub display: DisplaySection,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SerialSection {
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BleSection {
    pub device_name: Option<String>,
    pub scan_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DisplaySection {
    pub json: Option<bool>,
}

/// Values given on the command line; `None`/`false` leaves the lower layers alone.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub serial_port: Option<String>,
    pub baud_rate: Option<u32>,
    pub device_name: Option<String>,
    pub json: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub serial: SerialConfig,
    pub ble: BleConfig,
    pub json: bool,
}

impl Settings {
    pub fn resolve(file: FileConfig, flags: &Overrides) -> Self {
        let mut serial = SerialConfig::default();
        if let Some(port) = file.serial.port { serial.port = port; }
        if let Some(baud) = file.serial.baud_rate { serial.baud_rate = baud; }
        if let Some(port) = &flags.serial_port { serial.port = port.clone(); }
        if let Some(baud) = flags.baud_rate { serial.baud_rate = baud; }

        let mut ble = BleConfig::default();
        if let Some(name) = file.ble.device_name { ble.device_name = name; }
        if let Some(secs) = file.ble.scan_timeout_secs { ble.scan_timeout = Duration::from_secs(secs); }
        if let Some(name) = &flags.device_name { ble.device_name = name.clone(); }

        let json = flags.json || file.display.json.unwrap_or(false);
        Self { serial, ble, json }
    }
}

pub fn default_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|dir| dir.join("pedal-console").join("config.toml"))
}

/// An explicit path must exist; the default location is optional.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<FileConfig> {
    if let Some(path) = explicit {
        return read(path);
    }
    match default_path() {
        Some(path) if path.is_file() => read(&path),
        _ => Ok(FileConfig::default()),
    }
}

fn read(path: &Path) -> anyhow::Result<FileConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse(&text).with_context(|| format!("parse {}", path.display()))
}

pub fn parse(text: &str) -> anyhow::Result<FileConfig> {
    Ok(toml::from_str(text)?)
}
