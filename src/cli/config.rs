use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{
    api::genibus::{CycleTuning, Priority, PumpDevice, Task},
    protocol::genibus::{HeadClass, DEFAULT_SOURCE_ADDRESS},
};

/// One task of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub head_class: u8,
    pub address: u8,
    /// Data bytes of the item (1 for 8 bit values, 2 for 16 bit, ...)
    #[serde(default = "default_width")]
    pub width: u8,
    pub priority: Priority,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Request INFO again after this many values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_refresh_interval: Option<u32>,
}

fn default_width() -> u8 {
    1
}

fn default_multiplier() -> f64 {
    1.0
}

/// One pump on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub address: u8,
    #[serde(default = "default_low_tasks_per_cycle")]
    pub low_tasks_per_cycle: usize,
    /// Known read buffer of the device; the bus default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_buffer_len: Option<usize>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

fn default_low_tasks_per_cycle() -> usize {
    4
}

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeBootConfig {
    pub port_name: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_source_address")]
    pub source_address: u8,
    #[serde(default)]
    pub tuning: CycleTuning,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_source_address() -> u8 {
    DEFAULT_SOURCE_ADDRESS
}

impl BridgeBootConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("Invalid TOML configuration")
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str).context("Invalid JSON configuration")
    }

    /// Read configuration from a file, `.toml` or `.json`
    pub fn from_file(file_path: impl AsRef<Path>) -> Result<Self> {
        let path = file_path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Err(anyhow!(
                "Unsupported configuration format: {} (expected .toml or .json)",
                path.display()
            )),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Convert to a JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Build the device catalog. Task head classes are validated here, before anything touches the
    /// bus.
    pub fn to_devices(&self) -> Result<Vec<PumpDevice>> {
        self.devices
            .iter()
            .map(|device| {
                let mut pump = PumpDevice::new(&device.id, device.address)
                    .with_low_tasks_per_cycle(device.low_tasks_per_cycle);
                if let Some(len) = device.read_buffer_len {
                    pump = pump.with_read_buffer_len(len);
                }
                for task in &device.tasks {
                    let mut built = Task::new(
                        &task.name,
                        HeadClass::from(task.head_class),
                        task.address,
                        task.width,
                        task.priority,
                    )
                    .with_context(|| format!("Device {} task {}", device.id, task.name))?
                    .with_multiplier(task.multiplier);
                    if let Some(interval) = task.info_refresh_interval {
                        built = built.with_info_refresh(interval);
                    }
                    pump.add_task(built);
                }
                Ok(pump)
            })
            .collect()
    }
}
