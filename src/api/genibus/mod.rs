pub mod bridge;
pub mod demux;
pub mod device;
pub mod driver;
pub mod master;
pub mod scheduler;
pub mod task;
pub mod traits;
pub mod transport;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{error::GenibusError, protocol::genibus::Telegram};

pub use bridge::{BridgeState, CycleReport, GenibusBridge};
pub use demux::TaskUpdate;
pub use device::{ConnectionState, PumpDevice, TimingModel};
pub use driver::{CycleDriver, Trigger};
pub use master::{BridgeCommand, GenibusMaster};
pub use scheduler::{CycleClock, PlannedTelegram, Scheduler};
pub use task::{
    InfoData, Priority, Scale, Task, TaskId, TaskKind, TaskValue, MAX_DATA_WIDTH,
};
pub use traits::{FlumeUpdateHandler, LoggingHandler, NoOpHandler, UpdateHandler};
pub use transport::{
    mock::{MockConnector, MockStream},
    serial::SerialConnector,
    ByteStream, Connector, TransportAdapter,
};

/// Timing constants of the cycle loop.
///
/// The defaults are empirically tuned for 9600 baud pumps; they are hardware specific rather than
/// protocol constants, so every one of them can be overridden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CycleTuning {
    /// Length of one external cycle.
    pub cycle_time_ms: u64,
    /// Minimum response time of a device, reserved at the end of every cycle and added to every
    /// timeout.
    pub protocol_minimum_ms: u64,
    /// No new telegram is started once less than this is left in the cycle.
    pub end_of_cycle_margin_ms: u64,
    /// Added to the estimated round trip time when computing the response timeout.
    pub timeout_slack_ms: u64,
    /// A second slack step is added when the cycle still has this much room beyond the timeout.
    pub slack_headroom_ms: u64,
    /// Below this budget scale a device waits for the next cycle instead of sending a short
    /// telegram.
    pub starvation_threshold: f64,
    /// Fewer bytes left in the cycle than this and the device is skipped.
    pub min_telegram_bytes: usize,
    /// How long a device that stopped answering is left alone.
    pub retry_interval_ms: u64,
    /// Consecutive timeouts before that cooldown applies.
    pub retry_limit: u8,
    /// Time allowed for draining stale input before a request.
    pub drain_timeout_ms: u64,
    /// Bus settling delay after a complete response.
    pub settle_delay_ms: u64,
    /// A late cycle trigger still runs when it is at most this late.
    pub catch_up_window_ms: u64,
}

impl Default for CycleTuning {
    fn default() -> Self {
        Self {
            cycle_time_ms: 1000,
            protocol_minimum_ms: 60,
            end_of_cycle_margin_ms: 100,
            timeout_slack_ms: 100,
            slack_headroom_ms: 180,
            starvation_threshold: 0.3,
            min_telegram_bytes: 5,
            retry_interval_ms: 5000,
            retry_limit: 3,
            drain_timeout_ms: 60,
            settle_delay_ms: 3,
            catch_up_window_ms: 250,
        }
    }
}

/// Middleware around every exchange. Hooks run in registration order; a failing hook is logged and
/// the exchange goes on.
pub trait BridgeHook: Send + Sync {
    fn on_before_request(&self, _device_id: &str, _request: &Telegram) -> Result<()> {
        Ok(())
    }
    fn on_after_response(&self, _device_id: &str, _response: &Telegram) -> Result<()> {
        Ok(())
    }
    fn on_error(&self, _device_id: &str, _error: &GenibusError) {}
}

/// Builder for a [`GenibusBridge`] or a threaded [`GenibusMaster`].
///
/// # Example
///
/// ```no_run
/// use genibridge::genibus::{BridgeBuilder, LoggingHandler, PumpDevice, Priority, Task};
/// use genibridge::protocol::genibus::HeadClass;
/// use std::sync::Arc;
///
/// let pump = PumpDevice::new("circulator", 0x20)
///     .with_task(Task::new("h", HeadClass::Measured, 37, 1, Priority::High)?);
///
/// let master = BridgeBuilder::new()
///     .with_port("/dev/ttyUSB0")
///     .with_cycle_time(1000)
///     .add_device(pump)
///     .add_handler(Arc::new(LoggingHandler))
///     .spawn()?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct BridgeBuilder {
    port_name: Option<String>,
    baud_rate: u32,
    source_address: u8,
    tuning: CycleTuning,
    devices: Vec<PumpDevice>,
    hooks: Vec<Arc<dyn BridgeHook>>,
    handlers: Vec<Arc<dyn UpdateHandler>>,
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self {
            port_name: None,
            baud_rate: 9600,
            source_address: crate::protocol::genibus::DEFAULT_SOURCE_ADDRESS,
            tuning: CycleTuning::default(),
            devices: Vec::new(),
            hooks: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Set the serial port name.
    pub fn with_port(mut self, port_name: &str) -> Self {
        self.port_name = Some(port_name.to_string());
        self
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Bus address the bridge sends from.
    pub fn with_source_address(mut self, address: u8) -> Self {
        self.source_address = address;
        self
    }

    pub fn with_tuning(mut self, tuning: CycleTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_cycle_time(mut self, cycle_time_ms: u64) -> Self {
        self.tuning.cycle_time_ms = cycle_time_ms;
        self
    }

    pub fn add_device(mut self, device: PumpDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Add a hook to the middleware chain (can be called multiple times)
    pub fn add_hook(mut self, hook: Arc<dyn BridgeHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Add a handler that receives every decoded value
    pub fn add_handler(mut self, handler: Arc<dyn UpdateHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Build a bridge on the configured serial port. The port is opened on the first cycle.
    pub fn build(self) -> Result<GenibusBridge> {
        let port_name = self
            .port_name
            .clone()
            .ok_or_else(|| anyhow!("Port name is required. Use with_port()"))?;
        let connector = SerialConnector::new(&port_name, self.baud_rate);
        self.build_with_connector(Box::new(connector))
    }

    /// Build a bridge on any byte stream, e.g. a [`MockConnector`] in tests.
    pub fn build_with_connector(self, connector: Box<dyn Connector>) -> Result<GenibusBridge> {
        if self.tuning.cycle_time_ms <= self.tuning.end_of_cycle_margin_ms {
            return Err(anyhow!(
                "Cycle time of {} ms leaves no room after the {} ms end of cycle margin",
                self.tuning.cycle_time_ms,
                self.tuning.end_of_cycle_margin_ms
            ));
        }

        let transport = TransportAdapter::new(connector, &self.tuning);
        let mut bridge = GenibusBridge::new(transport, self.source_address, self.tuning);
        for hook in self.hooks {
            bridge.add_hook(hook);
        }
        for handler in self.handlers {
            bridge.add_handler(handler);
        }
        for device in self.devices {
            bridge
                .register_device(device)
                .map_err(|err| anyhow!("Failed to register device: {err}"))?;
        }
        Ok(bridge)
    }

    /// Build the bridge and run it on its own thread.
    pub fn spawn(self) -> Result<GenibusMaster> {
        let bridge = self.build()?;
        GenibusMaster::spawn(bridge, None)
    }
}
