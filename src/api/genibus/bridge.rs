//! Bridge orchestrator: one synchronous run per external cycle.
//!
//! A run builds a telegram, blocks for its response, demultiplexes it and repeats until no device
//! has anything left to send or the cycle is nearly over. The in-flight round trip is never
//! interrupted.

use serde::Serialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use super::{
    demux::{self, TaskUpdate},
    device::PumpDevice,
    scheduler::{CycleClock, PlannedTelegram, Scheduler},
    task::TaskId,
    traits::UpdateHandler,
    transport::TransportAdapter,
    BridgeHook, CycleTuning,
};
use crate::{
    error::{GenibusError, Result},
    protocol::genibus::{HeadClass, Telegram, BROADCAST_ADDRESS},
};

/// Bridge wide state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeState {
    pub port_name: String,
    pub source_address: u8,
    pub connection_ok: bool,
    pub cycle_id: u64,
}

/// What one run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle_id: u64,
    pub telegrams: usize,
    pub responses: usize,
    pub timeouts: usize,
    pub mismatches: usize,
    pub updates: usize,
    pub elapsed_ms: u64,
}

pub struct GenibusBridge {
    state: BridgeState,
    tuning: CycleTuning,
    devices: Vec<PumpDevice>,
    scheduler: Scheduler,
    transport: TransportAdapter,
    hooks: Vec<Arc<dyn BridgeHook>>,
    handlers: Vec<Arc<dyn UpdateHandler>>,
    epoch: Instant,
}

impl GenibusBridge {
    pub fn new(transport: TransportAdapter, source_address: u8, tuning: CycleTuning) -> Self {
        Self {
            state: BridgeState {
                port_name: transport.port_name().to_string(),
                source_address,
                connection_ok: false,
                cycle_id: 0,
            },
            scheduler: Scheduler::new(source_address, tuning.clone()),
            tuning,
            devices: Vec::new(),
            transport,
            hooks: Vec::new(),
            handlers: Vec::new(),
            epoch: Instant::now(),
        }
    }

    pub fn add_hook(&mut self, hook: Arc<dyn BridgeHook>) {
        self.hooks.push(hook);
    }

    pub fn add_handler(&mut self, handler: Arc<dyn UpdateHandler>) {
        self.handlers.push(handler);
    }

    pub fn state(&self) -> &BridgeState {
        &self.state
    }

    pub fn tuning(&self) -> &CycleTuning {
        &self.tuning
    }

    pub fn devices(&self) -> &[PumpDevice] {
        &self.devices
    }

    pub fn device(&self, id: &str) -> Option<&PumpDevice> {
        self.devices.iter().find(|device| device.id == id)
    }

    /// False once any handler asks to stop.
    pub fn should_continue(&self) -> bool {
        self.handlers.iter().all(|handler| handler.should_continue())
    }

    pub fn register_device(&mut self, device: PumpDevice) -> Result<()> {
        if self.device(&device.id).is_some() {
            return Err(GenibusError::DuplicateDevice(device.id));
        }
        log::info!(
            "Registered device {} at address {} with {} tasks",
            device.id,
            device.address,
            device.tasks.len()
        );
        self.devices.push(device);
        Ok(())
    }

    pub fn unregister_device(&mut self, id: &str) -> Result<PumpDevice> {
        let index = self
            .devices
            .iter()
            .position(|device| device.id == id)
            .ok_or_else(|| GenibusError::UnknownDevice(id.to_string()))?;
        let device = self.devices.remove(index);
        self.scheduler.device_removed(index, self.devices.len());
        log::info!("Unregistered device {}", id);
        Ok(device)
    }

    /// Queue a value for a command (head class 3) or parameter (head class 4/5) task.
    pub fn write(
        &mut self,
        device_id: &str,
        head_class: HeadClass,
        address: u8,
        value: f64,
    ) -> Result<()> {
        let device = self
            .devices
            .iter_mut()
            .find(|device| device.id == device_id)
            .ok_or_else(|| GenibusError::UnknownDevice(device_id.to_string()))?;
        let unknown_task = || GenibusError::UnknownTask {
            device_id: device_id.to_string(),
            head_class: head_class.code(),
            address,
        };
        let index = device
            .index_of(TaskId {
                head_class,
                address,
            })
            .ok_or_else(unknown_task)?;

        device.tasks[index].request_write(value)?;
        if !device.queue.contains(&index) {
            device.queue.push(index);
        }
        log::debug!(
            "Queued write of {} to task {}/{} on device {}",
            value,
            head_class,
            address,
            device_id
        );
        Ok(())
    }

    pub fn open(&mut self) -> Result<()> {
        let result = self.transport.open();
        self.state.connection_ok = result.is_ok();
        result
    }

    pub fn close(&mut self) {
        self.transport.close();
        self.state.connection_ok = false;
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Every device starts over as if it had stopped answering.
    fn force_all_lost(&mut self) {
        for device in &mut self.devices {
            device.mark_lost();
            device.reset();
        }
    }

    /// One run. `start_delay` is how late the trigger fired; it is charged to this cycle's budget.
    pub fn run_cycle(&mut self, start_delay: Duration) -> CycleReport {
        self.state.cycle_id += 1;
        let cycle_id = self.state.cycle_id;
        let cycle_start = self.now_ms().saturating_sub(start_delay.as_millis() as u64);
        let mut report = CycleReport {
            cycle_id,
            ..Default::default()
        };

        if !self.transport.is_open() {
            if let Err(err) = self.open() {
                log::error!("Cannot open {}: {}", self.state.port_name, err);
                return report;
            }
        }
        if self.transport.check_link().is_err() {
            self.force_all_lost();
            self.state.connection_ok = self.transport.is_open();
            if !self.state.connection_ok {
                return report;
            }
        }

        loop {
            let clock = CycleClock {
                cycle_id,
                cycle_start,
                now: self.now_ms(),
            };
            if clock.elapsed() + self.tuning.end_of_cycle_margin_ms >= self.tuning.cycle_time_ms {
                log::debug!("Cycle {} out of time after {} ms", cycle_id, clock.elapsed());
                break;
            }
            let Some(planned) = self.plan(&clock) else {
                break;
            };
            if self.exchange(planned, &clock, &mut report).is_err() {
                break;
            }
        }

        report.elapsed_ms = self.now_ms().saturating_sub(cycle_start);
        log::debug!("{:?}", report);
        report
    }

    /// Ask the scheduler once per device; the first telegram wins.
    fn plan(&mut self, clock: &CycleClock) -> Option<PlannedTelegram> {
        for _ in 0..self.devices.len() {
            if let Some(planned) = self.scheduler.next_telegram(&mut self.devices, clock) {
                return Some(planned);
            }
        }
        None
    }

    fn response_timeout(&self, planned: &PlannedTelegram, elapsed: u64) -> Duration {
        let device = &self.devices[planned.device];
        let timing = device.timing();
        let bytes = planned.telegram.pdu_len()
            + planned.answer_estimate.max(device.last_response_pdu);
        let estimate = timing.empty_telegram_ms() + bytes as f64 * timing.ms_per_byte();

        let slack = self.tuning.timeout_slack_ms as f64;
        let headroom = self.tuning.slack_headroom_ms as f64;
        let remaining = self.tuning.cycle_time_ms.saturating_sub(elapsed) as f64;
        let mut timeout = estimate + slack;
        if remaining > timeout + headroom {
            timeout += slack;
        }
        timeout += self.tuning.protocol_minimum_ms as f64;
        Duration::from_millis(timeout.ceil() as u64)
    }

    fn exchange(
        &mut self,
        planned: PlannedTelegram,
        clock: &CycleClock,
        report: &mut CycleReport,
    ) -> Result<()> {
        let timeout = self.response_timeout(&planned, clock.elapsed());
        let device_id = self.devices[planned.device].id.clone();
        before_request(&self.hooks, &device_id, &planned.telegram);
        report.telegrams += 1;

        let started = Instant::now();
        let outcome = self.transport.send_and_wait(&planned.telegram, timeout);
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let device = &mut self.devices[planned.device];
        match outcome {
            Ok(Some(response)) => {
                if planned.telegram.destination != BROADCAST_ADDRESS {
                    let bytes = planned.telegram.pdu_len() + response.pdu_len();
                    device.timing.record_exchange(bytes, duration_ms);
                }
                match demux::process_response(device, &planned, &response) {
                    Ok(updates) => {
                        device.last_response_pdu = response.pdu_len();
                        report.responses += 1;
                        report.updates += updates.len();
                        after_response(&self.hooks, &device_id, &response);
                        publish(&self.handlers, &updates);
                    }
                    Err(err) => {
                        report.mismatches += 1;
                        on_error(&self.hooks, &device_id, &err);
                    }
                }
                Ok(())
            }
            Ok(None) => {
                log::warn!(
                    "No answer on GENIbus from device {} (address {}) within {} ms",
                    device.id,
                    device.address,
                    timeout.as_millis()
                );
                demux::on_no_response(device);
                report.timeouts += 1;
                let err = GenibusError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                };
                on_error(&self.hooks, &device_id, &err);
                Ok(())
            }
            Err(err) => {
                log::error!("Transport failure on {}: {}", self.state.port_name, err);
                on_error(&self.hooks, &device_id, &err);
                self.transport.close();
                self.force_all_lost();
                self.state.connection_ok = false;
                Err(err)
            }
        }
    }
}

fn before_request(hooks: &[Arc<dyn BridgeHook>], device_id: &str, request: &Telegram) {
    for hook in hooks {
        if let Err(err) = hook.on_before_request(device_id, request) {
            log::warn!("Hook failed before request to {}: {}", device_id, err);
        }
    }
}

fn after_response(hooks: &[Arc<dyn BridgeHook>], device_id: &str, response: &Telegram) {
    for hook in hooks {
        if let Err(err) = hook.on_after_response(device_id, response) {
            log::warn!("Hook failed after response from {}: {}", device_id, err);
        }
    }
}

fn on_error(hooks: &[Arc<dyn BridgeHook>], device_id: &str, error: &GenibusError) {
    for hook in hooks {
        hook.on_error(device_id, error);
    }
}

fn publish(handlers: &[Arc<dyn UpdateHandler>], updates: &[TaskUpdate]) {
    for update in updates {
        for handler in handlers {
            if let Err(err) = handler.handle_update(update) {
                log::warn!("Update handler failed for {}: {}", update.name, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::genibus::{
            device::ConnectionState,
            task::{Priority, Task},
            transport::mock::{MockConnector, MockStream},
        },
        protocol::genibus::{Apdu, Operation},
    };

    /// Answers every GET byte with 0x07.
    fn answering_stream() -> MockStream {
        MockStream::with_responder(|request| {
            let request = Telegram::decode(request).ok()?;
            let apdus = request
                .apdus
                .iter()
                .map(|apdu| Apdu {
                    head_class: apdu.head_class,
                    os_ack: 0,
                    data: match apdu.operation() {
                        Operation::Get => vec![0x07; apdu.data.len()],
                        _ => Vec::new(),
                    },
                })
                .collect();
            let reply = Telegram::reply(request.source, request.destination, apdus);
            reply.encode().ok().map(|bytes| bytes.to_vec())
        })
    }

    fn bridge(stream: &MockStream) -> GenibusBridge {
        let tuning = CycleTuning {
            timeout_slack_ms: 0,
            protocol_minimum_ms: 10,
            ..CycleTuning::default()
        };
        let transport =
            TransportAdapter::new(Box::new(MockConnector::new(stream.clone())), &tuning);
        GenibusBridge::new(transport, 0x01, tuning)
    }

    #[test]
    fn test_registry() {
        let mut bridge = bridge(&MockStream::new());
        bridge.register_device(PumpDevice::new("a", 0x20)).unwrap();
        bridge.register_device(PumpDevice::new("b", 0x21)).unwrap();
        assert!(matches!(
            bridge.register_device(PumpDevice::new("a", 0x22)),
            Err(GenibusError::DuplicateDevice(_))
        ));
        assert_eq!(bridge.unregister_device("a").unwrap().address(), 0x20);
        assert!(matches!(
            bridge.unregister_device("a"),
            Err(GenibusError::UnknownDevice(_))
        ));
        assert_eq!(bridge.devices().len(), 1);
    }

    #[test]
    fn test_write_validation() {
        let mut bridge = bridge(&MockStream::new());
        let device = PumpDevice::new("a", 0x20)
            .with_task(Task::new("stop", HeadClass::Command, 5, 1, Priority::Low).unwrap())
            .with_task(Task::new("h", HeadClass::Measured, 37, 1, Priority::Low).unwrap());
        bridge.register_device(device).unwrap();

        bridge.write("a", HeadClass::Command, 5, 1.0).unwrap();
        assert_eq!(bridge.device("a").unwrap().queued().count(), 1);
        assert!(matches!(
            bridge.write("a", HeadClass::Measured, 37, 1.0),
            Err(GenibusError::ReadOnly { .. })
        ));
        assert!(matches!(
            bridge.write("a", HeadClass::Command, 6, 1.0),
            Err(GenibusError::UnknownTask { .. })
        ));
        assert!(matches!(
            bridge.write("x", HeadClass::Command, 5, 1.0),
            Err(GenibusError::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_timeout_formula() {
        let mut bridge = bridge(&MockStream::new());
        bridge.register_device(PumpDevice::new("a", 0x20)).unwrap();
        let planned = PlannedTelegram {
            device: 0,
            telegram: Telegram::request(0x20, 0x01),
            apdu_tasks: Vec::new(),
            request_budget: 64,
            response_budget: 96,
            request_cost: 0,
            answer_estimate: 10,
        };
        // 40 ms empty + 10 bytes * 2 ms, no slack configured, 10 ms protocol minimum
        assert_eq!(bridge.response_timeout(&planned, 0), Duration::from_millis(70));

        bridge.tuning.timeout_slack_ms = 100;
        assert_eq!(bridge.response_timeout(&planned, 0), Duration::from_millis(270));
        assert_eq!(bridge.response_timeout(&planned, 700), Duration::from_millis(170));
    }

    #[test]
    fn test_unopenable_port_ends_cycle() {
        let stream = MockStream::new();
        stream.set_fail_open(true);
        let mut bridge = bridge(&stream);
        bridge.register_device(PumpDevice::new("a", 0x20)).unwrap();
        let report = bridge.run_cycle(Duration::ZERO);
        assert_eq!(report.telegrams, 0);
        assert!(!bridge.state().connection_ok);
    }

    #[test]
    fn test_silent_device_goes_lost() {
        let stream = MockStream::new();
        let mut bridge = bridge(&stream);
        bridge
            .register_device(
                PumpDevice::new("a", 0x20)
                    .with_task(Task::new("p", HeadClass::Protocol, 3, 1, Priority::High).unwrap()),
            )
            .unwrap();

        let report = bridge.run_cycle(Duration::ZERO);
        assert_eq!(report.telegrams, 1);
        assert_eq!(report.timeouts, 1);
        let device = bridge.device("a").unwrap();
        assert_eq!(device.connection_state(), ConnectionState::Lost);
        assert_eq!(device.timeout_counter(), 1);
    }

    #[test]
    fn test_transport_failure_marks_all_lost_and_reconnects() {
        let stream = answering_stream();
        let mut bridge = bridge(&stream);
        for (id, address) in [("a", 0x20), ("b", 0x21)] {
            let device = PumpDevice::new(id, address)
                .with_task(Task::new("p", HeadClass::Protocol, 3, 1, Priority::High).unwrap());
            bridge.register_device(device).unwrap();
        }

        let report = bridge.run_cycle(Duration::ZERO);
        assert_eq!(report.timeouts, 0);
        assert!(report.responses >= 2);
        assert!(bridge
            .devices()
            .iter()
            .all(|device| device.connection_state() == ConnectionState::Ok));
        assert_eq!(stream.open_count(), 1);

        // the link check fails and reopens, then the first request fails as well
        stream.set_fail_writes(true);
        let report = bridge.run_cycle(Duration::ZERO);
        assert_eq!(report.telegrams, 1);
        assert_eq!(report.responses, 0);
        assert!(!bridge.state().connection_ok);
        assert_eq!(stream.open_count(), 2);
        assert!(bridge
            .devices()
            .iter()
            .all(|device| device.connection_state() == ConnectionState::Lost));

        stream.set_fail_writes(false);
        let report = bridge.run_cycle(Duration::ZERO);
        assert_eq!(stream.open_count(), 3);
        assert!(bridge.state().connection_ok);
        assert!(report.responses >= 2);
        assert!(bridge
            .devices()
            .iter()
            .all(|device| device.connection_state() == ConnectionState::Ok));
    }
}
