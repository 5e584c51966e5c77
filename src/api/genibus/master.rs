use anyhow::{anyhow, Result};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use super::{
    bridge::{CycleReport, GenibusBridge},
    demux::TaskUpdate,
    driver::{CycleDriver, Trigger},
    traits::FlumeUpdateHandler,
};
use crate::protocol::genibus::HeadClass;

/// Reports kept for a reader that is not keeping up.
const REPORT_BACKLOG: usize = 64;

/// Commands accepted by a running master.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCommand {
    Write {
        device_id: String,
        head_class: u8,
        address: u8,
        value: f64,
    },
    Stop,
}

/// Handle to a bridge running its cycle loop on a dedicated thread
pub struct GenibusMaster {
    receiver: flume::Receiver<TaskUpdate>,
    reports: flume::Receiver<CycleReport>,
    control_sender: flume::Sender<BridgeCommand>,
    handle: Option<JoinHandle<()>>,
}

impl GenibusMaster {
    /// Move the bridge onto its own thread and start cycling.
    ///
    /// With `max_cycles` set the loop ends by itself after that many runs. Either way it also ends
    /// on [`GenibusMaster::stop`], when this handle is dropped, or when a registered handler asks
    /// to stop.
    pub fn spawn(mut bridge: GenibusBridge, max_cycles: Option<u64>) -> Result<Self> {
        let (handler, receiver) = FlumeUpdateHandler::channel();
        bridge.add_handler(Arc::new(handler));
        let (report_tx, reports) = flume::bounded(REPORT_BACKLOG);
        let (control_sender, control_rx) = flume::unbounded();

        let handle = thread::Builder::new()
            .name("genibus-master".to_string())
            .spawn(move || run_master_loop(bridge, control_rx, report_tx, max_cycles))?;

        Ok(Self {
            receiver,
            reports,
            control_sender,
            handle: Some(handle),
        })
    }

    /// Next decoded value, if one is waiting
    pub fn try_recv(&self) -> Option<TaskUpdate> {
        self.receiver.try_recv().ok()
    }

    /// Receive a decoded value with timeout
    pub fn recv_timeout(&self, timeout: Duration) -> Option<TaskUpdate> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Get the underlying receiver for advanced usage
    pub fn receiver(&self) -> &flume::Receiver<TaskUpdate> {
        &self.receiver
    }

    /// One report per finished cycle. Reports are dropped while the backlog is full.
    pub fn reports(&self) -> &flume::Receiver<CycleReport> {
        &self.reports
    }

    pub fn send_control(&self, command: BridgeCommand) -> Result<()> {
        self.control_sender
            .send(command)
            .map_err(|e| anyhow!("Failed to send control command: {}", e))
    }

    /// Queue a write. It goes out with the next telegram to that device.
    pub fn write(
        &self,
        device_id: &str,
        head_class: HeadClass,
        address: u8,
        value: f64,
    ) -> Result<()> {
        self.send_control(BridgeCommand::Write {
            device_id: device_id.to_string(),
            head_class: head_class.code(),
            address,
            value,
        })
    }

    /// Stop the cycle loop gracefully. A cycle in progress is finished first.
    pub fn stop(&self) -> Result<()> {
        self.send_control(BridgeCommand::Stop)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }

    /// Wait for the loop thread to end.
    pub fn join(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("GENIbus master thread panicked")),
            None => Ok(()),
        }
    }
}

/// Returns false when the loop should end.
fn apply(bridge: &mut GenibusBridge, command: BridgeCommand) -> bool {
    match command {
        BridgeCommand::Write {
            device_id,
            head_class,
            address,
            value,
        } => {
            let head_class = HeadClass::from(head_class);
            if let Err(err) = bridge.write(&device_id, head_class, address, value) {
                log::warn!("Rejected write to {}: {}", device_id, err);
            }
            true
        }
        BridgeCommand::Stop => false,
    }
}

fn run_master_loop(
    mut bridge: GenibusBridge,
    control_rx: flume::Receiver<BridgeCommand>,
    report_tx: flume::Sender<CycleReport>,
    max_cycles: Option<u64>,
) {
    let tuning = bridge.tuning().clone();
    let mut driver = CycleDriver::new(
        Duration::from_millis(tuning.cycle_time_ms),
        Duration::from_millis(tuning.catch_up_window_ms),
        Instant::now(),
    );
    let mut cycles = 0u64;
    log::info!(
        "GENIbus master started on {} with {} device(s), cycle time {} ms",
        bridge.state().port_name,
        bridge.devices().len(),
        tuning.cycle_time_ms
    );

    'cycles: loop {
        loop {
            match control_rx.try_recv() {
                Ok(command) => {
                    if !apply(&mut bridge, command) {
                        break 'cycles;
                    }
                }
                Err(flume::TryRecvError::Empty) => break,
                Err(flume::TryRecvError::Disconnected) => break 'cycles,
            }
        }
        if !bridge.should_continue() {
            log::info!("Update handler requested stop");
            break;
        }

        match driver.poll(Instant::now()) {
            Trigger::Wait(delay) => match control_rx.recv_timeout(delay) {
                Ok(command) => {
                    if !apply(&mut bridge, command) {
                        break;
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => break,
            },
            Trigger::Run { start_delay } => {
                let report = bridge.run_cycle(start_delay);
                if let Err(flume::TrySendError::Full(report)) = report_tx.try_send(report) {
                    log::trace!(
                        "Report backlog full, dropping report of cycle {}",
                        report.cycle_id
                    );
                }
                cycles += 1;
                if max_cycles.is_some_and(|max| cycles >= max) {
                    break;
                }
            }
        }
    }

    bridge.close();
    log::info!(
        "GENIbus master stopped after {} cycle(s), {} trigger(s) skipped",
        cycles,
        driver.skipped()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::genibus::{
            task::{Priority, Task, TaskValue},
            transport::mock::{MockConnector, MockStream},
            BridgeBuilder, PumpDevice,
        },
        protocol::genibus::{Apdu, Operation, Telegram},
    };

    /// Answers every apdu with 0x07 per requested byte.
    fn pump() -> MockStream {
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

    fn bridge(stream: &MockStream) -> Result<GenibusBridge> {
        BridgeBuilder::new()
            .with_cycle_time(200)
            .add_device(
                PumpDevice::new("pump", 0x20)
                    .with_task(Task::new(
                        "unit_family",
                        HeadClass::Protocol,
                        148,
                        1,
                        Priority::High,
                    )?)
                    .with_task(Task::new("start", HeadClass::Command, 6, 1, Priority::Low)?),
            )
            .build_with_connector(Box::new(MockConnector::new(stream.clone())))
    }

    #[test]
    fn test_master_runs_limited_cycles() -> Result<()> {
        let stream = pump();
        let master = GenibusMaster::spawn(bridge(&stream)?, Some(2))?;

        let update = master
            .recv_timeout(Duration::from_secs(2))
            .ok_or_else(|| anyhow!("no update received"))?;
        assert_eq!(update.device_id, "pump");
        assert_eq!(update.address, 148);
        assert_eq!(update.value, TaskValue::Number(7.0));

        let first = master.reports().recv_timeout(Duration::from_secs(2))?;
        assert_eq!(first.cycle_id, 1);
        assert!(first.responses >= 1);
        master.join()?;
        Ok(())
    }

    #[test]
    fn test_master_forwards_writes_and_stops() -> Result<()> {
        let stream = pump();
        let master = GenibusMaster::spawn(bridge(&stream)?, None)?;
        master.reports().recv_timeout(Duration::from_secs(2))?;

        master.write("pump", HeadClass::Command, 6, 1.0)?;
        let sent_command = || {
            stream.written_frames().iter().any(|frame| {
                Telegram::decode(frame).is_ok_and(|telegram| {
                    telegram
                        .apdus
                        .iter()
                        .any(|apdu| apdu.head_class == HeadClass::Command && apdu.data == vec![6])
                })
            })
        };
        for _ in 0..5 {
            if sent_command() {
                break;
            }
            master.reports().recv_timeout(Duration::from_secs(2))?;
        }
        master.stop()?;
        master.join()?;

        assert!(sent_command());
        Ok(())
    }
}
