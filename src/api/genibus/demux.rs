//! Response demultiplexer: hands the bytes of a response back to the tasks that asked for them.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{
    device::PumpDevice,
    scheduler::PlannedTelegram,
    task::{InfoData, TaskId, TaskKind, TaskValue},
};
use crate::{
    error::{GenibusError, Mismatch, Result},
    protocol::genibus::{AckCode, Apdu, HeadClass, Operation, Telegram, BROADCAST_ADDRESS},
};

/// Protocol data item 2: the read buffer length a device reports.
const BUFFER_LENGTH_ITEM: u8 = 2;

/// A freshly decoded value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskUpdate {
    pub device_id: String,
    pub head_class: u8,
    pub address: u8,
    pub name: String,
    pub value: TaskValue,
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Check a response against the request that provoked it.
pub fn check_response(request: &Telegram, response: &Telegram) -> Result<(), Mismatch> {
    if request.destination != BROADCAST_ADDRESS && response.source != request.destination {
        return Err(Mismatch::Address {
            expected: request.destination,
            found: response.source,
        });
    }
    if response.apdus.len() != request.apdus.len() {
        return Err(Mismatch::ApduCount {
            expected: request.apdus.len(),
            found: response.apdus.len(),
        });
    }
    for (index, (sent, received)) in request.apdus.iter().zip(&response.apdus).enumerate() {
        if sent.head_class != received.head_class {
            return Err(Mismatch::HeadClass {
                index,
                expected: sent.head_class.code(),
                found: received.head_class.code(),
            });
        }
    }
    Ok(())
}

/// Apply a response to the device and its tasks.
///
/// A mismatching response marks the device lost and resets it. Faulty apdus are logged and skipped.
pub fn process_response(
    device: &mut PumpDevice,
    planned: &PlannedTelegram,
    response: &Telegram,
) -> Result<Vec<TaskUpdate>> {
    if let Err(mismatch) = check_response(&planned.telegram, response) {
        log::warn!(
            "device {} (address {}): {}, resetting",
            device.id,
            device.address,
            mismatch
        );
        device.mark_lost();
        device.reset();
        return Err(GenibusError::ProtocolMismatch(mismatch));
    }
    device.mark_ok();

    let mut updates = Vec::new();
    for ((sent, received), tasks) in planned
        .telegram
        .apdus
        .iter()
        .zip(&response.apdus)
        .zip(&planned.apdu_tasks)
    {
        let ack = received.ack();
        if ack != AckCode::Ok {
            let fault = GenibusError::PartialApdu {
                head_class: received.head_class,
                ack,
            };
            match (ack, received.data.first()) {
                (AckCode::ItemUnknown, Some(item)) => {
                    log::warn!("device {}: {}, first unknown item {}", device.id, fault, item)
                }
                _ => log::warn!("device {}: {}", device.id, fault),
            }
            continue;
        }

        match sent.operation() {
            Operation::Info => walk_info(device, received, tasks),
            Operation::Get => walk_get(device, received, tasks, &mut updates),
            _ => {}
        }
    }
    Ok(updates)
}

/// No answer at all: count the timeout and start over with this device.
pub fn on_no_response(device: &mut PumpDevice) {
    device.mark_timeout();
    device.reset();
}

fn walk_info(device: &mut PumpDevice, apdu: &Apdu, tasks: &[TaskId]) {
    let data = &apdu.data;
    let mut idx = 0;
    for id in tasks {
        let Some(&flag) = data.get(idx) else {
            log::warn!(
                "device {}: INFO apdu for head class {} ended before task {}",
                device.id,
                apdu.head_class,
                id
            );
            return;
        };
        let len = InfoData::len_for_flag(flag);
        let Some(bytes) = data.get(idx..idx + len) else {
            log::warn!(
                "device {}: INFO for task {} cut short, abandoning the rest of the apdu",
                device.id,
                id
            );
            return;
        };
        idx += len;

        let Some(index) = device.index_of(*id) else {
            continue;
        };
        if let Some(info) = InfoData::parse(bytes) {
            log::trace!("device {}: INFO for task {}: {:?}", device.id, id, info);
            device.tasks[index].set_info_fields(info);
        }
    }
}

fn walk_get(
    device: &mut PumpDevice,
    apdu: &Apdu,
    tasks: &[TaskId],
    updates: &mut Vec<TaskUpdate>,
) {
    let data = &apdu.data;
    let mut idx = 0;
    for id in tasks {
        let Some(index) = device.index_of(*id) else {
            continue;
        };
        let task = &mut device.tasks[index];
        let width = match task.kind() {
            TaskKind::Ascii => data.len().saturating_sub(idx),
            _ => task.data_width(),
        };
        if idx + width > data.len() {
            log::warn!(
                "device {}: GET apdu for head class {} ran out of bytes at task {} ({}), \
                 abandoning the rest",
                device.id,
                apdu.head_class,
                id,
                task.name()
            );
            return;
        }

        task.begin_response();
        for &byte in &data[idx..idx + width] {
            task.process_response_byte(byte);
        }
        idx += width;

        let Some(value) = task.end_of_response() else {
            continue;
        };
        log::trace!(
            "device {}: {} ({}) from apdu {:?} = {:?}",
            device.id,
            id,
            task.name(),
            task.apdu_slot(),
            value
        );
        let update = TaskUpdate {
            device_id: device.id.clone(),
            head_class: id.head_class.code(),
            address: id.address,
            name: task.name().to_string(),
            unit: task.unit_label().map(str::to_string),
            value: value.clone(),
            timestamp: Utc::now(),
        };

        if id.head_class == HeadClass::Protocol && id.address == BUFFER_LENGTH_ITEM {
            if let TaskValue::Number(len) = value {
                log::debug!("device {}: reports buffer length {}", device.id, len);
                device.set_read_buffer_len(len as usize);
            }
        }
        updates.push(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::genibus::{
        device::ConnectionState,
        scheduler::{CycleClock, Scheduler},
        task::{Priority, Task},
        CycleTuning,
    };

    fn apdu(head_class: HeadClass, ack: u8, data: &[u8]) -> Apdu {
        Apdu {
            head_class,
            os_ack: ack,
            data: data.to_vec(),
        }
    }

    fn plan(device: PumpDevice) -> (Vec<PumpDevice>, PlannedTelegram) {
        let mut devices = vec![device];
        let mut scheduler = Scheduler::new(0x01, CycleTuning::default());
        let clock = CycleClock {
            cycle_id: 1,
            cycle_start: 0,
            now: 0,
        };
        let planned = scheduler.next_telegram(&mut devices, &clock).unwrap();
        (devices, planned)
    }

    #[test]
    fn test_get_and_ascii_demux() {
        let mut device = PumpDevice::new("pump", 0x20);
        device.add_task(
            Task::new("max_speed", HeadClass::Config, 10, 2, Priority::High)
                .unwrap()
                .with_preset_info(InfoData::parse(&[0x81]).unwrap()),
        );
        device.add_task(Task::new("product", HeadClass::Ascii, 8, 1, Priority::High).unwrap());
        let mut devices = vec![device];

        let mut request = Telegram::request(0x20, 0x01);
        request.apdus.push(apdu(HeadClass::Config, 0, &[10, 11]));
        request.apdus.push(apdu(HeadClass::Ascii, 0, &[8]));
        let planned = PlannedTelegram {
            device: 0,
            telegram: request,
            apdu_tasks: vec![
                vec![TaskId {
                    head_class: HeadClass::Config,
                    address: 10,
                }],
                vec![TaskId {
                    head_class: HeadClass::Ascii,
                    address: 8,
                }],
            ],
            request_budget: 64,
            response_budget: 96,
            request_cost: 0,
            answer_estimate: 0,
        };
        let response = Telegram::reply(
            0x01,
            0x20,
            vec![
                apdu(HeadClass::Config, 0, &[0x01, 0x02]),
                apdu(HeadClass::Ascii, 0, b"MAGNA3 32-100"),
            ],
        );

        let updates = process_response(&mut devices[0], &planned, &response).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].value, TaskValue::Number(258.0));
        assert_eq!(updates[1].value, TaskValue::Text("MAGNA3 32-100".to_string()));
        assert_eq!(devices[0].connection_state(), ConnectionState::Ok);
    }

    #[test]
    fn test_info_walk_mixed_lengths() {
        let mut device = PumpDevice::new("pump", 0x20).with_low_tasks_per_cycle(0);
        device.add_task(Task::new("t_w", HeadClass::Measured, 58, 1, Priority::High).unwrap());
        device.add_task(Task::new("p", HeadClass::Measured, 37, 1, Priority::High).unwrap());
        let (mut devices, planned) = plan(device);
        assert_eq!(planned.telegram.apdus[0].data, vec![58, 37]);

        let response = Telegram::reply(
            0x01,
            0x20,
            vec![apdu(HeadClass::Measured, 0, &[0x82, 20, 0, 254, 0x81])],
        );
        assert!(process_response(&mut devices[0], &planned, &response)
            .unwrap()
            .is_empty());
        let tasks = devices[0].tasks();
        assert_eq!(tasks[0].info().and_then(|info| info.unit_index), Some(20));
        assert_eq!(tasks[1].info().map(|info| info.sif), Some(1));
    }

    #[test]
    fn test_short_apdu_abandons_rest() {
        let mut device = PumpDevice::new("pump", 0x20).with_low_tasks_per_cycle(0);
        device.add_task(Task::new("a", HeadClass::Protocol, 3, 1, Priority::High).unwrap());
        device.add_task(Task::new("b", HeadClass::Protocol, 4, 2, Priority::High).unwrap());
        let (mut devices, planned) = plan(device);

        let response = Telegram::reply(0x01, 0x20, vec![apdu(HeadClass::Protocol, 0, &[7, 1])]);
        let updates = process_response(&mut devices[0], &planned, &response).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].address, 3);
        assert_eq!(updates[0].value, TaskValue::Number(7.0));
    }

    #[test]
    fn test_ack_fault_skips_apdu() {
        let mut device = PumpDevice::new("pump", 0x20).with_low_tasks_per_cycle(0);
        device.add_task(Task::new("a", HeadClass::Protocol, 3, 1, Priority::High).unwrap());
        let (mut devices, planned) = plan(device);

        let response = Telegram::reply(0x01, 0x20, vec![apdu(HeadClass::Protocol, 2, &[3])]);
        let updates = process_response(&mut devices[0], &planned, &response).unwrap();
        assert!(updates.is_empty());
        assert_eq!(devices[0].connection_state(), ConnectionState::Ok);
    }

    #[test]
    fn test_mismatch_resets_device() {
        let mut device = PumpDevice::new("pump", 0x20).with_low_tasks_per_cycle(0);
        device.add_task(Task::new("a", HeadClass::Protocol, 3, 1, Priority::High).unwrap());
        device.add_task(Task::new("b", HeadClass::Measured, 30, 1, Priority::Once).unwrap());
        let (mut devices, planned) = plan(device);

        let wrong_source = Telegram::reply(
            0x01,
            0x21,
            vec![apdu(HeadClass::Protocol, 0, &[1]), apdu(HeadClass::Measured, 0, &[0x81])],
        );
        assert!(matches!(
            process_response(&mut devices[0], &planned, &wrong_source),
            Err(GenibusError::ProtocolMismatch(Mismatch::Address { .. }))
        ));
        assert_eq!(devices[0].connection_state(), ConnectionState::Lost);
        assert!(devices[0].add_all_once);

        let wrong_count = Telegram::reply(0x01, 0x20, vec![apdu(HeadClass::Protocol, 0, &[1])]);
        assert!(matches!(
            check_response(&planned.telegram, &wrong_count),
            Err(Mismatch::ApduCount {
                expected: 2,
                found: 1
            })
        ));

        let swapped = Telegram::reply(
            0x01,
            0x20,
            vec![apdu(HeadClass::Measured, 0, &[0x81]), apdu(HeadClass::Protocol, 0, &[1])],
        );
        assert!(matches!(
            check_response(&planned.telegram, &swapped),
            Err(Mismatch::HeadClass { index: 0, .. })
        ));
    }

    #[test]
    fn test_buffer_length_applied() {
        let mut device = PumpDevice::new("pump", 0x20).with_low_tasks_per_cycle(0);
        device.add_task(Task::new("buf_len", HeadClass::Protocol, 2, 1, Priority::Once).unwrap());
        let (mut devices, planned) = plan(device);

        let response = Telegram::reply(0x01, 0x20, vec![apdu(HeadClass::Protocol, 0, &[150])]);
        process_response(&mut devices[0], &planned, &response).unwrap();
        assert_eq!(devices[0].read_buffer_len(), 150);
        assert_eq!(devices[0].send_buffer_len(), 150);
    }

    #[test]
    fn test_probe_answer_and_broadcast() {
        let probe = Telegram::request(0xC8, 0x00);
        let answer = Telegram::reply(0x00, 0xC8, Vec::new());
        assert_eq!(check_response(&probe, &answer), Ok(()));

        let broadcast = Telegram::request(BROADCAST_ADDRESS, 0x01);
        let from_anyone = Telegram::reply(0x01, 0x31, Vec::new());
        assert_eq!(check_response(&broadcast, &from_anyone), Ok(()));
    }

    #[test]
    fn test_no_response_counts_and_resets() {
        let mut device = PumpDevice::new("pump", 0x20);
        device.queue.push(0);
        device.add_all_once = false;
        on_no_response(&mut device);
        assert_eq!(device.timeout_counter(), 1);
        assert_eq!(device.connection_state(), ConnectionState::Lost);
        assert!(device.queue.is_empty());
        assert!(device.add_all_once);
    }
}
