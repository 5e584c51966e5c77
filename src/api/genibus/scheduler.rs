//! Telegram scheduler.
//!
//! Picks the next device round robin, refills its task queue and greedily packs tasks into one
//! request telegram. Two byte budgets bound the packing: what the device can read (request) and
//! what it can send back (response). Both shrink when the cycle is running out of time.

use super::{
    device::{ConnectionState, PumpDevice},
    task::{Task, TaskId, TaskKind},
    CycleTuning,
};
use crate::protocol::genibus::{
    Apdu, HeadClass, Operation, Telegram, ASCII_APDU_CAP, BROADCAST_ADDRESS, HEADER_AND_CRC,
    INFO_APDU_CAP, MAX_APDU_DATA,
};

/// Where the current cycle stands, in milliseconds of the bridge clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleClock {
    pub cycle_id: u64,
    pub cycle_start: u64,
    pub now: u64,
}

impl CycleClock {
    pub fn elapsed(&self) -> u64 {
        self.now.saturating_sub(self.cycle_start)
    }
}

/// A request ready to go out, with the bookkeeping the demultiplexer needs.
#[derive(Debug, Clone)]
pub struct PlannedTelegram {
    /// Index into the device list.
    pub device: usize,
    pub telegram: Telegram,
    /// Tasks per apdu, in request order.
    pub apdu_tasks: Vec<Vec<TaskId>>,
    pub request_budget: usize,
    pub response_budget: usize,
    /// Sum of the admitted request costs.
    pub request_cost: usize,
    /// Upper estimate of the response pdu.
    pub answer_estimate: usize,
}

impl PlannedTelegram {
    pub fn is_probe(&self) -> bool {
        self.telegram.is_probe()
    }
}

/// How one task would go into the telegram being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    operation: Operation,
    /// Existing apdu to append to, `None` opens a new one.
    slot: Option<usize>,
    cost: usize,
    answer: usize,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    cursor: usize,
    source_address: u8,
    tuning: CycleTuning,
}

impl Scheduler {
    pub fn new(source_address: u8, tuning: CycleTuning) -> Self {
        Self {
            cursor: 0,
            source_address,
            tuning,
        }
    }

    pub fn tuning(&self) -> &CycleTuning {
        &self.tuning
    }

    /// Keep the cursor on the same device after `removed` left the list.
    pub fn device_removed(&mut self, removed: usize, remaining: usize) {
        if self.cursor > removed {
            self.cursor -= 1;
        }
        if remaining == 0 || self.cursor >= remaining {
            self.cursor = 0;
        }
    }

    /// Next device in round robin order that is not cooling down after repeated timeouts.
    pub fn select_device(&mut self, devices: &[PumpDevice], now: u64) -> Option<usize> {
        let count = devices.len();
        for _ in 0..count {
            let index = self.cursor % count;
            self.cursor = (index + 1) % count;

            let device = &devices[index];
            if device.timeout_counter >= self.tuning.retry_limit {
                // a clock that went backwards counts as elapsed
                let cooling = now
                    .checked_sub(device.last_attempt_ms)
                    .is_some_and(|since| since < self.tuning.retry_interval_ms);
                if cooling {
                    continue;
                }
            }
            return Some(index);
        }
        None
    }

    /// Build the next telegram, or `None` when nothing worth sending is left for the selected
    /// device.
    pub fn next_telegram(
        &mut self,
        devices: &mut [PumpDevice],
        clock: &CycleClock,
    ) -> Option<PlannedTelegram> {
        let index = self.select_device(devices, clock.now)?;
        let tuning = self.tuning.clone();
        let device = &mut devices[index];
        device.last_attempt_ms = clock.now;
        let first_service = device.serviced_cycle != Some(clock.cycle_id);

        if device.connection == ConnectionState::Lost {
            if !first_service {
                return None;
            }
            log::debug!(
                "device {} (address {}): connection lost, probing",
                device.id,
                device.address
            );
            device.serviced_cycle = Some(clock.cycle_id);
            device.first_after_loss = true;
            return Some(self.probe(index, device, 0, 0));
        }

        let remaining_ms = tuning
            .cycle_time_ms
            .saturating_sub(tuning.protocol_minimum_ms)
            .saturating_sub(clock.elapsed());
        let cycle_bytes =
            (remaining_ms as f64 / (device.timing.ms_per_byte() * 2.0)).floor() as usize;
        if cycle_bytes < tuning.min_telegram_bytes {
            log::debug!(
                "device {}: {} bytes left in this cycle, not worth a telegram",
                device.id,
                cycle_bytes
            );
            return None;
        }

        let mut request_budget = device.read_buffer_len.saturating_sub(HEADER_AND_CRC);
        let mut response_budget = device.send_buffer_len.saturating_sub(HEADER_AND_CRC);
        if cycle_bytes < request_budget {
            let scale = cycle_bytes as f64 / request_budget as f64;
            if scale < tuning.starvation_threshold && first_service {
                log::debug!(
                    "device {}: budget scaled to {:.2}, waiting for a full telegram",
                    device.id,
                    scale
                );
                self.cursor = index;
                return None;
            }
            request_budget = (request_budget as f64 * scale).floor() as usize;
            response_budget = (response_budget as f64 * scale).floor() as usize;
        }

        refill(device, first_service, request_budget);
        device.serviced_cycle = Some(clock.cycle_id);

        let planned = self.pack(index, device, request_budget, response_budget);
        if planned.is_none() && !device.probe_sent && device.address != BROADCAST_ADDRESS {
            device.probe_sent = true;
            return Some(self.probe(index, device, request_budget, response_budget));
        }
        planned
    }

    fn probe(
        &self,
        index: usize,
        device: &PumpDevice,
        request_budget: usize,
        response_budget: usize,
    ) -> PlannedTelegram {
        PlannedTelegram {
            device: index,
            telegram: Telegram::request(device.address, self.source_address),
            apdu_tasks: Vec::new(),
            request_budget,
            response_budget,
            request_cost: 0,
            answer_estimate: 0,
        }
    }

    fn pack(
        &self,
        index: usize,
        device: &mut PumpDevice,
        request_budget: usize,
        response_budget: usize,
    ) -> Option<PlannedTelegram> {
        let mut planned = PlannedTelegram {
            device: index,
            telegram: Telegram::request(device.address, self.source_address),
            apdu_tasks: Vec::new(),
            request_budget,
            response_budget,
            request_cost: 0,
            answer_estimate: 0,
        };
        let read_buffer_len = device.read_buffer_len;

        let mut pos = 0;
        while pos < device.queue.len() {
            let task_index = device.queue[pos];
            let Some(placement) = place(&device.tasks[task_index], &planned, read_buffer_len)
            else {
                device.queue.remove(pos);
                continue;
            };

            if fits(&planned, placement) {
                admit(device, task_index, pos, placement, &mut planned);
                let (request, response) = remaining(&planned);
                if request == 0 || response == 0 {
                    break;
                }
                continue;
            }

            if device.tasks[task_index].head_class() == HeadClass::Ascii {
                pos += 1;
                continue;
            }

            // one more small task may still fit into what is left
            for ahead in pos + 1..device.queue.len() {
                let candidate = device.queue[ahead];
                let Some(placement) = place(&device.tasks[candidate], &planned, read_buffer_len)
                else {
                    continue;
                };
                if fits(&planned, placement) {
                    admit(device, candidate, ahead, placement, &mut planned);
                    break;
                }
            }
            break;
        }

        if planned.telegram.apdus.is_empty() {
            return None;
        }
        log::debug!(
            "device {}: telegram with {} apdus, request {}/{} bytes, \
             answer estimate {}/{} bytes, {} tasks left",
            device.id,
            planned.telegram.apdus.len(),
            planned.request_cost,
            request_budget,
            planned.answer_estimate,
            response_budget,
            device.queue.len()
        );
        Some(planned)
    }
}

fn remaining(planned: &PlannedTelegram) -> (usize, usize) {
    (
        planned.request_budget - planned.request_cost,
        planned.response_budget - planned.answer_estimate,
    )
}

fn fits(planned: &PlannedTelegram, placement: Placement) -> bool {
    let (request, response) = remaining(planned);
    placement.cost <= request && placement.answer <= response
}

/// Decide the operation of a task and what it would cost. `None` means the task has nothing to do.
fn place(task: &Task, planned: &PlannedTelegram, read_buffer_len: usize) -> Option<Placement> {
    let width = task.data_width();
    let head_class = task.head_class();

    let (operation, need) = match task.kind() {
        TaskKind::Protocol => (Operation::Get, width),
        TaskKind::Measured if !task.info_available() => (Operation::Info, 1),
        TaskKind::Measured => (Operation::Get, width),
        TaskKind::Command { pending: true } => (Operation::Set, task.write_payload().len()),
        TaskKind::Command { pending: false } => return None,
        TaskKind::Parameter { .. } if !task.info_available() => (Operation::Info, 1),
        TaskKind::Parameter {
            execute_get: true, ..
        } => (Operation::Get, width),
        TaskKind::Parameter {
            pending_write: Some(_),
            ..
        } => (Operation::Set, task.write_payload().len()),
        TaskKind::Parameter { .. } => return None,
        TaskKind::Ascii => {
            let cost = read_buffer_len
                .saturating_sub(HEADER_AND_CRC)
                .min(ASCII_APDU_CAP);
            return Some(Placement {
                operation: Operation::Get,
                slot: None,
                cost,
                answer: 30,
            });
        }
    };

    let cap = if operation == Operation::Info {
        INFO_APDU_CAP
    } else {
        MAX_APDU_DATA
    };
    if need > cap {
        log::warn!(
            "task {} ({}): {} bytes never fit a {:?} apdu, skipped",
            task.id(),
            task.name(),
            need,
            operation
        );
        return None;
    }
    let slot = planned
        .telegram
        .apdus
        .iter()
        .rposition(|apdu| apdu.head_class == head_class && apdu.operation() == operation)
        .filter(|&slot| planned.telegram.apdus[slot].len() + need <= cap);
    let header = if slot.is_some() { 0 } else { 2 };

    let answer = match operation {
        Operation::Info => 4 + header,
        Operation::Set => header,
        _ => need + header,
    };
    Some(Placement {
        operation,
        slot,
        cost: need + header,
        answer,
    })
}

/// Write the task into the telegram and charge both budgets.
fn admit(
    device: &mut PumpDevice,
    task_index: usize,
    pos: usize,
    placement: Placement,
    planned: &mut PlannedTelegram,
) {
    let task = &mut device.tasks[task_index];
    let slot = match placement.slot {
        Some(slot) => slot,
        None => {
            planned
                .telegram
                .apdus
                .push(Apdu::request(task.head_class(), placement.operation));
            planned.apdu_tasks.push(Vec::new());
            planned.telegram.apdus.len() - 1
        }
    };

    let apdu = &mut planned.telegram.apdus[slot];
    match placement.operation {
        Operation::Info => apdu.push(task.address()),
        Operation::Set => {
            apdu.data.extend(task.write_payload());
            task.clear_pending_write();
        }
        _ => apdu.data.extend(task.get_payload()),
    }
    task.set_apdu_slot(Some(slot));
    planned.apdu_tasks[slot].push(task.id());
    planned.request_cost += placement.cost;
    planned.answer_estimate += placement.answer;

    log::trace!(
        "admitted task {} ({}) as {:?} into apdu {}",
        task.id(),
        task.name(),
        placement.operation,
        slot
    );

    // a parameter read stays queued so it can go out as SET on its next visit
    if placement.operation == Operation::Get && matches!(task.kind(), TaskKind::Parameter { .. }) {
        task.set_execute_get(false);
    } else {
        device.queue.remove(pos);
    }
}

/// Refill the queue of a device according to the priority policy.
///
/// On the first service of a cycle (or after a lost connection came back) HIGH tasks, ONCE tasks
/// whose INFO has arrived, all ONCE tasks after a reset, and a share of LOW tasks are queued. A
/// later service in the same cycle that finds the queue empty tops it up with LOW tasks once.
pub fn refill(device: &mut PumpDevice, first_service: bool, telegram_budget: usize) {
    let n_low = device.low.len();
    let low_to_add = if n_low == 0 {
        0
    } else {
        device.low_tasks_per_cycle.clamp(1, n_low)
    };

    if first_service || device.first_after_loss {
        device.all_low_added = false;
        device.first_after_loss = false;
        device.probe_sent = false;

        if device.queue.len() > device.high.len() + low_to_add {
            return;
        }

        for i in 0..device.high.len() {
            let index = device.high[i];
            if !device.queue.contains(&index) {
                device.queue.push(index);
            }
        }

        let mut waiting = Vec::new();
        for index in std::mem::take(&mut device.once_with_info) {
            if device.tasks[index].info_available() {
                device.queue.push(index);
            } else {
                waiting.push(index);
            }
        }
        device.once_with_info = waiting;

        if device.add_all_once {
            device.add_all_once = false;
            for i in 0..device.once.len() {
                let index = device.once[i];
                device.queue.push(index);
                if matches!(
                    device.tasks[index].kind(),
                    TaskKind::Measured | TaskKind::Parameter { .. }
                ) {
                    device.once_with_info.push(index);
                }
            }
        }

        for _ in 0..low_to_add {
            let Some(index) = device.fill_queue.pop_front().or_else(|| device.next_low()) else {
                break;
            };
            if !device.queue.contains(&index) {
                device.queue.push(index);
            }
        }
        return;
    }

    if !device.queue.is_empty() || device.all_low_added {
        return;
    }
    device.all_low_added = true;

    let wanted = n_low - low_to_add;
    while device.fill_queue.len() < wanted {
        let Some(index) = device.next_low() else {
            break;
        };
        device.fill_queue.push_back(index);
    }

    let count = device.fill_queue.len().min(telegram_budget.saturating_sub(2));
    for _ in 0..count {
        if let Some(index) = device.fill_queue.pop_front() {
            device.queue.push(index);
        }
    }
}
