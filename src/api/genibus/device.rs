use std::collections::VecDeque;

use num_enum::FromPrimitive;

use super::task::{Priority, Task, TaskId};
use crate::protocol::genibus::HeadClass;

/// Read buffer every GENIbus device guarantees.
pub const DEFAULT_READ_BUFFER_LEN: usize = 70;
/// Send buffer every GENIbus device guarantees.
pub const DEFAULT_SEND_BUFFER_LEN: usize = 102;

const MS_PER_BYTE_SAMPLES: usize = 7;
const EMPTY_TELEGRAM_SAMPLES: usize = 5;
const DEFAULT_MS_PER_BYTE: f64 = 2.0;
const DEFAULT_EMPTY_TELEGRAM_MS: f64 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    Ok = 0,
    Lost = 1,
    #[num_enum(catch_all)]
    Undefined(u8),
}

impl ConnectionState {
    pub fn code(self) -> u8 {
        match self {
            ConnectionState::Ok => 0,
            ConnectionState::Lost => 1,
            ConnectionState::Undefined(code) => code,
        }
    }
}

/// Running estimate of how long the bus takes per byte and for an empty round trip.
#[derive(Debug, Clone)]
pub struct TimingModel {
    ms_per_byte: [f64; MS_PER_BYTE_SAMPLES],
    ms_per_byte_next: usize,
    empty_telegram: [f64; EMPTY_TELEGRAM_SAMPLES],
    empty_telegram_next: usize,
}

impl Default for TimingModel {
    fn default() -> Self {
        Self {
            ms_per_byte: [DEFAULT_MS_PER_BYTE; MS_PER_BYTE_SAMPLES],
            ms_per_byte_next: 0,
            empty_telegram: [DEFAULT_EMPTY_TELEGRAM_MS; EMPTY_TELEGRAM_SAMPLES],
            empty_telegram_next: 0,
        }
    }
}

impl TimingModel {
    pub fn ms_per_byte(&self) -> f64 {
        self.ms_per_byte.iter().sum::<f64>() / MS_PER_BYTE_SAMPLES as f64
    }

    pub fn empty_telegram_ms(&self) -> f64 {
        self.empty_telegram.iter().sum::<f64>() / EMPTY_TELEGRAM_SAMPLES as f64
    }

    pub fn record_ms_per_byte(&mut self, sample: f64) {
        self.ms_per_byte[self.ms_per_byte_next] = sample.clamp(0.5, 10.0);
        self.ms_per_byte_next = (self.ms_per_byte_next + 1) % MS_PER_BYTE_SAMPLES;
    }

    pub fn record_empty_telegram(&mut self, sample_ms: f64) {
        self.empty_telegram[self.empty_telegram_next] = sample_ms.clamp(10.0, 100.0);
        self.empty_telegram_next = (self.empty_telegram_next + 1) % EMPTY_TELEGRAM_SAMPLES;
    }

    /// Fold one completed exchange into the model.
    ///
    /// `bytes` counts the request bytes after the length field plus the response pdu.
    pub fn record_exchange(&mut self, bytes: usize, duration_ms: f64) {
        let empty = self.empty_telegram_ms();
        if bytes > 10 && duration_ms > empty {
            self.record_ms_per_byte((duration_ms - empty) / bytes as f64);
        } else if bytes == 0 {
            self.record_empty_telegram(duration_ms);
        }
    }

    pub fn reset_ms_per_byte(&mut self) {
        self.ms_per_byte = [DEFAULT_MS_PER_BYTE; MS_PER_BYTE_SAMPLES];
        self.ms_per_byte_next = 0;
    }
}

/// One pump on the bus: its task catalog, queue and connection bookkeeping.
///
/// Tasks are owned here and referenced by index everywhere else.
#[derive(Debug, Clone)]
pub struct PumpDevice {
    pub(crate) id: String,
    pub(crate) address: u8,
    pub(crate) read_buffer_len: usize,
    pub(crate) send_buffer_len: usize,

    pub(crate) tasks: Vec<Task>,
    pub(crate) high: Vec<usize>,
    pub(crate) low: Vec<usize>,
    pub(crate) once: Vec<usize>,
    pub(crate) low_tasks_per_cycle: usize,
    pub(crate) low_cursor: usize,

    pub(crate) queue: Vec<usize>,
    pub(crate) once_with_info: Vec<usize>,
    pub(crate) fill_queue: VecDeque<usize>,
    pub(crate) add_all_once: bool,
    pub(crate) all_low_added: bool,
    pub(crate) first_after_loss: bool,
    pub(crate) probe_sent: bool,
    pub(crate) serviced_cycle: Option<u64>,

    pub(crate) connection: ConnectionState,
    pub(crate) timeout_counter: u8,
    pub(crate) last_attempt_ms: u64,
    pub(crate) timing: TimingModel,
    pub(crate) last_response_pdu: usize,
}

impl PumpDevice {
    pub fn new(id: impl Into<String>, address: u8) -> Self {
        Self {
            id: id.into(),
            address,
            read_buffer_len: DEFAULT_READ_BUFFER_LEN,
            send_buffer_len: DEFAULT_SEND_BUFFER_LEN,
            tasks: Vec::new(),
            high: Vec::new(),
            low: Vec::new(),
            once: Vec::new(),
            low_tasks_per_cycle: 4,
            low_cursor: 0,
            queue: Vec::new(),
            once_with_info: Vec::new(),
            fill_queue: VecDeque::new(),
            add_all_once: true,
            all_low_added: false,
            first_after_loss: false,
            probe_sent: false,
            serviced_cycle: None,
            connection: ConnectionState::Ok,
            timeout_counter: 0,
            last_attempt_ms: 0,
            timing: TimingModel::default(),
            last_response_pdu: 0,
        }
    }

    pub fn with_low_tasks_per_cycle(mut self, count: usize) -> Self {
        self.low_tasks_per_cycle = count;
        self
    }

    pub fn with_read_buffer_len(mut self, len: usize) -> Self {
        self.set_read_buffer_len(len);
        self
    }

    /// Add a task to the catalog. A task with the same head class and address replaces the old one.
    pub fn add_task(&mut self, task: Task) {
        if let Some(index) = self.index_of(task.id()) {
            self.high.retain(|&i| i != index);
            self.low.retain(|&i| i != index);
            self.once.retain(|&i| i != index);
            self.tasks[index] = task;
            self.push_priority(index);
            return;
        }
        self.tasks.push(task);
        self.push_priority(self.tasks.len() - 1);
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.add_task(task);
        self
    }

    fn push_priority(&mut self, index: usize) {
        match self.tasks[index].priority() {
            Priority::High => self.high.push(index),
            Priority::Low => self.low.push(index),
            Priority::Once => self.once.push(index),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn timeout_counter(&self) -> u8 {
        self.timeout_counter
    }

    pub fn read_buffer_len(&self) -> usize {
        self.read_buffer_len
    }

    pub fn send_buffer_len(&self) -> usize {
        self.send_buffer_len
    }

    pub fn timing(&self) -> &TimingModel {
        &self.timing
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn queued(&self) -> impl Iterator<Item = &Task> + '_ {
        self.queue.iter().map(|&i| &self.tasks[i])
    }

    pub(crate) fn index_of(&self, id: TaskId) -> Option<usize> {
        self.tasks.iter().position(|task| task.id() == id)
    }

    pub fn task(&self, head_class: HeadClass, address: u8) -> Option<&Task> {
        self.index_of(TaskId {
            head_class,
            address,
        })
        .map(|i| &self.tasks[i])
    }

    pub fn task_mut(&mut self, head_class: HeadClass, address: u8) -> Option<&mut Task> {
        self.index_of(TaskId {
            head_class,
            address,
        })
        .map(move |i| &mut self.tasks[i])
    }

    /// Apply the buffer length a device reports. Values below the guaranteed minimum are ignored.
    pub fn set_read_buffer_len(&mut self, len: usize) {
        if len >= DEFAULT_READ_BUFFER_LEN {
            self.read_buffer_len = len;
        }
        self.send_buffer_len = len.max(DEFAULT_SEND_BUFFER_LEN);
    }

    pub(crate) fn next_low(&mut self) -> Option<usize> {
        if self.low.is_empty() {
            return None;
        }
        let index = self.low[self.low_cursor % self.low.len()];
        self.low_cursor = (self.low_cursor + 1) % self.low.len();
        Some(index)
    }

    pub(crate) fn mark_ok(&mut self) {
        self.connection = ConnectionState::Ok;
        self.timeout_counter = 0;
    }

    pub(crate) fn mark_timeout(&mut self) {
        self.timeout_counter = (self.timeout_counter + 1).min(3);
        self.connection = ConnectionState::Lost;
    }

    pub(crate) fn mark_lost(&mut self) {
        self.connection = ConnectionState::Lost;
    }

    /// Start over as if the device was new on the bus: ONCE tasks and INFO are requested again.
    pub fn reset(&mut self) {
        log::debug!("device {} (address {}): reset", self.id, self.address);
        self.queue.clear();
        self.once_with_info.clear();
        self.add_all_once = true;
        for task in &mut self.tasks {
            task.reset_info();
            task.set_execute_get(true);
        }
        self.read_buffer_len = DEFAULT_READ_BUFFER_LEN;
        self.send_buffer_len = DEFAULT_SEND_BUFFER_LEN;
        self.timing.reset_ms_per_byte();
    }
}
