use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    error::{GenibusError, Result},
    protocol::genibus::{lookup_unit, HeadClass},
};

/// Widest data item: GENIbus values are 8, 16, 24 or 32 bit.
pub const MAX_DATA_WIDTH: u8 = 4;

/// How often a task is scheduled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
    /// Every cycle.
    High,
    /// A few per cycle, round robin.
    Low,
    /// After registration and after every reset.
    Once,
}

/// Identity of a task inside its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{head_class}/{address}")]
pub struct TaskId {
    pub head_class: HeadClass,
    pub address: u8,
}

/// Scaling part of an INFO answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scale {
    /// No scaling information (1-byte INFO).
    Unscaled,
    /// `sif` 2: zero and range.
    Scaled { zero: f64, range: f64 },
    /// `sif` 3: 16-bit zero offset, extended precision.
    Extended { zero_hi: f64, zero_lo: f64 },
}

/// Decoded INFO answer of one data item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InfoData {
    pub value_interpretation: bool,
    pub byte_order: bool,
    pub sif: u8,
    pub unit_index: Option<u8>,
    pub scale: Scale,
}

impl InfoData {
    /// Bytes an INFO answer occupies, decided by its leading flag byte.
    pub fn len_for_flag(flag: u8) -> usize {
        if flag & 0x03 >= 2 {
            4
        } else {
            1
        }
    }

    /// Parse one INFO answer. `bytes` must hold exactly [`Self::len_for_flag`] bytes.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let flag = *bytes.first()?;
        let sif = flag & 0x03;
        let value_interpretation = flag & 0x10 != 0;
        let byte_order = flag & 0x20 != 0;

        if sif < 2 {
            return Some(Self {
                value_interpretation,
                byte_order,
                sif,
                unit_index: None,
                scale: Scale::Unscaled,
            });
        }

        let [_, unit, a, b] = *bytes else {
            return None;
        };
        let sign = if unit & 0x80 != 0 { -1.0 } else { 1.0 };
        let scale = if sif == 3 {
            Scale::Extended {
                zero_hi: sign * a as f64,
                zero_lo: sign * b as f64,
            }
        } else {
            Scale::Scaled {
                zero: sign * a as f64,
                range: b as f64,
            }
        };
        Some(Self {
            value_interpretation,
            byte_order,
            sif,
            unit_index: Some(unit & 0x7F),
            scale,
        })
    }

    /// INFO for a percentage item with zero 0 and range 100, for items whose INFO is known in
    /// advance.
    pub fn percent() -> Self {
        Self {
            value_interpretation: false,
            byte_order: false,
            sif: 2,
            unit_index: Some(30),
            scale: Scale::Scaled {
                zero: 0.0,
                range: 100.0,
            },
        }
    }

    pub fn unit_factor(&self) -> f64 {
        self.unit_index
            .and_then(lookup_unit)
            .map(|unit| unit.factor)
            .unwrap_or(1.0)
    }

    pub fn unit_label(&self) -> Option<&'static str> {
        self.unit_index.and_then(lookup_unit).map(|unit| unit.label)
    }
}

/// A decoded value, published to update handlers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaskValue {
    Number(f64),
    Text(String),
    /// The device reported "not available" (0xFF without value interpretation).
    Unavailable,
}

/// Head class specific runtime state.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// Head class 0, GET only.
    Protocol,
    /// Head class 2, INFO then GET.
    Measured,
    /// Head class 3, SET only. `pending` means "send the command".
    Command { pending: bool },
    /// Head class 4 and 5. GET once after INFO and after every SET; SET when a write is pending.
    Parameter {
        execute_get: bool,
        pending_write: Option<f64>,
    },
    /// Head class 7, GET only, one apdu per task.
    Ascii,
}

impl TaskKind {
    fn for_head_class(head_class: HeadClass) -> Result<Self> {
        Ok(match head_class {
            HeadClass::Protocol => TaskKind::Protocol,
            HeadClass::Measured => TaskKind::Measured,
            HeadClass::Command => TaskKind::Command { pending: false },
            HeadClass::Config | HeadClass::Reference => TaskKind::Parameter {
                execute_get: true,
                pending_write: None,
            },
            HeadClass::Ascii => TaskKind::Ascii,
            HeadClass::Unknown(code) => return Err(GenibusError::UnsupportedHeadClass(code)),
        })
    }
}

/// One addressable read/write unit on a device.
#[derive(Debug, Clone)]
pub struct Task {
    name: String,
    head_class: HeadClass,
    address: u8,
    width: u8,
    priority: Priority,
    multiplier: f64,
    kind: TaskKind,
    info: Option<InfoData>,
    preset_info: Option<InfoData>,
    info_refresh_interval: Option<u32>,
    gets_since_info: u32,
    rx: Vec<u8>,
    value: Option<TaskValue>,
    /// Index of the apdu the task was placed in during the last telegram build.
    apdu_slot: Option<usize>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        head_class: HeadClass,
        address: u8,
        width: u8,
        priority: Priority,
    ) -> Result<Self> {
        if !(1..=MAX_DATA_WIDTH).contains(&width) {
            return Err(GenibusError::UnsupportedWidth {
                head_class: head_class.code(),
                address,
                width,
            });
        }
        Ok(Self {
            name: name.into(),
            head_class,
            address,
            width,
            priority,
            multiplier: 1.0,
            kind: TaskKind::for_head_class(head_class)?,
            info: None,
            preset_info: None,
            info_refresh_interval: None,
            gets_since_info: 0,
            rx: Vec::new(),
            value: None,
            apdu_slot: None,
        })
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Request INFO again after every `interval` decoded values.
    pub fn with_info_refresh(mut self, interval: u32) -> Self {
        self.info_refresh_interval = (interval > 0).then_some(interval);
        self
    }

    /// Use a fixed INFO instead of asking the device. Survives device resets.
    pub fn with_preset_info(mut self, info: InfoData) -> Self {
        self.preset_info = Some(info);
        self.info = Some(info);
        self
    }

    pub fn id(&self) -> TaskId {
        TaskId {
            head_class: self.head_class,
            address: self.address,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn head_class(&self) -> HeadClass {
        self.head_class
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn data_width(&self) -> usize {
        self.width as usize
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn info(&self) -> Option<&InfoData> {
        self.info.as_ref()
    }

    pub fn value(&self) -> Option<&TaskValue> {
        self.value.as_ref()
    }

    pub fn unit_label(&self) -> Option<&'static str> {
        self.info.as_ref().and_then(InfoData::unit_label)
    }

    /// Command and parameter tasks accept writes from the host.
    pub fn is_writable(&self) -> bool {
        matches!(
            self.kind,
            TaskKind::Command { .. } | TaskKind::Parameter { .. }
        )
    }

    /// Head class 0, 3 and 7 need no INFO.
    pub fn info_available(&self) -> bool {
        match self.kind {
            TaskKind::Measured | TaskKind::Parameter { .. } => self.info.is_some(),
            _ => true,
        }
    }

    pub fn set_pending(&self) -> bool {
        match self.kind {
            TaskKind::Command { pending } => pending,
            TaskKind::Parameter { pending_write, .. } => pending_write.is_some(),
            _ => false,
        }
    }

    /// Whether a parameter task should go out as GET on its next visit.
    pub fn execute_get(&self) -> bool {
        matches!(
            self.kind,
            TaskKind::Parameter {
                execute_get: true,
                ..
            }
        )
    }

    pub(crate) fn set_execute_get(&mut self, value: bool) {
        if let TaskKind::Parameter { execute_get, .. } = &mut self.kind {
            *execute_get = value;
        }
    }

    /// Queue a value for the device. Commands fire on any non-zero value.
    pub fn request_write(&mut self, value: f64) -> Result<()> {
        match &mut self.kind {
            TaskKind::Command { pending } => {
                *pending = value != 0.0;
                Ok(())
            }
            TaskKind::Parameter { pending_write, .. } => {
                *pending_write = Some(value);
                Ok(())
            }
            _ => Err(GenibusError::ReadOnly {
                head_class: self.head_class.code(),
                address: self.address,
            }),
        }
    }

    /// Called once the pending write went into a telegram. Re-arms GET so the new value is read
    /// back.
    pub fn clear_pending_write(&mut self) {
        match &mut self.kind {
            TaskKind::Command { pending } => *pending = false,
            TaskKind::Parameter {
                execute_get,
                pending_write,
            } => {
                *pending_write = None;
                *execute_get = true;
            }
            _ => {}
        }
    }

    /// Bytes of a SET for the pending write, `(address, value)` pairs per data byte.
    pub fn write_payload(&self) -> Vec<u8> {
        match self.kind {
            TaskKind::Command { .. } => vec![self.address],
            TaskKind::Parameter {
                pending_write: Some(value),
                ..
            } => self
                .encode_write(value)
                .into_iter()
                .enumerate()
                .flat_map(|(i, byte)| [self.address.wrapping_add(i as u8), byte])
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Inverse of the GET decoding: engineering value to `width` big endian bytes.
    pub fn encode_write(&self, value: f64) -> Vec<u8> {
        let width = self.width as i32;
        let factor = self.info.map(|info| info.unit_factor()).unwrap_or(1.0) * self.multiplier;
        let value = if factor != 0.0 { value / factor } else { value };

        let raw = match self.info.map(|info| info.scale) {
            Some(Scale::Scaled { zero, range }) if range != 0.0 => {
                ((value - zero) * 254.0 * 256f64.powi(width - 1) / range).round()
            }
            Some(Scale::Scaled { .. }) => 0.0,
            Some(Scale::Extended { zero_hi, zero_lo }) => {
                value.round() - 256f64.powi((width - 2).max(0)) * (256.0 * zero_hi + zero_lo)
            }
            _ => value.round(),
        };

        let max = 256f64.powi(width) - 1.0;
        let clamped = raw.clamp(0.0, max) as u32;
        let bytes = clamped.to_be_bytes();
        bytes[bytes.len() - self.width as usize..].to_vec()
    }

    /// Bytes of a GET request: one address per data byte.
    pub fn get_payload(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.width).map(|i| self.address.wrapping_add(i))
    }

    pub fn set_info_fields(&mut self, info: InfoData) {
        self.info = Some(info);
        self.gets_since_info = 0;
    }

    /// Forget INFO so it is requested again. Preset INFO is restored instead.
    pub fn reset_info(&mut self) {
        self.info = self.preset_info;
        self.gets_since_info = 0;
    }

    pub(crate) fn begin_response(&mut self) {
        self.rx.clear();
    }

    pub fn process_response_byte(&mut self, byte: u8) {
        self.rx.push(byte);
    }

    /// Decode the collected GET bytes. `None` while fewer than `width` bytes arrived.
    pub fn end_of_response(&mut self) -> Option<TaskValue> {
        let value = match self.kind {
            TaskKind::Ascii => TaskValue::Text(
                String::from_utf8_lossy(&self.rx)
                    .trim_end_matches('\0')
                    .to_string(),
            ),
            _ if self.rx.len() < self.width as usize => return None,
            _ => self.decode_value(),
        };
        self.rx.clear();

        if let Some(interval) = self.info_refresh_interval {
            self.gets_since_info += 1;
            if self.gets_since_info >= interval && self.preset_info.is_none() {
                log::debug!("task {} ({}): refreshing INFO", self.id(), self.name);
                self.reset_info();
            }
        }

        self.value = Some(value.clone());
        Some(value)
    }

    fn decode_value(&self) -> TaskValue {
        let bytes = &self.rx[..self.width as usize];
        let big_endian = bytes.iter().fold(0f64, |acc, b| acc * 256.0 + *b as f64);

        let Some(info) = self.info else {
            return TaskValue::Number(big_endian * self.multiplier);
        };
        if !info.value_interpretation && bytes[0] == 0xFF {
            return TaskValue::Unavailable;
        }

        let raw = match info.scale {
            Scale::Scaled { zero, range } => {
                let range_max = if info.value_interpretation { 255.0 } else { 254.0 };
                zero + bytes
                    .iter()
                    .enumerate()
                    .map(|(i, b)| *b as f64 * range / range_max / 256f64.powi(i as i32))
                    .sum::<f64>()
            }
            Scale::Extended { zero_hi, zero_lo } => {
                let exponent = (self.width as i32 - 2).max(0);
                256f64.powi(exponent) * (256.0 * zero_hi + zero_lo) + big_endian
            }
            Scale::Unscaled => big_endian,
        };
        TaskValue::Number(raw * info.unit_factor() * self.multiplier)
    }

    pub(crate) fn apdu_slot(&self) -> Option<usize> {
        self.apdu_slot
    }

    pub(crate) fn set_apdu_slot(&mut self, slot: Option<usize>) {
        self.apdu_slot = slot;
    }
}
