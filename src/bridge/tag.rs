//! Per-register tag state: address decoding, scaling and noread accounting.

use std::time::Instant;

use thiserror::Error;

use crate::modbus::{ModbusError, ModbusTransport};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("register address {0} is outside the supported Modicon ranges")]
    Invalid(u16),
}

/// Modicon register classes. Register numbers map onto classes by range;
/// 20000..=29999 and everything from 50000 up are unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterClass {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl RegisterClass {
    /// Split a register number into its class and in-class offset.
    pub fn decode(address: u16) -> Result<(Self, u16), AddressError> {
        match address {
            0..=9999 => Ok((Self::Coil, address)),
            10000..=19999 => Ok((Self::DiscreteInput, address - 10000)),
            30000..=39999 => Ok((Self::InputRegister, address - 30000)),
            40000..=49999 => Ok((Self::HoldingRegister, address - 40000)),
            other => Err(AddressError::Invalid(other)),
        }
    }

    pub fn base(self) -> u16 {
        match self {
            Self::Coil => 0,
            Self::DiscreteInput => 10000,
            Self::InputRegister => 30000,
            Self::HoldingRegister => 40000,
        }
    }

    /// Coils and discrete inputs carry a single bit per register.
    pub fn is_single_bit(self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    /// Discrete inputs and input registers are read-only on the bus.
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Coil | Self::HoldingRegister)
    }

    /// Issue the class's read function against the transport.
    pub fn read(
        self,
        transport: &mut dyn ModbusTransport,
        slave: u8,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        match self {
            Self::Coil => transport.read_coils(slave, addr, count),
            Self::DiscreteInput => transport.read_discrete_inputs(slave, addr, count),
            Self::InputRegister => transport.read_input_registers(slave, addr, count),
            Self::HoldingRegister => transport.read_holding_registers(slave, addr, count),
        }
    }
}

/// What to publish once a tag's failed-read count exceeds its ignore limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoreadAction {
    #[default]
    DoNothing,
    ClearRetained,
    PublishNoread,
}

impl NoreadAction {
    /// Configuration encodes the action as -1 / 0 / 1.
    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            -1 => Some(Self::DoNothing),
            0 => Some(Self::ClearRetained),
            1 => Some(Self::PublishNoread),
            _ => None,
        }
    }
}

/// One cyclically polled register.
#[derive(Debug, Clone)]
pub struct ReadTag {
    pub slave_id: u8,
    /// Modicon register number as configured.
    pub address: u16,
    pub class: RegisterClass,
    /// Wire address within the class.
    pub class_offset: u16,
    pub update_cycle_id: u32,
    /// 0 = not part of a coalesced group.
    pub group: u16,
    /// Empty topic means the tag is polled but never published.
    pub topic: String,
    pub format: String,
    pub retain: bool,
    pub multiplier: f64,
    pub offset: f64,
    pub noread_value: f64,
    pub noread_action: NoreadAction,
    pub noread_ignore: u32,
    /// Stamped with the pass reference when the tag's register was covered by
    /// a group read, so the group is fetched at most once per pass.
    pub reference_time: Option<Instant>,
    noread_count: u32,
    raw_value: u16,
    last_update: Option<Instant>,
}

impl ReadTag {
    pub fn new(slave_id: u8, address: u16) -> Result<Self, AddressError> {
        let (class, class_offset) = RegisterClass::decode(address)?;
        Ok(Self {
            slave_id,
            address,
            class,
            class_offset,
            update_cycle_id: 0,
            group: 0,
            topic: String::new(),
            format: "%f".to_string(),
            retain: false,
            multiplier: 1.0,
            offset: 0.0,
            noread_value: 0.0,
            noread_action: NoreadAction::DoNothing,
            noread_ignore: 0,
            reference_time: None,
            noread_count: 0,
            raw_value: 0,
            last_update: None,
        })
    }

    /// Store a freshly read register value. Bit classes clamp to 0/1. A
    /// successful read ends any noread episode.
    pub fn set_raw(&mut self, value: u16) {
        self.raw_value = if self.class.is_single_bit() {
            u16::from(value != 0)
        } else {
            value
        };
        self.noread_count = 0;
        self.last_update = Some(Instant::now());
    }

    pub fn raw_value(&self) -> u16 {
        self.raw_value
    }

    /// Count a failed read, saturating just past the ignore limit.
    pub fn noread_notify(&mut self) {
        if self.noread_count <= self.noread_ignore {
            self.noread_count += 1;
        }
    }

    pub fn noread_count(&self) -> u32 {
        self.noread_count
    }

    pub fn in_noread(&self) -> bool {
        self.noread_count > 0
    }

    pub fn noread_ignore_exceeded(&self) -> bool {
        self.noread_count > self.noread_ignore
    }

    pub fn scaled_value(&self) -> f64 {
        f64::from(self.raw_value) * self.multiplier + self.offset
    }

    pub fn bool_value(&self) -> bool {
        self.raw_value != 0
    }
}

/// Register kind a subscribed topic writes to, parsed from the configured
/// data type (`r` = holding register, `i`/`q` = single bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    HoldingRegister,
    DiscreteInputLike,
    CoilLike,
}

impl WriteKind {
    pub fn parse(datatype: &str) -> Option<Self> {
        match datatype {
            "r" => Some(Self::HoldingRegister),
            "i" => Some(Self::DiscreteInputLike),
            "q" => Some(Self::CoilLike),
            _ => None,
        }
    }

    pub fn is_single_bit(self) -> bool {
        !matches!(self, Self::HoldingRegister)
    }
}

/// One subscribed MQTT topic mapped to a writable slave register.
#[derive(Debug, Clone)]
pub struct WriteTag {
    pub topic: String,
    pub slave_id: u8,
    pub address: u16,
    pub class_offset: u16,
    pub kind: WriteKind,
    /// Suppress writes triggered by broker-retained messages.
    pub ignore_retained: bool,
    pub(crate) raw_value: u16,
    pub(crate) write_pending: bool,
    pub(crate) write_failed_count: u32,
}

impl WriteTag {
    pub fn new(
        topic: String,
        slave_id: u8,
        address: u16,
        kind: WriteKind,
        ignore_retained: bool,
    ) -> Result<Self, AddressError> {
        let (_, class_offset) = RegisterClass::decode(address)?;
        Ok(Self {
            topic,
            slave_id,
            address,
            class_offset,
            kind,
            ignore_retained,
            raw_value: 0,
            write_pending: false,
            write_failed_count: 0,
        })
    }

    /// Store the value to write; single-bit kinds clamp to 0/1.
    pub fn set_raw(&mut self, value: u16) {
        self.raw_value = if self.kind.is_single_bit() {
            u16::from(value != 0)
        } else {
            value
        };
    }

    pub fn raw_value(&self) -> u16 {
        self.raw_value
    }

    pub fn bool_value(&self) -> bool {
        self.raw_value != 0
    }

    pub fn write_pending(&self) -> bool {
        self.write_pending
    }

    pub fn write_failed_count(&self) -> u32 {
        self.write_failed_count
    }
}
