//! Register map and codec of the iCON Modbus TCP interface.
//!
//! The controller exposes up to eight thermostat slots through fixed holding
//! register blocks. Flags are packed one slot per bit, temperatures and
//! humidities are signed 16-bit fixed-point numbers with one decimal place.
//!
//! Every block type carries its `ADDRESS` and `QUANTITY` and knows how to
//! decode itself from the raw registers returned by the device.

use crate::model::{Mode, ModeTemperatures};
use std::fmt;

/// Errors of the register codec.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum Error {
    /// The value does not fit into a signed 16-bit fixed-point register.
    #[error("Value {0} °C cannot be encoded into a register")]
    DegreeCelsiusOutOfRange(f64),

    /// The device answered with a different number of registers than requested.
    #[error("Expected {expected} registers, got {actual}")]
    UnexpectedRegisterCount { expected: u16, actual: usize },

    /// The thermostat slot is not addressable over Modbus.
    #[error("Thermostat slot {0} is out of range (0-7)")]
    SlotOutOfRange(u8),
}

pub const NUMBER_OF_SLOTS: u8 = 8;
pub const DEFAULT_PORT: u16 = 502;

/// Smallest temperature representable in a fixed-point register.
pub const DEGREE_CELSIUS_MIN: f64 = -3276.8;
/// Largest temperature representable in a fixed-point register.
pub const DEGREE_CELSIUS_MAX: f64 = 3276.7;

/// Unpacks a register into its 16 bits, bit `i` at index `i`.
pub fn decode_bitmap16(word: u16) -> [bool; 16] {
    std::array::from_fn(|i| (word >> i) & 1 == 1)
}

/// Decodes a signed fixed-point register with one decimal place.
///
/// Register values from `0x8000` upwards are negative (two's complement).
pub fn decode_fixed(raw: u16) -> f64 {
    f64::from(raw as i16) / 10.0
}

/// Encodes a temperature into a signed fixed-point register.
///
/// The value is rounded to one decimal place. Values that do not fit into
/// the register (or are not finite) are rejected instead of being clamped.
pub fn encode_fixed(value: f64) -> Result<u16, Error> {
    let tenths = (value * 10.0).round();
    if !tenths.is_finite() || !(-32768.0..=32767.0).contains(&tenths) {
        return Err(Error::DegreeCelsiusOutOfRange(value));
    }
    Ok(tenths as i16 as u16)
}

fn check_quantity(words: &[u16], expected: u16) -> Result<(), Error> {
    if words.len() == expected as usize {
        Ok(())
    } else {
        Err(Error::UnexpectedRegisterCount {
            expected,
            actual: words.len(),
        })
    }
}

/// A thermostat slot on the Modbus interface, 0 to 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Slot(u8);

impl Slot {
    pub const MIN: u8 = 0;
    pub const MAX: u8 = NUMBER_OF_SLOTS - 1;

    pub fn all() -> impl Iterator<Item = Slot> {
        (Self::MIN..=Self::MAX).map(Slot)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::ops::Deref for Slot {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u8> for Slot {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::SlotOutOfRange(value))
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block A: per-slot flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmaps {
    pub valve: [bool; 16],
    pub eco: [bool; 16],
    pub cooling: [bool; 16],
    pub inactive: [bool; 16],
}

impl Bitmaps {
    pub const ADDRESS: u16 = 0;
    pub const QUANTITY: u16 = 9;

    const VALVE: usize = 0;
    const ECO: usize = 4;
    const COOLING: usize = 6;
    const INACTIVE: usize = 8;

    pub fn decode_from_holding_registers(words: &[u16]) -> Result<Self, Error> {
        check_quantity(words, Self::QUANTITY)?;
        Ok(Self {
            valve: decode_bitmap16(words[Self::VALVE]),
            eco: decode_bitmap16(words[Self::ECO]),
            cooling: decode_bitmap16(words[Self::COOLING]),
            inactive: decode_bitmap16(words[Self::INACTIVE]),
        })
    }

    /// The operating mode a slot currently runs in.
    pub fn mode(&self, slot: Slot) -> Mode {
        Mode {
            eco: self.eco[slot.index()],
            cooling: self.cooling[slot.index()],
        }
    }
}

/// Block B: temperature and humidity of every slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurements {
    pub temperature: [f64; NUMBER_OF_SLOTS as usize],
    pub humidity: [f64; NUMBER_OF_SLOTS as usize],
}

impl Measurements {
    pub const ADDRESS: u16 = 25;
    pub const QUANTITY: u16 = 2 * NUMBER_OF_SLOTS as u16;

    pub fn decode_from_holding_registers(words: &[u16]) -> Result<Self, Error> {
        check_quantity(words, Self::QUANTITY)?;
        let (temperature, humidity) = words.split_at(NUMBER_OF_SLOTS as usize);
        Ok(Self {
            temperature: std::array::from_fn(|i| decode_fixed(temperature[i])),
            humidity: std::array::from_fn(|i| decode_fixed(humidity[i])),
        })
    }
}

/// Block C: the four mode targets of every slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Targets(pub [ModeTemperatures; NUMBER_OF_SLOTS as usize]);

impl Targets {
    pub const ADDRESS: u16 = 387;
    pub const QUANTITY: u16 = 4 * NUMBER_OF_SLOTS as u16;

    pub fn decode_from_holding_registers(words: &[u16]) -> Result<Self, Error> {
        check_quantity(words, Self::QUANTITY)?;
        Ok(Self(std::array::from_fn(|slot| {
            let block = &words[slot * 4..slot * 4 + 4];
            ModeTemperatures {
                heating: decode_fixed(block[0]),
                cooling: decode_fixed(block[1]),
                eco_heating: decode_fixed(block[2]),
                eco_cooling: decode_fixed(block[3]),
            }
        })))
    }

    /// Register holding the target of `slot` in `mode`.
    pub fn register_address(slot: Slot, mode: Mode) -> u16 {
        Self::ADDRESS + u16::from(*slot) * 4 + mode.index() as u16
    }

    pub fn get(&self, slot: Slot) -> &ModeTemperatures {
        &self.0[slot.index()]
    }
}

/// Mixing valve and water circuit readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerRegisters {
    pub mixing_valve: f64,
    pub water_temperature: f64,
    pub outside_temperature: f64,
}

impl ControllerRegisters {
    pub const ADDRESS: u16 = 16;
    pub const QUANTITY: u16 = 3;

    pub fn decode_from_holding_registers(words: &[u16]) -> Result<Self, Error> {
        check_quantity(words, Self::QUANTITY)?;
        Ok(Self {
            mixing_valve: decode_fixed(words[0]),
            water_temperature: decode_fixed(words[1]),
            outside_temperature: decode_fixed(words[2]),
        })
    }
}

/// Target temperature of the water circuit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetWaterTemperature(pub f64);

impl TargetWaterTemperature {
    pub const ADDRESS: u16 = 420;
    pub const QUANTITY: u16 = 1;

    pub fn decode_from_holding_registers(words: &[u16]) -> Result<Self, Error> {
        check_quantity(words, Self::QUANTITY)?;
        Ok(Self(decode_fixed(words[0])))
    }
}
