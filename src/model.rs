//! Canonical device state shared by both protocols.
//!
//! Every read produces a fresh [`DeviceState`]; nothing in here is ever
//! updated in place. A snapshot describes the device at the moment it was
//! fetched and nothing more.

use serde::Serialize;
use std::{cmp::Ordering, fmt};

/// Rounds to one decimal place, the precision of every temperature on the wire.
pub fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Selects one of the four target slots of a thermostat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Mode {
    pub eco: bool,
    pub cooling: bool,
}

impl Mode {
    pub const HEATING: Mode = Mode {
        eco: false,
        cooling: false,
    };
    pub const COOLING: Mode = Mode {
        eco: false,
        cooling: true,
    };
    pub const ECO_HEATING: Mode = Mode {
        eco: true,
        cooling: false,
    };
    pub const ECO_COOLING: Mode = Mode {
        eco: true,
        cooling: true,
    };

    pub fn new(eco: bool, cooling: bool) -> Self {
        Self { eco, cooling }
    }

    /// Position in the heating, cooling, eco heating, eco cooling order.
    pub fn index(&self) -> usize {
        usize::from(self.eco) * 2 + usize::from(self.cooling)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.eco, self.cooling) {
            (false, false) => write!(f, "heating"),
            (false, true) => write!(f, "cooling"),
            (true, false) => write!(f, "eco heating"),
            (true, true) => write!(f, "eco cooling"),
        }
    }
}

/// One temperature per operating mode, in °C.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModeTemperatures {
    pub heating: f64,
    pub cooling: f64,
    pub eco_heating: f64,
    pub eco_cooling: f64,
}

impl ModeTemperatures {
    pub fn get(&self, mode: Mode) -> f64 {
        match (mode.eco, mode.cooling) {
            (false, false) => self.heating,
            (false, true) => self.cooling,
            (true, false) => self.eco_heating,
            (true, true) => self.eco_cooling,
        }
    }
}

impl fmt::Display for ModeTemperatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "heating {:.1}, cooling {:.1}, eco heating {:.1}, eco cooling {:.1}",
            self.heating, self.cooling, self.eco_heating, self.eco_cooling
        )
    }
}

/// Identifier of a thermostat.
///
/// Modbus slots are plain numbers (`"3"`), the service protocol uses dotted
/// ids (`"1.3"`). Ids order numerically per dotted segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ThermostatId(String);

impl ThermostatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ThermostatId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Ord for ThermostatId {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut lhs = self.0.split('.');
        let mut rhs = other.0.split('.');
        loop {
            match (lhs.next(), rhs.next()) {
                // "01" and "1" sort together, but are not equal
                (None, None) => return self.0.cmp(&other.0),
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(a), Some(b)) => {
                    let order = match (a.parse::<u32>(), b.parse::<u32>()) {
                        (Ok(a), Ok(b)) => a.cmp(&b),
                        _ => a.cmp(b),
                    };
                    if order != Ordering::Equal {
                        return order;
                    }
                }
            }
        }
    }
}

impl PartialOrd for ThermostatId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ThermostatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One zone thermostat.
///
/// Readings the device did not report are `NaN`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thermostat {
    pub id: ThermostatId,
    pub name: Option<String>,
    /// The thermostat is communicating with the controller.
    pub is_live: bool,
    pub is_on: bool,
    pub parental_locked: bool,
    pub time_program_active: bool,
    pub valve_open: bool,
    pub eco_active: bool,
    pub eco_follows_master: bool,
    pub cooling_active: bool,
    pub current_temperature_c: f64,
    pub relative_humidity: f64,
    pub dew_point_c: Option<f64>,
    pub dew_protection_active: bool,
    pub frost_protection_active: bool,
    pub targets: ModeTemperatures,
    pub floor_heating_offset_c: Option<f64>,
    pub floor_cooling_offset_c: Option<f64>,
    /// Adjustable band (±) around the midpoint.
    pub limit_c: Option<f64>,
    /// Approximation only: the controller's global midpoint for the mode
    /// this thermostat currently runs in. It matches the thermostat only
    /// when all thermostats were given the same midpoint.
    pub midpoint_c: Option<f64>,
}

impl Thermostat {
    pub fn mode(&self) -> Mode {
        Mode::new(self.eco_active, self.cooling_active)
    }

    /// The target of the mode the thermostat currently runs in.
    pub fn current_target_c(&self) -> f64 {
        self.targets.get(self.mode())
    }
}

fn flag(f: &mut fmt::Formatter<'_>, name: &str, value: bool) -> fmt::Result {
    if value {
        write!(f, ", {name}")
    } else {
        Ok(())
    }
}

impl fmt::Display for Thermostat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thermostat {}", self.id)?;
        if let Some(name) = &self.name {
            write!(f, " ({name})")?;
        }
        write!(
            f,
            ": {:.1} °C, {:.1} %RH, target {:.1} °C ({}), valve {}",
            self.current_temperature_c,
            self.relative_humidity,
            self.current_target_c(),
            self.mode(),
            if self.valve_open { "open" } else { "closed" }
        )?;
        if let Some(limit) = self.limit_c {
            write!(f, ", limit ±{limit:.1}")?;
        }
        if let Some(midpoint) = self.midpoint_c {
            write!(f, ", midpoint ~{midpoint:.1}")?;
        }
        if let Some(dew_point) = self.dew_point_c {
            write!(f, ", dew point {dew_point:.1}")?;
        }
        flag(f, "offline", !self.is_live)?;
        flag(f, "locked", self.parental_locked)?;
        flag(f, "time program", self.time_program_active)?;
        flag(f, "eco follows master", self.eco_follows_master)?;
        flag(f, "dew protection", self.dew_protection_active)?;
        flag(f, "frost protection", self.frost_protection_active)?;
        write!(f, "\n  targets: {}", self.targets)
    }
}

/// Settings only returned when the extended configuration was requested.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerConfig {
    pub name: Option<String>,
    pub mixing_valve_reading: Option<f64>,
    pub thermostat_hysteresis_c: Option<f64>,
    pub heating_enabled: bool,
    pub cooling_enabled: bool,
}

/// Shared hydraulic and system state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Controller {
    /// Master eco mode, not available over Modbus.
    pub eco_active: Option<bool>,
    /// Master cooling mode, not available over Modbus.
    pub cooling_active: Option<bool>,
    pub mixing_valve_percent: f64,
    pub water_temperature_c: f64,
    pub outside_temperature_c: f64,
    pub target_water_temperature_c: Option<f64>,
    pub midpoints: Option<ModeTemperatures>,
    pub firmware_version: Option<String>,
    /// Opaque token that changes whenever the configuration changes.
    pub config_version: Option<String>,
    pub timezone: Option<String>,
    pub uptime_hours: Option<f64>,
    pub config: Option<ControllerConfig>,
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.config.as_ref().and_then(|c| c.name.as_ref()) {
            writeln!(f, "Controller {name}")?;
        } else {
            writeln!(f, "Controller")?;
        }
        let mode = |value: Option<bool>, on: &'static str, off: &'static str| match value {
            Some(true) => on,
            Some(false) => off,
            None => "unknown",
        };
        writeln!(
            f,
            "  mode: {} / {}",
            mode(self.eco_active, "eco", "comfort"),
            mode(self.cooling_active, "cooling", "heating")
        )?;
        writeln!(f, "  mixing valve: {:.1} %", self.mixing_valve_percent)?;
        write!(f, "  water temperature: {:.1} °C", self.water_temperature_c)?;
        if let Some(target) = self.target_water_temperature_c {
            write!(f, " (target {target:.1} °C)")?;
        }
        writeln!(f)?;
        writeln!(f, "  outside temperature: {:.1} °C", self.outside_temperature_c)?;
        if let Some(midpoints) = &self.midpoints {
            writeln!(f, "  midpoints: {midpoints}")?;
        }
        if let Some(config) = &self.config {
            if let Some(hysteresis) = config.thermostat_hysteresis_c {
                writeln!(f, "  hysteresis: {hysteresis:.1} °C")?;
            }
            writeln!(
                f,
                "  heating {}, cooling {}",
                if config.heating_enabled { "enabled" } else { "disabled" },
                if config.cooling_enabled { "enabled" } else { "disabled" }
            )?;
        }
        if let Some(version) = &self.firmware_version {
            writeln!(f, "  firmware: {version}")?;
        }
        if let Some(version) = &self.config_version {
            writeln!(f, "  config version: {version}")?;
        }
        if let Some(timezone) = &self.timezone {
            writeln!(f, "  timezone: {timezone}")?;
        }
        if let Some(uptime) = self.uptime_hours {
            writeln!(f, "  uptime: {uptime} h")?;
        }
        Ok(())
    }
}

/// A point-in-time snapshot of a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    /// Logical address the snapshot was read from.
    pub address: String,
    pub controller: Controller,
    /// Active thermostats, ordered by id.
    pub thermostats: Vec<Thermostat>,
}

impl DeviceState {
    /// Builds a snapshot, putting the thermostats in id order.
    pub fn new(address: String, controller: Controller, mut thermostats: Vec<Thermostat>) -> Self {
        thermostats.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            address,
            controller,
            thermostats,
        }
    }

    pub fn thermostat(&self, id: &ThermostatId) -> Option<&Thermostat> {
        self.thermostats.iter().find(|t| &t.id == id)
    }
}
