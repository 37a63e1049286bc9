//! Wire format of the JSON service protocol.
//!
//! The controller speaks one JSON object per TCP connection in each
//! direction. Fields carry short upper-case codes; this module is the only
//! place that knows them. Fields missing from a response are tolerated,
//! fields of the wrong type are a [`Error::Protocol`].
//!
//! | Code | Meaning |
//! |------|---------|
//! | `SYSID` | system id of the controller |
//! | `RELOAD` | `1` requests the configuration block, `6` identifies the controller |
//! | `ERR` | `1` when the request was refused (usually a wrong system id) |
//! | `DP` | thermostats, keyed by id |
//! | `ON`, `LIVE` | thermostat present, thermostat communicating |
//! | `NAME` | name |
//! | `PL`, `TPR` | parental lock, time program |
//! | `OUT` | valve open |
//! | `CE`, `CEF`, `HC` | eco mode, eco follows master, cooling mode |
//! | `TEMP`, `RH`, `DEW` | temperature, relative humidity, dew point |
//! | `DWP`, `FROST` | dew protection, frost protection |
//! | `XAH`, `XAC`, `ECOH`, `ECOC` | targets (midpoints at top level) |
//! | `REQ` | setpoint of the currently active mode (write only) |
//! | `FHO`, `FCO`, `LIM` | floor heating/cooling offset, limit |
//! | `MXAH`, `MXAC`, `MECOH`, `MECOC` | per-thermostat midpoints (write only) |
//! | `MIX`, `WTEMP`, `ETEMP` | mixing valve, water and outside temperature |
//! | `VER`, `CFGV`, `TZ`, `UPTIME` | firmware, config version, timezone, uptime |
//! | `CFG` → `ICON1` → `STATUS` | configuration block |
//! | `RESTART`, `SWUPDATE` | commands |

use crate::{
    model::{
        Controller, ControllerConfig, DeviceState, Mode, ModeTemperatures, Thermostat,
        ThermostatId,
    },
    Error, Result,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// `RELOAD` value requesting the configuration block.
pub(crate) const RELOAD_CONFIG: u8 = 1;
/// `RELOAD` value requesting the identification of the controller.
pub(crate) const RELOAD_IDENTIFY: u8 = 6;

fn flag(value: bool) -> u8 {
    u8::from(value)
}

fn is_set(value: Option<i64>) -> bool {
    value == Some(1)
}

/// Fields that some firmware versions send as numbers and others as strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Text {
    String(String),
    Integer(i64),
    Float(f64),
}

impl From<Text> for String {
    fn from(value: Text) -> Self {
        match value {
            Text::String(s) => s,
            Text::Integer(i) => i.to_string(),
            Text::Float(f) => f.to_string(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub(crate) struct Request<'a> {
    #[serde(rename = "SYSID", skip_serializing_if = "Option::is_none")]
    pub sys_id: Option<&'a str>,
    #[serde(rename = "RELOAD", skip_serializing_if = "Option::is_none")]
    pub reload: Option<u8>,
    #[serde(rename = "DP", skip_serializing_if = "BTreeMap::is_empty")]
    pub thermostats: BTreeMap<&'a str, ThermostatWrite>,
    #[serde(rename = "CE", skip_serializing_if = "Option::is_none")]
    pub eco: Option<u8>,
    #[serde(rename = "HC", skip_serializing_if = "Option::is_none")]
    pub cooling: Option<u8>,
    #[serde(rename = "RESTART", skip_serializing_if = "Option::is_none")]
    pub restart: Option<u8>,
    #[serde(rename = "SWUPDATE", skip_serializing_if = "Option::is_none")]
    pub software_update: Option<u8>,
}

impl<'a> Request<'a> {
    /// The identification request, sent without a system id.
    pub fn identify() -> Self {
        Self {
            reload: Some(RELOAD_IDENTIFY),
            ..Default::default()
        }
    }

    pub fn read(sys_id: &'a str, include_config: bool) -> Self {
        Self {
            sys_id: Some(sys_id),
            reload: include_config.then_some(RELOAD_CONFIG),
            ..Default::default()
        }
    }

    pub fn thermostat(sys_id: &'a str, id: &'a ThermostatId, write: ThermostatWrite) -> Self {
        Self {
            sys_id: Some(sys_id),
            thermostats: BTreeMap::from([(id.as_str(), write)]),
            ..Default::default()
        }
    }

    pub fn master_eco(sys_id: &'a str, eco: bool) -> Self {
        Self {
            sys_id: Some(sys_id),
            eco: Some(flag(eco)),
            ..Default::default()
        }
    }

    pub fn master_cooling(sys_id: &'a str, cooling: bool) -> Self {
        Self {
            sys_id: Some(sys_id),
            cooling: Some(flag(cooling)),
            ..Default::default()
        }
    }

    pub fn restart(sys_id: &'a str) -> Self {
        Self {
            sys_id: Some(sys_id),
            restart: Some(1),
            ..Default::default()
        }
    }

    pub fn software_update(sys_id: &'a str) -> Self {
        Self {
            sys_id: Some(sys_id),
            software_update: Some(1),
            ..Default::default()
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|err| Error::Protocol(format!("Cannot encode request: {err}")))
    }
}

/// Fields written to one thermostat. Unset fields are not sent.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub(crate) struct ThermostatWrite {
    #[serde(rename = "XAH", skip_serializing_if = "Option::is_none")]
    pub heating: Option<f64>,
    #[serde(rename = "XAC", skip_serializing_if = "Option::is_none")]
    pub cooling: Option<f64>,
    #[serde(rename = "ECOH", skip_serializing_if = "Option::is_none")]
    pub eco_heating: Option<f64>,
    #[serde(rename = "ECOC", skip_serializing_if = "Option::is_none")]
    pub eco_cooling: Option<f64>,
    #[serde(rename = "REQ", skip_serializing_if = "Option::is_none")]
    pub current_target: Option<f64>,
    #[serde(rename = "LIM", skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
    #[serde(rename = "PL", skip_serializing_if = "Option::is_none")]
    pub parental_lock: Option<u8>,
    #[serde(rename = "CE", skip_serializing_if = "Option::is_none")]
    pub eco_active: Option<u8>,
    #[serde(rename = "HC", skip_serializing_if = "Option::is_none")]
    pub cooling_active: Option<u8>,
    #[serde(rename = "MXAH", skip_serializing_if = "Option::is_none")]
    pub heating_midpoint: Option<f64>,
    #[serde(rename = "MXAC", skip_serializing_if = "Option::is_none")]
    pub cooling_midpoint: Option<f64>,
    #[serde(rename = "MECOH", skip_serializing_if = "Option::is_none")]
    pub eco_heating_midpoint: Option<f64>,
    #[serde(rename = "MECOC", skip_serializing_if = "Option::is_none")]
    pub eco_cooling_midpoint: Option<f64>,
}

impl ThermostatWrite {
    /// Target of an explicit mode.
    pub fn target(mode: Mode, value: f64) -> Self {
        let mut write = Self::default();
        let field = match (mode.eco, mode.cooling) {
            (true, true) => &mut write.eco_cooling,
            (true, false) => &mut write.eco_heating,
            (false, true) => &mut write.cooling,
            (false, false) => &mut write.heating,
        };
        *field = Some(value);
        write
    }

    /// Target of whatever mode the thermostat currently runs in.
    pub fn current_target(value: f64) -> Self {
        Self {
            current_target: Some(value),
            ..Default::default()
        }
    }

    pub fn limit(value: f64) -> Self {
        Self {
            limit: Some(value),
            ..Default::default()
        }
    }

    pub fn parental_lock(locked: bool) -> Self {
        Self {
            parental_lock: Some(flag(locked)),
            ..Default::default()
        }
    }

    pub fn eco(eco: bool) -> Self {
        Self {
            eco_active: Some(flag(eco)),
            ..Default::default()
        }
    }

    pub fn cooling(cooling: bool) -> Self {
        Self {
            cooling_active: Some(flag(cooling)),
            ..Default::default()
        }
    }

    pub fn midpoints(midpoints: &ModeTemperatures) -> Self {
        Self {
            heating_midpoint: Some(midpoints.heating),
            cooling_midpoint: Some(midpoints.cooling),
            eco_heating_midpoint: Some(midpoints.eco_heating),
            eco_cooling_midpoint: Some(midpoints.eco_cooling),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StateResponse {
    #[serde(rename = "DP")]
    thermostats: BTreeMap<String, ThermostatEntry>,
    #[serde(rename = "CE")]
    eco: Option<i64>,
    #[serde(rename = "HC")]
    cooling: Option<i64>,
    #[serde(rename = "MIX")]
    mixing_valve: Option<f64>,
    #[serde(rename = "WTEMP")]
    water_temperature: Option<f64>,
    #[serde(rename = "ETEMP")]
    outside_temperature: Option<f64>,
    #[serde(rename = "XAH")]
    heating_midpoint: Option<f64>,
    #[serde(rename = "XAC")]
    cooling_midpoint: Option<f64>,
    #[serde(rename = "ECOH")]
    eco_heating_midpoint: Option<f64>,
    #[serde(rename = "ECOC")]
    eco_cooling_midpoint: Option<f64>,
    #[serde(rename = "VER")]
    firmware_version: Option<Text>,
    #[serde(rename = "CFGV")]
    config_version: Option<Text>,
    #[serde(rename = "TZ")]
    timezone: Option<Text>,
    #[serde(rename = "UPTIME")]
    uptime_hours: Option<f64>,
    #[serde(rename = "CFG")]
    config: Option<ConfigBlock>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ThermostatEntry {
    #[serde(rename = "ON")]
    on: Option<i64>,
    #[serde(rename = "LIVE")]
    live: Option<i64>,
    #[serde(rename = "NAME")]
    name: Option<String>,
    #[serde(rename = "PL")]
    parental_lock: Option<i64>,
    #[serde(rename = "TPR")]
    time_program: Option<i64>,
    #[serde(rename = "OUT")]
    valve: Option<i64>,
    #[serde(rename = "CE")]
    eco: Option<i64>,
    #[serde(rename = "CEF")]
    eco_follows_master: Option<i64>,
    #[serde(rename = "HC")]
    cooling: Option<i64>,
    #[serde(rename = "TEMP")]
    temperature: Option<f64>,
    #[serde(rename = "RH")]
    humidity: Option<f64>,
    #[serde(rename = "DEW")]
    dew_point: Option<f64>,
    #[serde(rename = "DWP")]
    dew_protection: Option<i64>,
    #[serde(rename = "FROST")]
    frost_protection: Option<i64>,
    #[serde(rename = "XAH")]
    heating: Option<f64>,
    #[serde(rename = "XAC")]
    cooling_target: Option<f64>,
    #[serde(rename = "ECOH")]
    eco_heating: Option<f64>,
    #[serde(rename = "ECOC")]
    eco_cooling: Option<f64>,
    #[serde(rename = "FHO")]
    floor_heating_offset: Option<f64>,
    #[serde(rename = "FCO")]
    floor_cooling_offset: Option<f64>,
    #[serde(rename = "LIM")]
    limit: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigBlock {
    #[serde(rename = "NAME")]
    name: Option<String>,
    #[serde(rename = "ICON1")]
    icon: Option<IconBlock>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IconBlock {
    #[serde(rename = "HYST")]
    hysteresis: Option<f64>,
    #[serde(rename = "HEAT")]
    heating_enabled: Option<i64>,
    #[serde(rename = "COOL")]
    cooling_enabled: Option<i64>,
    #[serde(rename = "STATUS")]
    status: Option<StatusBlock>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatusBlock {
    #[serde(rename = "AO")]
    mixing_valve: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IdentifyResponse {
    #[serde(rename = "SYSID")]
    sys_id: Option<Text>,
    #[serde(rename = "ERR")]
    error: Option<i64>,
}

/// Parses a raw response into a JSON tree.
pub(crate) fn parse_json(payload: &[u8]) -> Result<Value> {
    serde_json::from_slice(payload).map_err(|err| {
        Error::Protocol(format!(
            "Could not parse NGBS response ({err}): {}",
            String::from_utf8_lossy(payload)
        ))
    })
}

/// Fails with [`Error::Rejected`] when the device flagged the request as refused.
pub(crate) fn check_rejected(value: &Value) -> Result<()> {
    match value.get("ERR").and_then(Value::as_i64) {
        Some(1) => Err(Error::Rejected(
            "ERR=1, the system id is probably wrong".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Interprets the answer to [`Request::identify`].
///
/// Controllers older than firmware 1079 (January 2023) refuse to identify
/// themselves without a system id; that yields `None`.
pub(crate) fn parse_sys_id(value: Value) -> Result<Option<String>> {
    let raw = value.to_string();
    let response: IdentifyResponse = serde_path_to_error::deserialize(value)?;
    match response {
        IdentifyResponse {
            sys_id: Some(sys_id),
            ..
        } => Ok(Some(sys_id.into()).filter(|s: &String| !s.is_empty())),
        IdentifyResponse { error: Some(1), .. } => Ok(None),
        _ => Err(Error::Protocol(format!("Unknown response format: {raw}"))),
    }
}

/// Maps a state response to the canonical model.
pub(crate) fn parse_state(address: &str, value: Value) -> Result<DeviceState> {
    check_rejected(&value)?;
    let response: StateResponse = serde_path_to_error::deserialize(value)?;

    let midpoints = [
        response.heating_midpoint,
        response.cooling_midpoint,
        response.eco_heating_midpoint,
        response.eco_cooling_midpoint,
    ]
    .iter()
    .any(Option::is_some)
    .then(|| ModeTemperatures {
        heating: response.heating_midpoint.unwrap_or(f64::NAN),
        cooling: response.cooling_midpoint.unwrap_or(f64::NAN),
        eco_heating: response.eco_heating_midpoint.unwrap_or(f64::NAN),
        eco_cooling: response.eco_cooling_midpoint.unwrap_or(f64::NAN),
    });

    let thermostats = response
        .thermostats
        .into_iter()
        .filter(|(_, entry)| is_set(entry.on))
        .map(|(id, entry)| thermostat(id, entry, midpoints.as_ref()))
        .collect();

    let config = response.config.map(|cfg| {
        let icon = cfg.icon.unwrap_or_default();
        ControllerConfig {
            name: cfg.name,
            mixing_valve_reading: icon.status.and_then(|status| status.mixing_valve),
            thermostat_hysteresis_c: icon.hysteresis,
            heating_enabled: icon.heating_enabled.map_or(true, |v| v == 1),
            cooling_enabled: icon.cooling_enabled.map_or(true, |v| v == 1),
        }
    });

    let controller = Controller {
        eco_active: response.eco.map(|v| v == 1),
        cooling_active: response.cooling.map(|v| v == 1),
        mixing_valve_percent: response.mixing_valve.unwrap_or(f64::NAN),
        water_temperature_c: response.water_temperature.unwrap_or(f64::NAN),
        outside_temperature_c: response.outside_temperature.unwrap_or(f64::NAN),
        target_water_temperature_c: None,
        midpoints,
        firmware_version: response.firmware_version.map(String::from),
        config_version: response.config_version.map(String::from),
        timezone: response.timezone.map(String::from),
        uptime_hours: response.uptime_hours,
        config,
    };

    Ok(DeviceState::new(address.to_string(), controller, thermostats))
}

fn thermostat(
    id: String,
    entry: ThermostatEntry,
    midpoints: Option<&ModeTemperatures>,
) -> Thermostat {
    let mode = Mode::new(is_set(entry.eco), is_set(entry.cooling));
    Thermostat {
        id: ThermostatId::new(id),
        name: entry.name,
        is_live: is_set(entry.live),
        is_on: true,
        parental_locked: is_set(entry.parental_lock),
        time_program_active: is_set(entry.time_program),
        valve_open: is_set(entry.valve),
        eco_active: mode.eco,
        eco_follows_master: is_set(entry.eco_follows_master),
        cooling_active: mode.cooling,
        current_temperature_c: entry.temperature.unwrap_or(f64::NAN),
        relative_humidity: entry.humidity.unwrap_or(f64::NAN),
        dew_point_c: entry.dew_point,
        dew_protection_active: is_set(entry.dew_protection),
        frost_protection_active: is_set(entry.frost_protection),
        targets: ModeTemperatures {
            heating: entry.heating.unwrap_or(f64::NAN),
            cooling: entry.cooling_target.unwrap_or(f64::NAN),
            eco_heating: entry.eco_heating.unwrap_or(f64::NAN),
            eco_cooling: entry.eco_cooling.unwrap_or(f64::NAN),
        },
        floor_heating_offset_c: entry.floor_heating_offset,
        floor_cooling_offset_c: entry.floor_cooling_offset,
        limit_c: entry.limit,
        midpoint_c: midpoints.map(|m| m.get(mode)),
    }
}
