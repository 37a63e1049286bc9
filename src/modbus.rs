//! Register level access to the controller over `tokio-modbus`.
//!
//! [`Icon`] is stateless: every function takes the Modbus context to use,
//! so the caller decides how connections are opened, shared and timed out.
//! [`crate::modbus_client::ModbusClient`] does that for the common case.
//!
//! # Examples
//!
//! ```no_run
//! use ngbs_icon_lib::modbus::Icon;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut ctx = tokio_modbus::client::tcp::connect("192.168.1.2:502".parse()?).await?;
//!
//!     let read = Icon::read_registers(&mut ctx);
//!     let registers = tokio::time::timeout(Duration::from_secs(2), read).await??;
//!     let state = registers.into_state("modbus-tcp://192.168.1.2:502".to_string());
//!     for thermostat in &state.thermostats {
//!         println!("{thermostat}");
//!     }
//!     Ok(())
//! }
//! ```

use crate::{
    model::{Controller, DeviceState, Mode, Thermostat, ThermostatId},
    protocol::{self as proto, Slot},
    Result,
};
use tokio_modbus::prelude::{Reader, Writer};

/// Register operations of the iCON controller.
#[derive(Debug)]
pub struct Icon;

impl Icon {
    /// Helper function to map tokio result to our result.
    fn map_tokio_result<T>(result: tokio_modbus::Result<T>) -> Result<T> {
        match result {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err.into()), // Modbus exception
            Err(err) => Err(err.into()),     // IO error
        }
    }

    /// Helper function to read holding registers and decode them into a specific type.
    async fn read_and_decode<T, F>(
        ctx: &mut tokio_modbus::client::Context,
        address: u16,
        quantity: u16,
        decoder: F,
    ) -> Result<T>
    where
        F: FnOnce(&[u16]) -> std::result::Result<T, proto::Error>,
    {
        Ok(decoder(&Self::map_tokio_result(
            ctx.read_holding_registers(address, quantity).await,
        )?)?)
    }

    /// Reads the valve, eco, cooling and inactive flags of all slots.
    pub async fn read_bitmaps(ctx: &mut tokio_modbus::client::Context) -> Result<proto::Bitmaps> {
        Self::read_and_decode(
            ctx,
            proto::Bitmaps::ADDRESS,
            proto::Bitmaps::QUANTITY,
            proto::Bitmaps::decode_from_holding_registers,
        )
        .await
    }

    /// Reads temperature and humidity of all slots.
    pub async fn read_measurements(
        ctx: &mut tokio_modbus::client::Context,
    ) -> Result<proto::Measurements> {
        Self::read_and_decode(
            ctx,
            proto::Measurements::ADDRESS,
            proto::Measurements::QUANTITY,
            proto::Measurements::decode_from_holding_registers,
        )
        .await
    }

    /// Reads the four mode targets of all slots.
    pub async fn read_targets(ctx: &mut tokio_modbus::client::Context) -> Result<proto::Targets> {
        Self::read_and_decode(
            ctx,
            proto::Targets::ADDRESS,
            proto::Targets::QUANTITY,
            proto::Targets::decode_from_holding_registers,
        )
        .await
    }

    pub async fn read_controller(
        ctx: &mut tokio_modbus::client::Context,
    ) -> Result<proto::ControllerRegisters> {
        Self::read_and_decode(
            ctx,
            proto::ControllerRegisters::ADDRESS,
            proto::ControllerRegisters::QUANTITY,
            proto::ControllerRegisters::decode_from_holding_registers,
        )
        .await
    }

    pub async fn read_target_water_temperature(
        ctx: &mut tokio_modbus::client::Context,
    ) -> Result<proto::TargetWaterTemperature> {
        Self::read_and_decode(
            ctx,
            proto::TargetWaterTemperature::ADDRESS,
            proto::TargetWaterTemperature::QUANTITY,
            proto::TargetWaterTemperature::decode_from_holding_registers,
        )
        .await
    }

    /// Reads every register block needed for a [`DeviceState`].
    ///
    /// # Errors
    ///
    /// * [`crate::Error::Transport`] if the connection fails,
    /// * [`crate::Error::Rejected`] on a Modbus exception,
    /// * [`crate::Error::Encoding`] if a block has an unexpected length.
    pub async fn read_registers(ctx: &mut tokio_modbus::client::Context) -> Result<Registers> {
        Ok(Registers {
            bitmaps: Self::read_bitmaps(ctx).await?,
            measurements: Self::read_measurements(ctx).await?,
            targets: Self::read_targets(ctx).await?,
            controller: Self::read_controller(ctx).await?,
            target_water_temperature: Self::read_target_water_temperature(ctx).await?,
        })
    }

    /// Writes the target of `slot` in `mode`.
    ///
    /// `value` is the already encoded register value, see [`proto::encode_fixed`].
    pub async fn write_target(
        ctx: &mut tokio_modbus::client::Context,
        slot: Slot,
        mode: Mode,
        value: u16,
    ) -> Result<()> {
        Self::map_tokio_result(
            ctx.write_single_register(proto::Targets::register_address(slot, mode), value)
                .await,
        )
    }
}

/// The raw register blocks of one read.
#[derive(Debug, Clone, PartialEq)]
pub struct Registers {
    pub bitmaps: proto::Bitmaps,
    pub measurements: proto::Measurements,
    pub targets: proto::Targets,
    pub controller: proto::ControllerRegisters,
    pub target_water_temperature: proto::TargetWaterTemperature,
}

impl Registers {
    /// Maps the register blocks to the canonical model.
    ///
    /// Slots flagged inactive are left out. Thermostat ids are the slot numbers.
    pub fn into_state(self, address: String) -> DeviceState {
        let thermostats = Slot::all()
            .filter(|slot| !self.bitmaps.inactive[slot.index()])
            .map(|slot| self.thermostat(slot))
            .collect();
        let controller = Controller {
            eco_active: None,
            cooling_active: None,
            mixing_valve_percent: self.controller.mixing_valve,
            water_temperature_c: self.controller.water_temperature,
            outside_temperature_c: self.controller.outside_temperature,
            target_water_temperature_c: Some(self.target_water_temperature.0),
            midpoints: None,
            firmware_version: None,
            config_version: None,
            timezone: None,
            uptime_hours: None,
            config: None,
        };
        DeviceState::new(address, controller, thermostats)
    }

    fn thermostat(&self, slot: Slot) -> Thermostat {
        let i = slot.index();
        let mode = self.bitmaps.mode(slot);
        Thermostat {
            id: ThermostatId::new(slot.to_string()),
            name: None,
            is_live: true,
            is_on: true,
            parental_locked: false,
            time_program_active: false,
            valve_open: self.bitmaps.valve[i],
            eco_active: mode.eco,
            eco_follows_master: false,
            cooling_active: mode.cooling,
            current_temperature_c: self.measurements.temperature[i],
            relative_humidity: self.measurements.humidity[i],
            dew_point_c: None,
            dew_protection_active: false,
            frost_protection_active: false,
            targets: *self.targets.get(slot),
            floor_heating_offset_c: None,
            floor_cooling_offset_c: None,
            limit_c: None,
            midpoint_c: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registers() -> Registers {
        let mut block_a = [0u16; 9];
        block_a[0] = 0b0000_0101; // valves of slots 0 and 2 open
        block_a[4] = 0b0000_0100; // slot 2 eco
        block_a[6] = 0b0000_0110; // slots 1 and 2 cooling
        block_a[8] = 0b1111_1000; // slots 3..=7 inactive

        let mut block_b = [0u16; 16];
        for slot in 0..8 {
            block_b[slot] = 200 + slot as u16; // 20.0, 20.1, ...
            block_b[8 + slot] = 400 + slot as u16 * 10; // 40.0, 41.0, ...
        }

        let block_c: Vec<u16> = (0..32).map(|i| 180 + i as u16).collect();

        Registers {
            bitmaps: proto::Bitmaps::decode_from_holding_registers(&block_a).unwrap(),
            measurements: proto::Measurements::decode_from_holding_registers(&block_b).unwrap(),
            targets: proto::Targets::decode_from_holding_registers(&block_c).unwrap(),
            controller: proto::ControllerRegisters::decode_from_holding_registers(&[
                425,
                352,
                (-35i16) as u16,
            ])
            .unwrap(),
            target_water_temperature: proto::TargetWaterTemperature(35.0),
        }
    }

    #[test]
    fn inactive_slots_are_excluded() {
        let state = registers().into_state("modbus-tcp://host:502".into());
        let ids: Vec<&str> = state.thermostats.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["0", "1", "2"]);
    }

    #[test]
    fn thermostat_mapping() {
        let state = registers().into_state("modbus-tcp://host:502".into());
        let [heating, cooling, eco_cooling] = &state.thermostats[..] else {
            panic!("expected three thermostats");
        };

        assert!(heating.valve_open && !cooling.valve_open && eco_cooling.valve_open);
        assert_eq!(heating.mode(), Mode::HEATING);
        assert_eq!(cooling.mode(), Mode::COOLING);
        assert_eq!(eco_cooling.mode(), Mode::ECO_COOLING);

        assert_eq!(cooling.current_temperature_c, 20.1);
        assert_eq!(cooling.relative_humidity, 41.0);

        // slot 2 targets start at register 387 + 8
        assert_eq!(eco_cooling.targets.heating, 18.8);
        assert_eq!(eco_cooling.current_target_c(), 19.1);
        assert_eq!(heating.current_target_c(), 18.0);
    }

    #[test]
    fn controller_mapping() {
        let state = registers().into_state("modbus-tcp://host:502".into());
        let controller = &state.controller;
        assert_eq!(controller.mixing_valve_percent, 42.5);
        assert_eq!(controller.water_temperature_c, 35.2);
        assert_eq!(controller.outside_temperature_c, -3.5);
        assert_eq!(controller.target_water_temperature_c, Some(35.0));
        assert_eq!(controller.eco_active, None);
        assert!(controller.config.is_none());
    }
}
