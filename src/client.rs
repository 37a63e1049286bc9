//! One interface over both protocols.
//!
//! [`Client::connect`] picks the protocol from the address scheme. Both
//! protocol clients implement [`DeviceClient`], so code written against the
//! trait works with either; operations a protocol cannot express return
//! [`crate::Error::Unsupported`].

use crate::{
    address::Address,
    model::{DeviceState, Mode, ThermostatId},
    poller::PollSettings,
    service_client::ServiceClient,
    Result,
};
use std::{future::Future, time::Duration};

#[cfg(feature = "modbus-tcp")]
use crate::modbus_client::ModbusClient;

/// Operations on an NGBS iCON controller.
///
/// Every write waits until the device reports the written value before it
/// returns the state it observed; see [`crate::poller`]. A write that is
/// never reported fails with [`crate::Error::Convergence`] even though the device
/// may apply it later.
pub trait DeviceClient {
    /// Logical address of the device, `scheme://[sysid@]host:port`.
    fn address(&self) -> String;

    /// Reads a fresh snapshot.
    ///
    /// `include_config` additionally fetches the configuration block, which
    /// the settle check needs. It is ignored where no such block exists.
    fn get_state(&self, include_config: bool) -> impl Future<Output = Result<DeviceState>> + Send;

    /// Sets a thermostat target.
    ///
    /// With `mode` the target of that mode is written, otherwise the target
    /// of whatever mode the thermostat currently runs in. The value is
    /// rounded to one decimal.
    fn set_thermostat_target(
        &self,
        id: &ThermostatId,
        target: f64,
        mode: Option<Mode>,
    ) -> impl Future<Output = Result<DeviceState>> + Send;

    /// Sets the adjustable band (±) of a thermostat. Not polled.
    fn set_thermostat_limit(
        &self,
        id: &ThermostatId,
        limit: f64,
    ) -> impl Future<Output = Result<DeviceState>> + Send;

    /// Locks or unlocks a thermostat. Not polled.
    fn set_thermostat_parental_lock(
        &self,
        id: &ThermostatId,
        locked: bool,
    ) -> impl Future<Output = Result<DeviceState>> + Send;

    fn set_thermostat_eco(
        &self,
        id: &ThermostatId,
        eco: bool,
    ) -> impl Future<Output = Result<DeviceState>> + Send;

    fn set_thermostat_cooling(
        &self,
        id: &ThermostatId,
        cooling: bool,
    ) -> impl Future<Output = Result<DeviceState>> + Send;

    /// Switches the master eco mode of the controller.
    fn set_eco(&self, eco: bool) -> impl Future<Output = Result<DeviceState>> + Send;

    /// Switches the controller between heating and cooling.
    fn set_cooling(&self, cooling: bool) -> impl Future<Output = Result<DeviceState>> + Send;

    /// Derives and writes per-mode midpoints for every thermostat.
    ///
    /// `midpoint` is moved into the safe range per thermostat, taking its
    /// limit into account, see [`crate::limits::thermostat_midpoints`].
    /// Thermostats are written one by one; the first failure stops the
    /// batch and earlier writes stay in place.
    fn set_thermostat_limit_midpoints(
        &self,
        midpoint: f64,
        heating_cooling_diff: f64,
        eco_diff: f64,
    ) -> impl Future<Output = Result<DeviceState>> + Send;

    /// Asks the controller to restart. Does not wait for an answer.
    fn restart(&self) -> impl Future<Output = Result<()>> + Send;

    /// Asks the controller to install the latest firmware. Does not wait for an answer.
    fn software_update(&self) -> impl Future<Output = Result<()>> + Send;
}

/// A client for either protocol.
#[derive(Debug)]
pub enum Client {
    #[cfg_attr(docsrs, doc(cfg(feature = "modbus-tcp")))]
    #[cfg(feature = "modbus-tcp")]
    ModbusTcp(ModbusClient),
    Service(ServiceClient),
}

impl Client {
    /// Creates the client for `address`, see [`crate::address`].
    ///
    /// Nothing is sent; an invalid address fails with
    /// [`crate::Error::Configuration`] right away.
    pub fn connect(address: &str) -> Result<Self> {
        Self::from_address(&address.parse()?, None)
    }

    /// Like [`Client::connect`] with a request timeout other than the default.
    pub fn connect_with_timeout(address: &str, timeout: Duration) -> Result<Self> {
        Self::from_address(&address.parse()?, Some(timeout))
    }

    pub fn from_address(address: &Address, timeout: Option<Duration>) -> Result<Self> {
        match address {
            #[cfg(feature = "modbus-tcp")]
            Address::ModbusTcp { host, port } => {
                let client = ModbusClient::new(host.as_str(), *port);
                Ok(Client::ModbusTcp(match timeout {
                    Some(timeout) => client.with_timeout(timeout),
                    None => client,
                }))
            }
            #[cfg(not(feature = "modbus-tcp"))]
            Address::ModbusTcp { .. } => Err(crate::Error::Configuration(
                "Modbus TCP support is not compiled in (feature \"modbus-tcp\")".to_string(),
            )),
            Address::Service { sys_id, host, port } => {
                let client = ServiceClient::new(host.as_str(), sys_id.as_str(), *port);
                Ok(Client::Service(match timeout {
                    Some(timeout) => client.with_timeout(timeout),
                    None => client,
                }))
            }
        }
    }

    /// Replaces the polling budgets of the underlying client.
    pub fn with_poll_settings(self, poll: PollSettings) -> Self {
        match self {
            #[cfg(feature = "modbus-tcp")]
            Client::ModbusTcp(client) => Client::ModbusTcp(client.with_poll_settings(poll)),
            Client::Service(client) => Client::Service(client.with_poll_settings(poll)),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $client:ident => $call:expr) => {
        match $self {
            #[cfg(feature = "modbus-tcp")]
            Client::ModbusTcp($client) => $call.await,
            Client::Service($client) => $call.await,
        }
    };
}

impl DeviceClient for Client {
    fn address(&self) -> String {
        match self {
            #[cfg(feature = "modbus-tcp")]
            Client::ModbusTcp(client) => client.address(),
            Client::Service(client) => client.address(),
        }
    }

    async fn get_state(&self, include_config: bool) -> Result<DeviceState> {
        dispatch!(self, client => client.get_state(include_config))
    }

    async fn set_thermostat_target(
        &self,
        id: &ThermostatId,
        target: f64,
        mode: Option<Mode>,
    ) -> Result<DeviceState> {
        dispatch!(self, client => client.set_thermostat_target(id, target, mode))
    }

    async fn set_thermostat_limit(&self, id: &ThermostatId, limit: f64) -> Result<DeviceState> {
        dispatch!(self, client => client.set_thermostat_limit(id, limit))
    }

    async fn set_thermostat_parental_lock(
        &self,
        id: &ThermostatId,
        locked: bool,
    ) -> Result<DeviceState> {
        dispatch!(self, client => client.set_thermostat_parental_lock(id, locked))
    }

    async fn set_thermostat_eco(&self, id: &ThermostatId, eco: bool) -> Result<DeviceState> {
        dispatch!(self, client => client.set_thermostat_eco(id, eco))
    }

    async fn set_thermostat_cooling(
        &self,
        id: &ThermostatId,
        cooling: bool,
    ) -> Result<DeviceState> {
        dispatch!(self, client => client.set_thermostat_cooling(id, cooling))
    }

    async fn set_eco(&self, eco: bool) -> Result<DeviceState> {
        dispatch!(self, client => client.set_eco(eco))
    }

    async fn set_cooling(&self, cooling: bool) -> Result<DeviceState> {
        dispatch!(self, client => client.set_cooling(cooling))
    }

    async fn set_thermostat_limit_midpoints(
        &self,
        midpoint: f64,
        heating_cooling_diff: f64,
        eco_diff: f64,
    ) -> Result<DeviceState> {
        dispatch!(self, client => client.set_thermostat_limit_midpoints(
            midpoint,
            heating_cooling_diff,
            eco_diff
        ))
    }

    async fn restart(&self) -> Result<()> {
        dispatch!(self, client => client.restart())
    }

    async fn software_update(&self) -> Result<()> {
        dispatch!(self, client => client.software_update())
    }
}
