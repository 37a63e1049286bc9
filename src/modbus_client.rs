//! Stateful Modbus TCP client.
//!
//! Wraps one `tokio-modbus` connection in a mutex so the client can be shared
//! between tasks; requests are serialized. The connection is opened lazily,
//! reopened after the device dropped it and reopened when it sat idle long
//! enough for the controller to have discarded it.

use crate::{
    address::MODBUS_TCP_SCHEME,
    client::DeviceClient,
    model::{round_tenth, DeviceState, Mode, ThermostatId},
    modbus::{Icon, Registers},
    poller::{is_settled, poll_until, PollSettings},
    protocol::{self as proto, Slot},
    Error, Result,
};
use futures::future::BoxFuture;
use log::debug;
use std::{io, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tokio_modbus::client::Context;

/// Time allowed for one Modbus request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
/// Idle time after which the controller is assumed to have closed the connection.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const PROTOCOL: &str = "Modbus";

struct Connection {
    ctx: Context,
    last_used: Instant,
}

/// A controller reachable over Modbus TCP.
///
/// Only the registers for thermostat readings and targets exist on this
/// interface. Everything else returns [`Error::Unsupported`].
pub struct ModbusClient {
    host: String,
    port: u16,
    timeout: Duration,
    idle_timeout: Duration,
    poll: PollSettings,
    connection: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for ModbusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn is_connection_closed(err: &Error) -> bool {
    matches!(
        err,
        Error::Transport(err) if matches!(
            err.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::NotConnected
        )
    )
}

impl ModbusClient {
    /// Creates a client. No connection is made until the first request.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            poll: PollSettings::default(),
            connection: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    async fn timed<T>(
        &self,
        what: &str,
        request: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| Error::timed_out(what))?
    }

    async fn connect(&self) -> Result<Context> {
        debug!("Connecting to {}:{}", self.host, self.port);
        let connect = async {
            let socket_addr = tokio::net::lookup_host((self.host.as_str(), self.port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("Cannot resolve {}", self.host),
                    )
                })?;
            Ok::<_, Error>(tokio_modbus::client::tcp::connect(socket_addr).await?)
        };
        self.timed("Modbus connect", connect).await
    }

    /// Returns an open connection and whether it was opened just now.
    async fn ensure_connected<'a>(
        &self,
        slot: &'a mut Option<Connection>,
    ) -> Result<(&'a mut Connection, bool)> {
        let (connection, fresh) = match slot.take() {
            Some(connection) if connection.last_used.elapsed() < self.idle_timeout => {
                (connection, false)
            }
            previous => {
                if previous.is_some() {
                    debug!("Connection idle for too long, reconnecting");
                }
                let connection = Connection {
                    ctx: self.connect().await?,
                    last_used: Instant::now(),
                };
                (connection, true)
            }
        };
        Ok((slot.insert(connection), fresh))
    }

    /// Runs `op` on the connection, reconnecting once if a reused
    /// connection turns out to be closed.
    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'c> Fn(&'c mut Context) -> BoxFuture<'c, Result<T>>,
    {
        let mut slot = self.connection.lock().await;
        let (connection, fresh) = self.ensure_connected(&mut slot).await?;
        let mut result = self.timed("Modbus request", op(&mut connection.ctx)).await;

        if !fresh && result.as_ref().is_err_and(is_connection_closed) {
            debug!("Connection closed by the device, reconnecting");
            *slot = None;
            let (connection, _) = self.ensure_connected(&mut slot).await?;
            result = self.timed("Modbus request", op(&mut connection.ctx)).await;
        }

        match &result {
            Ok(_) => {
                if let Some(connection) = slot.as_mut() {
                    connection.last_used = Instant::now();
                }
            }
            // the stream may be out of step with the device, start over next time
            Err(Error::Transport(_) | Error::Protocol(_)) => *slot = None,
            Err(_) => {}
        }
        result
    }

    async fn read_registers(&self) -> Result<Registers> {
        self.with_connection(|ctx| Box::pin(Icon::read_registers(ctx)))
            .await
    }

    fn slot(id: &ThermostatId) -> Result<Slot> {
        id.as_str()
            .parse::<u8>()
            .ok()
            .and_then(|n| Slot::try_from(n).ok())
            .ok_or_else(|| Error::UnknownThermostat(id.to_string()))
    }
}

impl DeviceClient for ModbusClient {
    fn address(&self) -> String {
        format!("{MODBUS_TCP_SCHEME}://{}:{}", self.host, self.port)
    }

    async fn get_state(&self, _include_config: bool) -> Result<DeviceState> {
        Ok(self.read_registers().await?.into_state(self.address()))
    }

    /// Without a `mode` the target of the mode the slot currently runs in
    /// is written.
    async fn set_thermostat_target(
        &self,
        id: &ThermostatId,
        target: f64,
        mode: Option<Mode>,
    ) -> Result<DeviceState> {
        let slot = Self::slot(id)?;
        let target = round_tenth(target);
        let value = proto::encode_fixed(target)?;

        let bitmaps = self
            .with_connection(|ctx| Box::pin(Icon::read_bitmaps(ctx)))
            .await?;
        if bitmaps.inactive[slot.index()] {
            return Err(Error::UnknownThermostat(id.to_string()));
        }
        let mode = mode.unwrap_or_else(|| bitmaps.mode(slot));

        debug!("Writing {target} to slot {slot} ({mode})");
        self.with_connection(move |ctx| Box::pin(Icon::write_target(ctx, slot, mode, value)))
            .await?;

        poll_until(
            self.poll.thermostat,
            move || self.get_state(false),
            |state: &DeviceState| {
                state
                    .thermostat(id)
                    .is_some_and(|th| round_tenth(th.targets.get(mode)) == target)
            },
            is_settled,
        )
        .await
    }

    async fn set_thermostat_limit(&self, _id: &ThermostatId, _limit: f64) -> Result<DeviceState> {
        Err(Error::Unsupported("Setting the limit", PROTOCOL))
    }

    async fn set_thermostat_parental_lock(
        &self,
        _id: &ThermostatId,
        _locked: bool,
    ) -> Result<DeviceState> {
        Err(Error::Unsupported("Setting the parental lock", PROTOCOL))
    }

    async fn set_thermostat_eco(&self, _id: &ThermostatId, _eco: bool) -> Result<DeviceState> {
        Err(Error::Unsupported("Setting the thermostat eco mode", PROTOCOL))
    }

    async fn set_thermostat_cooling(
        &self,
        _id: &ThermostatId,
        _cooling: bool,
    ) -> Result<DeviceState> {
        Err(Error::Unsupported("Setting the thermostat cooling mode", PROTOCOL))
    }

    async fn set_eco(&self, _eco: bool) -> Result<DeviceState> {
        Err(Error::Unsupported("Setting the master eco mode", PROTOCOL))
    }

    async fn set_cooling(&self, _cooling: bool) -> Result<DeviceState> {
        Err(Error::Unsupported("Setting the master cooling mode", PROTOCOL))
    }

    async fn set_thermostat_limit_midpoints(
        &self,
        _midpoint: f64,
        _heating_cooling_diff: f64,
        _eco_diff: f64,
    ) -> Result<DeviceState> {
        Err(Error::Unsupported("Setting midpoints", PROTOCOL))
    }

    async fn restart(&self) -> Result<()> {
        Err(Error::Unsupported("Restarting", PROTOCOL))
    }

    async fn software_update(&self) -> Result<()> {
        Err(Error::Unsupported("Software update", PROTOCOL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{poller::PollPolicy, testing::FakeModbus};
    use assert_matches::assert_matches;

    fn device_registers() -> Vec<u16> {
        let mut registers = vec![0u16; 512];
        registers[0] = 0b01; // slot 0 valve open
        registers[4] = 0b01; // slot 0 eco
        registers[8] = 0b1111_1100; // slots 2..=7 inactive
        registers[16] = 300; // mixing valve
        registers[17] = 350; // water
        registers[18] = 80; // outside
        registers[25] = 205;
        registers[26] = 221;
        registers[33] = 450;
        registers[34] = 380;
        for target in &mut registers[387..419] {
            *target = 210;
        }
        registers[420] = 400;
        registers
    }

    async fn client(requests_per_connection: usize) -> (FakeModbus, ModbusClient) {
        let device = FakeModbus::start(device_registers(), requests_per_connection).await;
        let delay = Duration::from_millis(1);
        let client = ModbusClient::new("127.0.0.1", device.port)
            .with_timeout(Duration::from_secs(1))
            .with_poll_settings(PollSettings {
                thermostat: PollPolicy::new(10, delay),
                master: PollPolicy::new(20, delay),
                mode_flip: PollPolicy::new(2, delay),
            });
        (device, client)
    }

    #[tokio::test]
    async fn read_state() {
        let (device, client) = client(usize::MAX).await;
        let state = client.get_state(true).await.unwrap();
        assert_eq!(state.address, format!("modbus-tcp://127.0.0.1:{}", device.port));

        let ids: Vec<&str> = state.thermostats.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["0", "1"]);
        assert_eq!(state.thermostats[0].mode(), Mode::ECO_HEATING);
        assert_eq!(state.thermostats[0].current_temperature_c, 20.5);
        assert_eq!(state.thermostats[1].relative_humidity, 38.0);
        assert_eq!(state.controller.target_water_temperature_c, Some(40.0));
        assert_eq!(device.connections(), 1);
    }

    #[tokio::test]
    async fn write_target_of_explicit_mode() {
        let (device, client) = client(usize::MAX).await;
        let id = ThermostatId::from("1");
        let state = client
            .set_thermostat_target(&id, 22.54, Some(Mode::COOLING))
            .await
            .unwrap();
        assert_eq!(device.register(392), 225);
        assert_eq!(state.thermostat(&id).unwrap().targets.cooling, 22.5);
    }

    #[tokio::test]
    async fn write_target_of_current_mode() {
        let (device, client) = client(usize::MAX).await;
        let id = ThermostatId::from("0");
        let state = client.set_thermostat_target(&id, 19.0, None).await.unwrap();
        // slot 0 runs in eco heating
        assert_eq!(device.register(389), 190);
        assert_eq!(state.thermostat(&id).unwrap().current_target_c(), 19.0);
    }

    #[tokio::test]
    async fn unknown_thermostats() {
        let (device, client) = client(usize::MAX).await;
        for id in ["5", "9", "1.1", ""] {
            assert_matches!(
                client
                    .set_thermostat_target(&ThermostatId::from(id), 20.0, Some(Mode::HEATING))
                    .await,
                Err(Error::UnknownThermostat(..))
            );
        }
        assert_eq!(device.register(387 + 5 * 4), 210);
    }

    #[tokio::test]
    async fn unencodable_target_fails_before_io() {
        let (device, client) = client(usize::MAX).await;
        assert_matches!(
            client
                .set_thermostat_target(&ThermostatId::from("0"), 4000.0, None)
                .await,
            Err(Error::Encoding(proto::Error::DegreeCelsiusOutOfRange(..)))
        );
        assert_eq!(device.connections(), 0);
    }

    #[tokio::test]
    async fn json_only_operations_are_unsupported() {
        let (device, client) = client(usize::MAX).await;
        let id = ThermostatId::from("0");
        assert_matches!(client.set_eco(true).await, Err(Error::Unsupported(..)));
        assert_matches!(client.set_cooling(true).await, Err(Error::Unsupported(..)));
        assert_matches!(client.set_thermostat_limit(&id, 2.0).await, Err(Error::Unsupported(..)));
        assert_matches!(
            client.set_thermostat_limit_midpoints(21.0, 1.0, 1.0).await,
            Err(Error::Unsupported(..))
        );
        assert_matches!(client.restart().await, Err(Error::Unsupported(..)));
        assert_eq!(device.connections(), 0);
    }

    #[tokio::test]
    async fn reconnects_after_device_closed_connection() {
        // one full state read per connection
        let (device, client) = client(5).await;
        client.get_state(false).await.unwrap();
        client.get_state(false).await.unwrap();
        assert_eq!(device.connections(), 2);
    }

    #[tokio::test]
    async fn reconnects_after_idle_timeout() {
        let (device, client) = client(usize::MAX).await;
        let client = client.with_idle_timeout(Duration::ZERO);
        client.get_state(false).await.unwrap();
        client.get_state(false).await.unwrap();
        assert_eq!(device.connections(), 2);
    }

    #[tokio::test]
    async fn unreachable_device() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let client = ModbusClient::new("127.0.0.1", port);
        let err = client.get_state(false).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
