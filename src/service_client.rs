//! Client for the JSON service protocol.
//!
//! Every request opens a new TCP connection, sends one JSON object, closes
//! its sending half and reads one JSON object until the device closes the
//! connection. Nothing is kept open between requests.

use crate::{
    client::DeviceClient,
    limits,
    model::{round_tenth, Controller, DeviceState, Mode, ThermostatId},
    poller::{is_settled, poll_until, PollSettings},
    service::{self, Request, ThermostatWrite},
    Error, Result,
};
use log::{debug, info, trace};
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

/// Time allowed for one request, from connecting until the response is complete.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Rejects values that would be written as `null`.
fn check_finite(what: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::Configuration(format!("Invalid {what}: {value}")))
    }
}

/// A controller reachable over the JSON service protocol.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    host: String,
    port: u16,
    sys_id: String,
    timeout: Duration,
    poll: PollSettings,
}

impl ServiceClient {
    /// Creates a client. No connection is made until the first request.
    pub fn new(host: impl Into<String>, sys_id: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            sys_id: sys_id.into(),
            timeout: DEFAULT_TIMEOUT,
            poll: PollSettings::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn sys_id(&self) -> &str {
        &self.sys_id
    }

    /// Sends `payload` and returns the raw response.
    async fn round_trip(&self, payload: &[u8]) -> Result<Vec<u8>> {
        trace!("{}:{} <- {}", self.host, self.port, String::from_utf8_lossy(payload));
        let exchange = async {
            let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
            stream.write_all(payload).await?;
            stream.shutdown().await?;
            let mut response = Vec::new();
            stream.read_to_end(&mut response).await?;
            Ok::<_, std::io::Error>(response)
        };
        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::timed_out(&format!("Request to {}:{}", self.host, self.port)))??;
        trace!("{}:{} -> {}", self.host, self.port, String::from_utf8_lossy(&response));
        Ok(response)
    }

    /// Sends `request` without waiting for an answer.
    async fn send(&self, request: &Request<'_>) -> Result<()> {
        let payload = request.to_bytes()?;
        let send = async {
            let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
            stream.write_all(&payload).await?;
            stream.shutdown().await
        };
        tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| Error::timed_out(&format!("Request to {}:{}", self.host, self.port)))??;
        Ok(())
    }

    async fn exchange(&self, request: &Request<'_>) -> Result<serde_json::Value> {
        let response = self.round_trip(&request.to_bytes()?).await?;
        service::parse_json(&response)
    }

    async fn state_request(&self, request: &Request<'_>) -> Result<DeviceState> {
        let value = self.exchange(request).await?;
        service::parse_state(&self.address(), value)
    }

    /// Asks the controller for its system id.
    ///
    /// Returns `None` when the controller refuses to tell, which firmware
    /// older than 1079 does.
    pub async fn get_sys_id(&self) -> Result<Option<String>> {
        let value = self.exchange(&Request::identify()).await?;
        service::parse_sys_id(value)
    }

    /// The complete response to a configuration read, without interpretation.
    pub async fn export(&self) -> Result<serde_json::Value> {
        let value = self.exchange(&Request::read(&self.sys_id, true)).await?;
        service::check_rejected(&value)?;
        Ok(value)
    }

    async fn write_thermostat(&self, id: &ThermostatId, write: ThermostatWrite) -> Result<()> {
        debug!("Writing {write:?} to thermostat {id}");
        self.state_request(&Request::thermostat(&self.sys_id, id, write))
            .await
            .map(drop)
    }

    /// Waits for a thermostat change; `applied` is checked on the thermostat.
    async fn await_thermostat<P>(&self, id: &ThermostatId, applied: P) -> Result<DeviceState>
    where
        P: Fn(&crate::model::Thermostat) -> bool,
    {
        poll_until(
            self.poll.thermostat,
            move || self.get_state(true),
            |state: &DeviceState| state.thermostat(id).is_some_and(&applied),
            is_settled,
        )
        .await
    }

    /// Waits for a master-mode change in two phases.
    ///
    /// First a short check that the master flag flipped at all, so a device
    /// ignoring the request fails fast. Then a longer wait for the valves.
    async fn await_master<P>(&self, flipped: P) -> Result<DeviceState>
    where
        P: Fn(&Controller) -> bool,
    {
        poll_until(
            self.poll.mode_flip,
            move || self.get_state(false),
            |state: &DeviceState| flipped(&state.controller),
            |_| true,
        )
        .await?;
        poll_until(
            self.poll.master,
            move || self.get_state(true),
            |_| true,
            is_settled,
        )
        .await
    }
}

impl DeviceClient for ServiceClient {
    fn address(&self) -> String {
        format!(
            "{}://{}@{}:{}",
            crate::address::SERVICE_SCHEME,
            self.sys_id,
            self.host,
            self.port
        )
    }

    async fn get_state(&self, include_config: bool) -> Result<DeviceState> {
        self.state_request(&Request::read(&self.sys_id, include_config))
            .await
    }

    async fn set_thermostat_target(
        &self,
        id: &ThermostatId,
        target: f64,
        mode: Option<Mode>,
    ) -> Result<DeviceState> {
        check_finite("target", target)?;
        let target = round_tenth(target);
        let write = match mode {
            Some(mode) => ThermostatWrite::target(mode, target),
            None => ThermostatWrite::current_target(target),
        };
        self.write_thermostat(id, write).await?;
        self.await_thermostat(id, |th| {
            let value = match mode {
                Some(mode) => th.targets.get(mode),
                None => th.current_target_c(),
            };
            round_tenth(value) == target
        })
        .await
    }

    async fn set_thermostat_limit(&self, id: &ThermostatId, limit: f64) -> Result<DeviceState> {
        let limit = round_tenth(limit);
        if !(0.0..=limits::MAX_TARGET_C - limits::MIN_TARGET_C).contains(&limit) {
            return Err(Error::Configuration(format!("Invalid limit ±{limit}")));
        }
        self.write_thermostat(id, ThermostatWrite::limit(limit)).await?;
        self.get_state(false).await
    }

    async fn set_thermostat_parental_lock(
        &self,
        id: &ThermostatId,
        locked: bool,
    ) -> Result<DeviceState> {
        self.write_thermostat(id, ThermostatWrite::parental_lock(locked))
            .await?;
        self.get_state(false).await
    }

    async fn set_thermostat_eco(&self, id: &ThermostatId, eco: bool) -> Result<DeviceState> {
        self.write_thermostat(id, ThermostatWrite::eco(eco)).await?;
        self.await_thermostat(id, |th| th.eco_active == eco).await
    }

    async fn set_thermostat_cooling(
        &self,
        id: &ThermostatId,
        cooling: bool,
    ) -> Result<DeviceState> {
        self.write_thermostat(id, ThermostatWrite::cooling(cooling))
            .await?;
        self.await_thermostat(id, |th| th.cooling_active == cooling)
            .await
    }

    async fn set_eco(&self, eco: bool) -> Result<DeviceState> {
        info!("Switching master eco mode {}", if eco { "on" } else { "off" });
        self.state_request(&Request::master_eco(&self.sys_id, eco))
            .await?;
        self.await_master(|controller| controller.eco_active == Some(eco))
            .await
    }

    async fn set_cooling(&self, cooling: bool) -> Result<DeviceState> {
        info!(
            "Switching master mode to {}",
            if cooling { "cooling" } else { "heating" }
        );
        self.state_request(&Request::master_cooling(&self.sys_id, cooling))
            .await?;
        self.await_master(|controller| controller.cooling_active == Some(cooling))
            .await
    }

    async fn set_thermostat_limit_midpoints(
        &self,
        midpoint: f64,
        heating_cooling_diff: f64,
        eco_diff: f64,
    ) -> Result<DeviceState> {
        check_finite("midpoint", midpoint)?;
        check_finite("heating/cooling difference", heating_cooling_diff)?;
        check_finite("eco difference", eco_diff)?;
        let state = self.get_state(false).await?;
        for th in &state.thermostats {
            let limit = th.limit_c.unwrap_or(0.0);
            let midpoints =
                limits::thermostat_midpoints(midpoint, limit, heating_cooling_diff, eco_diff);
            debug!("Thermostat {} (limit ±{limit}): midpoints {midpoints}", th.id);
            self.write_thermostat(&th.id, ThermostatWrite::midpoints(&midpoints))
                .await?;
        }
        self.get_state(false).await
    }

    async fn restart(&self) -> Result<()> {
        info!("Restarting controller {}", self.address());
        self.send(&Request::restart(&self.sys_id)).await
    }

    async fn software_update(&self) -> Result<()> {
        info!("Starting software update on controller {}", self.address());
        self.send(&Request::software_update(&self.sys_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        poller::PollPolicy,
        testing::{sample_state, FakeDevice, Simulator, SYS_ID},
    };
    use assert_matches::assert_matches;
    use serde_json::json;

    fn fast_polling() -> PollSettings {
        let delay = Duration::from_millis(1);
        PollSettings {
            thermostat: PollPolicy::new(10, delay),
            master: PollPolicy::new(20, delay),
            mode_flip: PollPolicy::new(2, delay),
        }
    }

    async fn simulated(simulator: Simulator) -> (FakeDevice, ServiceClient) {
        let device = FakeDevice::start(simulator.into_handler()).await;
        let client = ServiceClient::new("127.0.0.1", SYS_ID, device.port)
            .with_timeout(Duration::from_secs(1))
            .with_poll_settings(fast_polling());
        (device, client)
    }

    /// Number of plain state reads among `requests`.
    fn reads(requests: &[serde_json::Value]) -> usize {
        requests
            .iter()
            .filter(|r| ["DP", "CE", "HC"].iter().all(|key| r.get(key).is_none()))
            .count()
    }

    #[tokio::test]
    async fn read_state() {
        let (device, client) = simulated(Simulator::new(sample_state(), 0)).await;
        let state = client.get_state(false).await.unwrap();
        assert_eq!(state.thermostats.len(), 3);
        assert_eq!(state.address, format!("service://{SYS_ID}@127.0.0.1:{}", device.port));
        assert!(state.controller.config.is_none());

        let state = client.get_state(true).await.unwrap();
        assert_eq!(
            state.controller.config.unwrap().thermostat_hysteresis_c,
            Some(0.5)
        );
        assert_eq!(
            device.requests(),
            [json!({"SYSID": SYS_ID}), json!({"SYSID": SYS_ID, "RELOAD": 1})]
        );
    }

    #[tokio::test]
    async fn wrong_sys_id_is_rejected() {
        let device = FakeDevice::start(Simulator::new(sample_state(), 0).into_handler()).await;
        let client = ServiceClient::new("127.0.0.1", "42", device.port);
        assert_matches!(client.get_state(false).await, Err(Error::Rejected(..)));
    }

    #[tokio::test]
    async fn target_converges_after_delayed_apply() {
        let (device, client) = simulated(Simulator::new(sample_state(), 3)).await;
        let id = ThermostatId::from("1.1");
        let state = client
            .set_thermostat_target(&id, 22.5, Some(Mode::HEATING))
            .await
            .unwrap();
        assert_eq!(state.thermostat(&id).unwrap().targets.heating, 22.5);

        let requests = device.requests();
        assert_eq!(requests[0], json!({"SYSID": SYS_ID, "DP": {"1.1": {"XAH": 22.5}}}));
        assert_eq!(reads(&requests), 3);
    }

    #[tokio::test]
    async fn target_without_mode_uses_current_setpoint() {
        let (device, client) = simulated(Simulator::new(sample_state(), 1)).await;
        let id = ThermostatId::from("1.2");
        let state = client.set_thermostat_target(&id, 17.25, None).await.unwrap();
        // 1.2 runs in eco heating
        assert_eq!(state.thermostat(&id).unwrap().targets.eco_heating, 17.3);
        assert_eq!(device.requests()[0]["DP"]["1.2"], json!({"REQ": 17.3}));
    }

    #[tokio::test]
    async fn ignored_write_fails_after_budget() {
        let (device, client) = simulated(Simulator::new(sample_state(), 0).ignoring_writes()).await;
        let result = client
            .set_thermostat_target(&ThermostatId::from("1.1"), 25.0, Some(Mode::HEATING))
            .await;
        assert_matches!(result, Err(Error::Convergence { attempts: 10 }));
        assert_eq!(reads(&device.requests()), 10);
    }

    #[tokio::test]
    async fn non_finite_values_fail_before_io() {
        let (device, client) = simulated(Simulator::new(sample_state(), 0)).await;
        let id = ThermostatId::from("1.1");
        assert_matches!(
            client.set_thermostat_target(&id, f64::NAN, None).await,
            Err(Error::Configuration(..))
        );
        assert_matches!(
            client
                .set_thermostat_target(&id, f64::INFINITY, Some(Mode::COOLING))
                .await,
            Err(Error::Configuration(..))
        );
        assert_matches!(
            client.set_thermostat_limit(&id, f64::NAN).await,
            Err(Error::Configuration(..))
        );
        assert_matches!(
            client.set_thermostat_limit_midpoints(f64::NAN, 1.0, 1.0).await,
            Err(Error::Configuration(..))
        );
        assert_matches!(
            client
                .set_thermostat_limit_midpoints(21.0, 1.0, f64::NEG_INFINITY)
                .await,
            Err(Error::Configuration(..))
        );
        assert!(device.requests().is_empty());
    }

    #[tokio::test]
    async fn thermostat_mode_flags() {
        let (_device, client) = simulated(Simulator::new(sample_state(), 2)).await;
        let id = ThermostatId::from("1.1");
        let state = client.set_thermostat_eco(&id, true).await.unwrap();
        assert!(state.thermostat(&id).unwrap().eco_active);
        let state = client.set_thermostat_cooling(&id, true).await.unwrap();
        assert_eq!(state.thermostat(&id).unwrap().mode(), Mode::ECO_COOLING);
    }

    #[tokio::test]
    async fn master_mode_change() {
        let (device, client) = simulated(Simulator::new(sample_state(), 1)).await;
        let state = client.set_eco(true).await.unwrap();
        assert_eq!(state.controller.eco_active, Some(true));
        assert_eq!(device.requests()[0], json!({"SYSID": SYS_ID, "CE": 1}));

        let state = client.set_cooling(true).await.unwrap();
        assert_eq!(state.controller.cooling_active, Some(true));
    }

    #[tokio::test]
    async fn ignored_master_change_fails_fast() {
        let (device, client) = simulated(Simulator::new(sample_state(), 0).ignoring_writes()).await;
        let result = client.set_cooling(true).await;
        assert_matches!(result, Err(Error::Convergence { attempts: 2 }));
        assert_eq!(reads(&device.requests()), 2);
    }

    #[tokio::test]
    async fn limit_and_lock_read_back_once() {
        let (device, client) = simulated(Simulator::new(sample_state(), 0)).await;
        let id = ThermostatId::from("1.2");
        client.set_thermostat_limit(&id, 4.0).await.unwrap();
        client.set_thermostat_parental_lock(&id, true).await.unwrap();
        let requests = device.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[0]["DP"]["1.2"], json!({"LIM": 4.0}));
        assert_eq!(requests[2]["DP"]["1.2"], json!({"PL": 1}));

        assert_matches!(
            client.set_thermostat_limit(&id, -1.0).await,
            Err(Error::Configuration(..))
        );
        assert_eq!(device.requests().len(), 4);
    }

    #[tokio::test]
    async fn midpoints_are_written_per_thermostat() {
        let (device, client) = simulated(Simulator::new(sample_state(), 0)).await;
        client
            .set_thermostat_limit_midpoints(44.0, 1.0, 1.0)
            .await
            .unwrap();

        let requests = device.requests();
        let writes: Vec<_> = requests.iter().filter(|r| r.get("DP").is_some()).collect();
        assert_eq!(writes.len(), 3);
        // limit 3: 44 moves down to 42
        assert_eq!(
            writes[0]["DP"]["1.1"],
            json!({"MXAH": 41.0, "MXAC": 43.0, "MECOH": 40.0, "MECOC": 44.0})
        );
        // limit 2: 44 moves down to 43
        assert_eq!(
            writes[1]["DP"]["1.2"],
            json!({"MXAH": 42.0, "MXAC": 44.0, "MECOH": 41.0, "MECOC": 45.0})
        );
        // limit 0: 44 stays
        assert_eq!(
            writes[2]["DP"]["1.10"],
            json!({"MXAH": 43.0, "MXAC": 45.0, "MECOH": 42.0, "MECOC": 46.0})
        );
        assert_eq!(reads(&requests), 2);
    }

    #[tokio::test]
    async fn midpoints_stop_at_first_failure() {
        let device = FakeDevice::start(|request| {
            if request.get("DP").is_some() {
                Some(json!({"ERR": 1}))
            } else {
                Some(sample_state())
            }
        })
        .await;
        let client = ServiceClient::new("127.0.0.1", SYS_ID, device.port);
        assert_matches!(
            client.set_thermostat_limit_midpoints(21.0, 1.0, 1.0).await,
            Err(Error::Rejected(..))
        );
        assert_eq!(device.requests().len(), 2);
    }

    #[tokio::test]
    async fn sys_id() {
        let (_device, client) = simulated(Simulator::new(sample_state(), 0)).await;
        assert_eq!(client.get_sys_id().await.unwrap(), Some(SYS_ID.to_string()));

        let device = FakeDevice::start(|_| Some(json!({"ERR": 1}))).await;
        let client = ServiceClient::new("127.0.0.1", "", device.port);
        assert_eq!(client.get_sys_id().await.unwrap(), None);
        assert_eq!(device.requests(), [json!({"RELOAD": 6})]);
    }

    #[tokio::test]
    async fn export_returns_raw_response() {
        let (_device, client) = simulated(Simulator::new(sample_state(), 0)).await;
        let value = client.export().await.unwrap();
        assert_eq!(value["CFG"]["NAME"], json!("House"));
        assert_eq!(value["DP"]["1.3"], json!({"ON": 0}));
    }

    #[tokio::test]
    async fn commands_are_fire_and_forget() {
        let device = FakeDevice::start(|_| None).await;
        let client = ServiceClient::new("127.0.0.1", SYS_ID, device.port)
            .with_timeout(Duration::from_millis(500));
        client.restart().await.unwrap();
        client.software_update().await.unwrap();
        let requests = device.wait_for_requests(2).await;
        assert!(requests.contains(&json!({"SYSID": SYS_ID, "RESTART": 1})));
        assert!(requests.contains(&json!({"SYSID": SYS_ID, "SWUPDATE": 1})));
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let device = FakeDevice::start(|_| None).await;
        let client = ServiceClient::new("127.0.0.1", SYS_ID, device.port)
            .with_timeout(Duration::from_millis(50));
        let err = client.get_state(false).await.unwrap_err();
        assert!(err.is_retryable());
        assert_matches!(err, Error::Transport(e) if e.kind() == std::io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn garbage_response_is_a_protocol_error() {
        let device = FakeDevice::start(|_| Some(json!("not an object"))).await;
        let client = ServiceClient::new("127.0.0.1", SYS_ID, device.port);
        assert_matches!(client.get_state(false).await, Err(Error::Protocol(..)));
    }
}
