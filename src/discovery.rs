//! Finding controllers on the network.
//!
//! Controllers answer an identification request on the service port, which
//! is all a scan needs. Looking at MAC addresses instead would need raw
//! socket privileges, [`is_ngbs_mac_address`] is offered for callers that
//! already have them from elsewhere (a DHCP lease table, say).

use crate::{
    address::SERVICE_DEFAULT_PORT, service_client::ServiceClient, Error, Result,
};
use futures::stream::{self, StreamExt};
use log::{debug, info};
use std::{collections::BTreeMap, net::Ipv4Addr, time::Duration};

/// Time a host gets to answer the identification request during a scan.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(2);
/// Number of hosts probed at the same time.
pub const MAX_CONCURRENT_PROBES: usize = 256;
/// Largest IP range [`scan_ip_range`] accepts.
pub const MAX_RANGE_SIZE: u32 = 65536;

const MAC_PREFIXES: [&str; 6] = [
    "66:55:44:00:0",
    "00:50:C2:FD:A",
    "00:50:C2:F2:7",
    "00:50:C2:DE:7",
    "40:D8:55:0D:2",
    "E4:95:6E:5",
];

/// Asks `host` for its system id.
///
/// `Ok(None)` means the host is a controller whose firmware does not hand
/// out its system id; it has to be read from the controller's display.
pub async fn get_sys_id(host: &str, port: u16, timeout: Duration) -> Result<Option<String>> {
    ServiceClient::new(host, "", port)
        .with_timeout(timeout)
        .get_sys_id()
        .await
}

/// Whether `host` answers like a controller.
pub async fn is_ngbs_host(host: &str, port: u16, timeout: Duration) -> bool {
    get_sys_id(host, port, timeout).await.is_ok()
}

/// Whether `mac` lies in one of the ranges used for iCON controllers.
pub fn is_ngbs_mac_address(mac: &str) -> bool {
    let mac = mac.to_ascii_uppercase();
    MAC_PREFIXES.iter().any(|prefix| mac.starts_with(prefix))
}

/// Splits an optional `:port` off `host`, defaulting to the service port.
pub fn split_host_port(host: &str) -> (&str, u16) {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => match port.parse() {
            Ok(port) => (name, port),
            Err(_) => (host, SERVICE_DEFAULT_PORT),
        },
        _ => (host, SERVICE_DEFAULT_PORT),
    }
}

/// Probes every host and returns those that answered, with their system id.
///
/// Hosts may carry a port (`192.168.1.2:7992`). Hosts that fail or do not
/// answer within `timeout` are left out of the result.
pub async fn scan_hosts<I, S>(hosts: I, timeout: Duration) -> BTreeMap<String, Option<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    stream::iter(hosts.into_iter().map(Into::into))
        .map(|host: String| async move {
            let (name, port) = split_host_port(&host);
            match get_sys_id(name, port, timeout).await {
                Ok(sys_id) => {
                    info!("Found controller at {host} (SYSID {sys_id:?})");
                    Some((host, sys_id))
                }
                Err(err) => {
                    debug!("{host}: {err}");
                    None
                }
            }
        })
        .buffer_unordered(MAX_CONCURRENT_PROBES)
        .filter_map(std::future::ready)
        .collect()
        .await
}

fn parse_ip(ip: &str) -> Result<Ipv4Addr> {
    ip.trim()
        .parse()
        .map_err(|err| Error::Configuration(format!("Invalid IP address '{ip}': {err}")))
}

/// All addresses from `start` to `end`, both included.
pub fn ip_range(start: &str, end: &str) -> Result<Vec<Ipv4Addr>> {
    let start = u32::from(parse_ip(start)?);
    let end = u32::from(parse_ip(end)?);
    if end < start {
        return Err(Error::Configuration(
            "End IP is lower than the start IP".to_string(),
        ));
    }
    if end - start >= MAX_RANGE_SIZE {
        return Err(Error::Configuration(format!(
            "IP range too large, at most {MAX_RANGE_SIZE} addresses can be scanned"
        )));
    }
    Ok((start..=end).map(Ipv4Addr::from).collect())
}

/// Scans every address from `start` to `end`, both included, on the service port.
pub async fn scan_ip_range(
    start: &str,
    end: &str,
    timeout: Duration,
) -> Result<BTreeMap<String, Option<String>>> {
    let hosts = ip_range(start, end)?;
    info!("Scanning {} hosts", hosts.len());
    Ok(scan_hosts(hosts.iter().map(Ipv4Addr::to_string), timeout).await)
}
