//! Connection addresses.
//!
//! A device is addressed by a URL, `scheme://[identifier@]host[:port]`:
//!
//! * `modbus-tcp://192.168.1.2` talks Modbus TCP (default port 502),
//! * `service://123456789@192.168.1.2` talks the JSON service protocol
//!   (default port 7992) and must carry the system id of the controller.

use crate::{Error, Result};
use std::{fmt, str::FromStr};

pub const MODBUS_TCP_SCHEME: &str = "modbus-tcp";
pub const SERVICE_SCHEME: &str = "service";
pub const SERVICE_DEFAULT_PORT: u16 = 7992;

/// A parsed device address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    ModbusTcp { host: String, port: u16 },
    Service { sys_id: String, host: String, port: u16 },
}

impl Address {
    pub fn host(&self) -> &str {
        match self {
            Address::ModbusTcp { host, .. } | Address::Service { host, .. } => host,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::ModbusTcp { port, .. } | Address::Service { port, .. } => *port,
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let url = url::Url::parse(s)
            .map_err(|err| Error::Configuration(format!("Invalid address '{s}': {err}")))?;
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => {
                return Err(Error::Configuration(format!(
                    "Address '{s}' does not contain a host"
                )))
            }
        };
        match url.scheme() {
            MODBUS_TCP_SCHEME => Ok(Address::ModbusTcp {
                host,
                port: url.port().unwrap_or(crate::protocol::DEFAULT_PORT),
            }),
            SERVICE_SCHEME => {
                if url.username().is_empty() {
                    return Err(Error::Configuration(format!(
                        "SYSID not specified (try service://SYSID@{host}; \
                         use the sysid command to get the SYSID)"
                    )));
                }
                Ok(Address::Service {
                    sys_id: url.username().to_string(),
                    host,
                    port: url.port().unwrap_or(SERVICE_DEFAULT_PORT),
                })
            }
            scheme => Err(Error::Configuration(format!("Unknown protocol: {scheme}"))),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::ModbusTcp { host, port } => {
                write!(f, "{MODBUS_TCP_SCHEME}://{host}:{port}")
            }
            Address::Service { sys_id, host, port } => {
                write!(f, "{SERVICE_SCHEME}://{sys_id}@{host}:{port}")
            }
        }
    }
}
