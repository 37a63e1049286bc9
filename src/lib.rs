//! A library for reading and controlling NGBS iCON floor heating controllers.
//!
//! The controller can be reached in two ways:
//!
//! 1.  **JSON service protocol** (`service://SYSID@host`, port 7992): the full
//!     feature set, including master eco/cooling modes, limits, parental lock,
//!     midpoints and firmware commands. Every request is one short-lived TCP
//!     connection. See [`service_client::ServiceClient`].
//!
//! 2.  **Modbus TCP** (`modbus-tcp://host`, port 502): thermostat readings and
//!     targets only. One connection is kept open and reopened as needed. See
//!     [`modbus_client::ModbusClient`] and, for raw register access,
//!     [`modbus::Icon`].
//!
//! Both implement [`client::DeviceClient`]; [`client::Client`] picks the right
//! one from an address string. Every read returns a fresh
//! [`model::DeviceState`]. Writes wait until the device reports the new value
//! before they return, see [`poller`].
//!
//! ## Features
//!
//! - **`modbus-tcp`** (default): the Modbus TCP transport via `tokio-modbus`.
//! - **`bin-dependencies`** (default): everything the `icon` command line tool needs.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ngbs_icon_lib::{
//!     client::{Client, DeviceClient},
//!     model::{Mode, ThermostatId},
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect("service://123456789@192.168.1.2")?;
//!
//!     let state = client.get_state(false).await?;
//!     for thermostat in &state.thermostats {
//!         println!("{thermostat}");
//!     }
//!
//!     // waits until the controller reports the new target
//!     let id = ThermostatId::from("1.1");
//!     client.set_thermostat_target(&id, 21.5, Some(Mode::HEATING)).await?;
//!     Ok(())
//! }
//! ```
//!
//! Controllers on the local network can be found with [`discovery`].
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod address;
pub mod client;
pub mod discovery;
mod error;
pub mod limits;
pub mod model;
pub mod poller;
pub mod protocol;
pub mod service;
pub mod service_client;

#[cfg_attr(docsrs, doc(cfg(feature = "modbus-tcp")))]
#[cfg(feature = "modbus-tcp")]
pub mod modbus;

#[cfg_attr(docsrs, doc(cfg(feature = "modbus-tcp")))]
#[cfg(feature = "modbus-tcp")]
pub mod modbus_client;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
