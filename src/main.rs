//! NGBS iCON CLI
//!
//! A command-line interface for NGBS iCON floor heating controllers, reached
//! through the JSON service protocol or Modbus TCP.
//!
//! This tool allows users to:
//! - Find controllers on the network and read their system id.
//! - Read thermostats and the controller state.
//! - Set thermostat targets, limits, parental lock and eco/cooling modes.
//! - Switch the master eco and cooling modes of the controller.
//! - Derive per-thermostat midpoints from one base midpoint.
//! - Export the raw configuration, restart the controller or update its firmware.
//!
//! The CLI leverages the `ngbs_icon_lib` crate for protocol definitions and client operations.

use anyhow::{bail, Context, Result};
use clap::Parser;
use commandline::{
    CliCommand, ControllerCommand, ControllerSetting, ModeSwitch, ScanTarget, ThermostatCommand,
    ThermostatSetting,
};
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use ngbs_icon_lib::{
    address::SERVICE_SCHEME,
    client::{Client, DeviceClient},
    discovery,
    model::{DeviceState, ThermostatId},
};
use serde::Serialize;
use std::{panic, time::Duration};

mod commandline;
mod config;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Cannot serialize output")?
    );
    Ok(())
}

fn print_state(state: &DeviceState, json: bool) -> Result<()> {
    if json {
        return print_json(state);
    }
    print!("{}", state.controller);
    for thermostat in &state.thermostats {
        println!("{thermostat}");
    }
    Ok(())
}

fn print_thermostat(state: &DeviceState, id: &ThermostatId, json: bool) -> Result<()> {
    let Some(thermostat) = state.thermostat(id) else {
        bail!("Thermostat {id} not found on {}", state.address);
    };
    if json {
        print_json(thermostat)
    } else {
        println!("{thermostat}");
        Ok(())
    }
}

/// Turns a bare host into a service address by asking the controller for its system id.
async fn resolve_address(address: &str, timeout: Duration) -> Result<String> {
    if address.contains("://") {
        return Ok(address.to_string());
    }
    let (host, port) = discovery::split_host_port(address);
    info!("Looking up the SYSID of {host}:{port}...");
    let sys_id = discovery::get_sys_id(host, port, timeout)
        .await
        .with_context(|| format!("Cannot read the SYSID of {host}:{port}"))?;
    match sys_id {
        Some(sys_id) => Ok(format!("{SERVICE_SCHEME}://{sys_id}@{host}:{port}")),
        None => bail!(
            "The controller at {host}:{port} does not report its SYSID. \
             Read it from the controller and use \"{SERVICE_SCHEME}://SYSID@{host}\"."
        ),
    }
}

/// Creates a client for `address`, applying timeout and poll budgets from the configuration.
async fn create_client(address: &str, config: &config::Config) -> Result<Client> {
    let address = resolve_address(address, config.timeout).await?;
    info!("Using {address}");
    let client = Client::connect_with_timeout(&address, config.timeout)
        .with_context(|| format!("Invalid device address '{address}'"))?;
    Ok(client.with_poll_settings(config.poll.into()))
}

fn confirm(prompt: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")
}

async fn handle_scan(hosts: &ScanTarget, timeout: Duration, json: bool) -> Result<()> {
    let found = match hosts {
        ScanTarget::Hosts(hosts) => {
            info!("Scanning {} hosts", hosts.len());
            discovery::scan_hosts(hosts.iter().cloned(), timeout).await
        }
        ScanTarget::Range { start, end } => discovery::scan_ip_range(start, end, timeout)
            .await
            .with_context(|| format!("Cannot scan {start}-{end}"))?,
    };
    if json {
        return print_json(&found);
    }
    if found.is_empty() {
        println!("No controller found.");
    }
    for (host, sys_id) in &found {
        match sys_id {
            Some(sys_id) => println!("{host}: SYSID {sys_id}"),
            None => println!("{host}: SYSID unknown"),
        }
    }
    Ok(())
}

async fn handle_thermostat(client: &Client, command: &ThermostatCommand, json: bool) -> Result<()> {
    match command {
        ThermostatCommand::Get { id: None } => {
            info!("Executing: Read thermostats");
            let state = client
                .get_state(false)
                .await
                .with_context(|| format!("Cannot read {}", client.address()))?;
            if json {
                print_json(&state.thermostats)?;
            } else {
                for thermostat in &state.thermostats {
                    println!("{thermostat}");
                }
            }
        }
        ThermostatCommand::Get { id: Some(id) } => {
            info!("Executing: Read thermostat {id}");
            let state = client
                .get_state(false)
                .await
                .with_context(|| format!("Cannot read {}", client.address()))?;
            print_thermostat(&state, &ThermostatId::from(id.as_str()), json)?;
        }
        ThermostatCommand::Set { id, setting } => {
            let id = ThermostatId::from(id.as_str());
            let state = match setting {
                ThermostatSetting::Target { value, mode } => {
                    info!("Executing: Set target of thermostat {id} to {value} °C ({mode:?})");
                    client
                        .set_thermostat_target(&id, *value, mode.map(Into::into))
                        .await
                        .with_context(|| format!("Failed to set target of thermostat {id}"))?
                }
                ThermostatSetting::Limit { value } => {
                    info!("Executing: Set limit of thermostat {id} to ±{value} °C");
                    client
                        .set_thermostat_limit(&id, *value)
                        .await
                        .with_context(|| format!("Failed to set limit of thermostat {id}"))?
                }
                ThermostatSetting::Lock { locked } => {
                    info!("Executing: Set parental lock of thermostat {id} to {locked}");
                    client
                        .set_thermostat_parental_lock(&id, *locked)
                        .await
                        .with_context(|| format!("Failed to set parental lock of thermostat {id}"))?
                }
                ThermostatSetting::Mode { mode } => {
                    info!("Executing: Switch thermostat {id} to {mode:?}");
                    match mode {
                        ModeSwitch::Eco => client.set_thermostat_eco(&id, true).await,
                        ModeSwitch::Comfort => client.set_thermostat_eco(&id, false).await,
                        ModeSwitch::Heating => client.set_thermostat_cooling(&id, false).await,
                        ModeSwitch::Cooling => client.set_thermostat_cooling(&id, true).await,
                    }
                    .with_context(|| format!("Failed to switch thermostat {id} to {mode:?}"))?
                }
            };
            print_thermostat(&state, &id, json)?;
        }
    }
    Ok(())
}

async fn handle_controller(
    client: &Client,
    command: &ControllerCommand,
    json: bool,
    yes: bool,
) -> Result<()> {
    match command {
        ControllerCommand::Get => {
            info!("Executing: Read controller");
            let state = client
                .get_state(true)
                .await
                .with_context(|| format!("Cannot read {}", client.address()))?;
            print_state(&state, json)?;
        }
        ControllerCommand::Export => {
            info!("Executing: Export configuration");
            let Client::Service(service) = client else {
                bail!("Export needs the {SERVICE_SCHEME} protocol");
            };
            let config = service
                .export()
                .await
                .with_context(|| format!("Cannot export {}", client.address()))?;
            print_json(&config)?;
        }
        ControllerCommand::Set { setting } => {
            let state = match setting {
                ControllerSetting::Midpoints {
                    midpoint,
                    hc_diff,
                    eco_diff,
                } => {
                    info!(
                        "Executing: Set midpoints from {midpoint} °C \
                         (heating/cooling ±{hc_diff}, eco ±{eco_diff})"
                    );
                    client
                        .set_thermostat_limit_midpoints(*midpoint, *hc_diff, *eco_diff)
                        .await
                        .with_context(|| "Failed to set thermostat midpoints")?
                }
                ControllerSetting::Mode { mode } => {
                    info!("Executing: Switch controller to {mode:?}");
                    match mode {
                        ModeSwitch::Eco => client.set_eco(true).await,
                        ModeSwitch::Comfort => client.set_eco(false).await,
                        ModeSwitch::Heating => client.set_cooling(false).await,
                        ModeSwitch::Cooling => client.set_cooling(true).await,
                    }
                    .with_context(|| format!("Failed to switch controller to {mode:?}"))?
                }
            };
            print_state(&state, json)?;
        }
        ControllerCommand::Restart => {
            if !confirm("Restart the controller?", yes)? {
                info!("Restart aborted by user.");
                return Ok(());
            }
            client
                .restart()
                .await
                .with_context(|| format!("Cannot restart {}", client.address()))?;
            println!("Restart requested.");
        }
        ControllerCommand::Update => {
            println!("WARNING: The controller is unavailable while the firmware is installed.");
            if !confirm("Install the latest firmware?", yes)? {
                info!("Software update aborted by user.");
                return Ok(());
            }
            client
                .software_update()
                .await
                .with_context(|| format!("Cannot update {}", client.address()))?;
            println!("Software update requested.");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "NGBS iCON CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Load the configuration, command line options take precedence
    let mut config = config::get_config(args.config.as_deref())
        .with_context(|| "Cannot load configuration")?;
    if let Some(timeout) = args.timeout {
        config.timeout = timeout;
        config.scan_timeout = timeout;
    }
    debug!("{config:?}");

    // 3. Execute the command
    match &args.command {
        CliCommand::Sysid { host } => {
            let (host, port) = discovery::split_host_port(host);
            match discovery::get_sys_id(host, port, config.timeout)
                .await
                .with_context(|| format!("Cannot read the SYSID of {host}:{port}"))?
            {
                Some(sys_id) => println!("{sys_id}"),
                None => bail!("The controller at {host}:{port} does not report its SYSID"),
            }
        }
        CliCommand::Scan { hosts } => {
            handle_scan(hosts, config.scan_timeout, args.json).await?;
        }
        CliCommand::Thermostat { address, command } => {
            let client = create_client(address, &config).await?;
            handle_thermostat(&client, command, args.json).await?;
        }
        CliCommand::Controller { address, command } => {
            let client = create_client(address, &config).await?;
            handle_controller(&client, command, args.json, args.yes).await?;
        }
    }

    Ok(())
}
