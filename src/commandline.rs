use clap::{builder::BoolishValueParser, ArgAction, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use ngbs_icon_lib::model::Mode;
use std::{path::PathBuf, time::Duration};

/// Hosts to scan, either listed or as an IPv4 range.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanTarget {
    Hosts(Vec<String>),
    Range { start: String, end: String },
}

fn parse_scan_target(s: &str) -> Result<ScanTarget, String> {
    if s.contains(',') {
        Ok(ScanTarget::Hosts(
            s.split(',')
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .map(String::from)
                .collect(),
        ))
    } else if let Some((start, end)) = s.split_once('-') {
        Ok(ScanTarget::Range {
            start: start.trim().to_string(),
            end: end.trim().to_string(),
        })
    } else if !s.trim().is_empty() {
        Ok(ScanTarget::Hosts(vec![s.trim().to_string()]))
    } else {
        Err("Invalid host range (use host1,host2,host3 or ip1-ip2)".to_string())
    }
}

fn parse_degree_celsius(s: &str) -> Result<f64, String> {
    let value = s
        .parse::<f64>()
        .map_err(|e| format!("Invalid temperature value format: {e}"))?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(format!("Invalid temperature value: {value}"))
    }
}

/// The target slot to write.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetMode {
    Heating,
    Cooling,
    EcoHeating,
    EcoCooling,
}

impl From<TargetMode> for Mode {
    fn from(mode: TargetMode) -> Self {
        match mode {
            TargetMode::Heating => Mode::HEATING,
            TargetMode::Cooling => Mode::COOLING,
            TargetMode::EcoHeating => Mode::ECO_HEATING,
            TargetMode::EcoCooling => Mode::ECO_COOLING,
        }
    }
}

/// Operating mode switch, eco/comfort or heating/cooling.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSwitch {
    Eco,
    Comfort,
    Heating,
    Cooling,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ThermostatSetting {
    /// Set the target temperature in °C.
    /// Without --mode the target of the mode the thermostat currently runs in is set.
    #[clap(verbatim_doc_comment)]
    Target {
        #[arg(value_parser = parse_degree_celsius, allow_negative_numbers = true)]
        value: f64,
        /// Set the target of this mode instead.
        #[arg(short, long, value_enum)]
        mode: Option<TargetMode>,
    },
    /// Set the adjustable range (±°C) around the midpoint.
    Limit {
        #[arg(value_parser = parse_degree_celsius)]
        value: f64,
    },
    /// Lock or unlock the thermostat (on/off, 1/0, yes/no).
    Lock {
        #[arg(action = ArgAction::Set, value_parser = BoolishValueParser::new())]
        locked: bool,
    },
    /// Switch between eco and comfort, or heating and cooling.
    Mode {
        #[arg(value_enum)]
        mode: ModeSwitch,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ThermostatCommand {
    /// Show one thermostat, or all of them.
    Get { id: Option<String> },
    /// Change a setting of one thermostat and wait until it is applied.
    Set {
        id: String,
        #[command(subcommand)]
        setting: ThermostatSetting,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ControllerSetting {
    /// Derive the four mode midpoints of every thermostat from one base midpoint.
    /// heating = MIDPOINT - HC_DIFF, cooling = MIDPOINT + HC_DIFF,
    /// eco heating and eco cooling are ECO_DIFF further out.
    #[clap(verbatim_doc_comment)]
    Midpoints {
        #[arg(value_parser = parse_degree_celsius)]
        midpoint: f64,
        #[arg(value_parser = parse_degree_celsius, allow_negative_numbers = true)]
        hc_diff: f64,
        #[arg(value_parser = parse_degree_celsius, allow_negative_numbers = true)]
        eco_diff: f64,
    },
    /// Switch the master mode of the controller.
    Mode {
        #[arg(value_enum)]
        mode: ModeSwitch,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ControllerCommand {
    /// Show the controller, including its configuration.
    Get,
    /// Print the raw configuration payload as JSON.
    Export,
    /// Change a controller setting and wait until it is applied.
    Set {
        #[command(subcommand)]
        setting: ControllerSetting,
    },
    /// Restart the controller.
    Restart,
    /// Install the latest firmware.
    Update,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommand {
    /// Print the system id (SYSID) of a controller.
    Sysid {
        /// Host name or IP address, optionally with ":port".
        host: String,
    },
    /// Find controllers on the network.
    Scan {
        /// Hosts as "host1,host2,host3" or an IPv4 range as "ip1-ip2" (both included).
        #[arg(value_parser = parse_scan_target, verbatim_doc_comment)]
        hosts: ScanTarget,
    },
    /// Read or change thermostats.
    Thermostat {
        /// "service://SYSID@host", "modbus-tcp://host" or a bare host.
        /// For a bare host the SYSID is looked up first.
        #[clap(verbatim_doc_comment)]
        address: String,
        #[command(subcommand)]
        command: ThermostatCommand,
    },
    /// Read or change the controller.
    Controller {
        /// "service://SYSID@host", "modbus-tcp://host" or a bare host.
        /// For a bare host the SYSID is looked up first.
        #[clap(verbatim_doc_comment)]
        address: String,
        #[command(subcommand)]
        command: ControllerCommand,
    },
}

const fn about_text() -> &'static str {
    "NGBS iCON CLI - Read and control NGBS iCON floor heating controllers."
}

#[derive(Parser, Debug)]
#[command(
    name = "icon",
    author,
    version,
    about = about_text(),
    long_about = None,
    propagate_version = true
)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: CliCommand,

    /// I/O timeout of a single request, overrides the config file.
    /// Examples: "2s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    /// YAML configuration file (default: icon.yml if present).
    #[arg(global = true, long)]
    pub config: Option<PathBuf>,

    /// Print states as JSON.
    #[arg(global = true, long)]
    pub json: bool,

    /// Do not ask for confirmation.
    #[arg(global = true, short, long)]
    pub yes: bool,
}
