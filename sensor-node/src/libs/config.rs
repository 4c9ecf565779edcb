//! Program configurations.

use std::env;

use clap::{Arg, ArgMatches, Command};
use serde::Deserialize;

use ttn_lora::libs::DEF_PORT;

/// Configuration file object.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// I2C bus device path.
    #[serde(rename = "i2cPath")]
    pub i2c_path: Option<String>,
    /// Seconds between two sensor readings.
    pub interval: Option<u64>,
    /// Uplink fPort.
    pub port: Option<u8>,
}

pub const DEF_I2C_PATH: &'static str = "/dev/i2c-1";
pub const DEF_INTERVAL: u64 = 60;

/// To register Clap arguments.
pub fn reg_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("sensor-node.i2c-path")
            .long("sensor-node.i2c-path")
            .help(format!("I2C bus device path [default: {}]", DEF_I2C_PATH))
            .num_args(1),
    )
    .arg(
        Arg::new("sensor-node.interval")
            .long("sensor-node.interval")
            .help(format!(
                "Seconds between sensor readings [default: {}]",
                DEF_INTERVAL
            ))
            .num_args(1)
            .value_parser(1..=86400),
    )
    .arg(
        Arg::new("sensor-node.port")
            .long("sensor-node.port")
            .help(format!("Uplink fPort 1~223 [default: {}]", DEF_PORT))
            .num_args(1)
            .value_parser(1..=223),
    )
}

/// To read input arguments from command-line arguments and environment variables.
///
/// This function will call [`apply_default()`] to fill missing values so you do not need call it
/// again.
pub fn read_args(args: &ArgMatches) -> Config {
    apply_default(&Config {
        i2c_path: match args.get_one::<String>("sensor-node.i2c-path") {
            None => match env::var("SENSOR_NODE_I2C_PATH") {
                Err(_) => None,
                Ok(v) => Some(v),
            },
            Some(v) => Some(v.clone()),
        },
        interval: match args.get_one::<i64>("sensor-node.interval") {
            None => match env::var("SENSOR_NODE_INTERVAL") {
                Err(_) => None,
                Ok(v) => v.parse::<u64>().ok(),
            },
            Some(v) => Some(*v as u64),
        },
        port: match args.get_one::<i64>("sensor-node.port") {
            None => match env::var("SENSOR_NODE_PORT") {
                Err(_) => None,
                Ok(v) => v.parse::<u8>().ok(),
            },
            Some(v) => Some(*v as u8),
        },
    })
}

/// Fill missing configuration with default values.
pub fn apply_default(config: &Config) -> Config {
    Config {
        i2c_path: match config.i2c_path.as_ref() {
            None => Some(DEF_I2C_PATH.to_string()),
            Some(path) => Some(path.clone()),
        },
        interval: Some(config.interval.unwrap_or(DEF_INTERVAL)),
        port: Some(config.port.unwrap_or(DEF_PORT)),
    }
}
