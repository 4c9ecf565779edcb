//! Program configurations.

use std::{env, str::FromStr, time::Duration};

use clap::{Arg, ArgMatches, Command};
use serde::Deserialize;

use super::{
    Region,
    client::{DEF_DEV_PATH, Options},
    error::Error,
    join::{DEF_DATA_RATE, DEF_JOIN_TIMEOUT, DEF_POLL_INTERVAL, DEF_TX_POWER, JoinParams},
    send_queue::{DEF_CAPACITY, DEF_MAX_ATTEMPTS, DEF_MIN_INTERVAL},
    transport::DEF_BAUD_RATE,
};

/// Configuration file object.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// Serial port device path such as `/dev/ttyAMA0` or `COM1`.
    #[serde(rename = "devPath")]
    pub dev_path: Option<String>,
    #[serde(rename = "baudRate")]
    pub baud_rate: Option<u32>,
    /// One of `EU868`, `US915`, `CN470`, `AS923`, `AU915`, `KR920`, `IN865`.
    pub region: Option<String>,
    pub debug: Option<bool>,
    /// Reboot the module when connecting.
    pub reset: Option<bool>,
    /// JoinEUI (AppEUI) from the TTN console.
    #[serde(rename = "appEui")]
    pub app_eui: Option<String>,
    /// AppKey from the TTN console.
    #[serde(rename = "appKey")]
    pub app_key: Option<String>,
    /// Join timeout in seconds.
    #[serde(rename = "joinTimeout")]
    pub join_timeout: Option<u64>,
    #[serde(rename = "dataRate")]
    pub data_rate: Option<u8>,
    /// EIRP in dBm.
    #[serde(rename = "txPower")]
    pub tx_power: Option<u8>,
    /// Minimum seconds between two uplinks.
    #[serde(rename = "sendInterval")]
    pub send_interval: Option<u64>,
    #[serde(rename = "queueSize")]
    pub queue_size: Option<usize>,
    #[serde(rename = "maxAttempts")]
    pub max_attempts: Option<u8>,
}

pub const DEF_REGION: &'static str = "EU868";
pub const DEF_DEBUG: bool = false;
pub const DEF_RESET: bool = true;

/// To register Clap arguments.
pub fn reg_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("ttn-lora.dev-path")
            .long("ttn-lora.dev-path")
            .help(format!(
                "Device path such as `/dev/ttyAMA0` or `COM1` [default: {}]",
                DEF_DEV_PATH
            ))
            .num_args(1),
    )
    .arg(
        Arg::new("ttn-lora.baud-rate")
            .long("ttn-lora.baud-rate")
            .help(format!("Serial baud rate [default: {}]", DEF_BAUD_RATE))
            .num_args(1)
            .value_parser(1200..=921600),
    )
    .arg(
        Arg::new("ttn-lora.region")
            .long("ttn-lora.region")
            .help(format!("LoRaWAN region [default: {}]", DEF_REGION))
            .num_args(1)
            .value_parser(["EU868", "US915", "CN470", "AS923", "AU915", "KR920", "IN865"]),
    )
    .arg(
        Arg::new("ttn-lora.debug")
            .long("ttn-lora.debug")
            .help("Log every AT command line")
            .num_args(1)
            .value_parser(["true", "false"]),
    )
    .arg(
        Arg::new("ttn-lora.reset")
            .long("ttn-lora.reset")
            .help("Reboot the module when connecting [default: true]")
            .num_args(1)
            .value_parser(["true", "false"]),
    )
    .arg(
        Arg::new("ttn-lora.app-eui")
            .long("ttn-lora.app-eui")
            .help("JoinEUI (AppEUI) with 16 hexadecimal characters")
            .num_args(1),
    )
    .arg(
        Arg::new("ttn-lora.app-key")
            .long("ttn-lora.app-key")
            .help("AppKey with 32 hexadecimal characters")
            .num_args(1),
    )
    .arg(
        Arg::new("ttn-lora.join-timeout")
            .long("ttn-lora.join-timeout")
            .help(format!(
                "Join timeout in seconds [default: {}]",
                DEF_JOIN_TIMEOUT.as_secs()
            ))
            .num_args(1)
            .value_parser(1..=3600),
    )
    .arg(
        Arg::new("ttn-lora.data-rate")
            .long("ttn-lora.data-rate")
            .help(format!(
                "Data rate 0~5, lower is longer range [default: {}]",
                DEF_DATA_RATE
            ))
            .num_args(1)
            .value_parser(0..=5),
    )
    .arg(
        Arg::new("ttn-lora.tx-power")
            .long("ttn-lora.tx-power")
            .help(format!("EIRP in dBm [default: {}]", DEF_TX_POWER))
            .num_args(1)
            .value_parser(0..=30),
    )
    .arg(
        Arg::new("ttn-lora.send-interval")
            .long("ttn-lora.send-interval")
            .help(format!(
                "Minimum seconds between uplinks [default: {}]",
                DEF_MIN_INTERVAL.as_secs()
            ))
            .num_args(1)
            .value_parser(1..=86400),
    )
    .arg(
        Arg::new("ttn-lora.queue-size")
            .long("ttn-lora.queue-size")
            .help(format!("Send queue capacity [default: {}]", DEF_CAPACITY))
            .num_args(1)
            .value_parser(1..=1000),
    )
    .arg(
        Arg::new("ttn-lora.max-attempts")
            .long("ttn-lora.max-attempts")
            .help(format!(
                "Transmission attempts per message [default: {}]",
                DEF_MAX_ATTEMPTS
            ))
            .num_args(1)
            .value_parser(1..=10),
    )
}

/// To read input arguments from command-line arguments and environment variables.
///
/// This function will call [`apply_default()`] to fill missing values so you do not need call it
/// again.
pub fn read_args(args: &ArgMatches) -> Config {
    apply_default(&Config {
        dev_path: read_string(args, "ttn-lora.dev-path", "TTN_LORA_DEV_PATH"),
        baud_rate: read_number(args, "ttn-lora.baud-rate", "TTN_LORA_BAUD_RATE"),
        region: read_string(args, "ttn-lora.region", "TTN_LORA_REGION"),
        debug: read_string(args, "ttn-lora.debug", "TTN_LORA_DEBUG").map(|v| v == "true"),
        reset: read_string(args, "ttn-lora.reset", "TTN_LORA_RESET").map(|v| v == "true"),
        app_eui: read_string(args, "ttn-lora.app-eui", "TTN_LORA_APP_EUI"),
        app_key: read_string(args, "ttn-lora.app-key", "TTN_LORA_APP_KEY"),
        join_timeout: read_number(args, "ttn-lora.join-timeout", "TTN_LORA_JOIN_TIMEOUT"),
        data_rate: read_number(args, "ttn-lora.data-rate", "TTN_LORA_DATA_RATE"),
        tx_power: read_number(args, "ttn-lora.tx-power", "TTN_LORA_TX_POWER"),
        send_interval: read_number(args, "ttn-lora.send-interval", "TTN_LORA_SEND_INTERVAL"),
        queue_size: read_number(args, "ttn-lora.queue-size", "TTN_LORA_QUEUE_SIZE"),
        max_attempts: read_number(args, "ttn-lora.max-attempts", "TTN_LORA_MAX_ATTEMPTS"),
    })
}

/// Fill missing configuration with default values.
///
/// Credentials have no default.
pub fn apply_default(config: &Config) -> Config {
    Config {
        dev_path: match config.dev_path.as_ref() {
            None => Some(DEF_DEV_PATH.to_string()),
            Some(path) => Some(path.clone()),
        },
        baud_rate: Some(config.baud_rate.unwrap_or(DEF_BAUD_RATE)),
        region: match config.region.as_ref() {
            None => Some(DEF_REGION.to_string()),
            Some(region) => Some(region.clone()),
        },
        debug: Some(config.debug.unwrap_or(DEF_DEBUG)),
        reset: Some(config.reset.unwrap_or(DEF_RESET)),
        app_eui: config.app_eui.clone(),
        app_key: config.app_key.clone(),
        join_timeout: Some(config.join_timeout.unwrap_or(DEF_JOIN_TIMEOUT.as_secs())),
        data_rate: Some(config.data_rate.unwrap_or(DEF_DATA_RATE)),
        tx_power: Some(config.tx_power.unwrap_or(DEF_TX_POWER)),
        send_interval: Some(config.send_interval.unwrap_or(DEF_MIN_INTERVAL.as_secs())),
        queue_size: Some(config.queue_size.unwrap_or(DEF_CAPACITY)),
        max_attempts: Some(config.max_attempts.unwrap_or(DEF_MAX_ATTEMPTS)),
    }
}

/// Build client options. Join parameters are filled only when both credentials are present.
pub fn to_options(config: &Config) -> Result<Options, Error> {
    let config = apply_default(config);
    let region = Region::from_str(config.region.as_deref().unwrap_or(DEF_REGION))?;
    let join = match (config.app_eui.as_ref(), config.app_key.as_ref()) {
        (Some(app_eui), Some(app_key)) => Some(JoinParams {
            app_eui: app_eui.clone(),
            app_key: app_key.clone(),
            timeout: Duration::from_secs(config.join_timeout.unwrap_or(DEF_JOIN_TIMEOUT.as_secs())),
            data_rate: config.data_rate.unwrap_or(DEF_DATA_RATE),
            tx_power: config.tx_power.unwrap_or(DEF_TX_POWER),
        }),
        _ => None,
    };
    if let Some(params) = join.as_ref() {
        params.validate(region)?;
    }

    Ok(Options {
        dev_path: config.dev_path.unwrap_or(DEF_DEV_PATH.to_string()),
        baud_rate: config.baud_rate.unwrap_or(DEF_BAUD_RATE),
        region,
        debug: config.debug.unwrap_or(DEF_DEBUG),
        reset: config.reset.unwrap_or(DEF_RESET),
        join,
        send_interval: Duration::from_secs(
            config.send_interval.unwrap_or(DEF_MIN_INTERVAL.as_secs()),
        ),
        queue_capacity: config.queue_size.unwrap_or(DEF_CAPACITY),
        max_attempts: config.max_attempts.unwrap_or(DEF_MAX_ATTEMPTS),
        poll_interval: DEF_POLL_INTERVAL,
        on_error: None,
    })
}

fn read_string(args: &ArgMatches, name: &str, env_name: &str) -> Option<String> {
    match args.get_one::<String>(name) {
        None => match env::var(env_name) {
            Err(_) => None,
            Ok(v) => Some(v),
        },
        Some(v) => Some(v.clone()),
    }
}

/// Clap range parsers produce `i64`. Invalid environment values are ignored.
fn read_number<T>(args: &ArgMatches, name: &str, env_name: &str) -> Option<T>
where
    T: FromStr + TryFrom<i64>,
{
    match args.get_one::<i64>(name) {
        None => match env::var(env_name) {
            Err(_) => None,
            Ok(v) => v.parse::<T>().ok(),
        },
        Some(v) => T::try_from(*v).ok(),
    }
}
