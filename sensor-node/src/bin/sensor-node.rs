use std::{error::Error as StdError, fs, sync::Arc, time::Duration};

use clap::{Arg as ClapArg, Command};
use log::{self, error, info, warn};
use serde::Deserialize;
use sylvia_iot_sdk::util::logger;
use tokio::{self, signal};

use sensor_node::libs::{
    self,
    sensor_task::{Options, SensorTask},
};
use ttn_lora::{Client, Error as LoraError, Message, libs::config as lora_config};

#[derive(Deserialize)]
struct AppConfig {
    log: logger::Config,
    #[serde(rename = "ttnLora")]
    ttn_lora: lora_config::Config,
    #[serde(rename = "sensorNode")]
    sensor_node: libs::config::Config,
}

const PROJ_NAME: &'static str = env!("CARGO_PKG_NAME");
const PROJ_VER: &'static str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> std::io::Result<()> {
    const FN_NAME: &'static str = "main";

    let conf = match init_config() {
        Err(e) => {
            let conf = &logger::Config {
                ..Default::default()
            };
            logger::init(PROJ_NAME, &conf);
            error!("[{}] read config error: {}", FN_NAME, e);
            return Ok(());
        }
        Ok(conf) => conf,
    };

    logger::init(PROJ_NAME, &conf.log);

    let mut lora_opts = match lora_config::to_options(&conf.ttn_lora) {
        Err(e) => {
            error!("[{}] invalid LoRa config: {}", FN_NAME, e);
            return Ok(());
        }
        Ok(opts) => opts,
    };
    if lora_opts.join.is_none() {
        error!("[{}] both appEui and appKey are required", FN_NAME);
        return Ok(());
    }
    lora_opts.on_error = Some(Arc::new(|msg: &Message, e: &LoraError| {
        warn!(
            "[on_error] drop {} bytes after {} attempts: {}",
            msg.payload.len(),
            msg.attempts,
            e
        );
    }));
    let client = match Client::connect(lora_opts).await {
        Err(e) => {
            error!("[{}] connect LoRa module error: {}", FN_NAME, e);
            return Ok(());
        }
        Ok(client) => Arc::new(client),
    };

    let sensor_conf = libs::config::apply_default(&conf.sensor_node);
    let opts = Options {
        i2c_path: sensor_conf
            .i2c_path
            .unwrap_or(libs::config::DEF_I2C_PATH.to_string()),
        interval: Duration::from_secs(sensor_conf.interval.unwrap_or(libs::config::DEF_INTERVAL)),
        port: sensor_conf.port.unwrap_or(ttn_lora::libs::DEF_PORT),
    };
    let task = match SensorTask::new(opts, client.clone()) {
        Err(e) => {
            error!("[{}] new task error: {}", FN_NAME, e);
            client.close().await;
            return Ok(());
        }
        Ok(task) => task,
    };

    if let Err(e) = signal::ctrl_c().await {
        error!("[{}] wait for signal error: {}", FN_NAME, e);
    }
    info!("[{}] shutting down", FN_NAME);
    task.stop();
    client.close().await;
    Ok(())
}

fn init_config() -> Result<AppConfig, Box<dyn StdError>> {
    let mut args = Command::new(PROJ_NAME).version(PROJ_VER).arg(
        ClapArg::new("file")
            .short('f')
            .long("file")
            .help("config file")
            .num_args(1),
    );
    args = logger::reg_args(args);
    args = lora_config::reg_args(args);
    args = libs::config::reg_args(args);
    let args = args.get_matches();

    if let Some(v) = args.get_one::<String>("file") {
        let conf_str = fs::read_to_string(v)?;
        return Ok(json5::from_str(conf_str.as_str())?);
    }

    Ok(AppConfig {
        log: logger::read_args(&args),
        ttn_lora: lora_config::read_args(&args),
        sensor_node: libs::config::read_args(&args),
    })
}
