//! Sensor task collects environment data and queues it as LoRaWAN uplinks:
//! - SHTC3 provides temperature and humidity.
//! - LPS22HB provides barometric pressure.
//! - Readings are encoded by the client and sent by its send queue.

use std::{
    error::Error as StdError,
    sync::{Arc, Mutex},
    time::Duration,
};

use i2cdev::{
    core::I2CDevice,
    linux::{LinuxI2CDevice, LinuxI2CError},
};
use log::{error, info, warn};
use tokio::{
    task::{self, JoinHandle},
    time::{self, MissedTickBehavior},
};

use ttn_lora::{Client, Fields};

pub struct Options {
    pub i2c_path: String,
    pub interval: Duration,
    pub port: u8,
}

pub struct SensorTask {
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

struct Sensors {
    shtc3_dev: Arc<Mutex<LinuxI2CDevice>>,   // SHTC3 (temperature and humidity sensor)
    lps22hb_dev: Arc<Mutex<LinuxI2CDevice>>, // LPS22HB (barometric pressure sensor)
}

/// One set of converted readings.
#[derive(Debug, PartialEq)]
struct Reading {
    temp: f64,
    humidity: f64,
    pressure: Option<f64>,
}

const I2C_SHTC3_ADDR: u16 = 0x70;
const I2C_LPS22HB_ADDR: u16 = 0x5c;
const SHTC3_WAIT: Duration = Duration::from_millis(20);

impl SensorTask {
    pub fn new(opts: Options, client: Arc<Client>) -> Result<Self, Box<dyn StdError>> {
        const FN_NAME: &'static str = "SensorTask::new";

        let mut shtc3_dev = match LinuxI2CDevice::new(opts.i2c_path.as_str(), I2C_SHTC3_ADDR) {
            Err(e) => {
                error!("[{}] new SHTC3 device error: {}", FN_NAME, e);
                return Err(Box::new(e));
            }
            Ok(dev) => dev,
        };
        reset_shtc3(&mut shtc3_dev)?;
        info!("[{}] SHTC3 initialized", FN_NAME);

        let mut lps22hb_dev = match LinuxI2CDevice::new(opts.i2c_path.as_str(), I2C_LPS22HB_ADDR)
        {
            Err(e) => {
                error!("[{}] new LPS22HB device error: {}", FN_NAME, e);
                return Err(Box::new(e));
            }
            Ok(dev) => dev,
        };
        reset_lps22hb(&mut lps22hb_dev)?;
        info!("[{}] LPS22HB initialized", FN_NAME);

        let sensors = Sensors {
            shtc3_dev: Arc::new(Mutex::new(shtc3_dev)),
            lps22hb_dev: Arc::new(Mutex::new(lps22hb_dev)),
        };
        Ok(SensorTask {
            task_handle: Mutex::new(Some(create_sensor_loop(sensors, client, opts))),
        })
    }

    /// Stop reading sensors. Messages already queued are left to the client.
    pub fn stop(&self) {
        if let Some(handle) = self.task_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// To create the periodic sensor reading task.
fn create_sensor_loop(sensors: Sensors, client: Arc<Client>, opts: Options) -> JoinHandle<()> {
    task::spawn(async move {
        const FN_NAME: &'static str = "sensor_loop";

        let mut ticker = time::interval(opts.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let reading = match read_sensors(&sensors).await {
                Err(e) => {
                    warn!("[{}] read sensors error: {}, skip this cycle", FN_NAME, e);
                    continue;
                }
                Ok(reading) => reading,
            };
            info!(
                "[{}] temperature: {:.1} C, humidity: {:.1}%, pressure: {:?} hPa",
                FN_NAME, reading.temp, reading.humidity, reading.pressure
            );
            if let Err(e) = client.send(reading.to_fields(), opts.port) {
                error!("[{}] queue sensor data error: {}", FN_NAME, e);
            }
        }
    })
}

impl Reading {
    fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("temp".to_string(), self.temp);
        fields.insert("humidity".to_string(), self.humidity);
        if let Some(pressure) = self.pressure {
            fields.insert("pressure".to_string(), pressure);
        }
        fields
    }
}

async fn read_sensors(sensors: &Sensors) -> Result<Reading, Box<dyn StdError + Send + Sync>> {
    let (raw_temp, raw_humid) = read_temp_humid(sensors.shtc3_dev.clone()).await?;
    let raw_pressure = read_pressure(sensors.lps22hb_dev.clone()).await?;
    Ok(convert(raw_temp, raw_humid, raw_pressure))
}

/// Convert raw register values to physical units.
/// - SHTC3 temperature in Celsius: (175 * value) / 65536 - 45
/// - SHTC3 humidity in percentage: (100 * value) / 65536
/// - LPS22HB pressure in hPa: value / 4096, none when no new sample is available
fn convert(raw_temp: u16, raw_humid: u16, raw_pressure: Option<u32>) -> Reading {
    Reading {
        temp: 175.0 * raw_temp as f64 / 65536.0 - 45.0,
        humidity: 100.0 * raw_humid as f64 / 65536.0,
        pressure: raw_pressure.map(|v| v as f64 / 4096.0),
    }
}

fn reset_shtc3(dev: &mut LinuxI2CDevice) -> Result<(), Box<dyn StdError>> {
    const FN_NAME: &'static str = "reset_shtc3";

    if let Err(e) = dev.write(&[0x40_u8, 0x1a_u8]) {
        error!("[{}] reset 0x401a error: {}", FN_NAME, e);
        return Err(Box::new(e));
    }
    Ok(())
}

/// Software reset and wait for the boot bit to clear.
fn reset_lps22hb(dev: &mut LinuxI2CDevice) -> Result<(), Box<dyn StdError>> {
    const FN_NAME: &'static str = "reset_lps22hb";

    let ctrl = match dev.smbus_read_byte_data(0x11) {
        Err(e) => {
            error!("[{}] read CTRL_REG2 error: {}", FN_NAME, e);
            return Err(Box::new(e));
        }
        Ok(v) => v,
    };
    if let Err(e) = dev.smbus_write_byte_data(0x11, ctrl | 0x04) {
        error!("[{}] write CTRL_REG2 error: {}", FN_NAME, e);
        return Err(Box::new(e));
    }
    loop {
        match dev.smbus_read_byte_data(0x11) {
            Err(e) => {
                error!("[{}] read CTRL_REG2 error: {}", FN_NAME, e);
                return Err(Box::new(e));
            }
            Ok(v) if v & 0x04 == 0 => break,
            Ok(_) => (),
        }
    }
    Ok(())
}

/// Read SHTC3 raw (temperature, humidity).
async fn read_temp_humid(
    dev: Arc<Mutex<LinuxI2CDevice>>,
) -> Result<(u16, u16), Box<dyn StdError + Send + Sync>> {
    let result = task::spawn_blocking(move || -> Result<(u16, u16), LinuxI2CError> {
        let mut dev = dev.lock().unwrap();
        let temp = shtc3_measure(&mut dev, [0x78, 0x66])?;
        let humid = shtc3_measure(&mut dev, [0x58, 0xe0])?;
        Ok((temp, humid))
    })
    .await?;
    Ok(result?)
}

fn shtc3_measure(dev: &mut LinuxI2CDevice, cmd: [u8; 2]) -> Result<u16, LinuxI2CError> {
    dev.write(&cmd)?;
    std::thread::sleep(SHTC3_WAIT);
    // The third byte is the CRC.
    let mut buf = [0u8; 3];
    dev.read(&mut buf)?;
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Trigger one shot acquisition and read the raw 24-bit pressure.
async fn read_pressure(
    dev: Arc<Mutex<LinuxI2CDevice>>,
) -> Result<Option<u32>, Box<dyn StdError + Send + Sync>> {
    let result = task::spawn_blocking(move || -> Result<Option<u32>, LinuxI2CError> {
        let mut dev = dev.lock().unwrap();
        let ctrl = dev.smbus_read_byte_data(0x11)?;
        dev.smbus_write_byte_data(0x11, ctrl | 0x01)?;

        let status = dev.smbus_read_byte_data(0x27)?;
        if status & 0x01 == 0 {
            return Ok(None);
        }
        let xl = dev.smbus_read_byte_data(0x28)?;
        let l = dev.smbus_read_byte_data(0x29)?;
        let h = dev.smbus_read_byte_data(0x2a)?;
        Ok(Some(u32::from_be_bytes([0, h, l, xl])))
    })
    .await?;
    Ok(result?)
}
