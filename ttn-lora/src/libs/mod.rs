use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub mod client;
pub mod config;
pub mod encoder;
pub mod error;
pub mod join;
pub mod send_queue;
pub mod transport;

use error::Error;

/// Largest application payload accepted by the module.
pub const MAX_PAYLOAD: usize = 242;
/// Lowest application fPort.
pub const MIN_PORT: u8 = 1;
/// Highest application fPort. Ports above are reserved by LoRaWAN.
pub const MAX_PORT: u8 = 223;
/// Default fPort for uplinks.
pub const DEF_PORT: u8 = 1;

/// 64-bit extended unique identifier (DevEUI, JoinEUI/AppEUI).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Eui64(pub [u8; 8]);

/// 128-bit OTAA application root key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AppKey(pub [u8; 16]);

/// The last observed link quality.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SignalQuality {
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Signal-to-noise ratio in dB.
    pub snr: i16,
    #[serde(rename = "observedAt")]
    pub observed_at: DateTime<Utc>,
}

/// LoRaWAN regional parameter sets supported by the module.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum Region {
    #[default]
    EU868,
    US915,
    CN470,
    AS923,
    AU915,
    KR920,
    IN865,
}

/// One uplink waiting in the send queue.
#[derive(Clone, Debug)]
pub struct Message {
    pub payload: Vec<u8>,
    pub port: u8,
    pub enqueued_at: Instant,
    /// Number of failed transmission attempts so far.
    pub attempts: u8,
}

impl Message {
    /// Create a message after checking the payload size and the fPort range.
    pub fn new(payload: Vec<u8>, port: u8) -> Result<Self, Error> {
        if payload.is_empty() {
            return Err(Error::Validation("empty payload".to_string()));
        } else if payload.len() > MAX_PAYLOAD {
            return Err(Error::Validation(format!(
                "payload too large ({} bytes), max {}",
                payload.len(),
                MAX_PAYLOAD
            )));
        }
        if port < MIN_PORT || port > MAX_PORT {
            return Err(Error::Validation(format!(
                "port {} out of range {}~{}",
                port, MIN_PORT, MAX_PORT
            )));
        }

        Ok(Message {
            payload,
            port,
            enqueued_at: Instant::now(),
            attempts: 0,
        })
    }
}

impl Eui64 {
    /// Parse from exactly 16 hexadecimal characters.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        if s.len() != 16 {
            return Err(Error::Validation(format!(
                "EUI should be 16 hex characters, got {}",
                s.len()
            )));
        }
        let mut eui = [0u8; 8];
        if let Err(e) = hex::decode_to_slice(s, &mut eui) {
            return Err(Error::Validation(format!("invalid EUI {}: {}", s, e)));
        }
        Ok(Eui64(eui))
    }

    /// Upper-case hexadecimal representation used by AT commands.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_hex().as_str())
    }
}

impl FromStr for Eui64 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Eui64::from_hex(s)
    }
}

impl AppKey {
    /// Parse from exactly 32 hexadecimal characters.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        if s.len() != 32 {
            return Err(Error::Validation(format!(
                "AppKey should be 32 hex characters, got {}",
                s.len()
            )));
        }
        let mut key = [0u8; 16];
        if let Err(e) = hex::decode_to_slice(s, &mut key) {
            return Err(Error::Validation(format!("invalid AppKey: {}", e)));
        }
        Ok(AppKey(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

// Never print the key itself.
impl fmt::Debug for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AppKey(..)")
    }
}

impl Region {
    /// Token used by `AT+REGION=`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::EU868 => "EU868",
            Region::US915 => "US915",
            Region::CN470 => "CN470",
            Region::AS923 => "AS923",
            Region::AU915 => "AU915",
            Region::KR920 => "KR920",
            Region::IN865 => "IN865",
        }
    }

    /// Highest uplink data rate index of the 125 kHz channels.
    pub fn max_data_rate(&self) -> u8 {
        match self {
            Region::US915 | Region::AU915 => 4,
            _ => 5,
        }
    }

    /// Maximum EIRP in dBm.
    pub fn max_eirp(&self) -> u8 {
        match self {
            Region::EU868 | Region::AS923 | Region::AU915 => 16,
            Region::US915 => 30,
            Region::CN470 => 19,
            Region::KR920 => 14,
            Region::IN865 => 30,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "EU868" => Ok(Region::EU868),
            "US915" => Ok(Region::US915),
            "CN470" => Ok(Region::CN470),
            "AS923" => Ok(Region::AS923),
            "AU915" => Ok(Region::AU915),
            "KR920" => Ok(Region::KR920),
            "IN865" => Ok(Region::IN865),
            _ => Err(Error::Validation(format!("unknown region {}", s))),
        }
    }
}
