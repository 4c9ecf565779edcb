//! Client composes the transport, the join controller and the send queue.
//!
//! ```no_run
//! # async fn run() -> Result<(), ttn_lora::Error> {
//! use ttn_lora::{Client, JoinParams, Options};
//!
//! let client = Client::connect(Options {
//!     dev_path: "/dev/ttyS0".to_string(),
//!     ..Default::default()
//! })
//! .await?;
//! client
//!     .join(&JoinParams::new("2309199300000000", "0102030405060708090A0B0C0D0E0F10"))
//!     .await?;
//! client.send("Hello World!", 1)?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use std::{sync::Arc, time::Duration};

use log::{error, info, warn};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time,
};

use super::{
    Eui64, Message, Region, SignalQuality,
    encoder::{self, Fields},
    error::Error,
    join::{DEF_POLL_INTERVAL, JoinController, JoinParams, JoinSession, JoinState},
    send_queue::{self, ErrorHandler, SendQueue, Uplink},
    transport::{Command, DEF_BAUD_RATE, Transport},
};

#[derive(Clone)]
pub struct Options {
    /// Serial port device path such as `/dev/ttyS0` or `COM1`.
    pub dev_path: String,
    pub baud_rate: u32,
    pub region: Region,
    /// Log every AT line.
    pub debug: bool,
    /// Reboot the module before the first command.
    pub reset: bool,
    /// Join right after connecting when present.
    pub join: Option<JoinParams>,
    pub send_interval: Duration,
    pub queue_capacity: usize,
    pub max_attempts: u8,
    pub poll_interval: Duration,
    pub on_error: Option<ErrorHandler>,
}

/// Data accepted by [`Client::send`].
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    /// Sent as UTF-8 bytes.
    Text(String),
    /// Encoded with [`encoder::encode`].
    Fields(Fields),
}

pub struct Client {
    transport: Arc<Transport>,
    join: JoinController,
    queue: SendQueue,
    region: Region,
}

pub const DEF_DEV_PATH: &'static str = "/dev/ttyAMA0";
const REBOOT_TIMEOUT: Duration = Duration::from_secs(2);
const REBOOT_SETTLE: Duration = Duration::from_secs(1);
const PROBE_RETRY: usize = 3;
const PROBE_SLEEP: Duration = Duration::from_millis(500);

impl Default for Options {
    fn default() -> Self {
        Options {
            dev_path: DEF_DEV_PATH.to_string(),
            baud_rate: DEF_BAUD_RATE,
            region: Region::default(),
            debug: false,
            reset: true,
            join: None,
            send_interval: send_queue::DEF_MIN_INTERVAL,
            queue_capacity: send_queue::DEF_CAPACITY,
            max_attempts: send_queue::DEF_MAX_ATTEMPTS,
            poll_interval: DEF_POLL_INTERVAL,
            on_error: None,
        }
    }
}

impl Client {
    /// Open the serial port and prepare the module.
    pub async fn connect(opts: Options) -> Result<Self, Error> {
        let transport = Transport::open(opts.dev_path.as_str(), opts.baud_rate, opts.debug)?;
        Client::with_transport(Arc::new(transport), opts).await
    }

    /// Same as [`Client::connect`] over an arbitrary byte stream.
    pub async fn with_stream<S>(stream: S, opts: Options) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let transport = Transport::from_stream(stream, opts.debug);
        Client::with_transport(Arc::new(transport), opts).await
    }

    async fn with_transport(transport: Arc<Transport>, opts: Options) -> Result<Self, Error> {
        const FN_NAME: &'static str = "Client::connect";

        let join = match setup(&transport, &opts).await {
            Err(e) => {
                error!("[{}] initialize module error: {}", FN_NAME, e);
                transport.close().await;
                return Err(e);
            }
            Ok(join) => join.with_poll_interval(opts.poll_interval),
        };
        let queue_opts = send_queue::Options {
            capacity: opts.queue_capacity,
            min_interval: opts.send_interval,
            max_attempts: opts.max_attempts,
            on_error: opts.on_error.clone(),
            ..Default::default()
        };
        let uplink: Arc<dyn Uplink> = transport.clone();
        let queue = SendQueue::new(uplink, join.subscribe(), queue_opts);
        let client = Client {
            transport,
            join,
            queue,
            region: opts.region,
        };
        info!(
            "[{}] connected to module {} ({})",
            FN_NAME,
            client.dev_eui(),
            client.region
        );

        if let Some(params) = opts.join.as_ref() {
            if let Err(e) = client.join(params).await {
                client.close().await;
                return Err(e);
            }
        }
        Ok(client)
    }

    /// OTAA join. Blocks the caller until joined, rejected or timed out.
    pub async fn join(&self, params: &JoinParams) -> Result<(), Error> {
        self.join.join(params).await
    }

    /// Queue data for the background worker and return immediately.
    ///
    /// Only invalid data is reported here. Transmission failures go to the error handler.
    pub fn send<P: Into<Payload>>(&self, data: P, port: u8) -> Result<(), Error> {
        let payload = data.into().into_bytes()?;
        let msg = Message::new(payload, port)?;
        if !self.transport.is_connected() {
            return Err(Error::Serial("client closed".to_string()));
        }
        self.queue.enqueue(msg);
        Ok(())
    }

    pub fn dev_eui(&self) -> Eui64 {
        self.join.dev_eui()
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn is_joined(&self) -> bool {
        self.join.is_joined()
    }

    pub fn join_state(&self) -> JoinState {
        self.join.state()
    }

    pub fn session(&self) -> JoinSession {
        self.join.session()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    /// Last RSSI in dBm.
    pub fn rssi(&self) -> Option<i16> {
        self.signal().map(|s| s.rssi)
    }

    /// Last SNR in dB.
    pub fn snr(&self) -> Option<i16> {
        self.signal().map(|s| s.snr)
    }

    pub fn signal(&self) -> Option<SignalQuality> {
        self.transport.signal()
    }

    /// Ask the module for the current RSSI and SNR.
    pub async fn query_signal(&self) -> Result<SignalQuality, Error> {
        self.transport.query_signal().await
    }

    /// Stop the send queue and release the port. Safe to call many times.
    pub async fn close(&self) {
        self.queue.stop().await;
        self.transport.close().await;
        info!("[Client::close] LoRa connection closed");
    }
}

impl Payload {
    pub fn into_bytes(self) -> Result<Vec<u8>, Error> {
        match self {
            Payload::Bytes(data) => Ok(data),
            Payload::Text(text) => Ok(text.into_bytes()),
            Payload::Fields(fields) => encoder::encode(&fields),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Bytes(data)
    }
}

impl From<&[u8]> for Payload {
    fn from(data: &[u8]) -> Self {
        Payload::Bytes(data.to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Fields> for Payload {
    fn from(fields: Fields) -> Self {
        Payload::Fields(fields)
    }
}

/// Objects become sensor fields (non-numeric members are skipped), strings become text and arrays
/// of numbers 0~255 become bytes.
impl TryFrom<&Value> for Payload {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Payload::Fields(
                map.iter()
                    .filter_map(|(k, v)| v.as_f64().map(|v| (k.clone(), v)))
                    .collect(),
            )),
            Value::String(text) => Ok(Payload::Text(text.clone())),
            Value::Array(items) => {
                let mut data = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_u64() {
                        Some(v) if v <= u8::MAX as u64 => data.push(v as u8),
                        _ => {
                            return Err(Error::Validation(format!("invalid byte {}", item)));
                        }
                    }
                }
                Ok(Payload::Bytes(data))
            }
            _ => Err(Error::Validation(format!("unsupported payload {}", value))),
        }
    }
}

/// Reboot, probe and configure the module, then read its DevEUI.
async fn setup(transport: &Arc<Transport>, opts: &Options) -> Result<JoinController, Error> {
    const FN_NAME: &'static str = "setup";

    if opts.reset {
        let cmd = Command::new("AT+REBOOT").timeout(REBOOT_TIMEOUT);
        if let Err(e) = transport.send_command(&cmd).await {
            warn!("[{}] reboot error: {}", FN_NAME, e);
        }
        time::sleep(REBOOT_SETTLE).await;
    }

    let mut retry = 0;
    loop {
        match transport.send_command(&Command::new("AT")).await {
            Ok(_) => break,
            Err(e) => {
                retry += 1;
                if retry >= PROBE_RETRY {
                    error!("[{}] module not responding: {}", FN_NAME, e);
                    return Err(Error::Serial(format!("module not responding: {}", e)));
                }
                time::sleep(PROBE_SLEEP).await;
            }
        }
    }

    let commands = [
        "AT+LORAMODE=LORAWAN".to_string(),
        "AT+JOINTYPE=OTAA".to_string(),
        format!("AT+REGION={}", opts.region),
        "AT+CLASS=CLASS_A".to_string(),
        "AT+ADR=0".to_string(),
        "AT+UPLINKTYPE=UNCONFIRMED".to_string(),
    ];
    for text in commands.iter() {
        transport.send_command(&Command::new(text.as_str())).await?;
    }

    JoinController::new(transport.clone(), opts.region).await
}
