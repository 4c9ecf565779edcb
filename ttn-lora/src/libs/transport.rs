//! AT command serial port operations.
//!
//! One task owns the read half of the port and splits incoming lines into two sinks:
//! - lines expected by the in-flight command go to that command's waiter.
//! - all other lines are unsolicited events and go to a bounded broadcast channel. Slow
//!   subscribers lose the oldest events, the read loop never waits for them.
//!
//! Commands are serialized by the write-half mutex so only one command waits for a response at a
//! time.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{Mutex as AsyncMutex, broadcast, mpsc, watch},
    task::{self, JoinHandle},
    time::{self, Instant},
};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};

use super::{Message, SignalQuality, error::Error, send_queue::Uplink};

/// Provides functions to exchange AT commands with the LoRaWAN module.
pub struct Transport {
    port: AsyncMutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    shared: Arc<Shared>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    /// The fPort last configured with `AT+PORT`.
    fport: Mutex<Option<u8>>,
    debug: bool,
}

/// One AT request.
#[derive(Clone, Debug)]
pub struct Command {
    text: String,
    /// Lines starting with this prefix (`+DEVEUI` for `AT+DEVEUI?`) belong to the command.
    prefix: Option<String>,
    /// Extra lines that complete the command successfully.
    success: Vec<String>,
    timeout: Duration,
}

/// Successful command result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Response {
    /// The text after `=` of the terminal line, if any.
    pub value: Option<String>,
    /// Lines of the command received before the terminal line.
    pub lines: Vec<String>,
}

/// Unsolicited notifications from the module.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Joined,
    JoinFailed(String),
    Signal { rssi: i16, snr: i16 },
    TxDone,
    Other(String),
}

/// State shared between the command callers and the read loop.
struct Shared {
    pending: Mutex<Option<Pending>>,
    events: broadcast::Sender<Event>,
    signal: watch::Sender<Option<SignalQuality>>,
    connected: AtomicBool,
}

/// The waiter of the in-flight command.
struct Pending {
    prefix: Option<String>,
    success: Vec<String>,
    tx: mpsc::UnboundedSender<String>,
}

/// Clears the pending slot when the command finishes or its future is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
}

enum Reply {
    Info,
    Done(Option<String>),
    Failed(String),
}

pub const DEF_BAUD_RATE: u32 = 9600;
pub const DEF_CMD_TIMEOUT: Duration = Duration::from_secs(3);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CAPACITY: usize = 32;
const MAX_LINE: u64 = 512;
const PORT_TIMEOUT: Duration = Duration::from_secs(5);

impl Transport {
    /// Open the serial device with 8N1 framing.
    pub fn open(path: &str, baud_rate: u32, debug: bool) -> Result<Self, Error> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(PORT_TIMEOUT)
            .open_native_async()?;
        info!("[Transport::open] opened {} at {} baud", path, baud_rate);
        Ok(Transport::from_stream(port, debug))
    }

    /// Use any byte stream as the module link. Must be called inside a tokio runtime.
    pub fn from_stream<S>(stream: S, debug: bool) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (signal, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            events,
            signal,
            connected: AtomicBool::new(true),
        });
        let read_task = create_read_loop(reader, shared.clone(), debug);

        Transport {
            port: AsyncMutex::new(Some(Box::new(writer))),
            shared,
            read_task: Mutex::new(Some(read_task)),
            fport: Mutex::new(None),
            debug,
        }
    }

    /// Send one command and wait for its terminal line.
    pub async fn send_command(&self, cmd: &Command) -> Result<Response, Error> {
        const FN_NAME: &'static str = "Transport::send_command";

        let mut port = self.port.lock().await;
        let port = match port.as_mut() {
            None => return Err(Error::Serial("port closed".to_string())),
            Some(port) => port,
        };
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(Error::Serial("link closed".to_string()));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _guard = self.shared.set_pending(Pending {
            prefix: cmd.prefix.clone(),
            success: cmd.success.clone(),
            tx,
        });

        if self.debug {
            debug!("[{}] TX: {}", FN_NAME, cmd.text);
        }
        let deadline = Instant::now() + cmd.timeout;
        let line = format!("{}\r\n", cmd.text);
        let write = async {
            port.write_all(line.as_bytes()).await?;
            port.flush().await
        };
        match time::timeout_at(deadline, write).await {
            Err(_) => return Err(cmd.timed_out()),
            Ok(Err(e)) => {
                error!("[{}] write `{}` error: {}", FN_NAME, cmd.text, e);
                return Err(Error::from(e));
            }
            Ok(Ok(())) => (),
        }

        let mut lines = vec![];
        loop {
            let line = match time::timeout_at(deadline, rx.recv()).await {
                Err(_) => return Err(cmd.timed_out()),
                Ok(None) => {
                    return Err(Error::Serial(format!(
                        "link closed while waiting for `{}`",
                        cmd.text
                    )));
                }
                Ok(Some(line)) => line,
            };
            match cmd.classify(line.as_str()) {
                Reply::Info => lines.push(line),
                Reply::Done(value) => return Ok(Response { value, lines }),
                Reply::Failed(code) => {
                    return Err(Error::Device {
                        command: cmd.text.clone(),
                        code,
                    });
                }
            }
        }
    }

    /// Query `AT+RSSI?` and `AT+SNR?` and remember the result as the latest signal quality.
    pub async fn query_signal(&self) -> Result<SignalQuality, Error> {
        let rssi = self.query_number("AT+RSSI?").await?;
        let snr = self.query_number("AT+SNR?").await?;
        let quality = SignalQuality {
            rssi,
            snr,
            observed_at: Utc::now(),
        };
        self.shared.signal.send_replace(Some(quality));
        Ok(quality)
    }

    /// The latest signal quality from a signal event or [`Transport::query_signal`].
    pub fn signal(&self) -> Option<SignalQuality> {
        *self.shared.signal.borrow()
    }

    /// Receive unsolicited events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Release the port after the in-flight command (if any) completes. Safe to call many times.
    pub async fn close(&self) {
        const FN_NAME: &'static str = "Transport::close";

        let mut port = self.port.lock().await;
        if let Some(mut port) = port.take() {
            if let Err(e) = port.shutdown().await {
                warn!("[{}] shutdown port error: {}", FN_NAME, e);
            }
            info!("[{}] port closed", FN_NAME);
        }
        self.shared.connected.store(false, Ordering::Release);
        if let Some(handle) = self.read_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn query_number(&self, text: &str) -> Result<i16, Error> {
        let resp = self.send_command(&Command::new(text)).await?;
        match resp.value.as_ref().and_then(|v| v.parse::<i16>().ok()) {
            None => Err(Error::Device {
                command: text.to_string(),
                code: format!("invalid value {:?}", resp.value),
            }),
            Some(v) => Ok(v),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Ok(mut read_task) = self.read_task.lock() {
            if let Some(handle) = read_task.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl Uplink for Transport {
    /// `AT+PORT=<port>` when the port differs from the previous uplink, then `AT+SEND=<HEX>`.
    async fn transmit(&self, msg: &Message) -> Result<(), Error> {
        let fport = *self.fport.lock().unwrap();
        if fport != Some(msg.port) {
            let text = format!("AT+PORT={}", msg.port);
            self.send_command(&Command::new(text.as_str())).await?;
            *self.fport.lock().unwrap() = Some(msg.port);
        }
        let text = format!("AT+SEND={}", hex::encode_upper(&msg.payload));
        self.send_command(&Command::new(text.as_str()).timeout(SEND_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn refresh_signal(&self) {
        if let Err(e) = self.query_signal().await {
            debug!("[Transport::refresh_signal] query signal error: {}", e);
        }
    }
}

impl Command {
    pub fn new(text: &str) -> Self {
        Command {
            text: text.to_string(),
            prefix: response_prefix(text),
            success: vec![],
            timeout: DEF_CMD_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a module-specific line that completes the command successfully.
    pub fn success(mut self, token: &str) -> Self {
        self.success.push(token.to_string());
        self
    }

    pub fn text(&self) -> &str {
        self.text.as_str()
    }

    fn timed_out(&self) -> Error {
        Error::Timeout {
            command: self.text.clone(),
            timeout: self.timeout,
        }
    }

    fn classify(&self, line: &str) -> Reply {
        if line == "OK" || self.success.iter().any(|s| s == line) {
            return Reply::Done(None);
        } else if let Some(code) = error_code(line) {
            return Reply::Failed(code);
        }
        let rest = match self.prefix.as_ref().and_then(|p| strip_token(line, p)) {
            None => return Reply::Info,
            Some(rest) => rest,
        };
        let value = match rest.strip_prefix('=') {
            None => return Reply::Info,
            Some(value) => value.trim(),
        };
        if value == "OK" {
            return Reply::Done(None);
        }
        for err in ["ERROR", "ERR"] {
            if let Some(code) = value.strip_prefix(err) {
                return Reply::Failed(trim_code(code));
            }
        }
        Reply::Done(Some(value.to_string()))
    }
}

impl Pending {
    fn matches(&self, line: &str) -> bool {
        if line == "OK" || error_code(line).is_some() || self.success.iter().any(|s| s == line) {
            return true;
        }
        match self.prefix.as_ref() {
            None => false,
            Some(prefix) => strip_token(line, prefix).is_some(),
        }
    }
}

impl Shared {
    fn set_pending(&self, pending: Pending) -> PendingGuard<'_> {
        *self.pending.lock().unwrap() = Some(pending);
        PendingGuard { shared: self }
    }

    /// Route one received line.
    fn dispatch(&self, line: &str) {
        {
            let pending = self.pending.lock().unwrap();
            if let Some(pending) = pending.as_ref() {
                if pending.matches(line) {
                    let _ = pending.tx.send(line.to_string());
                    return;
                }
            }
        }

        let event = Event::parse(line);
        if let Event::Signal { rssi, snr } = event {
            self.signal.send_replace(Some(SignalQuality {
                rssi,
                snr,
                observed_at: Utc::now(),
            }));
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.shared.pending.lock() {
            *pending = None;
        }
    }
}

impl Event {
    pub fn parse(line: &str) -> Event {
        let body = match line.strip_prefix("+EVT:") {
            None => return Event::Other(line.to_string()),
            Some(body) => body.trim(),
        };
        match body {
            "JOINED" => return Event::Joined,
            "JOIN_FAILED" => return Event::JoinFailed("rejected".to_string()),
            "TX_DONE" => return Event::TxDone,
            _ => (),
        }
        if let Some(reason) = body.strip_prefix("JOIN_FAILED:") {
            return Event::JoinFailed(reason.trim().to_string());
        }
        if let Some(values) = body.strip_prefix("SIGNAL:") {
            if let Some((rssi, snr)) = values.split_once(',') {
                if let (Ok(rssi), Ok(snr)) = (rssi.trim().parse(), snr.trim().parse()) {
                    return Event::Signal { rssi, snr };
                }
            }
        }
        Event::Other(line.to_string())
    }
}

/// To create the read loop task that owns the read half of the port.
fn create_read_loop<R>(reader: R, shared: Arc<Shared>, debug: bool) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    task::spawn(async move {
        const FN_NAME: &'static str = "read_loop";

        let mut reader = BufReader::new(reader);
        let mut buff = Vec::with_capacity(MAX_LINE as usize);
        loop {
            buff.clear();
            // Bound the line length so noise without newlines cannot grow the buffer forever.
            match (&mut reader).take(MAX_LINE).read_until(b'\n', &mut buff).await {
                Err(e) => {
                    error!("[{}] read port error: {}", FN_NAME, e);
                    break;
                }
                Ok(0) => {
                    info!("[{}] port reached EOF", FN_NAME);
                    break;
                }
                Ok(_) => (),
            }
            let line = String::from_utf8_lossy(&buff);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if debug {
                debug!("[{}] RX: {}", FN_NAME, line);
            }
            shared.dispatch(line);
        }
        shared.connected.store(false, Ordering::Release);
        // Dropping the sender wakes up the waiting command.
        shared.pending.lock().unwrap().take();
    })
}

/// `AT+DEVEUI?` -> `+DEVEUI`, `AT+JOIN=1` -> `+JOIN`, `AT` -> none.
fn response_prefix(text: &str) -> Option<String> {
    let rest = text.strip_prefix("AT")?;
    if !rest.starts_with('+') {
        return None;
    }
    let end = rest.find(|c| c == '=' || c == '?').unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

/// Strip `token` when the line continues with `=`, `:` or ends right after it.
fn strip_token<'a>(line: &'a str, token: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(token)?;
    match rest.chars().next() {
        None | Some('=') | Some(':') => Some(rest),
        _ => None,
    }
}

/// Returns the code of `ERROR`, `ERROR:<code>`, `ERROR(<code>)` or `+CME ERROR: <code>`.
fn error_code(line: &str) -> Option<String> {
    let rest = line
        .strip_prefix("+CME ERROR")
        .or_else(|| line.strip_prefix("ERROR"))?;
    Some(trim_code(rest))
}

fn trim_code(raw: &str) -> String {
    let code = raw.trim_matches(|c: char| c == ':' || c == '=' || c == '(' || c == ')' || c.is_whitespace());
    match code.is_empty() {
        false => code.to_string(),
        true => "unknown".to_string(),
    }
}
