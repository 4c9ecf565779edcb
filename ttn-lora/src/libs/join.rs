//! OTAA activation.
//!
//! State machine: `Idle -> Joining -> Joined` or `Idle -> Joining -> Failed(reason)`. Every
//! [`JoinController::join`] call re-enters `Joining`, even from `Joined`.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::{
    sync::{Mutex as AsyncMutex, broadcast::error::RecvError, watch},
    time::{self, Instant},
};

use super::{
    AppKey, Eui64, Region,
    error::Error,
    transport::{Command, DEF_CMD_TIMEOUT, Event, Transport},
};

#[derive(Clone, Debug, PartialEq)]
pub enum JoinState {
    Idle,
    Joining,
    Joined { at: DateTime<Utc> },
    Failed(String),
}

/// Arguments of [`JoinController::join`].
#[derive(Clone, Debug)]
pub struct JoinParams {
    /// JoinEUI (AppEUI) with 16 hexadecimal characters.
    pub app_eui: String,
    /// AppKey with 32 hexadecimal characters.
    pub app_key: String,
    pub timeout: Duration,
    /// 0~5. Lower is longer range.
    pub data_rate: u8,
    /// EIRP in dBm.
    pub tx_power: u8,
}

/// A snapshot of the device identity and the current join attempt.
#[derive(Clone, Debug)]
pub struct JoinSession {
    pub dev_eui: Eui64,
    pub app_eui: Option<Eui64>,
    pub app_key: Option<AppKey>,
    pub state: JoinState,
    pub joined_at: Option<DateTime<Utc>>,
}

pub struct JoinController {
    transport: Arc<Transport>,
    region: Region,
    dev_eui: Eui64,
    state_tx: watch::Sender<JoinState>,
    credentials: Mutex<Option<(Eui64, AppKey)>>,
    attempt: AsyncMutex<()>,
    poll_interval: Duration,
}

pub const DEF_JOIN_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEF_DATA_RATE: u8 = 5;
pub const DEF_TX_POWER: u8 = 14;
pub const DEF_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_DATA_RATE: u8 = 5;
const JOIN_CMD_TIMEOUT: Duration = Duration::from_secs(5);

impl JoinState {
    pub fn is_joined(&self) -> bool {
        match self {
            JoinState::Joined { .. } => true,
            _ => false,
        }
    }
}

impl JoinParams {
    /// Parameters with the default timeout, data rate and TX power.
    ///
    /// The default data rate 5 is out of range for US915 and AU915 (0~4), set `data_rate`
    /// explicitly for those regions or [`JoinParams::validate`] fails.
    pub fn new(app_eui: &str, app_key: &str) -> Self {
        JoinParams {
            app_eui: app_eui.to_string(),
            app_key: app_key.to_string(),
            timeout: DEF_JOIN_TIMEOUT,
            data_rate: DEF_DATA_RATE,
            tx_power: DEF_TX_POWER,
        }
    }

    /// Check all arguments against the region without any I/O.
    pub fn validate(&self, region: Region) -> Result<(Eui64, AppKey), Error> {
        let app_eui = Eui64::from_hex(self.app_eui.as_str())?;
        let app_key = AppKey::from_hex(self.app_key.as_str())?;
        if self.data_rate > MAX_DATA_RATE || self.data_rate > region.max_data_rate() {
            return Err(Error::Validation(format!(
                "data rate {} out of range 0~{} for {}",
                self.data_rate,
                MAX_DATA_RATE.min(region.max_data_rate()),
                region
            )));
        }
        if self.tx_power > region.max_eirp() {
            return Err(Error::Validation(format!(
                "TX power {} dBm exceeds {} dBm for {}",
                self.tx_power,
                region.max_eirp(),
                region
            )));
        }
        Ok((app_eui, app_key))
    }
}

impl JoinController {
    /// Read the DevEUI of the module. The DevEUI does not change afterwards.
    pub async fn new(transport: Arc<Transport>, region: Region) -> Result<Self, Error> {
        const FN_NAME: &'static str = "JoinController::new";

        let cmd = Command::new("AT+DEVEUI?");
        let resp = transport.send_command(&cmd).await?;
        let dev_eui = match resp.value.as_ref().map(|v| Eui64::from_hex(v.as_str())) {
            Some(Ok(eui)) => eui,
            _ => {
                error!("[{}] invalid DevEUI response {:?}", FN_NAME, resp.value);
                return Err(Error::Device {
                    command: cmd.text().to_string(),
                    code: format!("invalid DevEUI {:?}", resp.value),
                });
            }
        };
        info!("[{}] DevEUI: {}", FN_NAME, dev_eui);

        let (state_tx, _) = watch::channel(JoinState::Idle);
        Ok(JoinController {
            transport,
            region,
            dev_eui,
            state_tx,
            credentials: Mutex::new(None),
            attempt: AsyncMutex::new(()),
            poll_interval: DEF_POLL_INTERVAL,
        })
    }

    /// Change how often `AT+JOIN?` is polled while waiting for the join accept.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn dev_eui(&self) -> Eui64 {
        self.dev_eui
    }

    pub fn state(&self) -> JoinState {
        self.state_tx.borrow().clone()
    }

    pub fn is_joined(&self) -> bool {
        self.state_tx.borrow().is_joined()
    }

    pub fn joined_at(&self) -> Option<DateTime<Utc>> {
        match *self.state_tx.borrow() {
            JoinState::Joined { at } => Some(at),
            _ => None,
        }
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<JoinState> {
        self.state_tx.subscribe()
    }

    pub fn session(&self) -> JoinSession {
        let credentials = *self.credentials.lock().unwrap();
        JoinSession {
            dev_eui: self.dev_eui,
            app_eui: credentials.map(|c| c.0),
            app_key: credentials.map(|c| c.1),
            state: self.state(),
            joined_at: self.joined_at(),
        }
    }

    /// Configure the module, send the join request and wait for the join accept.
    pub async fn join(&self, params: &JoinParams) -> Result<(), Error> {
        const FN_NAME: &'static str = "JoinController::join";

        let (app_eui, app_key) = params.validate(self.region)?;

        let _attempt = self.attempt.lock().await;
        // Subscribe before the join request so that a fast accept is not missed.
        let mut events = self.transport.subscribe();
        *self.credentials.lock().unwrap() = Some((app_eui, app_key));
        self.state_tx.send_replace(JoinState::Joining);
        info!("[{}] joining with JoinEUI {}", FN_NAME, app_eui);

        // The join timeout covers the configuration commands too.
        let deadline = Instant::now() + params.timeout;
        let commands = [
            (format!("AT+DATARATE={}", params.data_rate), DEF_CMD_TIMEOUT),
            (format!("AT+EIRP={}", params.tx_power), DEF_CMD_TIMEOUT),
            (format!("AT+JOINEUI={}", app_eui.to_hex()), DEF_CMD_TIMEOUT),
            (format!("AT+APPKEY={}", app_key.to_hex()), DEF_CMD_TIMEOUT),
            ("AT+JOIN=1".to_string(), JOIN_CMD_TIMEOUT),
        ];
        for (text, timeout) in commands.iter() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let cmd = Command::new(text.as_str()).timeout((*timeout).min(remaining));
            let result = match remaining.is_zero() {
                true => Err(Error::JoinTimeout(params.timeout)),
                false => self.transport.send_command(&cmd).await,
            };
            match result {
                Ok(_) => (),
                Err(Error::Timeout { .. }) | Err(Error::JoinTimeout(_))
                    if Instant::now() >= deadline =>
                {
                    warn!("[{}] join timeout during `{}`", FN_NAME, text);
                    self.fail("timeout".to_string());
                    return Err(Error::JoinTimeout(params.timeout));
                }
                Err(e) => {
                    error!("[{}] `{}` error: {}", FN_NAME, text, e);
                    self.fail(format!("`{}` failed: {}", text, e));
                    return Err(e);
                }
            }
        }
        info!("[{}] join request sent, waiting for network accept", FN_NAME);

        let mut next_poll = Instant::now() + self.poll_interval;
        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => {
                    warn!("[{}] no join accept after {:?}", FN_NAME, params.timeout);
                    self.fail("timeout".to_string());
                    return Err(Error::JoinTimeout(params.timeout));
                }
                event = events.recv() => match event {
                    Ok(Event::Joined) => return Ok(self.joined()),
                    Ok(Event::JoinFailed(reason)) => {
                        warn!("[{}] join rejected: {}", FN_NAME, reason);
                        self.fail(reason.clone());
                        return Err(Error::JoinFailed(reason));
                    }
                    Ok(_) => (),
                    Err(RecvError::Lagged(n)) => warn!("[{}] missed {} events", FN_NAME, n),
                    Err(RecvError::Closed) => {
                        self.fail("link closed".to_string());
                        return Err(Error::Serial("link closed".to_string()));
                    }
                },
                _ = time::sleep_until(next_poll) => {
                    next_poll = next_poll + self.poll_interval;
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        continue;
                    }
                    // Firmware without join events still answers `AT+JOIN?`.
                    let cmd = Command::new("AT+JOIN?").timeout(remaining.min(DEF_CMD_TIMEOUT));
                    match self.transport.send_command(&cmd).await {
                        Ok(resp) => {
                            if resp.value.as_deref() == Some("1") {
                                return Ok(self.joined());
                            }
                        }
                        Err(Error::Serial(e)) => {
                            self.fail(e.clone());
                            return Err(Error::Serial(e));
                        }
                        Err(e) => debug!("[{}] poll join status error: {}", FN_NAME, e),
                    }
                }
            }
        }
    }

    fn joined(&self) {
        let at = Utc::now();
        self.state_tx.send_replace(JoinState::Joined { at });
        info!("[JoinController::joined] joined at {}", at);
    }

    fn fail(&self, reason: String) {
        self.state_tx.send_replace(JoinState::Failed(reason));
    }
}
