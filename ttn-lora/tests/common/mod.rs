//! A scripted LoRaWAN module on the other end of an in-memory duplex link.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream},
    sync::mpsc,
    task::{self, JoinHandle},
    time::Instant,
};

pub const DEV_EUI: &'static str = "0011223344556677";
pub const APP_EUI: &'static str = "2309199300000000";
pub const APP_KEY: &'static str = "0102030405060708090A0B0C0D0E0F10";

pub struct MockModule {
    commands: Arc<Mutex<Vec<(Instant, String)>>>,
    push_tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Start a module that answers every received line with the lines returned by `responder`.
///
/// Returns the host side of the link.
pub fn start<F>(mut responder: F) -> (DuplexStream, MockModule)
where
    F: FnMut(&str) -> Vec<String> + Send + 'static,
{
    let (host, device) = io::duplex(4096);
    let commands = Arc::new(Mutex::new(vec![]));
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();

    let recorded = commands.clone();
    let task = task::spawn(async move {
        let (reader, mut writer) = io::split(device);
        let mut lines = BufReader::new(reader).lines();
        loop {
            let replies = tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        recorded.lock().unwrap().push((Instant::now(), line.clone()));
                        responder(line.as_str())
                    }
                    _ => break,
                },
                pushed = push_rx.recv() => match pushed {
                    None => break,
                    Some(line) => vec![line],
                },
            };
            for reply in replies {
                if writer
                    .write_all(format!("{}\r\n", reply).as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    });

    (
        host,
        MockModule {
            commands,
            push_tx,
            task,
        },
    )
}

/// A module that behaves like a healthy device in range of a gateway.
pub fn start_default() -> (DuplexStream, MockModule) {
    start(reply)
}

/// Default answers of a healthy module.
pub fn reply(line: &str) -> Vec<String> {
    let lines: Vec<&str> = match line {
        "AT+DEVEUI?" => vec!["+DEVEUI=0011223344556677"],
        "AT+RSSI?" => vec!["+RSSI=-87"],
        "AT+SNR?" => vec!["+SNR=7"],
        "AT+JOIN?" => vec!["+JOIN=0"],
        "AT+JOIN=1" => vec!["OK", "+EVT:JOINED"],
        _ => match line.starts_with("AT") {
            false => vec![],
            true => vec!["OK"],
        },
    };
    lines.into_iter().map(|l| l.to_string()).collect()
}

impl MockModule {
    /// All received lines in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Receive times of the lines starting with `prefix`.
    pub fn times_of(&self, prefix: &str) -> Vec<Instant> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, line)| line.starts_with(prefix))
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.times_of(prefix).len()
    }

    /// Send an unsolicited line to the host.
    pub fn push(&self, line: &str) {
        let _ = self.push_tx.send(line.to_string());
    }
}

impl Drop for MockModule {
    fn drop(&mut self) {
        self.task.abort();
    }
}
