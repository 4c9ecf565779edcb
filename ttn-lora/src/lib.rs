//! LoRaWAN client for radio modules driven by AT commands over a serial port.
//!
//! - [`Transport`](libs::transport::Transport) exchanges AT lines and demultiplexes unsolicited
//!   events.
//! - [`JoinController`](libs::join::JoinController) performs the OTAA join.
//! - [`SendQueue`](libs::send_queue::SendQueue) drains uplinks in the background with duty-cycle
//!   pacing and retries.
//! - [`encode`](libs::encoder::encode) packs sensor readings into a compact payload.

pub mod libs;

pub use libs::{
    Eui64, Message, Region, SignalQuality,
    client::{Client, Options, Payload},
    encoder::{Fields, encode},
    error::Error,
    join::{JoinParams, JoinState},
};
