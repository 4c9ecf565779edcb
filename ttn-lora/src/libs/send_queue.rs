//! Send queue handles LoRaWAN uplinks in the background:
//! - Keep at most `capacity` messages, evicting the oldest one on overflow.
//! - Use a worker task to transmit the head message when the device has joined and the duty-cycle
//!   interval since the previous attempt has elapsed.
//! - Put failed messages back to the head until they reach the attempt limit.
//! - Query the link quality only after the RX windows of a successful uplink have passed.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::{
    sync::{Notify, watch},
    task::{self, JoinHandle},
    time::{self, Instant},
};

use super::{Message, error::Error, join::JoinState};

/// The link used by the worker to transmit messages.
#[async_trait]
pub trait Uplink: Send + Sync {
    async fn transmit(&self, msg: &Message) -> Result<(), Error>;

    /// Called after a successful transmission to update link quality.
    async fn refresh_signal(&self) {}
}

/// Receives messages dropped after exhausting all attempts.
pub type ErrorHandler = Arc<dyn Fn(&Message, &Error) + Send + Sync>;

#[derive(Clone)]
pub struct Options {
    pub capacity: usize,
    /// Minimum time between two transmission attempts.
    pub min_interval: Duration,
    /// Total attempts for one message including the first one.
    pub max_attempts: u8,
    /// Quiet time after a successful transmission so the module finishes its TX and RX windows
    /// before the signal query.
    pub post_send_settle: Duration,
    pub on_error: Option<ErrorHandler>,
}

pub struct SendQueue {
    inner: Arc<Inner>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    stop_tx: watch::Sender<bool>,
    capacity: usize,
}

struct QueueState {
    messages: VecDeque<Message>,
    stopped: bool,
}

struct Worker {
    inner: Arc<Inner>,
    uplink: Arc<dyn Uplink>,
    join_rx: watch::Receiver<JoinState>,
    stop_rx: watch::Receiver<bool>,
    min_interval: Duration,
    max_attempts: u8,
    post_send_settle: Duration,
    on_error: Option<ErrorHandler>,
}

pub const DEF_CAPACITY: usize = 20;
pub const DEF_MIN_INTERVAL: Duration = Duration::from_secs(30);
pub const DEF_MAX_ATTEMPTS: u8 = 3;
pub const DEF_POST_SEND_SETTLE: Duration = Duration::from_secs(3);

impl Default for Options {
    fn default() -> Self {
        Options {
            capacity: DEF_CAPACITY,
            min_interval: DEF_MIN_INTERVAL,
            max_attempts: DEF_MAX_ATTEMPTS,
            post_send_settle: DEF_POST_SEND_SETTLE,
            on_error: None,
        }
    }
}

impl SendQueue {
    /// Create the queue and start its worker. Must be called inside a tokio runtime.
    pub fn new(uplink: Arc<dyn Uplink>, join_rx: watch::Receiver<JoinState>, opts: Options) -> Self {
        let capacity = opts.capacity.max(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState {
                messages: VecDeque::with_capacity(capacity),
                stopped: false,
            }),
            notify: Notify::new(),
            stop_tx,
            capacity,
        });
        let worker = Worker {
            inner: inner.clone(),
            uplink,
            join_rx,
            stop_rx,
            min_interval: opts.min_interval,
            max_attempts: opts.max_attempts.max(1),
            post_send_settle: opts.post_send_settle,
            on_error: opts.on_error,
        };

        SendQueue {
            inner,
            task_handle: Mutex::new(Some(create_worker(worker))),
        }
    }

    /// Append a message without waiting.
    ///
    /// Returns the message that was not kept: the evicted oldest entry when the queue is full, or
    /// `msg` itself after [`SendQueue::stop`].
    pub fn enqueue(&self, msg: Message) -> Option<Message> {
        const FN_NAME: &'static str = "SendQueue::enqueue";

        let evicted = {
            let mut state = self.inner.state.lock().unwrap();
            if state.stopped {
                warn!("[{}] queue stopped, message dropped", FN_NAME);
                return Some(msg);
            }
            let evicted = match state.messages.len() >= self.inner.capacity {
                false => None,
                true => state.messages.pop_front(),
            };
            state.messages.push_back(msg);
            debug!(
                "[{}] queued ({}/{})",
                FN_NAME,
                state.messages.len(),
                self.inner.capacity
            );
            evicted
        };
        if let Some(old) = evicted.as_ref() {
            warn!(
                "[{}] queue full, evicted the oldest message ({} bytes)",
                FN_NAME,
                old.payload.len()
            );
        }
        self.inner.notify.notify_one();
        evicted
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Stop the worker and wait for the in-flight transmission. Safe to call many times.
    ///
    /// No transmission starts once this function is called. Queued messages are discarded.
    pub async fn stop(&self) {
        const FN_NAME: &'static str = "SendQueue::stop";

        let discarded = {
            let mut state = self.inner.state.lock().unwrap();
            state.stopped = true;
            let discarded = state.messages.len();
            state.messages.clear();
            discarded
        };
        self.inner.stop_tx.send_replace(true);
        self.inner.notify.notify_one();

        let handle = self.task_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("[{}] worker task error: {}", FN_NAME, e);
            }
            info!("[{}] stopped, {} queued messages discarded", FN_NAME, discarded);
        }
    }
}

impl Drop for SendQueue {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.stopped = true;
        }
        if let Ok(mut handle) = self.task_handle.lock() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
    }
}

impl Inner {
    /// Take the head message unless the queue has been stopped.
    ///
    /// Checking the stop flag under the same lock as `stop()` guarantees that no transmission
    /// starts after `stop()` has been called.
    fn pop_head(&self) -> Option<Message> {
        let mut state = self.state.lock().unwrap();
        match state.stopped {
            true => None,
            false => state.messages.pop_front(),
        }
    }

    /// Put a failed message back to the head. Returns the message if it is dropped instead.
    fn requeue_head(&self, msg: Message) -> Option<Message> {
        let mut state = self.state.lock().unwrap();
        if state.stopped || state.messages.len() >= self.capacity {
            return Some(msg);
        }
        state.messages.push_front(msg);
        None
    }

    fn has_messages(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.stopped && !state.messages.is_empty()
    }
}

/// To create the worker task that drains the queue.
fn create_worker(mut worker: Worker) -> JoinHandle<()> {
    task::spawn(async move {
        const FN_NAME: &'static str = "send_worker";

        let mut last_attempt: Option<Instant> = None;
        loop {
            // Gate 1: something to send.
            while !worker.inner.has_messages() {
                tokio::select! {
                    _ = stopped(&mut worker.stop_rx) => return,
                    _ = worker.inner.notify.notified() => (),
                }
            }
            // Gate 2: joined.
            if !worker.join_rx.borrow().is_joined() {
                debug!("[{}] waiting for join", FN_NAME);
                tokio::select! {
                    _ = stopped(&mut worker.stop_rx) => return,
                    ok = joined(&mut worker.join_rx) => {
                        if !ok {
                            warn!("[{}] join state closed, worker exits", FN_NAME);
                            return;
                        }
                    }
                }
            }
            // Gate 3: duty cycle.
            if let Some(last) = last_attempt {
                let next = last + worker.min_interval;
                if next > Instant::now() {
                    debug!(
                        "[{}] rate limit: waiting {:?}",
                        FN_NAME,
                        next - Instant::now()
                    );
                    tokio::select! {
                        _ = stopped(&mut worker.stop_rx) => return,
                        _ = time::sleep_until(next) => (),
                    }
                }
            }
            // A re-join may have started while waiting.
            if !worker.join_rx.borrow().is_joined() {
                continue;
            }

            let mut msg = match worker.inner.pop_head() {
                None => {
                    if *worker.stop_rx.borrow() {
                        return;
                    }
                    continue;
                }
                Some(msg) => msg,
            };
            last_attempt = Some(Instant::now());
            let result = worker.uplink.transmit(&msg).await;
            match result {
                Ok(()) => {
                    info!(
                        "[{}] sent {} bytes on port {} (queue: {})",
                        FN_NAME,
                        msg.payload.len(),
                        msg.port,
                        worker.inner.state.lock().unwrap().messages.len()
                    );
                    tokio::select! {
                        _ = stopped(&mut worker.stop_rx) => return,
                        _ = time::sleep(worker.post_send_settle) => (),
                    }
                    worker.uplink.refresh_signal().await;
                }
                Err(e) => {
                    msg.attempts += 1;
                    if msg.attempts < worker.max_attempts {
                        warn!(
                            "[{}] send error: {}, retry {}/{}",
                            FN_NAME, e, msg.attempts, worker.max_attempts
                        );
                        if let Some(msg) = worker.inner.requeue_head(msg) {
                            warn!("[{}] retry not queued, message dropped", FN_NAME);
                            worker.report(&msg, &e);
                        }
                    } else {
                        error!(
                            "[{}] send failed after {} attempts, dropping message: {}",
                            FN_NAME, msg.attempts, e
                        );
                        worker.report(&msg, &e);
                    }
                }
            }
        }
    })
}

async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

/// Returns `false` if the join state sender is gone.
async fn joined(join_rx: &mut watch::Receiver<JoinState>) -> bool {
    join_rx.wait_for(|state| state.is_joined()).await.is_ok()
}

impl Worker {
    fn report(&self, msg: &Message, err: &Error) {
        if let Some(handler) = self.on_error.as_ref() {
            handler(msg, err);
        }
    }
}
