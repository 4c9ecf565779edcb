use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{
    sync::watch,
    time::{self, Instant},
};

use ttn_lora::{
    Error, JoinState, Message,
    libs::send_queue::{DEF_POST_SEND_SETTLE, ErrorHandler, Options, SendQueue, Uplink},
};

/// Records every transmission attempt and fails the first `failures` of them.
#[derive(Default)]
struct MockUplink {
    attempts: Mutex<Vec<(Instant, Vec<u8>)>>,
    failures: AtomicUsize,
    refreshed: Mutex<Vec<Instant>>,
}

#[async_trait]
impl Uplink for MockUplink {
    async fn transmit(&self, msg: &Message) -> Result<(), Error> {
        self.attempts
            .lock()
            .unwrap()
            .push((Instant::now(), msg.payload.clone()));
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        match failed {
            false => Ok(()),
            true => Err(Error::Device {
                command: "AT+SEND".to_string(),
                code: "1".to_string(),
            }),
        }
    }

    async fn refresh_signal(&self) {
        self.refreshed.lock().unwrap().push(Instant::now());
    }
}

impl MockUplink {
    fn failing(failures: usize) -> Arc<Self> {
        let uplink = MockUplink::default();
        uplink.failures.store(failures, Ordering::SeqCst);
        Arc::new(uplink)
    }

    fn payloads(&self) -> Vec<Vec<u8>> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    fn refresh_times(&self) -> Vec<Instant> {
        self.refreshed.lock().unwrap().clone()
    }
}

fn msg(id: u8) -> Message {
    Message::new(vec![id], 1).unwrap()
}

fn joined() -> JoinState {
    JoinState::Joined { at: Utc::now() }
}

fn new_queue(
    uplink: Arc<MockUplink>,
    state: JoinState,
    opts: Options,
) -> (SendQueue, watch::Sender<JoinState>) {
    let (join_tx, join_rx) = watch::channel(state);
    (SendQueue::new(uplink, join_rx, opts), join_tx)
}

#[tokio::test(start_paused = true)]
async fn full_queue_evicts_oldest() {
    let uplink = MockUplink::failing(0);
    let (queue, join_tx) = new_queue(uplink.clone(), JoinState::Idle, Options::default());
    assert_eq!(queue.capacity(), 20);

    for id in 0..20 {
        assert!(queue.enqueue(msg(id)).is_none());
    }
    let evicted = queue.enqueue(msg(20)).unwrap();
    assert_eq!(evicted.payload, vec![0]);
    assert_eq!(queue.len(), 20);

    join_tx.send_replace(joined());
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(uplink.payloads(), vec![vec![1]]);
    queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn transmissions_respect_min_interval() {
    let uplink = MockUplink::failing(0);
    let (queue, _join_tx) = new_queue(uplink.clone(), joined(), Options::default());

    for id in 0..3 {
        queue.enqueue(msg(id));
    }
    time::sleep(Duration::from_secs(100)).await;

    assert_eq!(uplink.payloads(), vec![vec![0], vec![1], vec![2]]);
    let times = uplink.times();
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(30));
    }
    assert_eq!(uplink.refresh_times().len(), 3);
    assert!(queue.is_empty());
    queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_message_retried_at_head() {
    let uplink = MockUplink::failing(1);
    let (queue, _join_tx) = new_queue(uplink.clone(), joined(), Options::default());

    queue.enqueue(msg(1));
    queue.enqueue(msg(2));
    time::sleep(Duration::from_secs(100)).await;

    assert_eq!(uplink.payloads(), vec![vec![1], vec![1], vec![2]]);
    let times = uplink.times();
    assert!(times[1] - times[0] >= Duration::from_secs(30));
    queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn dropped_after_max_attempts() {
    let uplink = MockUplink::failing(usize::MAX);
    let dropped = Arc::new(Mutex::new(vec![]));
    let records = dropped.clone();
    let handler: ErrorHandler = Arc::new(move |msg: &Message, _err: &Error| {
        records
            .lock()
            .unwrap()
            .push((msg.payload.clone(), msg.attempts));
    });
    let opts = Options {
        min_interval: Duration::from_secs(5),
        on_error: Some(handler),
        ..Default::default()
    };
    let (queue, _join_tx) = new_queue(uplink.clone(), joined(), opts);

    queue.enqueue(msg(1));
    queue.enqueue(msg(2));
    time::sleep(Duration::from_secs(60)).await;

    assert_eq!(
        uplink.payloads(),
        vec![vec![1], vec![1], vec![1], vec![2], vec![2], vec![2]]
    );
    assert_eq!(
        *dropped.lock().unwrap(),
        vec![(vec![1], 3), (vec![2], 3)]
    );
    assert!(uplink.refresh_times().is_empty());
    assert!(queue.is_empty());
    queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn no_transmission_before_joined() {
    let uplink = MockUplink::failing(0);
    let (queue, join_tx) = new_queue(uplink.clone(), JoinState::Idle, Options::default());

    queue.enqueue(msg(1));
    join_tx.send_replace(JoinState::Joining);
    time::sleep(Duration::from_secs(100)).await;
    assert!(uplink.payloads().is_empty());
    assert_eq!(queue.len(), 1);

    join_tx.send_replace(joined());
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(uplink.payloads(), vec![vec![1]]);
    queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_during_interval_wait() {
    let uplink = MockUplink::failing(0);
    let (queue, _join_tx) = new_queue(uplink.clone(), joined(), Options::default());

    queue.enqueue(msg(1));
    queue.enqueue(msg(2));
    time::sleep(Duration::from_secs(1)).await;
    assert_eq!(uplink.payloads(), vec![vec![1]]);

    queue.stop().await;
    queue.stop().await;
    assert!(queue.is_empty());
    time::sleep(Duration::from_secs(100)).await;
    assert_eq!(uplink.payloads(), vec![vec![1]]);

    let rejected = queue.enqueue(msg(3)).unwrap();
    assert_eq!(rejected.payload, vec![3]);
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn signal_refreshed_after_settle() {
    let uplink = MockUplink::failing(0);
    let (queue, _join_tx) = new_queue(uplink.clone(), joined(), Options::default());

    queue.enqueue(msg(1));
    time::sleep(Duration::from_secs(1)).await;
    assert_eq!(uplink.payloads(), vec![vec![1]]);
    assert!(uplink.refresh_times().is_empty());

    time::sleep(Duration::from_secs(5)).await;
    let refreshed = uplink.refresh_times();
    assert_eq!(refreshed.len(), 1);
    assert!(refreshed[0] - uplink.times()[0] >= DEF_POST_SEND_SETTLE);
    queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_during_settle() {
    let uplink = MockUplink::failing(0);
    let (queue, _join_tx) = new_queue(uplink.clone(), joined(), Options::default());

    queue.enqueue(msg(1));
    time::sleep(Duration::from_secs(1)).await;
    let start = Instant::now();
    queue.stop().await;
    assert!(start.elapsed() < DEF_POST_SEND_SETTLE);

    time::sleep(Duration::from_secs(10)).await;
    assert!(uplink.refresh_times().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_during_retry_wait() {
    let uplink = MockUplink::failing(1);
    let dropped = Arc::new(Mutex::new(vec![]));
    let records = dropped.clone();
    let handler: ErrorHandler = Arc::new(move |msg: &Message, _err: &Error| {
        records.lock().unwrap().push(msg.payload.clone());
    });
    let opts = Options {
        on_error: Some(handler),
        ..Default::default()
    };
    let (queue, _join_tx) = new_queue(uplink.clone(), joined(), opts);

    queue.enqueue(msg(1));
    time::sleep(Duration::from_secs(1)).await;
    // The failed message is back at the head, waiting for the next interval.
    assert_eq!(uplink.payloads(), vec![vec![1]]);
    assert_eq!(queue.len(), 1);

    let start = Instant::now();
    queue.stop().await;
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(queue.is_empty());

    time::sleep(Duration::from_secs(100)).await;
    assert_eq!(uplink.payloads(), vec![vec![1]]);
    // Messages discarded by stop() are not reported as transmission failures.
    assert!(dropped.lock().unwrap().is_empty());
}

#[test]
fn message_validation() {
    assert!(matches!(Message::new(vec![], 1), Err(Error::Validation(_))));
    assert!(matches!(
        Message::new(vec![0; 243], 1),
        Err(Error::Validation(_))
    ));
    assert!(Message::new(vec![0; 242], 1).is_ok());
    assert!(matches!(Message::new(vec![1], 0), Err(Error::Validation(_))));
    assert!(matches!(
        Message::new(vec![1], 224),
        Err(Error::Validation(_))
    ));
    assert!(Message::new(vec![1], 223).is_ok());
}
