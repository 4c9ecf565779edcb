use std::time::Duration;

use tokio::time::{self, Instant};

use ttn_lora::{
    Error, Message,
    libs::{
        send_queue::Uplink,
        transport::{Command, Event, Transport},
    },
};

mod common;

#[tokio::test]
async fn value_response() {
    let (stream, _module) = common::start_default();
    let transport = Transport::from_stream(stream, true);

    let resp = transport
        .send_command(&Command::new("AT+DEVEUI?"))
        .await
        .unwrap();
    assert_eq!(resp.value.as_deref(), Some(common::DEV_EUI));
    assert!(resp.lines.is_empty());

    let resp = transport.send_command(&Command::new("AT")).await.unwrap();
    assert_eq!(resp.value, None);
}

#[tokio::test]
async fn info_lines_before_terminal_line() {
    let (stream, _module) = common::start(|line| match line {
        "AT+VER?" => vec!["+VER: build 12".to_string(), "+VER=1.2.3".to_string()],
        _ => common::reply(line),
    });
    let transport = Transport::from_stream(stream, false);

    let resp = transport.send_command(&Command::new("AT+VER?")).await.unwrap();
    assert_eq!(resp.value.as_deref(), Some("1.2.3"));
    assert_eq!(resp.lines, vec!["+VER: build 12".to_string()]);
}

#[tokio::test]
async fn module_specific_success_token() {
    let (stream, _module) = common::start(|line| match line {
        "AT+SAVE" => vec!["SAVED".to_string()],
        _ => common::reply(line),
    });
    let transport = Transport::from_stream(stream, false);

    let cmd = Command::new("AT+SAVE").success("SAVED");
    assert!(transport.send_command(&cmd).await.is_ok());
}

#[tokio::test]
async fn device_error_codes() {
    let (stream, _module) = common::start(|line| {
        let reply = match line {
            l if l.starts_with("AT+JOINEUI=") => "ERROR(5)",
            l if l.starts_with("AT+APPKEY=") => "+CME ERROR: 12",
            "AT+CLASS=CLASS_B" => "+CLASS=ERR:3",
            _ => "ERROR",
        };
        vec![reply.to_string()]
    });
    let transport = Transport::from_stream(stream, false);

    let expected = [
        ("AT+JOINEUI=2309199300000000", "5"),
        ("AT+APPKEY=00", "12"),
        ("AT+CLASS=CLASS_B", "3"),
        ("AT+FOO", "unknown"),
    ];
    for (text, expected_code) in expected {
        match transport.send_command(&Command::new(text)).await {
            Err(Error::Device { command, code }) => {
                assert_eq!(command, text);
                assert_eq!(code, expected_code);
            }
            other => panic!("{} expected a device error, got {:?}", text, other),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn command_timeout() {
    let (stream, _module) = common::start(|_| vec![]);
    let transport = Transport::from_stream(stream, false);

    let start = Instant::now();
    match transport.send_command(&Command::new("AT")).await {
        Err(Error::Timeout { command, timeout }) => {
            assert_eq!(command, "AT");
            assert_eq!(timeout, Duration::from_secs(3));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(start.elapsed() >= Duration::from_secs(3));

    let cmd = Command::new("AT+SEND=00").timeout(Duration::from_secs(10));
    let start = Instant::now();
    assert!(matches!(
        transport.send_command(&cmd).await,
        Err(Error::Timeout { .. })
    ));
    assert!(start.elapsed() >= Duration::from_secs(10));
}

#[tokio::test]
async fn event_interleaved_with_command() {
    let (stream, _module) = common::start(|line| match line {
        "AT+DEVEUI?" => vec![
            "+EVT:SIGNAL:-90,5".to_string(),
            "+EVT:TX_DONE".to_string(),
            "+DEVEUI=0011223344556677".to_string(),
        ],
        _ => common::reply(line),
    });
    let transport = Transport::from_stream(stream, false);
    let mut events = transport.subscribe();

    let resp = transport
        .send_command(&Command::new("AT+DEVEUI?"))
        .await
        .unwrap();
    assert_eq!(resp.value.as_deref(), Some(common::DEV_EUI));
    assert_eq!(
        events.recv().await.unwrap(),
        Event::Signal { rssi: -90, snr: 5 }
    );
    assert_eq!(events.recv().await.unwrap(), Event::TxDone);

    let signal = transport.signal().unwrap();
    assert_eq!(signal.rssi, -90);
    assert_eq!(signal.snr, 5);
}

#[tokio::test]
async fn unsolicited_events_without_command() {
    let (stream, module) = common::start_default();
    let transport = Transport::from_stream(stream, false);
    let mut events = transport.subscribe();

    module.push("+EVT:JOIN_FAILED:no gateway");
    module.push("+EVT:JOINED");
    module.push("RDY");
    assert_eq!(
        events.recv().await.unwrap(),
        Event::JoinFailed("no gateway".to_string())
    );
    assert_eq!(events.recv().await.unwrap(), Event::Joined);
    assert_eq!(
        events.recv().await.unwrap(),
        Event::Other("RDY".to_string())
    );
}

#[tokio::test]
async fn query_signal() {
    let (stream, _module) = common::start_default();
    let transport = Transport::from_stream(stream, false);
    assert!(transport.signal().is_none());

    let signal = transport.query_signal().await.unwrap();
    assert_eq!(signal.rssi, -87);
    assert_eq!(signal.snr, 7);
    assert_eq!(transport.signal(), Some(signal));
}

#[tokio::test]
async fn transmit_sets_port_when_changed() {
    let (stream, module) = common::start_default();
    let transport = Transport::from_stream(stream, false);

    let msg = Message::new(vec![0x01, 0xab, 0xff], 2).unwrap();
    transport.transmit(&msg).await.unwrap();
    let msg = Message::new(vec![0x10], 2).unwrap();
    transport.transmit(&msg).await.unwrap();
    let msg = Message::new(vec![0x20], 5).unwrap();
    transport.transmit(&msg).await.unwrap();
    assert_eq!(
        module.commands(),
        vec![
            "AT+PORT=2",
            "AT+SEND=01ABFF",
            "AT+SEND=10",
            "AT+PORT=5",
            "AT+SEND=20"
        ]
    );
}

#[tokio::test]
async fn transmit_port_error_not_sent() {
    let (stream, module) = common::start(|line| match line {
        l if l.starts_with("AT+PORT=") => vec!["ERROR(2)".to_string()],
        _ => common::reply(line),
    });
    let transport = Transport::from_stream(stream, false);

    let msg = Message::new(vec![0x01], 3).unwrap();
    assert!(matches!(
        transport.transmit(&msg).await,
        Err(Error::Device { .. })
    ));
    assert!(transport.transmit(&msg).await.is_err());
    assert_eq!(module.count("AT+PORT=3"), 2);
    assert_eq!(module.count("AT+SEND="), 0);
}

#[tokio::test]
async fn close_is_idempotent() {
    let (stream, _module) = common::start_default();
    let transport = Transport::from_stream(stream, false);
    assert!(transport.is_connected());

    transport.close().await;
    transport.close().await;
    assert!(!transport.is_connected());
    assert!(matches!(
        transport.send_command(&Command::new("AT")).await,
        Err(Error::Serial(_))
    ));
}

#[tokio::test]
async fn module_disconnected() {
    let (stream, module) = common::start_default();
    let transport = Transport::from_stream(stream, false);
    drop(module);

    let result = time::timeout(Duration::from_secs(2), async {
        while transport.is_connected() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok());
    assert!(matches!(
        transport.send_command(&Command::new("AT")).await,
        Err(Error::Serial(_))
    ));
}
