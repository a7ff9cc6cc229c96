use finexia_client::channel::{
    ChannelConfig, ChannelError, ChannelSubscriber, ConnectionState, Frame, StatusChannel,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Open,
    Message(Frame, String),
    Close(u16, String),
    Error(ChannelError),
}

struct Recorder(mpsc::UnboundedSender<Event>);

impl ChannelSubscriber for Recorder {
    fn on_open(&self) {
        let _ = self.0.send(Event::Open);
    }

    fn on_message(&self, frame: &Frame, raw: &str) {
        let _ = self.0.send(Event::Message(frame.clone(), raw.to_string()));
    }

    fn on_close(&self, code: u16, reason: &str) {
        let _ = self.0.send(Event::Close(code, reason.to_string()));
    }

    fn on_error(&self, error: &ChannelError) {
        let _ = self.0.send(Event::Error(error.clone()));
    }
}

fn channel_with(config: ChannelConfig) -> (StatusChannel, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StatusChannel::new(config, Arc::new(Recorder(tx))), rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("event in time")
        .expect("subscriber alive")
}

/// Next close, skipping any transport error reported just before it.
async fn next_close(rx: &mut mpsc::UnboundedReceiver<Event>) -> (u16, String) {
    loop {
        match next_event(rx).await {
            Event::Close(code, reason) => return (code, reason),
            Event::Error(_) => continue,
            other => panic!("expected close, got {other:?}"),
        }
    }
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Event>, window: Duration) {
    if let Ok(event) = timeout(window, rx.recv()).await {
        panic!("unexpected event {event:?}");
    }
}

#[derive(Clone)]
enum Behavior {
    /// Send the frames, then stay open and forward client text.
    Hold(Vec<String>),
    CloseWith(u16),
    /// Drop the TCP stream without a close frame.
    Drop,
    DropAfter(Duration),
}

struct TestServer {
    url: String,
    accepted: Arc<AtomicUsize>,
    received: mpsc::UnboundedReceiver<String>,
}

async fn spawn_server(behaviors: Vec<Behavior>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!(
        "ws://{}/ws/system/status",
        listener.local_addr().expect("local addr")
    );
    let accepted = Arc::new(AtomicUsize::new(0));
    let (received_tx, received) = mpsc::unbounded_channel();
    let count = accepted.clone();
    tokio::spawn(async move {
        let mut behaviors = VecDeque::from(behaviors);
        while let Ok((stream, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            let behavior = behaviors
                .pop_front()
                .unwrap_or_else(|| Behavior::Hold(Vec::new()));
            let received_tx = received_tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                match behavior {
                    Behavior::Hold(frames) => {
                        for frame in frames {
                            if ws.send(Message::Text(frame)).await.is_err() {
                                return;
                            }
                        }
                        while let Some(Ok(message)) = ws.next().await {
                            if let Message::Text(text) = message {
                                let _ = received_tx.send(text);
                            }
                        }
                    }
                    Behavior::CloseWith(code) => {
                        let _ = ws
                            .close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: "bye".into(),
                            }))
                            .await;
                        while let Some(Ok(message)) = ws.next().await {
                            if let Message::Close(_) = message {
                                let _ = received_tx.send("close-ack".to_string());
                            }
                        }
                    }
                    Behavior::Drop => drop(ws),
                    Behavior::DropAfter(delay) => {
                        sleep(delay).await;
                        drop(ws);
                    }
                }
            });
        }
    });
    TestServer {
        url,
        accepted,
        received,
    }
}

async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("ws://{addr}/ws/system/status")
}

fn fast_config(url: &str) -> ChannelConfig {
    ChannelConfig::new(url)
        .with_connect_timeout(Duration::from_secs(2))
        .with_backoff(Duration::from_millis(100), Duration::from_millis(400))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn normal_close_codes_do_not_reconnect() {
    for code in [1000u16, 1001] {
        let mut server = spawn_server(vec![Behavior::CloseWith(code)]).await;
        let (channel, mut events) = channel_with(fast_config(&server.url));
        channel.connect();

        assert_eq!(next_event(&mut events).await, Event::Open);
        assert_eq!(next_close(&mut events).await, (code, "bye".to_string()));
        let ack = timeout(Duration::from_secs(2), server.received.recv())
            .await
            .expect("close reply");
        assert_eq!(ack.as_deref(), Some("close-ack"));
        assert_eq!(channel.reconnect_attempts(), 0);
        assert_eq!(channel.pending_reconnect_delay(), None);

        assert_quiet(&mut events, Duration::from_millis(300)).await;
        assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(channel.connection_state(), ConnectionState::Closed);
        channel.close();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_error_close_reconnects_with_base_delay() {
    let server = spawn_server(vec![Behavior::CloseWith(1011)]).await;
    let (channel, mut events) = channel_with(fast_config(&server.url));
    channel.connect();

    assert_eq!(next_event(&mut events).await, Event::Open);
    assert_eq!(next_close(&mut events).await, (1011, "bye".to_string()));
    assert_eq!(channel.reconnect_attempts(), 1);
    assert_eq!(
        channel.pending_reconnect_delay(),
        Some(Duration::from_millis(100))
    );

    assert_eq!(next_event(&mut events).await, Event::Open);
    assert!(channel.is_connected());
    assert_eq!(channel.reconnect_attempts(), 0);
    assert_eq!(server.accepted.load(Ordering::SeqCst), 2);
    channel.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_stops_after_max_attempts() {
    let url = refused_url().await;
    let config = ChannelConfig::new(&url)
        .with_max_reconnect_attempts(3)
        .with_backoff(Duration::from_millis(20), Duration::from_millis(40));
    let (channel, mut events) = channel_with(config);
    channel.connect();

    for _ in 0..4 {
        match next_event(&mut events).await {
            Event::Error(ChannelError::Transport(_)) => {}
            other => panic!("expected transport error, got {other:?}"),
        }
        assert_eq!(next_event(&mut events).await, Event::Close(1006, String::new()));
    }

    assert_quiet(&mut events, Duration::from_millis(300)).await;
    assert_eq!(channel.reconnect_attempts(), 3);
    assert_eq!(channel.pending_reconnect_delay(), None);
    assert_eq!(channel.connection_state(), ConnectionState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_cancels_pending_reconnect() {
    let url = refused_url().await;
    let (channel, mut events) = channel_with(fast_config(&url));
    channel.connect();

    assert_eq!(next_close(&mut events).await.0, 1006);
    assert!(channel.pending_reconnect_delay().is_some());
    channel.close();
    assert_eq!(channel.pending_reconnect_delay(), None);

    assert_quiet(&mut events, Duration::from_millis(400)).await;
    assert_eq!(channel.connection_state(), ConnectionState::Closed);
    assert_eq!(channel.reconnect_attempts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_handshake_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}/ws/system/status", listener.local_addr().expect("addr"));
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let config = ChannelConfig::new(&url)
        .with_connect_timeout(Duration::from_millis(150))
        .with_backoff(Duration::from_secs(5), Duration::from_secs(5));
    let (channel, mut events) = channel_with(config);
    channel.connect();
    assert_eq!(channel.connection_state(), ConnectionState::Connecting);

    assert_eq!(
        next_event(&mut events).await,
        Event::Close(4000, "Connection timeout".to_string())
    );
    assert_eq!(channel.connection_state(), ConnectionState::Closed);
    assert_eq!(channel.reconnect_attempts(), 1);
    assert_eq!(
        channel.pending_reconnect_delay(),
        Some(Duration::from_secs(5))
    );
    channel.close();
    assert_quiet(&mut events, Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_are_decoded_or_forwarded_raw() {
    let server = spawn_server(vec![Behavior::Hold(vec![
        r#"{"type":"pipeline_update","pipeline_status":{"status":"running"}}"#.to_string(),
        "not json".to_string(),
    ])])
    .await;
    let (channel, mut events) = channel_with(fast_config(&server.url));
    channel.connect();

    assert_eq!(next_event(&mut events).await, Event::Open);
    match next_event(&mut events).await {
        Event::Message(Frame::Json(value), _) => {
            assert_eq!(value["type"], "pipeline_update");
            assert_eq!(value["pipeline_status"]["status"], "running");
        }
        other => panic!("expected json frame, got {other:?}"),
    }
    assert_eq!(
        next_event(&mut events).await,
        Event::Message(Frame::Unparsed, "not json".to_string())
    );
    assert!(channel.is_connected());
    channel.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_requires_open_connection() {
    let mut server = spawn_server(Vec::new()).await;
    let (channel, mut events) = channel_with(fast_config(&server.url));
    assert!(!channel.send_message("early"));

    channel.connect();
    assert_eq!(next_event(&mut events).await, Event::Open);
    assert!(channel.send_message("ping"));
    assert!(channel.send_json(&json!({"type": "subscribe", "topic": "pipeline"})));

    let first = timeout(Duration::from_secs(2), server.received.recv())
        .await
        .expect("first frame in time")
        .expect("server alive");
    assert_eq!(first, "ping");
    let second = timeout(Duration::from_secs(2), server.received.recv())
        .await
        .expect("second frame in time")
        .expect("server alive");
    let second: serde_json::Value = serde_json::from_str(&second).expect("json frame");
    assert_eq!(second, json!({"type": "subscribe", "topic": "pipeline"}));

    channel.close();
    assert!(!channel.send_message("late"));
    assert_quiet(&mut events, Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_reconnect_resets_backoff() {
    let server = spawn_server(vec![
        Behavior::Drop,
        Behavior::DropAfter(Duration::from_millis(300)),
    ])
    .await;
    let config = ChannelConfig::new(&server.url)
        .with_connect_timeout(Duration::from_secs(2))
        .with_backoff(Duration::from_secs(1), Duration::from_secs(4));
    let (channel, mut events) = channel_with(config);
    channel.connect();

    assert_eq!(next_event(&mut events).await, Event::Open);
    assert_eq!(next_close(&mut events).await.0, 1006);
    assert_eq!(channel.reconnect_attempts(), 1);
    assert_eq!(channel.pending_reconnect_delay(), Some(Duration::from_secs(1)));

    channel.connect();
    assert_eq!(channel.pending_reconnect_delay(), None);
    assert_eq!(next_event(&mut events).await, Event::Open);
    assert_eq!(channel.reconnect_attempts(), 0);
    assert_eq!(channel.pending_reconnect_delay(), None);

    assert_eq!(next_close(&mut events).await.0, 1006);
    assert_eq!(channel.reconnect_attempts(), 1);
    assert_eq!(channel.pending_reconnect_delay(), Some(Duration::from_secs(1)));
    channel.close();
    assert_quiet(&mut events, Duration::from_millis(1200)).await;
    assert_eq!(server.accepted.load(Ordering::SeqCst), 2);
}
