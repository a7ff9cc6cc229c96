//! Reconnecting status channel.
//!
//! A [`StatusChannel`] owns at most one live WebSocket. Every `connect` and
//! `close` bumps a generation counter; the I/O task and the timers carry the
//! generation they were spawned under and become no-ops once it is stale, so
//! a timer racing an intentional close can never reopen the socket.

use crate::timer::TimerHandle;
use finexia_core::wire::{
    is_normal_close, CLOSE_ABNORMAL, CLOSE_CONNECT_TIMEOUT, CLOSE_NO_STATUS,
    CONNECT_TIMEOUT_REASON,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(16);
pub const STATUS_CHANNEL_PATH: &str = "/ws/system/status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    /// Delay before the `attempt`-th reconnect (1-based): base doubled per
    /// prior attempt, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("invalid channel url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("channel transport error: {0}")]
    Transport(String),
}

/// Decoded form of an inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Json(Value),
    /// The frame was not valid JSON; only the raw text is available.
    Unparsed,
}

/// Receives channel events. Every method defaults to a no-op.
///
/// For one connection the calls arrive as open, then messages, then close;
/// `on_error` may come just before the close it caused. Callbacks run on the
/// channel's tasks and must not block.
pub trait ChannelSubscriber: Send + Sync {
    fn on_open(&self) {}

    fn on_message(&self, _frame: &Frame, _raw: &str) {}

    fn on_close(&self, _code: u16, _reason: &str) {}

    fn on_error(&self, _error: &ChannelError) {}
}

pub struct NoopSubscriber;

impl ChannelSubscriber for NoopSubscriber {}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Text(String),
    Json(Value),
}

impl OutboundMessage {
    fn into_text(self) -> String {
        match self {
            OutboundMessage::Text(text) => text,
            OutboundMessage::Json(value) => value.to_string(),
        }
    }
}

impl From<String> for OutboundMessage {
    fn from(value: String) -> Self {
        OutboundMessage::Text(value)
    }
}

impl From<&str> for OutboundMessage {
    fn from(value: &str) -> Self {
        OutboundMessage::Text(value.to_string())
    }
}

impl From<Value> for OutboundMessage {
    fn from(value: Value) -> Self {
        OutboundMessage::Json(value)
    }
}

/// Derives the status socket URL from the REST base URL. The session token
/// travels as the `token` query parameter, which is where the backend looks
/// for socket credentials.
pub fn status_channel_url(api_base: &str, token: Option<&str>) -> Result<Url, ChannelError> {
    let invalid = |reason: String| ChannelError::InvalidUrl {
        url: api_base.to_string(),
        reason,
    };
    let mut url = Url::parse(api_base).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid(format!("cannot switch scheme to {scheme}")))?;
    url.set_path(STATUS_CHANNEL_PATH);
    url.set_query(None);
    if let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

fn parse_channel_url(raw: &str) -> Result<Url, ChannelError> {
    let url = Url::parse(raw).map_err(|err| ChannelError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ChannelError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("expected ws or wss scheme, got {other}"),
        }),
    }
}

enum Command {
    Send(String),
    Close,
}

enum ConnectionEnd {
    Closed { code: u16, reason: String },
    Failed(ChannelError),
}

struct ChannelState {
    connection: ConnectionState,
    generation: u64,
    reconnect_attempts: u32,
    commands: Option<mpsc::UnboundedSender<Command>>,
    io_task: Option<JoinHandle<()>>,
    connect_timer: Option<TimerHandle>,
    reconnect_timer: Option<TimerHandle>,
    reconnect_delay: Option<Duration>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            connection: ConnectionState::Idle,
            generation: 0,
            reconnect_attempts: 0,
            commands: None,
            io_task: None,
            connect_timer: None,
            reconnect_timer: None,
            reconnect_delay: None,
        }
    }

    /// Invalidates the current generation and releases the socket. An open
    /// socket gets a close frame; a socket still connecting is aborted.
    fn retire(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.connect_timer.take() {
            timer.cancel();
        }
        let established = matches!(
            self.connection,
            ConnectionState::Open | ConnectionState::Closing
        );
        if let Some(commands) = self.commands.take() {
            if established {
                let _ = commands.send(Command::Close);
            }
        }
        if let Some(task) = self.io_task.take() {
            if !established {
                task.abort();
            }
        }
        self.connection = ConnectionState::Closed;
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.cancel();
        }
        self.reconnect_delay = None;
    }
}

impl Drop for ChannelState {
    fn drop(&mut self) {
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
    }
}

struct Shared {
    config: ChannelConfig,
    subscriber: Arc<dyn ChannelSubscriber>,
    state: Mutex<ChannelState>,
}

/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct StatusChannel {
    shared: Arc<Shared>,
}

impl StatusChannel {
    pub fn new(config: ChannelConfig, subscriber: Arc<dyn ChannelSubscriber>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                subscriber,
                state: Mutex::new(ChannelState::new()),
            }),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Replaces any existing connection with a fresh attempt. Must be called
    /// inside a tokio runtime. A malformed URL is reported through
    /// `on_error` and leaves the channel closed.
    pub fn connect(&self) {
        self.shared.connect_if(None);
    }

    /// Tears the channel down without triggering reconnect or `on_close`.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.cancel_reconnect();
        state.retire();
        drop(state);
        debug!(event = "channel_close_requested");
    }

    /// Queues a frame on the open socket. Returns false when not connected.
    pub fn send_message(&self, payload: impl Into<OutboundMessage>) -> bool {
        let text = payload.into().into_text();
        let state = self.shared.lock();
        if state.connection != ConnectionState::Open {
            return false;
        }
        state
            .commands
            .as_ref()
            .map(|commands| commands.send(Command::Send(text)).is_ok())
            .unwrap_or(false)
    }

    pub fn send_json<T: Serialize>(&self, payload: &T) -> bool {
        match serde_json::to_string(payload) {
            Ok(text) => self.send_message(text),
            Err(err) => {
                warn!(event = "channel_encode_error", error = %err);
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().connection == ConnectionState::Open
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lock().connection
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().reconnect_attempts
    }

    /// Delay of the reconnect currently waiting to fire, if any.
    pub fn pending_reconnect_delay(&self) -> Option<Duration> {
        self.shared.lock().reconnect_delay
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// With `expected` set this is the reconnect timer firing: it only acts
    /// if its generation is still current and the channel is not open.
    fn connect_if(self: &Arc<Self>, expected: Option<u64>) {
        let url = parse_channel_url(&self.config.url);
        let mut state = self.lock();
        if let Some(generation) = expected {
            if state.generation != generation {
                return;
            }
            if let Some(timer) = state.reconnect_timer.take() {
                timer.detach();
            }
            state.reconnect_delay = None;
            if state.connection == ConnectionState::Open {
                return;
            }
            info!(
                event = "channel_reconnecting",
                attempt = state.reconnect_attempts
            );
        }
        state.cancel_reconnect();
        state.retire();

        let url = match url {
            Ok(url) => url,
            Err(err) => {
                drop(state);
                warn!(event = "channel_init_error", error = %err);
                self.subscriber.on_error(&err);
                return;
            }
        };

        let generation = state.generation;
        let (commands, command_rx) = mpsc::unbounded_channel();
        state.connection = ConnectionState::Connecting;
        state.commands = Some(commands);
        state.io_task = Some(tokio::spawn(run_connection(
            Arc::downgrade(self),
            generation,
            url.clone(),
            command_rx,
        )));
        let weak = Arc::downgrade(self);
        state.connect_timer = Some(TimerHandle::after(
            self.config.connect_timeout,
            async move {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_connect_timeout(generation);
                }
            },
        ));
        drop(state);
        debug!(
            event = "channel_connecting",
            host = url.host_str().unwrap_or_default(),
            path = url.path(),
            generation
        );
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut ChannelState) -> Option<Duration> {
        state.cancel_reconnect();
        if state.reconnect_attempts >= self.config.max_reconnect_attempts {
            warn!(
                event = "channel_reconnect_exhausted",
                attempts = state.reconnect_attempts
            );
            return None;
        }
        state.reconnect_attempts += 1;
        let delay = self.config.backoff_delay(state.reconnect_attempts);
        let generation = state.generation;
        let weak = Arc::downgrade(self);
        state.reconnect_timer = Some(TimerHandle::after(delay, async move {
            if let Some(shared) = weak.upgrade() {
                shared.connect_if(Some(generation));
            }
        }));
        state.reconnect_delay = Some(delay);
        Some(delay)
    }

    fn handle_open(&self, generation: u64) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        state.connection = ConnectionState::Open;
        state.reconnect_attempts = 0;
        if let Some(timer) = state.connect_timer.take() {
            timer.cancel();
        }
        drop(state);
        info!(event = "channel_open", generation);
        self.subscriber.on_open();
        true
    }

    fn handle_frame(&self, generation: u64, raw: &str) {
        if self.lock().generation != generation {
            return;
        }
        let frame = match serde_json::from_str::<Value>(raw) {
            Ok(value) => Frame::Json(value),
            Err(err) => {
                warn!(event = "channel_decode_error", error = %err, bytes = raw.len());
                Frame::Unparsed
            }
        };
        self.subscriber.on_message(&frame, raw);
    }

    fn mark_closing(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation && state.connection == ConnectionState::Open {
            state.connection = ConnectionState::Closing;
        }
    }

    fn handle_connection_end(self: &Arc<Self>, generation: u64, end: ConnectionEnd) {
        let reconnect_in = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            drop(state.io_task.take());
            state.commands = None;
            state.retire();
            let abnormal = match &end {
                ConnectionEnd::Closed { code, .. } => !is_normal_close(*code),
                ConnectionEnd::Failed(_) => true,
            };
            if abnormal {
                self.schedule_reconnect(&mut state)
            } else {
                None
            }
        };
        let reconnect_in_ms = reconnect_in.map(|delay| delay.as_millis() as u64);
        match end {
            ConnectionEnd::Closed { code, reason } => {
                info!(event = "channel_closed", code, reason = %reason, reconnect_in_ms);
                self.subscriber.on_close(code, &reason);
            }
            ConnectionEnd::Failed(err) => {
                warn!(event = "channel_transport_error", error = %err, reconnect_in_ms);
                self.subscriber.on_error(&err);
                self.subscriber.on_close(CLOSE_ABNORMAL, "");
            }
        }
    }

    fn handle_connect_timeout(self: &Arc<Self>, generation: u64) {
        let reconnect_in = {
            let mut state = self.lock();
            if state.generation != generation || state.connection != ConnectionState::Connecting
            {
                return;
            }
            if let Some(timer) = state.connect_timer.take() {
                timer.detach();
            }
            state.retire();
            self.schedule_reconnect(&mut state)
        };
        warn!(
            event = "channel_connect_timeout",
            timeout_ms = self.config.connect_timeout.as_millis() as u64,
            reconnect_in_ms = reconnect_in.map(|delay| delay.as_millis() as u64)
        );
        self.subscriber
            .on_close(CLOSE_CONNECT_TIMEOUT, CONNECT_TIMEOUT_REASON);
    }
}

async fn run_connection(
    shared: Weak<Shared>,
    generation: u64,
    url: Url,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(err) => {
            if let Some(shared) = shared.upgrade() {
                let err = ChannelError::Transport(err.to_string());
                shared.handle_connection_end(generation, ConnectionEnd::Failed(err));
            }
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();
    let opened = shared
        .upgrade()
        .map(|shared| shared.handle_open(generation))
        .unwrap_or(false);
    if !opened {
        let _ = sink.close().await;
        return;
    }

    let end = loop {
        tokio::select! {
            frame = stream.next() => {
                let Some(owner) = shared.upgrade() else {
                    break None;
                };
                match frame {
                    Some(Ok(Message::Text(text))) => owner.handle_frame(generation, &text),
                    Some(Ok(Message::Binary(bytes))) => {
                        owner.handle_frame(generation, &String::from_utf8_lossy(&bytes));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        owner.mark_closing(generation);
                        let (code, reason) = frame
                            .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
                            .unwrap_or((CLOSE_NO_STATUS, String::new()));
                        // Flushes the queued close reply to the server.
                        let _ = sink.close().await;
                        break Some(ConnectionEnd::Closed { code, reason });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        break Some(ConnectionEnd::Failed(ChannelError::Transport(err.to_string())));
                    }
                    None => {
                        break Some(ConnectionEnd::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: String::new(),
                        });
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Send(text)) => {
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            break Some(ConnectionEnd::Failed(ChannelError::Transport(err.to_string())));
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = sink.close().await;
                        break None;
                    }
                }
            }
        }
    };

    if let Some(end) = end {
        if let Some(shared) = shared.upgrade() {
            shared.handle_connection_end(generation, end);
        }
    }
}
