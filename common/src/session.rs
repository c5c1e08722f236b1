use core::fmt;

use thiserror::Error;

use crate::{
    config::{ConnectionCredentials, Credentials, FanConfig},
    topics::{TopicSpec, TOPIC_STATE_CONNECTED},
    types::ConnectedPayload,
};

pub const CLIENT_ID_PREFIX: &str = "WiFiFan";

pub fn elapsed_ms(now_ms: u32, since_ms: u32) -> u32 {
    now_ms.wrapping_sub(since_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectCause {
    #[error("broker rejected the protocol version")]
    BadProtocol,
    #[error("broker rejected the client id")]
    BadClientId,
    #[error("broker unavailable")]
    Unavailable,
    #[error("bad username or password")]
    BadCredentials,
    #[error("client not authorized")]
    Unauthorized,
    #[error("connection lost")]
    ConnectionLost,
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("disconnected")]
    Disconnected,
    #[error("unknown connect failure")]
    Unknown,
}

impl ConnectCause {
    pub fn code(self) -> i32 {
        match self {
            Self::ConnectionTimeout => -4,
            Self::ConnectionLost => -3,
            Self::Unknown => -2,
            Self::Disconnected => -1,
            Self::BadProtocol => 1,
            Self::BadClientId => 2,
            Self::Unavailable => 3,
            Self::BadCredentials => 4,
            Self::Unauthorized => 5,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -4 => Self::ConnectionTimeout,
            -3 => Self::ConnectionLost,
            -1 => Self::Disconnected,
            1 => Self::BadProtocol,
            2 => Self::BadClientId,
            3 => Self::Unavailable,
            4 => Self::BadCredentials,
            5 => Self::Unauthorized,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionTimeout => "MQTT_CONNECTION_TIMEOUT",
            Self::ConnectionLost => "MQTT_CONNECTION_LOST",
            Self::Unknown => "MQTT_CONNECT_FAILED",
            Self::Disconnected => "MQTT_DISCONNECTED",
            Self::BadProtocol => "MQTT_CONNECT_BAD_PROTOCOL",
            Self::BadClientId => "MQTT_CONNECT_BAD_CLIENT_ID",
            Self::Unavailable => "MQTT_CONNECT_UNAVAILABLE",
            Self::BadCredentials => "MQTT_CONNECT_BAD_CREDENTIALS",
            Self::Unauthorized => "MQTT_CONNECT_UNAUTHORIZED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("transport rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("link to broker lost")]
pub struct LinkLost;

// Messages read before the link dropped are still handed over; the loss
// surfaces on the next poll, when the transport no longer reports connected.
pub fn poll_outcome(link_ok: bool, newly_read: usize) -> Result<(), LinkLost> {
    if link_ok || newly_read > 0 {
        Ok(())
    } else {
        Err(LinkLost)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest<'a> {
    pub client_id: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub credentials: Option<&'a Credentials>,
    pub timeout_ms: u32,
}

/// Platform MQTT client, as seen from the tick loop. Every call must return
/// within a bounded time; `connect` may take up to `request.timeout_ms`.
pub trait MqttTransport {
    fn connect(&mut self, request: &ConnectRequest<'_>) -> Result<(), ConnectCause>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;
    fn poll(&mut self, inbox: &mut Vec<InboundMessage>) -> Result<(), LinkLost>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disabled,
    Disconnected,
    Connecting,
    Connected,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "DISABLED",
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected {
        client_id: String,
        subscribed: usize,
        reconnects: u32,
    },
    ConnectFailed {
        client_id: String,
        cause: ConnectCause,
        retry_in_ms: u32,
    },
    LinkLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub connect_attempts: u32,
    pub failed_attempts: u32,
    pub reconnects: u32,
    pub last_failure: Option<ConnectCause>,
}

pub struct TransportSession {
    endpoint: Option<ConnectionCredentials>,
    topics: TopicSpec,
    state: SessionState,
    boot_ms: u32,
    boot_grace_done: bool,
    last_attempt_ms: Option<u32>,
    backoff_ms: u32,
    boot_grace_ms: u32,
    connect_timeout_ms: u32,
    suffix_source: fn() -> u16,
    stats: SessionStats,
    ever_connected: bool,
}

impl TransportSession {
    pub fn new(
        endpoint: Option<ConnectionCredentials>,
        topics: TopicSpec,
        config: &FanConfig,
        suffix_source: fn() -> u16,
        boot_ms: u32,
    ) -> Self {
        let state = if endpoint.is_some() {
            SessionState::Disconnected
        } else {
            SessionState::Disabled
        };

        Self {
            endpoint,
            topics,
            state,
            boot_ms,
            boot_grace_done: config.boot_grace_ms == 0,
            last_attempt_ms: None,
            backoff_ms: config.backoff_ms,
            boot_grace_ms: config.boot_grace_ms,
            connect_timeout_ms: config.connect_timeout_ms,
            suffix_source,
            stats: SessionStats::default(),
            ever_connected: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    // True while a reconnect is held back by boot grace or backoff.
    pub fn backoff_pending(&mut self, now_ms: u32) -> bool {
        if self.state != SessionState::Disconnected {
            return false;
        }

        if !self.boot_grace_done {
            if elapsed_ms(now_ms, self.boot_ms) < self.boot_grace_ms {
                return true;
            }
            self.boot_grace_done = true;
        }

        self.last_attempt_ms
            .map(|last| elapsed_ms(now_ms, last) < self.backoff_ms)
            .unwrap_or(false)
    }

    pub fn advance<T: MqttTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        now_ms: u32,
        inbox: &mut Vec<InboundMessage>,
    ) -> Option<SessionEvent> {
        match self.state {
            SessionState::Disabled | SessionState::Connecting => None,
            SessionState::Disconnected => {
                if self.backoff_pending(now_ms) {
                    return None;
                }

                let event = self.attempt_connect(transport, now_ms);
                if self.is_connected() && transport.poll(inbox).is_err() {
                    // Lost again before the first read; the connected event still stands.
                    self.mark_lost(transport, now_ms);
                }
                Some(event)
            }
            SessionState::Connected => {
                let healthy = transport.is_connected() && transport.poll(inbox).is_ok();
                if healthy {
                    return None;
                }

                self.mark_lost(transport, now_ms);
                Some(SessionEvent::LinkLost)
            }
        }
    }

    pub fn publish<T: MqttTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        transport.publish(topic, payload)
    }

    fn attempt_connect<T: MqttTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        now_ms: u32,
    ) -> SessionEvent {
        self.state = SessionState::Connecting;
        self.last_attempt_ms = Some(now_ms);
        self.stats.connect_attempts = self.stats.connect_attempts.saturating_add(1);

        let client_id = format!("{CLIENT_ID_PREFIX}-{}", (self.suffix_source)());

        let result = match &self.endpoint {
            Some(endpoint) => transport.connect(&ConnectRequest {
                client_id: &client_id,
                host: &endpoint.host,
                port: endpoint.port,
                credentials: endpoint.credentials.as_ref(),
                timeout_ms: self.connect_timeout_ms,
            }),
            None => Err(ConnectCause::Disconnected),
        };

        if let Err(cause) = result {
            return self.fail_attempt(client_id, cause);
        }

        let reconnects = if self.ever_connected {
            self.stats.reconnects.saturating_add(1)
        } else {
            0
        };

        let connected = ConnectedPayload {
            client_id: client_id.clone(),
            reconnects,
        };
        // The connected announcement is best effort; subscriptions are not.
        if let Ok(body) = serde_json::to_vec(&connected) {
            let _ = transport.publish(TOPIC_STATE_CONNECTED, &body);
        }

        let mut subscribed = 0;
        let mut subscribe_failed = false;
        for topic in self.topics.topics() {
            if transport.subscribe(topic).is_err() {
                subscribe_failed = true;
                break;
            }
            subscribed += 1;
        }
        if subscribe_failed {
            transport.disconnect();
            return self.fail_attempt(client_id, ConnectCause::ConnectionLost);
        }

        self.state = SessionState::Connected;
        self.stats.reconnects = reconnects;
        self.ever_connected = true;
        SessionEvent::Connected {
            client_id,
            subscribed,
            reconnects,
        }
    }

    fn fail_attempt(&mut self, client_id: String, cause: ConnectCause) -> SessionEvent {
        self.state = SessionState::Disconnected;
        self.stats.failed_attempts = self.stats.failed_attempts.saturating_add(1);
        self.stats.last_failure = Some(cause);
        SessionEvent::ConnectFailed {
            client_id,
            cause,
            retry_in_ms: self.backoff_ms,
        }
    }

    fn mark_lost<T: MqttTransport + ?Sized>(&mut self, transport: &mut T, now_ms: u32) {
        transport.disconnect();
        self.state = SessionState::Disconnected;
        self.last_attempt_ms = Some(now_ms);
        self.stats.last_failure = Some(ConnectCause::ConnectionLost);
    }
}
