use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions, QoS,
};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use fan_common::{
    poll_outcome, Actuator, ConnectCause, ConnectRequest, ConnectionCredentials, DeviceState,
    FanController, InboundMessage, LinkLost, LogLevel, MqttTransport, NetworkConfig, NoCapture,
    RuntimeConfig, StateChange, TickReport, TransportError,
};

const MQTT_KEEP_ALIVE_SEC: u64 = 15;
const MQTT_REQUEST_CAPACITY: usize = 64;
const POLL_SLICE_MS: u64 = 5;
const MAX_EVENTS_PER_POLL: usize = 32;

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("FAN_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.wifi-fan"));
    let runtime_path = data_dir.join("runtime.json");

    let mut runtime = load_runtime_config(&runtime_path).unwrap_or_else(|err| {
        warn!("failed to load runtime config from {}: {err:#}", runtime_path.display());
        RuntimeConfig::default()
    });
    runtime.fan.sanitize();
    apply_env_overrides(&mut runtime.network);

    let endpoint = ConnectionCredentials::from_network(&runtime.network).unwrap_or_else(|err| {
        warn!("invalid broker settings ({err}); messaging disabled");
        None
    });
    match &endpoint {
        Some(endpoint) => info!(
            "broker `{}:{}` (credentials: {})",
            endpoint.host,
            endpoint.port,
            endpoint.has_credentials()
        ),
        None => info!("no broker configured; messaging disabled"),
    }

    let transport = RumqttTransport::new().context("failed to start mqtt runtime")?;
    let tick_interval = Duration::from_millis(runtime.fan.tick_interval_ms.into());
    let mut controller = FanController::new(
        &runtime.fan,
        endpoint,
        random_suffix,
        monotonic_ms(),
        transport,
        LoggingActuator,
        NoCapture,
    );

    info!("fan controller running, tick every {tick_interval:?}");
    loop {
        let report = controller.tick(monotonic_ms());
        log_report(&report);
        thread::sleep(tick_interval);
    }
}

fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match std::fs::read(path) {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(network: &mut NetworkConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
}

fn random_suffix() -> u16 {
    rand::random()
}

fn log_report(report: &TickReport) {
    for line in report.log_lines() {
        match line.level {
            LogLevel::Debug => debug!("{}", line.message),
            LogLevel::Info => info!("{}", line.message),
            LogLevel::Warn => warn!("{}", line.message),
        }
    }
}

// Stands in for the relay board when running off-device.
struct LoggingActuator;

impl Actuator for LoggingActuator {
    fn apply(&mut self, change: StateChange, state: &DeviceState) {
        let outputs = state.outputs();
        info!(
            "actuator {change:?}: speed lines {:?}, oscillate {}",
            outputs.speed_lines, outputs.oscillate
        );
    }
}

struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
}

struct RumqttTransport {
    runtime: Runtime,
    link: Option<MqttLink>,
}

impl RumqttTransport {
    fn new() -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime, link: None })
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.link
            .as_ref()
            .map(|link| &link.client)
            .ok_or(TransportError::NotConnected)
    }
}

impl MqttTransport for RumqttTransport {
    fn connect(&mut self, request: &ConnectRequest<'_>) -> Result<(), ConnectCause> {
        self.disconnect();

        let mut options = MqttOptions::new(request.client_id, request.host, request.port);
        options.set_keep_alive(Duration::from_secs(MQTT_KEEP_ALIVE_SEC));
        options.set_clean_session(true);
        if let Some(credentials) = request.credentials {
            options.set_credentials(&credentials.username, &credentials.password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, MQTT_REQUEST_CAPACITY);
        let timeout = Duration::from_millis(request.timeout_ms.into());

        let result = self.runtime.block_on(async {
            tokio::time::timeout(timeout, async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => return Ok(()),
                        Ok(_) => {}
                        Err(err) => return Err(connect_cause(&err)),
                    }
                }
            })
            .await
        });

        match result {
            Ok(Ok(())) => {
                self.link = Some(MqttLink { client, eventloop });
                Ok(())
            }
            Ok(Err(cause)) => Err(cause),
            Err(_) => Err(ConnectCause::ConnectionTimeout),
        }
    }

    fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            if link.client.try_disconnect().is_ok() {
                // Give the event loop one slice to flush the DISCONNECT packet.
                self.runtime.block_on(async {
                    let slice = Duration::from_millis(POLL_SLICE_MS);
                    let _ = tokio::time::timeout(slice, link.eventloop.poll()).await;
                });
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| TransportError::Rejected(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.client()?
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| TransportError::Rejected(err.to_string()))
    }

    fn poll(&mut self, inbox: &mut Vec<InboundMessage>) -> Result<(), LinkLost> {
        let Some(link) = self.link.as_mut() else {
            return Err(LinkLost);
        };

        let already_read = inbox.len();
        let healthy = self.runtime.block_on(async {
            for _ in 0..MAX_EVENTS_PER_POLL {
                let slice = Duration::from_millis(POLL_SLICE_MS);
                match tokio::time::timeout(slice, link.eventloop.poll()).await {
                    Err(_) => return true,
                    Ok(Ok(Event::Incoming(Incoming::Publish(message)))) => {
                        inbox.push(InboundMessage::new(message.topic, message.payload.to_vec()));
                    }
                    Ok(Ok(Event::Incoming(Incoming::Disconnect))) => return false,
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        debug!("mqtt poll error: {err}");
                        return false;
                    }
                }
            }
            true
        });

        if healthy {
            return Ok(());
        }

        self.link = None;
        poll_outcome(false, inbox.len() - already_read)
    }
}

fn connect_cause(err: &ConnectionError) -> ConnectCause {
    match err {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion => ConnectCause::BadProtocol,
            ConnectReturnCode::BadClientId => ConnectCause::BadClientId,
            ConnectReturnCode::ServiceUnavailable => ConnectCause::Unavailable,
            ConnectReturnCode::BadUserNamePassword => ConnectCause::BadCredentials,
            ConnectReturnCode::NotAuthorized => ConnectCause::Unauthorized,
            ConnectReturnCode::Success => ConnectCause::Unknown,
        },
        ConnectionError::Io(_) => ConnectCause::Unavailable,
        ConnectionError::NetworkTimeout => ConnectCause::ConnectionTimeout,
        _ => ConnectCause::Unknown,
    }
}

fn monotonic_ms() -> u32 {
    static START: OnceLock<Instant> = OnceLock::new();
    // Truncation is the wrapping millisecond counter the session expects.
    START.get_or_init(Instant::now).elapsed().as_millis() as u32
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn refused_connections_map_to_client_codes() {
        let cases = [
            (ConnectReturnCode::RefusedProtocolVersion, 1),
            (ConnectReturnCode::BadClientId, 2),
            (ConnectReturnCode::ServiceUnavailable, 3),
            (ConnectReturnCode::BadUserNamePassword, 4),
            (ConnectReturnCode::NotAuthorized, 5),
        ];

        for (code, expected) in cases {
            let cause = connect_cause(&ConnectionError::ConnectionRefused(code));
            assert_eq!(cause.code(), expected, "{code:?}");
        }
    }

    #[test]
    fn io_failure_means_unavailable() {
        let err = ConnectionError::Io(std::io::Error::from(ErrorKind::ConnectionRefused));
        assert_eq!(connect_cause(&err), ConnectCause::Unavailable);
        assert_eq!(
            connect_cause(&ConnectionError::NetworkTimeout),
            ConnectCause::ConnectionTimeout
        );
    }

    #[test]
    fn missing_runtime_file_gives_defaults() {
        let path = std::env::temp_dir().join("fan-controller-missing").join("runtime.json");

        let runtime = load_runtime_config(&path).unwrap();

        assert_eq!(runtime.network.mqtt_host, "");
        assert_eq!(runtime.fan.backoff_ms, 5_000);
    }

    #[test]
    fn runtime_file_is_parsed() {
        let dir = std::env::temp_dir().join(format!("fan-controller-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime.json");
        std::fs::write(
            &path,
            r#"{"fan":{"backoff_ms":8000},"network":{"mqtt_host":"10.1.1.5","mqtt_user":"fan"}}"#,
        )
        .unwrap();

        let runtime = load_runtime_config(&path).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(runtime.fan.backoff_ms, 8_000);
        let endpoint = ConnectionCredentials::from_network(&runtime.network)
            .unwrap()
            .unwrap();
        assert_eq!(endpoint.host, "10.1.1.5");
        assert_eq!(endpoint.port, 1883);
        assert!(endpoint.has_credentials());
    }

    #[test]
    fn disconnected_transport_refuses_io() {
        let mut transport = RumqttTransport::new().unwrap();

        assert!(!transport.is_connected());
        assert_eq!(
            transport.publish("fan/state/connected", b"{}"),
            Err(TransportError::NotConnected)
        );
        assert_eq!(transport.poll(&mut Vec::new()), Err(LinkLost));
    }
}
