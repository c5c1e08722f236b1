use core::convert::TryInto;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        gpio::{AnyInputPin, AnyOutputPin},
        modem::Modem,
        prelude::Peripherals,
        rmt::RMT,
    },
    log::EspLogger,
    mqtt::client::{EspMqttClient, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use fan_common::{
    config::NetworkConfig, poll_outcome, Actuator, ConnectCause, ConnectRequest,
    ConnectionCredentials, DeviceState, FanController, InboundMessage, IrCaptureConfig, LinkLost,
    LogLevel, MqttTransport, ResetReason, RuntimeConfig, StateChange, TickReport, TransportError,
    MAX_SPEED,
};

use crate::ir::IrReceiver;

const NVS_NAMESPACE: &str = "wifi-fan";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const TICK_INTERVAL_MS: u64 = 50;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const MQTT_KEEP_ALIVE_SEC: u64 = 15;
const MQTT_CONNECT_POLL_MS: u64 = 10;
const SPEED_PINS: [i32; MAX_SPEED as usize] = [25, 26, 27];
const OSCILLATE_PIN: i32 = 33;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();
    log_reset_reason();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.fan.sanitize();
    runtime.ir.sanitize();

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`",
        runtime.network.wifi_ssid, runtime.network.mqtt_host, runtime.network.mqtt_port,
    );

    let Peripherals { modem, rmt, .. } = Peripherals::take()?;

    let capture = if runtime.ir.enabled {
        match init_ir_receiver(rmt, &runtime.ir) {
            Ok(receiver) => {
                info!(
                    "IR receiver initialized on RMT channel{} / GPIO{}",
                    runtime.ir.rmt_channel, runtime.ir.rx_pin
                );
                receiver
            }
            Err(err) => {
                warn!("failed to initialize IR receiver, capture disabled: {err:#}");
                IrReceiver::disabled()
            }
        }
    } else {
        IrReceiver::disabled()
    };

    let actuator = GpioActuator::new().context("failed to claim fan output pins")?;

    // Without WiFi the session just keeps failing and backing off.
    let _wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => {
            disable_wifi_power_save();
            Some(wifi)
        }
        Err(err) => {
            warn!("wifi startup failed: {err:#}");
            None
        }
    };

    let endpoint = ConnectionCredentials::from_network(&runtime.network).unwrap_or_else(|err| {
        warn!("invalid broker settings ({err}); messaging disabled");
        None
    });
    if endpoint.is_none() {
        info!("no broker configured; messaging disabled");
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let mut controller = FanController::new(
        &runtime.fan,
        endpoint,
        random_suffix,
        monotonic_ms(),
        EspTransport::default(),
        actuator,
        capture,
    );

    loop {
        feed_watchdog();
        let report = controller.tick(monotonic_ms());
        log_report(&report);
        thread::sleep(Duration::from_millis(TICK_INTERVAL_MS));
    }
}

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, false)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

fn init_ir_receiver(rmt: RMT, ir: &IrCaptureConfig) -> anyhow::Result<IrReceiver> {
    if ir.rx_pin < 0 {
        return Err(anyhow!("invalid rx pin: {}", ir.rx_pin));
    }

    let pin = ir.rx_pin;

    match ir.rmt_channel {
        0 => unsafe { IrReceiver::new(rmt.channel0, AnyInputPin::new(pin), ir) },
        1 => unsafe { IrReceiver::new(rmt.channel1, AnyInputPin::new(pin), ir) },
        2 => unsafe { IrReceiver::new(rmt.channel2, AnyInputPin::new(pin), ir) },
        3 => unsafe { IrReceiver::new(rmt.channel3, AnyInputPin::new(pin), ir) },
        #[cfg(any(esp32, esp32s3))]
        4 => unsafe { IrReceiver::new(rmt.channel4, AnyInputPin::new(pin), ir) },
        #[cfg(any(esp32, esp32s3))]
        5 => unsafe { IrReceiver::new(rmt.channel5, AnyInputPin::new(pin), ir) },
        #[cfg(any(esp32, esp32s3))]
        6 => unsafe { IrReceiver::new(rmt.channel6, AnyInputPin::new(pin), ir) },
        #[cfg(any(esp32, esp32s3))]
        7 => unsafe { IrReceiver::new(rmt.channel7, AnyInputPin::new(pin), ir) },
        _ => Err(anyhow!("unsupported RMT channel: {}", ir.rmt_channel)),
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi ssid not provisioned"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow!("wifi not up after {WIFI_CONNECT_ATTEMPTS} attempts: {err:#}"));
    }
    drop(wifi);
    Ok(esp_wifi)
}

struct GpioActuator {
    speed: Vec<PinDriver<'static, AnyOutputPin, Output>>,
    oscillate: PinDriver<'static, AnyOutputPin, Output>,
}

impl GpioActuator {
    fn new() -> anyhow::Result<Self> {
        let mut speed = Vec::with_capacity(SPEED_PINS.len());
        for pin in SPEED_PINS {
            let mut driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
                .with_context(|| format!("speed output on GPIO{pin}"))?;
            driver.set_low()?;
            speed.push(driver);
        }

        let mut oscillate = unsafe { PinDriver::output(AnyOutputPin::new(OSCILLATE_PIN)) }
            .with_context(|| format!("oscillate output on GPIO{OSCILLATE_PIN}"))?;
        oscillate.set_low()?;

        Ok(Self { speed, oscillate })
    }
}

impl Actuator for GpioActuator {
    fn apply(&mut self, change: StateChange, state: &DeviceState) {
        let outputs = state.outputs();
        debug!("actuator {change:?} -> {outputs:?}");

        let lines = self
            .speed
            .iter_mut()
            .zip(outputs.speed_lines)
            .chain(core::iter::once((&mut self.oscillate, outputs.oscillate)));

        for (pin, high) in lines {
            let result = if high { pin.set_high() } else { pin.set_low() };
            if let Err(err) = result {
                warn!("failed to drive fan output: {err}");
            }
        }
    }
}

enum MqttSignal {
    Connected,
    Disconnected,
    Error(String),
    Message(InboundMessage),
}

type SignalQueue = Arc<Mutex<VecDeque<MqttSignal>>>;

// ESP-IDF MQTT client. Its callback runs on the MQTT task and only queues
// signals; the tick loop drains them.
#[derive(Default)]
struct EspTransport {
    client: Option<EspMqttClient<'static>>,
    signals: SignalQueue,
}

fn lock_signals(signals: &SignalQueue) -> MutexGuard<'_, VecDeque<MqttSignal>> {
    signals
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EspTransport {
    fn wait_for_connack(&self, timeout_ms: u32) -> Result<(), ConnectCause> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms.into());

        loop {
            while let Some(signal) = lock_signals(&self.signals).pop_front() {
                match signal {
                    MqttSignal::Connected => return Ok(()),
                    MqttSignal::Disconnected => return Err(ConnectCause::Unavailable),
                    MqttSignal::Error(err) => {
                        debug!("mqtt error while connecting: {err}");
                        return Err(ConnectCause::Unknown);
                    }
                    MqttSignal::Message(_) => {}
                }
            }

            if Instant::now() >= deadline {
                return Err(ConnectCause::ConnectionTimeout);
            }
            thread::sleep(Duration::from_millis(MQTT_CONNECT_POLL_MS));
        }
    }
}

impl MqttTransport for EspTransport {
    fn connect(&mut self, request: &ConnectRequest<'_>) -> Result<(), ConnectCause> {
        self.disconnect();

        let url = format!("mqtt://{}:{}", request.host, request.port);
        let conf = MqttClientConfiguration {
            client_id: Some(request.client_id),
            username: request.credentials.map(|c| c.username.as_str()),
            password: request.credentials.map(|c| c.password.as_str()),
            keep_alive_interval: Some(Duration::from_secs(MQTT_KEEP_ALIVE_SEC)),
            network_timeout: Duration::from_millis(request.timeout_ms.into()),
            ..Default::default()
        };

        let signals = self.signals.clone();
        let client = EspMqttClient::new_cb(&url, &conf, move |event| {
            let signal = match event.payload() {
                EventPayload::Connected(_) => MqttSignal::Connected,
                EventPayload::Disconnected => MqttSignal::Disconnected,
                EventPayload::Error(err) => MqttSignal::Error(format!("{err:?}")),
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details: Details::Complete,
                    ..
                } => MqttSignal::Message(InboundMessage::new(topic, data)),
                _ => return,
            };
            lock_signals(&signals).push_back(signal);
        })
        .map_err(|err| {
            warn!("mqtt client init failed: {err}");
            ConnectCause::Unknown
        })?;
        self.client = Some(client);

        if let Err(cause) = self.wait_for_connack(request.timeout_ms) {
            self.disconnect();
            return Err(cause);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        // Dropping the client stops its task and closes the socket.
        self.client = None;
        lock_signals(&self.signals).clear();
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| TransportError::Rejected(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
        client
            .enqueue(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|err| TransportError::Rejected(err.to_string()))
    }

    fn poll(&mut self, inbox: &mut Vec<InboundMessage>) -> Result<(), LinkLost> {
        if self.client.is_none() {
            return Err(LinkLost);
        }

        let mut lost = false;
        let already_read = inbox.len();
        {
            let mut signals = lock_signals(&self.signals);
            while let Some(signal) = signals.pop_front() {
                match signal {
                    MqttSignal::Message(message) => inbox.push(message),
                    MqttSignal::Disconnected => lost = true,
                    MqttSignal::Error(err) => debug!("mqtt error: {err}"),
                    MqttSignal::Connected => {}
                }
            }
        }

        if lost {
            self.disconnect();
        }
        poll_outcome(!lost, inbox.len() - already_read)
    }
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

fn log_reset_reason() {
    let reason = ResetReason::from_code(unsafe { esp_idf_svc::sys::esp_reset_reason() });
    if reason.is_fault() {
        warn!("wifi fan started after {reason} reset");
    } else {
        info!("wifi fan started ({reason})");
    }
}

fn random_suffix() -> u16 {
    (unsafe { esp_idf_svc::sys::esp_random() } & 0xFFFF) as u16
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn monotonic_ms() -> u32 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u32
}
