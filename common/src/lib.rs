pub mod capture;
pub mod config;
pub mod controller;
pub mod device;
pub mod report;
pub mod reset;
pub mod router;
pub mod session;
pub mod topics;
pub mod types;

#[cfg(test)]
mod mock;

pub use capture::{CaptureFeed, CaptureRecord, NoCapture};
pub use config::{
    ConfigError, ConnectionCredentials, Credentials, FanConfig, IrCaptureConfig, NetworkConfig,
    RuntimeConfig,
};
pub use controller::{FanController, RoutedMessage, StatusOutcome, StatusReason, TickReport};
pub use device::{
    Actuator, DeviceState, OutputLevels, StateChange, StateError, MAX_SPEED, MAX_TIMER_MINUTES,
};
pub use report::{LogLevel, LogLine};
pub use reset::ResetReason;
pub use router::{CommandRouter, RouteError, Routed};
pub use session::{
    poll_outcome, ConnectCause, ConnectRequest, InboundMessage, LinkLost, MqttTransport,
    SessionEvent, SessionState, TransportError, TransportSession,
};
pub use topics::*;
pub use types::{ConnectedPayload, StatusPayload};
