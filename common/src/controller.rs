use crate::{
    capture::{CaptureFeed, CaptureRecord},
    config::{ConnectionCredentials, FanConfig},
    device::{Actuator, DeviceState},
    router::{CommandRouter, RouteError, Routed},
    session::{
        elapsed_ms, InboundMessage, MqttTransport, SessionEvent, TransportError, TransportSession,
    },
    topics::{TopicSpec, TOPIC_STATE_STATUS},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusReason {
    Connected,
    Changed,
    Interval,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    Sent(StatusReason),
    Failed(StatusReason, TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    pub topic: String,
    pub payload_len: usize,
    pub result: Result<Routed, RouteError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub session_event: Option<SessionEvent>,
    // Messages read in the same poll that lost the link; never routed.
    pub dropped: usize,
    pub routed: Vec<RoutedMessage>,
    pub status: Option<StatusOutcome>,
    pub capture: Option<CaptureRecord>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.session_event.is_none()
            && self.dropped == 0
            && self.routed.is_empty()
            && self.status.is_none()
            && self.capture.is_none()
    }
}

pub struct FanController<T, A, C> {
    session: TransportSession,
    router: CommandRouter,
    state: DeviceState,
    transport: T,
    actuator: A,
    capture: C,
    inbox: Vec<InboundMessage>,
    status_interval_ms: u32,
    last_status_ms: Option<u32>,
    status_dirty: bool,
}

impl<T, A, C> FanController<T, A, C>
where
    T: MqttTransport,
    A: Actuator,
    C: CaptureFeed,
{
    pub fn new(
        config: &FanConfig,
        endpoint: Option<ConnectionCredentials>,
        suffix_source: fn() -> u16,
        boot_ms: u32,
        transport: T,
        actuator: A,
        capture: C,
    ) -> Self {
        let spec = TopicSpec::fan();
        Self {
            session: TransportSession::new(endpoint, spec.clone(), config, suffix_source, boot_ms),
            router: CommandRouter::new(spec, config.max_payload_bytes),
            state: DeviceState::new(),
            transport,
            actuator,
            capture,
            inbox: Vec::new(),
            status_interval_ms: config.status_interval_ms,
            last_status_ms: None,
            status_dirty: false,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn capture(&self) -> &C {
        &self.capture
    }

    pub fn tick(&mut self, now_ms: u32) -> TickReport {
        let mut report = TickReport::default();

        self.inbox.clear();
        report.session_event = self
            .session
            .advance(&mut self.transport, now_ms, &mut self.inbox);

        let just_connected = matches!(report.session_event, Some(SessionEvent::Connected { .. }));

        if self.session.is_connected() {
            for message in self.inbox.drain(..) {
                let result = self.router.route(
                    &message.topic,
                    &message.payload,
                    &mut self.state,
                    &mut self.actuator,
                );
                if matches!(result, Ok(Routed::Applied { .. })) {
                    self.status_dirty = true;
                }
                report.routed.push(RoutedMessage {
                    payload_len: message.payload.len(),
                    topic: message.topic,
                    result,
                });
            }
        } else {
            report.dropped = self.inbox.len();
            self.inbox.clear();
        }

        // At most one status per tick, sent after this tick's commands are applied.
        if self.session.is_connected() {
            let reason = if just_connected {
                Some(StatusReason::Connected)
            } else {
                self.status_due(now_ms)
            };
            if let Some(reason) = reason {
                report.status = Some(self.publish_status(now_ms, reason));
            }
        }

        report.capture = self.capture.poll_decoded(now_ms);
        report
    }

    fn status_due(&self, now_ms: u32) -> Option<StatusReason> {
        if self.status_dirty {
            return Some(StatusReason::Changed);
        }

        if self.status_interval_ms == 0 {
            return None;
        }

        let interval_elapsed = self
            .last_status_ms
            .map(|last| elapsed_ms(now_ms, last) >= self.status_interval_ms)
            .unwrap_or(true);
        interval_elapsed.then_some(StatusReason::Interval)
    }

    fn publish_status(&mut self, now_ms: u32, reason: StatusReason) -> StatusOutcome {
        let body = match serde_json::to_vec(&self.state.status_payload()) {
            Ok(body) => body,
            Err(err) => {
                return StatusOutcome::Failed(reason, TransportError::Rejected(err.to_string()))
            }
        };

        match self
            .session
            .publish(&mut self.transport, TOPIC_STATE_STATUS, &body)
        {
            Ok(()) => {
                self.last_status_ms = Some(now_ms);
                self.status_dirty = false;
                StatusOutcome::Sent(reason)
            }
            Err(err) => StatusOutcome::Failed(reason, err),
        }
    }
}
