use std::collections::VecDeque;

use crate::{
    capture::{CaptureFeed, CaptureRecord},
    device::{Actuator, DeviceState, StateChange},
    session::{
        ConnectCause, ConnectRequest, InboundMessage, LinkLost, MqttTransport, TransportError,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect {
        client_id: String,
        with_credentials: bool,
    },
    Disconnect,
    Subscribe(String),
    Publish {
        topic: String,
        payload: String,
    },
    Poll,
}

#[derive(Debug, Default)]
pub struct MockTransport {
    pub calls: Vec<TransportCall>,
    // Subscribes past this many accepted ones are refused.
    pub reject_subscribes_after: Option<usize>,
    // The next poll hands over pending messages, then reports the link lost.
    pub fail_next_poll: bool,
    connected: bool,
    subscribed: usize,
    connect_failures: VecDeque<ConnectCause>,
    pending: VecDeque<InboundMessage>,
}

impl MockTransport {
    pub fn fail_next_connects(&mut self, causes: Vec<ConnectCause>) {
        self.connect_failures.extend(causes);
    }

    // Handed over on the next poll while connected.
    pub fn deliver(&mut self, topic: &str, payload: &str) {
        self.pending
            .push_back(InboundMessage::new(topic, payload.as_bytes().to_vec()));
    }

    pub fn drop_link(&mut self) {
        self.connected = false;
    }

    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Publish { topic: t, payload } if t == topic => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }
}

impl MqttTransport for MockTransport {
    fn connect(&mut self, request: &ConnectRequest<'_>) -> Result<(), ConnectCause> {
        self.calls.push(TransportCall::Connect {
            client_id: request.client_id.to_string(),
            with_credentials: request.credentials.is_some(),
        });

        if let Some(cause) = self.connect_failures.pop_front() {
            return Err(cause);
        }
        self.connected = true;
        self.subscribed = 0;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.calls.push(TransportCall::Disconnect);
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        if self
            .reject_subscribes_after
            .is_some_and(|limit| self.subscribed >= limit)
        {
            return Err(TransportError::Rejected("subscribe refused".to_string()));
        }
        self.subscribed += 1;
        self.calls.push(TransportCall::Subscribe(topic.to_string()));
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.calls.push(TransportCall::Publish {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        });
        Ok(())
    }

    fn poll(&mut self, inbox: &mut Vec<InboundMessage>) -> Result<(), LinkLost> {
        self.calls.push(TransportCall::Poll);
        if !self.connected {
            return Err(LinkLost);
        }
        if self.fail_next_poll {
            self.fail_next_poll = false;
            self.connected = false;
            inbox.extend(self.pending.drain(..));
            return Err(LinkLost);
        }
        inbox.extend(self.pending.drain(..));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingActuator {
    pub changes: Vec<StateChange>,
}

impl Actuator for RecordingActuator {
    fn apply(&mut self, change: StateChange, _state: &DeviceState) {
        self.changes.push(change);
    }
}

#[derive(Debug, Default)]
pub struct ScriptedCapture {
    pub records: VecDeque<CaptureRecord>,
    pub polls: usize,
}

impl CaptureFeed for ScriptedCapture {
    fn poll_decoded(&mut self, _now_ms: u32) -> Option<CaptureRecord> {
        self.polls += 1;
        self.records.pop_front()
    }
}
