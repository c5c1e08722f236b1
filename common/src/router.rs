use serde_json::Value;
use thiserror::Error;

use crate::{
    device::{Actuator, DeviceState, StateChange, StateError},
    topics::{Command, HandlerKind, TopicSpec},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),
    #[error(transparent)]
    OutOfRange(#[from] StateError),
    #[error("payload of {len} bytes exceeds {max}")]
    Oversize { len: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Applied {
        command: Command,
        change: StateChange,
    },
    UnknownTopic,
}

// Integer payloads arrive either as a bare decimal or as `{"value": n}`.
#[derive(Debug, Clone, PartialEq)]
pub enum ValuePayload {
    Plain(i64),
    Json(Value),
}

impl ValuePayload {
    pub fn parse(payload: &[u8]) -> Result<Self, RouteError> {
        match payload.first() {
            Some(first) if first.is_ascii_digit() => parse_plain(payload).map(Self::Plain),
            Some(_) => serde_json::from_slice(payload)
                .map(Self::Json)
                .map_err(|_| RouteError::MalformedPayload("invalid json")),
            None => Err(RouteError::MalformedPayload("empty payload")),
        }
    }

    pub fn value(&self) -> Result<i64, RouteError> {
        match self {
            Self::Plain(value) => Ok(*value),
            Self::Json(doc) => doc
                .as_object()
                .ok_or(RouteError::MalformedPayload("expected json object"))?
                .get("value")
                .ok_or(RouteError::MalformedPayload("missing value"))?
                .as_i64()
                .ok_or(RouteError::MalformedPayload("value is not an integer")),
        }
    }
}

fn parse_plain(payload: &[u8]) -> Result<i64, RouteError> {
    let text = core::str::from_utf8(payload)
        .map_err(|_| RouteError::MalformedPayload("non utf8 payload"))?
        .trim_end_matches(|c: char| c.is_ascii_whitespace());

    if !text.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(RouteError::MalformedPayload("not a decimal integer"));
    }

    text.parse::<i64>()
        .map_err(|_| RouteError::MalformedPayload("integer overflow"))
}

pub fn parse_boolean_state(payload: &[u8]) -> Result<bool, RouteError> {
    let doc: Value = serde_json::from_slice(payload)
        .map_err(|_| RouteError::MalformedPayload("invalid json"))?;

    let state = doc
        .as_object()
        .ok_or(RouteError::MalformedPayload("expected json object"))?
        .get("state")
        .ok_or(RouteError::MalformedPayload("missing state"))?;

    match state {
        Value::Bool(enabled) => Ok(*enabled),
        Value::String(text) => Ok(text == "true"),
        _ => Err(RouteError::MalformedPayload("state is not a bool or string")),
    }
}

#[derive(Debug, Clone)]
pub struct CommandRouter {
    spec: TopicSpec,
    max_payload_bytes: usize,
}

impl CommandRouter {
    pub fn new(spec: TopicSpec, max_payload_bytes: usize) -> Self {
        Self {
            spec,
            max_payload_bytes,
        }
    }

    pub fn route(
        &self,
        topic: &str,
        payload: &[u8],
        state: &mut DeviceState,
        actuator: &mut dyn Actuator,
    ) -> Result<Routed, RouteError> {
        if payload.len() > self.max_payload_bytes {
            return Err(RouteError::Oversize {
                len: payload.len(),
                max: self.max_payload_bytes,
            });
        }

        let Some(route) = self.spec.lookup(topic) else {
            return Ok(Routed::UnknownTopic);
        };

        let change = match route.kind {
            HandlerKind::BooleanState => {
                let enabled = parse_boolean_state(payload)?;
                apply_boolean(route.command, enabled, state, actuator)?
            }
            HandlerKind::IntegerValue => {
                let value = ValuePayload::parse(payload)?.value()?;
                apply_integer(route.command, value, state, actuator)?
            }
        };

        Ok(Routed::Applied {
            command: route.command,
            change,
        })
    }
}

fn apply_boolean(
    command: Command,
    enabled: bool,
    state: &mut DeviceState,
    actuator: &mut dyn Actuator,
) -> Result<StateChange, RouteError> {
    match command {
        Command::Oscillate => {
            state.apply_oscillate(enabled, actuator);
            Ok(StateChange::Oscillate(enabled))
        }
        Command::Speed | Command::Timer => {
            Err(RouteError::MalformedPayload("boolean payload for integer command"))
        }
    }
}

fn apply_integer(
    command: Command,
    value: i64,
    state: &mut DeviceState,
    actuator: &mut dyn Actuator,
) -> Result<StateChange, RouteError> {
    match command {
        Command::Speed => {
            state.apply_speed(value, actuator)?;
            Ok(StateChange::Speed(state.speed()))
        }
        Command::Timer => {
            state.apply_timer(value, actuator)?;
            Ok(StateChange::Timer(state.timer_minutes()))
        }
        Command::Oscillate => {
            Err(RouteError::MalformedPayload("integer payload for boolean command"))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        mock::RecordingActuator,
        topics::{TOPIC_CMD_OSCILLATE, TOPIC_CMD_SPEED, TOPIC_CMD_TIMER},
    };

    fn router() -> CommandRouter {
        CommandRouter::new(TopicSpec::fan(), 512)
    }

    fn route(state: &mut DeviceState, topic: &str, payload: &str) -> Result<Routed, RouteError> {
        let mut actuator = RecordingActuator::default();
        router().route(topic, payload.as_bytes(), state, &mut actuator)
    }

    #[test]
    fn boolean_payloads() {
        let cases = [
            (r#"{"state": true}"#, true),
            (r#"{"state": "true"}"#, true),
            (r#"{"state": "false"}"#, false),
            (r#"{"state": "yes"}"#, false),
            (r#"{"state": "TRUE"}"#, false),
            (r#"{"state": false}"#, false),
        ];

        for (payload, expected) in cases {
            let mut state = DeviceState::new();
            state.apply_oscillate(!expected, &mut RecordingActuator::default());

            route(&mut state, TOPIC_CMD_OSCILLATE, payload).unwrap();
            assert_eq!(state.oscillate(), expected, "payload {payload}");
        }
    }

    #[test]
    fn boolean_without_state_is_dropped() {
        for payload in ["{}", "not json", "[true]", r#"{"state": 1}"#, r#"{"state": null}"#, ""] {
            let mut state = DeviceState::new();
            state.apply_oscillate(true, &mut RecordingActuator::default());

            let result = route(&mut state, TOPIC_CMD_OSCILLATE, payload);

            assert!(
                matches!(result, Err(RouteError::MalformedPayload(_))),
                "payload {payload:?} gave {result:?}"
            );
            assert!(state.oscillate());
        }
    }

    #[test]
    fn integer_plain_and_json() {
        let mut state = DeviceState::new();

        assert_eq!(
            route(&mut state, TOPIC_CMD_TIMER, "42"),
            Ok(Routed::Applied {
                command: Command::Timer,
                change: StateChange::Timer(42),
            })
        );
        assert_eq!(state.timer_minutes(), 42);

        route(&mut state, TOPIC_CMD_TIMER, r#"{"value": 7}"#).unwrap();
        assert_eq!(state.timer_minutes(), 7);

        route(&mut state, TOPIC_CMD_SPEED, "3\r\n").unwrap();
        assert_eq!(state.speed(), 3);
    }

    #[test]
    fn integer_garbage_is_dropped() {
        let mut state = DeviceState::new();
        route(&mut state, TOPIC_CMD_SPEED, "2").unwrap();

        let payloads = [
            "abc",
            "4x",
            "2.5",
            r#"{"value": "2"}"#,
            r#"{"value": 1.5}"#,
            r#"{"speed": 1}"#,
            "-1",
            "",
        ];
        for payload in payloads {
            let result = route(&mut state, TOPIC_CMD_SPEED, payload);
            assert!(
                matches!(result, Err(RouteError::MalformedPayload(_))),
                "payload {payload:?} gave {result:?}"
            );
            assert_eq!(state.speed(), 2);
        }
    }

    #[test]
    fn out_of_range_is_not_clamped() {
        let mut state = DeviceState::new();
        route(&mut state, TOPIC_CMD_SPEED, "1").unwrap();

        let result = route(&mut state, TOPIC_CMD_SPEED, "4");
        assert!(matches!(result, Err(RouteError::OutOfRange(_))));

        let result = route(&mut state, TOPIC_CMD_SPEED, r#"{"value": -3}"#);
        assert!(matches!(result, Err(RouteError::OutOfRange(_))));

        assert_eq!(state.speed(), 1);
    }

    #[test]
    fn unknown_topic_is_a_noop() {
        let mut state = DeviceState::new();
        let before = state;

        assert_eq!(
            route(&mut state, "fan/cmnd/light", r#"{"state": true}"#),
            Ok(Routed::UnknownTopic)
        );
        assert_eq!(route(&mut state, "fan/cmnd/speed/extra", "2"), Ok(Routed::UnknownTopic));
        assert_eq!(state, before);
    }

    #[test]
    fn oversize_rejected_before_parsing() {
        let router = CommandRouter::new(TopicSpec::fan(), 8);
        let mut state = DeviceState::new();
        let mut actuator = RecordingActuator::default();

        let result = router.route(TOPIC_CMD_SPEED, b"000000001", &mut state, &mut actuator);

        assert_eq!(result, Err(RouteError::Oversize { len: 9, max: 8 }));
        assert!(actuator.changes.is_empty());

        // Oversize applies to unknown topics as well.
        let result = router.route("other/topic", &[b'x'; 9], &mut state, &mut actuator);
        assert!(matches!(result, Err(RouteError::Oversize { .. })));
    }

    #[test]
    fn routing_is_order_independent() {
        let commands = [
            (TOPIC_CMD_SPEED, "2"),
            (TOPIC_CMD_OSCILLATE, r#"{"state": "true"}"#),
            (TOPIC_CMD_TIMER, r#"{"value": 90}"#),
        ];

        let mut forward = DeviceState::new();
        for (topic, payload) in commands {
            route(&mut forward, topic, payload).unwrap();
        }

        let mut reverse = DeviceState::new();
        for (topic, payload) in commands.iter().rev() {
            route(&mut reverse, topic, payload).unwrap();
        }

        assert_eq!(forward, reverse);
        assert_eq!(forward.speed(), 2);
        assert!(forward.oscillate());
        assert_eq!(forward.timer_minutes(), 90);
    }

    #[test]
    fn value_payload_tag_follows_first_byte() {
        assert_eq!(ValuePayload::parse(b"17").unwrap(), ValuePayload::Plain(17));
        assert!(matches!(
            ValuePayload::parse(br#" {"value": 17}"#).unwrap(),
            ValuePayload::Json(_)
        ));
    }
}
