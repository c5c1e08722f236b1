pub const TOPIC_CMD_OSCILLATE: &str = "fan/cmnd/oscillate";
pub const TOPIC_CMD_SPEED: &str = "fan/cmnd/speed";
pub const TOPIC_CMD_TIMER: &str = "fan/cmnd/timer";

pub const TOPIC_STATE_STATUS: &str = "hottub/state/status";
pub const TOPIC_STATE_CONNECTED: &str = "fan/state/connected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    BooleanState,
    IntegerValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Oscillate,
    Speed,
    Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicRoute {
    pub topic: &'static str,
    pub kind: HandlerKind,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    routes: Vec<TopicRoute>,
}

impl TopicSpec {
    pub fn new(routes: Vec<TopicRoute>) -> Self {
        Self { routes }
    }

    pub fn fan() -> Self {
        Self::new(vec![
            TopicRoute {
                topic: TOPIC_CMD_OSCILLATE,
                kind: HandlerKind::BooleanState,
                command: Command::Oscillate,
            },
            TopicRoute {
                topic: TOPIC_CMD_SPEED,
                kind: HandlerKind::IntegerValue,
                command: Command::Speed,
            },
            TopicRoute {
                topic: TOPIC_CMD_TIMER,
                kind: HandlerKind::IntegerValue,
                command: Command::Timer,
            },
        ])
    }

    pub fn lookup(&self, topic: &str) -> Option<&TopicRoute> {
        self.routes.iter().find(|route| route.topic == topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.iter().map(|route| route.topic)
    }
}

impl Default for TopicSpec {
    fn default() -> Self {
        Self::fan()
    }
}
