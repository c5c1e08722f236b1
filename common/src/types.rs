use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusPayload {
    pub speed: u8,
    pub oscillate: bool,
    #[serde(rename = "timerMinutes")]
    pub timer_minutes: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectedPayload {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub reconnects: u32,
}
