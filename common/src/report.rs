use crate::{
    controller::{StatusOutcome, TickReport},
    router::Routed,
    session::SessionEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
}

impl LogLine {
    fn new(level: LogLevel, message: String) -> Self {
        Self { level, message }
    }
}

impl TickReport {
    // Each binary maps the levels onto its own logger.
    pub fn log_lines(&self) -> Vec<LogLine> {
        let mut lines = Vec::new();

        match &self.session_event {
            Some(SessionEvent::Connected {
                client_id,
                subscribed,
                reconnects,
            }) => lines.push(LogLine::new(
                LogLevel::Info,
                format!(
                    "mqtt connected as `{client_id}`, subscribed to {subscribed} topics \
                     (reconnects: {reconnects})"
                ),
            )),
            Some(SessionEvent::ConnectFailed {
                client_id,
                cause,
                retry_in_ms,
            }) => lines.push(LogLine::new(
                LogLevel::Warn,
                format!(
                    "mqtt connect as `{client_id}` failed: {} ({}), retrying in {retry_in_ms} ms",
                    cause.as_str(),
                    cause.code()
                ),
            )),
            Some(SessionEvent::LinkLost) => {
                lines.push(LogLine::new(LogLevel::Warn, "mqtt link lost".to_string()))
            }
            None => {}
        }

        if self.dropped > 0 {
            lines.push(LogLine::new(
                LogLevel::Warn,
                format!("discarded {} message(s) read as the link went down", self.dropped),
            ));
        }

        for message in &self.routed {
            let line = match &message.result {
                Ok(Routed::Applied { command, change }) => LogLine::new(
                    LogLevel::Info,
                    format!("{command:?} on `{}` applied: {change:?}", message.topic),
                ),
                Ok(Routed::UnknownTopic) => LogLine::new(
                    LogLevel::Debug,
                    format!("ignoring message on `{}`", message.topic),
                ),
                Err(err) => LogLine::new(
                    LogLevel::Debug,
                    format!(
                        "dropped {} byte message on `{}`: {err}",
                        message.payload_len, message.topic
                    ),
                ),
            };
            lines.push(line);
        }

        if let Some(StatusOutcome::Failed(reason, err)) = &self.status {
            lines.push(LogLine::new(
                LogLevel::Warn,
                format!("status publish ({reason:?}) failed: {err}"),
            ));
        }

        if let Some(capture) = &self.capture {
            lines.push(LogLine::new(LogLevel::Info, capture.summary()));
            lines.push(LogLine::new(LogLevel::Info, capture.to_source_code()));
            if capture.overflow {
                lines.push(LogLine::new(
                    LogLevel::Warn,
                    "ir capture buffer full; raw timings truncated".to_string(),
                ));
            }
        }

        lines
    }
}
