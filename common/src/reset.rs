use core::fmt;

// Numbering follows ESP-IDF's `esp_reset_reason_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    Unknown,
    PowerOn,
    External,
    Software,
    Panic,
    InterruptWatchdog,
    TaskWatchdog,
    OtherWatchdog,
    DeepSleep,
    Brownout,
    Sdio,
}

impl ResetReason {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::PowerOn,
            2 => Self::External,
            3 => Self::Software,
            4 => Self::Panic,
            5 => Self::InterruptWatchdog,
            6 => Self::TaskWatchdog,
            7 => Self::OtherWatchdog,
            8 => Self::DeepSleep,
            9 => Self::Brownout,
            10 => Self::Sdio,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::PowerOn => "power-on",
            Self::External => "external pin",
            Self::Software => "software restart",
            Self::Panic => "panic",
            Self::InterruptWatchdog => "interrupt watchdog",
            Self::TaskWatchdog => "task watchdog",
            Self::OtherWatchdog => "watchdog",
            Self::DeepSleep => "deep sleep wake",
            Self::Brownout => "brownout",
            Self::Sdio => "sdio",
        }
    }

    pub fn is_fault(self) -> bool {
        matches!(
            self,
            Self::Panic
                | Self::InterruptWatchdog
                | Self::TaskWatchdog
                | Self::OtherWatchdog
                | Self::Brownout
        )
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn watchdog_resets_are_faults() {
        assert_eq!(ResetReason::from_code(6), ResetReason::TaskWatchdog);
        assert!(ResetReason::from_code(5).is_fault());
        assert!(ResetReason::from_code(6).is_fault());
        assert!(ResetReason::from_code(7).is_fault());
        assert!(!ResetReason::from_code(1).is_fault());
        assert!(!ResetReason::from_code(3).is_fault());
    }

    #[test]
    fn unlisted_codes_are_unknown() {
        assert_eq!(ResetReason::from_code(0), ResetReason::Unknown);
        assert_eq!(ResetReason::from_code(14), ResetReason::Unknown);
        assert_eq!(ResetReason::from_code(4).to_string(), "panic");
    }
}
