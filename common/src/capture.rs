use core::fmt::Write as _;

pub const PROTOCOL_UNKNOWN: &str = "UNKNOWN";

pub const MIN_RAW_ENTRIES: usize = 6;

const FNV_PRIME_32: u32 = 16_777_619;
const FNV_BASIS_32: u32 = 2_166_136_261;

// One completed infrared decode. `raw` holds alternating mark/space
// durations in microseconds, starting with a mark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub protocol: &'static str,
    pub value: u64,
    pub bits: u16,
    pub raw: Vec<u16>,
    pub overflow: bool,
    pub captured_at_ms: u32,
}

pub trait CaptureFeed {
    fn poll_decoded(&mut self, now_ms: u32) -> Option<CaptureRecord>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

impl CaptureFeed for NoCapture {
    fn poll_decoded(&mut self, _now_ms: u32) -> Option<CaptureRecord> {
        None
    }
}

impl CaptureRecord {
    /// Protocol-agnostic decode: the timing shape is folded into a 32-bit FNV-1 hash,
    /// so the same button press gives the same value across captures.
    pub fn from_raw(raw: Vec<u16>, overflow: bool, captured_at_ms: u32) -> Option<Self> {
        if raw.len() < MIN_RAW_ENTRIES {
            return None;
        }

        let hash = raw
            .windows(3)
            .map(|window| compare_durations(window[0], window[2]))
            .fold(FNV_BASIS_32, |hash, step| {
                hash.wrapping_mul(FNV_PRIME_32) ^ step
            });

        Some(Self {
            protocol: PROTOCOL_UNKNOWN,
            value: u64::from(hash),
            bits: (raw.len() / 2) as u16,
            raw,
            overflow,
            captured_at_ms,
        })
    }

    pub fn summary(&self) -> String {
        format!(
            "Protocol  : {}\nCode      : 0x{:X} ({} Bits)",
            self.protocol, self.value, self.bits
        )
    }

    pub fn to_source_code(&self) -> String {
        let mut out = format!("uint16_t rawData[{}] = {{", self.raw.len());
        for (index, duration) in self.raw.iter().enumerate() {
            if index > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{duration}");
        }
        let _ = write!(out, "}};  // {} {:X}", self.protocol, self.value);
        if self.protocol == PROTOCOL_UNKNOWN {
            let _ = write!(out, "\nuint32_t data = 0x{:X};", self.value);
        }
        out
    }
}

// 0 when `next` is clearly shorter, 2 when clearly longer, 1 otherwise (20% tolerance).
fn compare_durations(current: u16, next: u16) -> u32 {
    let current = u32::from(current);
    let next = u32::from(next);

    if next * 10 < current * 8 {
        0
    } else if current * 10 < next * 8 {
        2
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const NEC_LIKE: [u16; 10] = [9_000, 4_500, 560, 560, 560, 1_690, 560, 560, 560, 1_690];

    #[test]
    fn short_captures_are_noise() {
        assert_eq!(CaptureRecord::from_raw(vec![9_000, 4_500, 560], false, 0), None);
    }

    #[test]
    fn hash_depends_on_shape_not_jitter() {
        let clean = CaptureRecord::from_raw(NEC_LIKE.to_vec(), false, 10).unwrap();
        let jittered: Vec<u16> = NEC_LIKE.iter().map(|d| d + d / 20).collect();
        let jittered = CaptureRecord::from_raw(jittered, false, 20).unwrap();

        assert_eq!(clean.value, jittered.value);
        assert_eq!(clean.bits, 5);
        assert_eq!(clean.protocol, PROTOCOL_UNKNOWN);
    }

    #[test]
    fn different_shapes_hash_differently() {
        let mut other = NEC_LIKE.to_vec();
        other[5] = 560;

        let a = CaptureRecord::from_raw(NEC_LIKE.to_vec(), false, 0).unwrap();
        let b = CaptureRecord::from_raw(other, false, 0).unwrap();

        assert_ne!(a.value, b.value);
    }

    #[test]
    fn compare_uses_twenty_percent_band() {
        assert_eq!(compare_durations(1_000, 1_100), 1);
        assert_eq!(compare_durations(1_000, 900), 1);
        assert_eq!(compare_durations(1_000, 700), 0);
        assert_eq!(compare_durations(1_000, 1_300), 2);
    }

    #[test]
    fn source_code_lists_timings() {
        let record = CaptureRecord {
            protocol: PROTOCOL_UNKNOWN,
            value: 0xBEEF,
            bits: 3,
            raw: vec![100, 200, 300],
            overflow: false,
            captured_at_ms: 0,
        };

        assert_eq!(
            record.to_source_code(),
            "uint16_t rawData[3] = {100, 200, 300};  // UNKNOWN BEEF\nuint32_t data = 0xBEEF;"
        );
        assert_eq!(record.summary(), "Protocol  : UNKNOWN\nCode      : 0xBEEF (3 Bits)");
    }
}
