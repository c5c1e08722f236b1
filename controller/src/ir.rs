use anyhow::Context;
use esp_idf_hal::{
    gpio::InputPin,
    peripheral::Peripheral,
    rmt::{config::ReceiveConfig, Pulse, Receive, RmtChannel, RxRmtDriver},
};
use log::warn;

use fan_common::{CaptureFeed, CaptureRecord, IrCaptureConfig};

// 80 MHz APB clock / 80 gives one tick per microsecond.
const IR_TICK_DIVIDER: u8 = 80;
// Pulses shorter than this many ticks are glitches.
const IR_FILTER_TICKS: u8 = 100;
const RMT_RING_BUFFER_BYTES: usize = 1_000;

enum IrBackend {
    Rmt(RxRmtDriver<'static>),
    Disabled,
}

pub struct IrReceiver {
    backend: IrBackend,
    pulses: Vec<(Pulse, Pulse)>,
    max_entries: usize,
    receive_errors: u32,
}

impl IrReceiver {
    pub fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
        config: &IrCaptureConfig,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: InputPin,
    {
        let idle_ticks = u16::from(config.idle_timeout_ms).saturating_mul(1_000);
        let rx_config = ReceiveConfig::new()
            .clock_divider(IR_TICK_DIVIDER)
            .idle_threshold(idle_ticks)
            .filter_ticks_thresh(IR_FILTER_TICKS);

        let rx = RxRmtDriver::new(channel, pin, &rx_config, RMT_RING_BUFFER_BYTES)
            .context("failed to init RMT IR receiver")?;
        rx.start().context("failed to start RMT IR receiver")?;

        Ok(Self {
            backend: IrBackend::Rmt(rx),
            pulses: vec![(Pulse::zero(), Pulse::zero()); config.buffer_entries.div_ceil(2)],
            max_entries: config.buffer_entries,
            receive_errors: 0,
        })
    }

    pub fn disabled() -> Self {
        Self {
            backend: IrBackend::Disabled,
            pulses: Vec::new(),
            max_entries: 0,
            receive_errors: 0,
        }
    }

    fn read_raw(&mut self) -> Option<(Vec<u16>, bool)> {
        let IrBackend::Rmt(rx) = &mut self.backend else {
            return None;
        };

        let (count, mut overflow) = match rx.receive(&mut self.pulses, 0) {
            Ok(Receive::Read(count)) => (count, false),
            Ok(Receive::Overflow(count)) => (count, true),
            Ok(Receive::Timeout) => return None,
            Err(err) => {
                self.receive_errors = self.receive_errors.saturating_add(1);
                warn!("RMT receive failed ({} so far): {err}", self.receive_errors);
                return None;
            }
        };

        let mut raw = Vec::with_capacity(count * 2);
        // A zero-length pulse terminates the frame.
        'frame: for (first, second) in self.pulses.iter().take(count) {
            for pulse in [first, second] {
                let ticks = pulse.ticks.ticks();
                if ticks == 0 {
                    break 'frame;
                }
                raw.push(ticks);
            }
        }

        if raw.len() > self.max_entries {
            raw.truncate(self.max_entries);
            overflow = true;
        }

        Some((raw, overflow))
    }
}

impl CaptureFeed for IrReceiver {
    fn poll_decoded(&mut self, now_ms: u32) -> Option<CaptureRecord> {
        let (raw, overflow) = self.read_raw()?;
        CaptureRecord::from_raw(raw, overflow, now_ms)
    }
}
