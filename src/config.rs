// Device-negotiated configuration and the handshake response grammar.

use tracing::{debug, warn};

/// Version string the host sends during the handshake.
pub const HOST_VERSION: &str = "v0.3.0";

/// Scalars negotiated with the device. Defaults reflect the device
/// firmware's shipping values and hold until a handshake response
/// overrides them.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// Firmware version reported by the device.
    pub version: String,
    /// Main acquisition loop period.
    pub loop_ms: u32,
    /// Duration of each device state.
    pub state_duration_us: u32,
    /// Delay between a head change and the first A2D read.
    pub head_settle_us: u32,
    pub sample_rate_hz: u32,
    /// A2D reading speed in triggered mode.
    pub read_rate_hz: u32,
    /// Maximum items per sample block.
    pub max_block: u32,
    pub trim_offset: i32,
    pub channel_scale: f64,
    pub triggered: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            version: String::new(),
            loop_ms: 20,
            state_duration_us: 3_050,
            head_settle_us: 440,
            sample_rate_hz: 2_000,
            read_rate_hz: 900,
            max_block: 164,
            trim_offset: 0,
            channel_scale: 1.0 / 466_010_000.0,
            triggered: false,
        }
    }
}

impl LinkConfig {
    /// Applies a `<KEY=VALUE:KEY=VALUE...` handshake response line.
    /// Unknown keys are ignored; malformed values are logged and skipped.
    pub fn apply_response(&mut self, line: &str) {
        let line = line.trim_start_matches('<').trim_end();
        for part in line.split(':') {
            let Some((key, value)) = part.split_once('=') else {
                if !part.is_empty() {
                    debug!(part, "skipping malformed configuration pair");
                }
                continue;
            };
            self.apply_field(key.trim(), value.trim());
        }
    }

    fn apply_field(&mut self, key: &str, value: &str) {
        match key {
            "VERSION" => self.version = value.to_string(),
            "LOOP_MS" => set_u32(&mut self.loop_ms, key, value),
            "STATE_DURATION_US" => set_u32(&mut self.state_duration_us, key, value),
            "HEAD_SETTLE_US" => set_u32(&mut self.head_settle_us, key, value),
            "SAMPLE_RATE_HZ" => set_u32(&mut self.sample_rate_hz, key, value),
            "READ_RATE_HZ" => set_u32(&mut self.read_rate_hz, key, value),
            "MAX_BLOCK" => set_u32(&mut self.max_block, key, value),
            "TRIM_OFFSET" => set_i32(&mut self.trim_offset, key, value),
            "CHANNEL_SCALE" => set_f64(&mut self.channel_scale, key, value),
            "TRIGGERED" => set_bool(&mut self.triggered, key, value),
            _ => debug!(key, "ignoring unknown configuration key"),
        }
    }
}

fn set_u32(slot: &mut u32, key: &str, value: &str) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(e) => warn!(key, value, %e, "bad configuration value"),
    }
}

fn set_i32(slot: &mut i32, key: &str, value: &str) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(e) => warn!(key, value, %e, "bad configuration value"),
    }
}

fn set_f64(slot: &mut f64, key: &str, value: &str) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(e) => warn!(key, value, %e, "bad configuration value"),
    }
}

fn set_bool(slot: &mut bool, key: &str, value: &str) {
    match value {
        "1" => *slot = true,
        "0" => *slot = false,
        _ => match value.parse() {
            Ok(parsed) => *slot = parsed,
            Err(e) => warn!(key, value, %e, "bad configuration value"),
        },
    }
}
