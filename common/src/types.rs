use serde::Serialize;

use crate::config::DeviceIdentity;

/// Value the sensor bus reports while a temperature conversion is still in
/// flight. Anything at or below [`NOT_READY_THRESHOLD_C`] is treated as this
/// sentinel and never published.
pub const SENSOR_NOT_READY_C: f32 = -127.0;

/// Plausibility floor for real readings; the sentinel sits well below it.
pub const NOT_READY_THRESHOLD_C: f32 = -100.0;

/// Upper bound on the 1-Wire address enumeration at startup.
pub const MAX_SENSOR_ADDRESSES: usize = 20;

/// One 64-bit 1-Wire ROM address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorAddress(pub u64);

impl std::fmt::Display for SensorAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// One validated telemetry sample, ready for the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryReading {
    pub ident: String,
    pub temperature: f32,
}

impl TelemetryReading {
    /// Returns `None` for the not-ready sentinel; readings are only ever
    /// constructed from samples that passed the plausibility check.
    pub fn from_sample(identity: &DeviceIdentity, sample_c: f32) -> Option<Self> {
        if sample_c <= NOT_READY_THRESHOLD_C {
            return None;
        }
        Some(Self {
            ident: identity.as_str().to_string(),
            temperature: sample_c,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub host: String,
    pub port: u16,
    pub artifact_path: String,
    pub current_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// New image flashed; on real hardware the device reboots and this
    /// outcome is never observed by the caller.
    Updated,
    NoUpdate,
    Failed,
}

/// Association details reported by the network link once joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub ssid: String,
    pub signal_dbm: i32,
    pub address: String,
}

/// One message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Result of a session liveness check: a protocol ping plus an independent
/// re-verification of the pinned certificate. Both must pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessReport {
    pub ping_ok: bool,
    pub fingerprint_ok: bool,
}

impl LivenessReport {
    pub fn is_alive(&self) -> bool {
        self.ping_ok && self.fingerprint_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ident() -> DeviceIdentity {
        DeviceIdentity::new("X").unwrap()
    }

    #[test]
    fn reading_keeps_plausible_samples() {
        let reading = TelemetryReading::from_sample(&ident(), 21.5).unwrap();
        assert_eq!(reading.ident, "X");
        assert_eq!(reading.temperature, 21.5);
    }

    #[test]
    fn reading_rejects_sentinel_and_threshold() {
        assert_eq!(TelemetryReading::from_sample(&ident(), SENSOR_NOT_READY_C), None);
        assert_eq!(TelemetryReading::from_sample(&ident(), -100.0), None);
        assert!(TelemetryReading::from_sample(&ident(), -99.9).is_some());
    }

    #[test]
    fn liveness_requires_both_checks() {
        for (ping_ok, fingerprint_ok) in [(true, true), (true, false), (false, true), (false, false)] {
            let report = LivenessReport {
                ping_ok,
                fingerprint_ok,
            };
            assert_eq!(report.is_alive(), ping_ok && fingerprint_ok);
        }
    }
}
