use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("device identity must be non-empty and alphanumeric (underscore allowed): `{0}`")]
    InvalidIdentity(String),
    #[error("certificate fingerprint must be 32 hex bytes: `{0}`")]
    InvalidFingerprint(String),
}

/// Immutable node identity. Alphanumeric (plus underscore) because it is
/// embedded in telemetry payloads and doubles as the update artifact name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(ident: impl Into<String>) -> Result<Self, ConfigError> {
        let ident = ident.into();
        let valid = !ident.is_empty()
            && ident
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(Self(ident))
        } else {
            Err(ConfigError::InvalidIdentity(ident))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the firmware image this node looks for on the update server.
    pub fn artifact_path(&self) -> String {
        format!("/{}.bin", self.0)
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 digest of the broker's leaf certificate in DER form. The session
/// trusts exactly this certificate; rotation requires a firmware update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertFingerprint([u8; 32]);

impl CertFingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses `DE:A8:B3:...` or bare hex, case-insensitive.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let hex: String = text.chars().filter(|c| *c != ':').collect();
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::InvalidFingerprint(text.to_string()));
        }

        let mut bytes = [0_u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
                .map_err(|_| ConfigError::InvalidFingerprint(text.to_string()))?;
        }
        Ok(Self(bytes))
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn matches(&self, digest: &[u8]) -> bool {
        digest == self.0
    }
}

impl std::fmt::Display for CertFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: "CHANGE_ME".to_string(),
            wifi_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub fingerprint: CertFingerprint,
    pub telemetry_topic: String,
    pub command_topic: String,
    pub keep_alive_secs: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 8883,
            username: String::new(),
            password: String::new(),
            fingerprint: CertFingerprint::from_bytes([0; 32]),
            telemetry_topic: "room01/bed/temp".to_string(),
            command_topic: "room01/bed/light".to_string(),
            keep_alive_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinConfig {
    pub one_wire: i32,
    pub red: i32,
    pub green: i32,
    pub blue: i32,
    pub status: i32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            one_wire: 14,
            red: 12,
            green: 13,
            blue: 15,
            status: 2,
        }
    }
}

/// Retry/timeout ceilings. Every wait in the bridge is bounded by one of
/// these; exhausting an attempt budget escalates to a device restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub wifi_poll_attempts: u32,
    pub wifi_poll_ms: u64,
    pub sync_poll_attempts: u32,
    pub sync_poll_ms: u64,
    pub broker_connect_attempts: u32,
    pub broker_retry_ms: u64,
    pub connect_timeout_ms: u64,
    pub liveness_window_ms: u64,
    pub command_drain_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            wifi_poll_attempts: 100,
            wifi_poll_ms: 100,
            sync_poll_attempts: 50,
            sync_poll_ms: 1_000,
            broker_connect_attempts: 100,
            broker_retry_ms: 500,
            connect_timeout_ms: 10_000,
            liveness_window_ms: 1_000,
            command_drain_ms: 2_000,
        }
    }
}

/// The whole configuration surface. Built once at startup and passed by
/// reference; nothing in the bridge mutates it or reloads it at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub identity: DeviceIdentity,
    pub firmware_version: String,
    pub network: NetworkConfig,
    pub broker: BrokerConfig,
    pub pins: PinConfig,
    pub retry: RetryConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            identity: DeviceIdentity("ROOMBRIDGE01".to_string()),
            firmware_version: "0.1".to_string(),
            network: NetworkConfig::default(),
            broker: BrokerConfig::default(),
            pins: PinConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn identity_accepts_alphanumeric_and_underscore() {
        let ident = DeviceIdentity::new("NODE_7_bed").unwrap();
        assert_eq!(ident.as_str(), "NODE_7_bed");
        assert_eq!(ident.artifact_path(), "/NODE_7_bed.bin");
    }

    #[test]
    fn identity_rejects_empty_and_punctuation() {
        assert!(DeviceIdentity::new("").is_err());
        assert!(DeviceIdentity::new("bed lights").is_err());
        assert!(DeviceIdentity::new("node/7").is_err());
    }

    #[test]
    fn fingerprint_parses_colon_separated_hex() {
        let text = "DE:A8:B3:D1:B5:F1:F7:34:F4:84:C7:E4:6C:4E:C5:AC:\
                    E9:F9:8D:0A:DE:A8:B3:D1:B5:F1:F7:34:F4:84:C7:E4";
        let fp = CertFingerprint::parse(text).unwrap();
        assert_eq!(fp.bytes()[0], 0xDE);
        assert_eq!(fp.bytes()[31], 0xE4);
    }

    #[test]
    fn fingerprint_parses_bare_lowercase_hex() {
        let fp = CertFingerprint::parse(&"ab".repeat(32)).unwrap();
        assert!(fp.matches(&[0xAB_u8; 32]));
    }

    #[test]
    fn fingerprint_rejects_wrong_length_and_garbage() {
        assert!(CertFingerprint::parse("DE:A8").is_err());
        assert!(CertFingerprint::parse(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn fingerprint_round_trips_through_display() {
        let fp = CertFingerprint::from_bytes([0x0A; 32]);
        let shown = fp.to_string();
        assert!(shown.starts_with("0A:0A:"));
        assert_eq!(CertFingerprint::parse(&shown).unwrap(), fp);
    }
}
