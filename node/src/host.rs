use anyhow::Context;
use chrono::Timelike;
use tracing::{info, warn};

use roombridge_common::{
    Actuator, Bridge, BridgeConfig, BridgeExit, CertFingerprint, ClockSync, Collaborators,
    DeviceIdentity, FirmwareUpdater, LinkInfo, NetworkLink, Platform, SensorBus, SensorAddress,
    StatusIndicator, UpdateOutcome, UpdateRequest, SENSOR_NOT_READY_C,
};

use crate::session::SecureBrokerSession;

/// Loopback "radio": the host process is already on the network.
struct HostLink;

impl NetworkLink for HostLink {
    fn begin_join(&mut self) {
        info!("host link: no radio to join");
    }

    fn poll_connected(&mut self) -> bool {
        true
    }

    fn link_info(&self) -> Option<LinkInfo> {
        Some(LinkInfo {
            ssid: "host".to_string(),
            signal_dbm: 0,
            address: "127.0.0.1".to_string(),
        })
    }
}

/// The host clock is already synced; local hour comes straight from chrono.
struct HostClock;

impl ClockSync for HostClock {
    fn begin_sync(&mut self) {}

    fn poll_synced(&mut self) -> bool {
        true
    }

    fn local_hour(&self) -> u32 {
        chrono::Local::now().hour()
    }
}

/// Simulated temperature wave, with a periodic not-ready sample so the
/// skip path gets exercised end to end.
struct SimulatedSensors {
    tick: u64,
}

impl SensorBus for SimulatedSensors {
    fn scan(&mut self) -> Vec<SensorAddress> {
        vec![SensorAddress(0x28_0000_0000_0001)]
    }

    fn sample(&mut self) -> f32 {
        self.tick = self.tick.saturating_add(1);
        if self.tick % 16 == 0 {
            return SENSOR_NOT_READY_C;
        }
        21.0 + ((self.tick % 8) as f32 * 0.25)
    }
}

struct LoggingActuator;

impl Actuator for LoggingActuator {
    fn set_channels(&mut self, red: u16, green: u16, blue: u16) {
        info!(red, green, blue, "actuator channels set");
    }
}

struct LoggingIndicator;

impl StatusIndicator for LoggingIndicator {
    fn set_wifi(&mut self, on: bool) {
        info!(on, "wifi indicator");
    }

    fn set_broker(&mut self, on: bool) {
        info!(on, "broker indicator");
    }

    fn set_idle(&mut self, daytime: bool) {
        info!(daytime, "idle indicator refreshed");
    }
}

struct NoopUpdater;

impl FirmwareUpdater for NoopUpdater {
    fn check_and_flash(&mut self, request: &UpdateRequest) -> UpdateOutcome {
        info!(
            host = %request.host,
            port = request.port,
            path = %request.artifact_path,
            "firmware update check skipped on host"
        );
        UpdateOutcome::NoUpdate
    }
}

struct ThreadPlatform;

impl Platform for ThreadPlatform {
    fn sleep_ms(&mut self, ms: u64) {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}

fn config_from_env() -> anyhow::Result<BridgeConfig> {
    let mut config = BridgeConfig::default();

    if let Ok(ident) = std::env::var("NODE_IDENT") {
        config.identity = DeviceIdentity::new(ident).context("invalid NODE_IDENT")?;
    }
    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.broker.host = host;
    }
    if let Ok(port) = std::env::var("MQTT_PORT") {
        config.broker.port = port.parse().context("invalid MQTT_PORT")?;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        config.broker.username = user;
        config.broker.password = std::env::var("MQTT_PASS").unwrap_or_default();
    }

    let fingerprint = std::env::var("MQTT_FINGERPRINT")
        .context("MQTT_FINGERPRINT must hold the broker certificate SHA-256")?;
    config.broker.fingerprint =
        CertFingerprint::parse(&fingerprint).context("invalid MQTT_FINGERPRINT")?;

    Ok(config)
}

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config_from_env()?;
    info!(ident = %config.identity, broker = %config.broker.host, "bridge starting on host");

    let mut session = SecureBrokerSession::new(
        config.identity.as_str(),
        config.broker.clone(),
        &config.retry,
    );

    let mut link = HostLink;
    let mut clock = HostClock;
    let mut sensors = SimulatedSensors { tick: 0 };
    let mut actuator = LoggingActuator;
    let mut indicator = LoggingIndicator;
    let mut updater = NoopUpdater;
    let mut platform = ThreadPlatform;

    let mut bridge = Bridge::new(config);
    let exit = bridge.run(&mut Collaborators {
        link: &mut link,
        clock: &mut clock,
        session: &mut session,
        sensors: &mut sensors,
        actuator: &mut actuator,
        indicator: &mut indicator,
        updater: &mut updater,
        platform: &mut platform,
    })?;

    match exit {
        BridgeExit::Restart => {
            warn!("retry budget exhausted; exiting so the supervisor can restart us");
            std::process::exit(1);
        }
    }
}
