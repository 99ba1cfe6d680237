pub mod bridge;
pub mod command;
pub mod config;
pub mod ports;
pub mod supervisor;
pub mod telemetry;
pub mod types;

pub use bridge::{is_daytime_hour, Bridge, BridgeError, BridgeExit, Collaborators};
pub use command::{ChannelLevels, CHANNEL_SCALE};
pub use config::{
    BridgeConfig, BrokerConfig, CertFingerprint, ConfigError, DeviceIdentity, NetworkConfig,
    PinConfig, RetryConfig,
};
pub use ports::{
    Actuator, BrokerSession, ClockSync, FirmwareUpdater, NetworkLink, Platform, SensorBus,
    SessionError, StatusIndicator,
};
pub use supervisor::{ConnectivitySupervisor, Effect, Event, Phase, RetryBudget};
pub use telemetry::{PublishOutcome, TelemetryPublisher};
pub use types::{
    InboundMessage, LinkInfo, LivenessReport, SensorAddress, TelemetryReading, UpdateOutcome,
    UpdateRequest, MAX_SENSOR_ADDRESSES, NOT_READY_THRESHOLD_C, SENSOR_NOT_READY_C,
};
