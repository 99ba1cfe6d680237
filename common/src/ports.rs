//! Collaborator seams. The bridge core drives hardware and network I/O only
//! through these traits; the node binary supplies the real implementations
//! (host simulation or ESP peripherals), tests supply mocks.

use std::time::Duration;

use thiserror::Error;

use crate::types::{InboundMessage, LinkInfo, LivenessReport, SensorAddress, UpdateOutcome, UpdateRequest};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("broker session is not connected")]
    NotConnected,
    #[error("broker connect failed: {0}")]
    ConnectFailed(String),
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
}

/// Wi-Fi association. Joining is started once, then polled.
pub trait NetworkLink {
    fn begin_join(&mut self);
    fn poll_connected(&mut self) -> bool;
    /// Present only while associated.
    fn link_info(&self) -> Option<LinkInfo>;
}

/// Network time. Syncing is started once, then polled; `local_hour` is only
/// meaningful after a successful sync.
pub trait ClockSync {
    fn begin_sync(&mut self);
    fn poll_synced(&mut self) -> bool;
    fn local_hour(&self) -> u32;
}

/// The encrypted publish/subscribe session. Owns at most one live handle;
/// any failure tears the handle down wholesale, never repairs it in place.
pub trait BrokerSession {
    /// Opens the transport, verifies the pinned fingerprint, authenticates
    /// and subscribes the command topic. Never leaves a half-open session
    /// behind on failure.
    fn connect(&mut self) -> Result<(), SessionError>;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError>;
    /// Waits up to `timeout` for one inbound message; `None` on a quiet
    /// window. Repeated calls drain a backlog one message at a time.
    fn poll_for_message(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, SessionError>;
    fn liveness_check(&mut self) -> LivenessReport;
    /// Idempotent.
    fn disconnect(&mut self);
}

/// 1-Wire temperature bus.
pub trait SensorBus {
    /// Enumerates device addresses; implementations cap the list at
    /// [`crate::types::MAX_SENSOR_ADDRESSES`].
    fn scan(&mut self) -> Vec<SensorAddress>;
    /// Reads the first sensor; returns the not-ready sentinel when the
    /// conversion has not completed.
    fn sample(&mut self) -> f32;
}

/// RGB output. Fire and forget; intensities are in the actuator's native
/// 10-bit range.
pub trait Actuator {
    fn set_channels(&mut self, red: u16, green: u16, blue: u16);
}

/// On-board status LEDs.
pub trait StatusIndicator {
    fn set_wifi(&mut self, on: bool);
    fn set_broker(&mut self, on: bool);
    /// Daytime runs the indicators bright, nighttime dimmed.
    fn set_idle(&mut self, daytime: bool);
}

/// Opaque check-and-flash firmware updater.
pub trait FirmwareUpdater {
    fn check_and_flash(&mut self, request: &UpdateRequest) -> UpdateOutcome;
}

/// Platform services with no better home.
pub trait Platform {
    fn sleep_ms(&mut self, ms: u64);
}
