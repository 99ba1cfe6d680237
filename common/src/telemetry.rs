//! Telemetry encoding and publishing: exactly one message per valid sample.

use crate::config::{BridgeConfig, DeviceIdentity};
use crate::ports::{BrokerSession, SessionError};
use crate::types::TelemetryReading;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The sample was the not-ready sentinel. A skipped cycle is expected
    /// behavior, not a fault.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct TelemetryPublisher {
    identity: DeviceIdentity,
    topic: String,
}

impl TelemetryPublisher {
    pub fn new(identity: DeviceIdentity, topic: impl Into<String>) -> Self {
        Self {
            identity,
            topic: topic.into(),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.identity.clone(), config.broker.telemetry_topic.clone())
    }

    /// Publishes one reading, or silently skips the sentinel. Failures are
    /// reported to the caller; retry policy lives in the supervisor.
    pub fn publish_reading(
        &self,
        sample_c: f32,
        session: &mut dyn BrokerSession,
    ) -> Result<PublishOutcome, SessionError> {
        let Some(reading) = TelemetryReading::from_sample(&self.identity, sample_c) else {
            return Ok(PublishOutcome::Skipped);
        };

        let payload = serde_json::to_vec(&reading)
            .map_err(|err| SessionError::PublishFailed(err.to_string()))?;
        session.publish(&self.topic, &payload)?;
        Ok(PublishOutcome::Published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InboundMessage, LivenessReport, SENSOR_NOT_READY_C};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSession {
        published: Vec<(String, Vec<u8>)>,
        fail_publish: bool,
    }

    impl BrokerSession for RecordingSession {
        fn connect(&mut self) -> Result<(), SessionError> {
            Ok(())
        }

        fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
            if self.fail_publish {
                return Err(SessionError::NotConnected);
            }
            self.published.push((topic.to_string(), payload.to_vec()));
            Ok(())
        }

        fn poll_for_message(
            &mut self,
            _timeout: Duration,
        ) -> Result<Option<InboundMessage>, SessionError> {
            Ok(None)
        }

        fn liveness_check(&mut self) -> LivenessReport {
            LivenessReport {
                ping_ok: true,
                fingerprint_ok: true,
            }
        }

        fn disconnect(&mut self) {}
    }

    fn publisher() -> TelemetryPublisher {
        TelemetryPublisher::new(DeviceIdentity::new("X").unwrap(), "room01/bed/temp")
    }

    #[test]
    fn valid_sample_publishes_exactly_once() {
        let mut session = RecordingSession::default();
        let outcome = publisher().publish_reading(21.5, &mut session).unwrap();

        assert_eq!(outcome, PublishOutcome::Published);
        assert_eq!(session.published.len(), 1);
        let (topic, payload) = &session.published[0];
        assert_eq!(topic, "room01/bed/temp");
        assert_eq!(
            std::str::from_utf8(payload).unwrap(),
            r#"{"ident":"X","temperature":21.5}"#
        );
    }

    #[test]
    fn sentinel_sample_is_skipped_silently() {
        let mut session = RecordingSession::default();
        let outcome = publisher()
            .publish_reading(SENSOR_NOT_READY_C, &mut session)
            .unwrap();

        assert_eq!(outcome, PublishOutcome::Skipped);
        assert!(session.published.is_empty());
    }

    #[test]
    fn publish_failure_propagates_without_retry() {
        let mut session = RecordingSession {
            fail_publish: true,
            ..Default::default()
        };
        let result = publisher().publish_reading(19.0, &mut session);

        assert!(matches!(result, Err(SessionError::NotConnected)));
        assert!(session.published.is_empty());
    }

    #[test]
    fn negative_but_plausible_temperatures_publish() {
        let mut session = RecordingSession::default();
        let outcome = publisher().publish_reading(-21.25, &mut session).unwrap();
        assert_eq!(outcome, PublishOutcome::Published);
    }
}
