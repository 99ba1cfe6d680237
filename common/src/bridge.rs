//! Bridge driver: interprets supervisor effects against the collaborator
//! ports and feeds the outcomes back in. One flow of control, no
//! concurrency; every wait it performs is bounded by configuration.

use std::time::Duration;

use thiserror::Error;

use crate::command::ChannelLevels;
use crate::config::BridgeConfig;
use crate::ports::{
    Actuator, BrokerSession, ClockSync, FirmwareUpdater, NetworkLink, Platform, SensorBus,
    StatusIndicator,
};
use crate::supervisor::{ConnectivitySupervisor, Effect, Event, Phase};
use crate::telemetry::TelemetryPublisher;
use crate::types::{SensorAddress, UpdateRequest, MAX_SENSOR_ADDRESSES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// A retry budget was exhausted; the platform must restart the device.
    Restart,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("supervisor produced no runnable effects in phase {0:?}")]
    Stalled(Phase),
}

/// Everything the bridge talks to. Mutable borrows for the duration of one
/// `run`; the driver is the only mutator.
pub struct Collaborators<'a> {
    pub link: &'a mut dyn NetworkLink,
    pub clock: &'a mut dyn ClockSync,
    pub session: &'a mut dyn BrokerSession,
    pub sensors: &'a mut dyn SensorBus,
    pub actuator: &'a mut dyn Actuator,
    pub indicator: &'a mut dyn StatusIndicator,
    pub updater: &'a mut dyn FirmwareUpdater,
    pub platform: &'a mut dyn Platform,
}

pub struct Bridge {
    config: BridgeConfig,
    supervisor: ConnectivitySupervisor,
    publisher: TelemetryPublisher,
    sensor_addresses: Vec<SensorAddress>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let supervisor = ConnectivitySupervisor::new(config.retry.clone());
        let publisher = TelemetryPublisher::from_config(&config);
        Self {
            config,
            supervisor,
            publisher,
            sensor_addresses: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.supervisor.phase()
    }

    pub fn discovered_sensors(&self) -> &[SensorAddress] {
        &self.sensor_addresses
    }

    /// Runs from power-on until a restart is required. Only a latched
    /// restart ends the loop; everything else is handled in place.
    pub fn run(&mut self, io: &mut Collaborators<'_>) -> Result<BridgeExit, BridgeError> {
        self.sensor_addresses = io.sensors.scan();
        self.sensor_addresses.truncate(MAX_SENSOR_ADDRESSES);

        let mut event = Event::PowerOn;
        loop {
            let effects = self.supervisor.on_event(event);
            if effects.is_empty() {
                return Err(BridgeError::Stalled(self.supervisor.phase()));
            }

            let mut produced = None;
            for effect in effects {
                match effect {
                    Effect::SetWifiIndicator(on) => io.indicator.set_wifi(on),
                    Effect::SetBrokerIndicator(on) => io.indicator.set_broker(on),
                    Effect::BeginWifiJoin => io.link.begin_join(),
                    Effect::PollWifi => {
                        produced = Some(Event::WifiPoll {
                            connected: io.link.poll_connected(),
                        });
                    }
                    Effect::RunUpdateCheck => {
                        // All update outcomes continue bring-up; a flashed
                        // image reboots the device before we get here.
                        let request = self.update_request();
                        let _ = io.updater.check_and_flash(&request);
                        produced = Some(Event::UpdateCheckDone);
                    }
                    Effect::BeginClockSync => io.clock.begin_sync(),
                    Effect::PollClock => {
                        produced = Some(Event::ClockPoll {
                            synced: io.clock.poll_synced(),
                        });
                    }
                    Effect::OpenBrokerSession => {
                        produced = Some(Event::BrokerConnect {
                            connected: io.session.connect().is_ok(),
                        });
                    }
                    Effect::CloseBrokerSession => io.session.disconnect(),
                    Effect::ProbeLiveness => {
                        produced = Some(Event::Liveness {
                            alive: io.session.liveness_check().is_alive(),
                        });
                    }
                    Effect::RefreshIdleIndicator => {
                        io.indicator.set_idle(is_daytime_hour(io.clock.local_hour()));
                    }
                    Effect::PublishTelemetry => {
                        // A failed publish surfaces on the next liveness
                        // probe; the session already reported it.
                        let sample = io.sensors.sample();
                        let _ = self.publisher.publish_reading(sample, io.session);
                    }
                    Effect::DrainCommands => self.drain_commands(io),
                    Effect::Sleep(ms) => io.platform.sleep_ms(ms),
                    Effect::Restart => return Ok(BridgeExit::Restart),
                }
            }

            event = produced.unwrap_or(Event::CycleComplete);
        }
    }

    /// Pulls inbound commands one message per poll until a window passes
    /// quietly, dispatching each to the actuator.
    fn drain_commands(&self, io: &mut Collaborators<'_>) {
        let window = Duration::from_millis(self.config.retry.command_drain_ms);
        loop {
            match io.session.poll_for_message(window) {
                Ok(Some(message)) if message.topic == self.config.broker.command_topic => {
                    let levels = ChannelLevels::decode(&message.payload);
                    let (red, green, blue) = levels.scaled();
                    io.actuator.set_channels(red, green, blue);
                }
                // Not ours; keep draining the window.
                Ok(Some(_)) => {}
                Ok(None) => break,
                // A dead session ends the drain; the next liveness probe
                // tears it down properly.
                Err(_) => break,
            }
        }
    }

    fn update_request(&self) -> UpdateRequest {
        UpdateRequest {
            host: self.config.broker.host.clone(),
            // The update server rides one port above the broker.
            port: self.config.broker.port.wrapping_add(1),
            artifact_path: self.config.identity.artifact_path(),
            current_version: self.config.firmware_version.clone(),
        }
    }
}

/// Indicators run bright between 10:00 and 20:59 local, dimmed at night.
pub fn is_daytime_hour(hour: u32) -> bool {
    (10..21).contains(&hour)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceIdentity;
    use crate::ports::SessionError;
    use crate::types::{InboundMessage, LinkInfo, LivenessReport, UpdateOutcome};
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    type Trace = Rc<RefCell<Vec<String>>>;

    fn note(trace: &Trace, entry: impl Into<String>) {
        trace.borrow_mut().push(entry.into());
    }

    struct ScriptLink {
        trace: Trace,
        script: VecDeque<bool>,
        fallback: bool,
        polls: u32,
    }

    impl NetworkLink for ScriptLink {
        fn begin_join(&mut self) {
            note(&self.trace, "begin_join");
        }

        fn poll_connected(&mut self) -> bool {
            self.polls += 1;
            note(&self.trace, "wifi_poll");
            self.script.pop_front().unwrap_or(self.fallback)
        }

        fn link_info(&self) -> Option<LinkInfo> {
            None
        }
    }

    struct ScriptClock {
        trace: Trace,
        script: VecDeque<bool>,
        fallback: bool,
        hour: u32,
    }

    impl ClockSync for ScriptClock {
        fn begin_sync(&mut self) {
            note(&self.trace, "begin_sync");
        }

        fn poll_synced(&mut self) -> bool {
            note(&self.trace, "clock_poll");
            self.script.pop_front().unwrap_or(self.fallback)
        }

        fn local_hour(&self) -> u32 {
            self.hour
        }
    }

    struct ScriptSession {
        trace: Trace,
        connect_script: VecDeque<bool>,
        connect_fallback: bool,
        liveness_script: VecDeque<bool>,
        inbound: VecDeque<InboundMessage>,
        published: Vec<(String, Vec<u8>)>,
        connects: u32,
        disconnects: u32,
    }

    impl ScriptSession {
        fn new(trace: Trace) -> Self {
            Self {
                trace,
                connect_script: VecDeque::new(),
                connect_fallback: false,
                liveness_script: VecDeque::new(),
                inbound: VecDeque::new(),
                published: Vec::new(),
                connects: 0,
                disconnects: 0,
            }
        }
    }

    impl BrokerSession for ScriptSession {
        fn connect(&mut self) -> Result<(), SessionError> {
            self.connects += 1;
            note(&self.trace, "connect");
            let ok = self.connect_script.pop_front().unwrap_or(self.connect_fallback);
            if ok {
                Ok(())
            } else {
                Err(SessionError::ConnectFailed("scripted".to_string()))
            }
        }

        fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
            note(&self.trace, "publish");
            self.published.push((topic.to_string(), payload.to_vec()));
            Ok(())
        }

        fn poll_for_message(
            &mut self,
            _timeout: Duration,
        ) -> Result<Option<InboundMessage>, SessionError> {
            note(&self.trace, "poll_msg");
            Ok(self.inbound.pop_front())
        }

        fn liveness_check(&mut self) -> LivenessReport {
            note(&self.trace, "liveness");
            let alive = self.liveness_script.pop_front().unwrap_or(false);
            LivenessReport {
                ping_ok: true,
                fingerprint_ok: alive,
            }
        }

        fn disconnect(&mut self) {
            self.disconnects += 1;
            note(&self.trace, "disconnect");
        }
    }

    struct FixedSensors {
        trace: Trace,
        addresses: Vec<SensorAddress>,
        sample_c: f32,
    }

    impl SensorBus for FixedSensors {
        fn scan(&mut self) -> Vec<SensorAddress> {
            note(&self.trace, "scan");
            self.addresses.clone()
        }

        fn sample(&mut self) -> f32 {
            note(&self.trace, "sample");
            self.sample_c
        }
    }

    struct RecordingActuator {
        trace: Trace,
        calls: Vec<(u16, u16, u16)>,
    }

    impl Actuator for RecordingActuator {
        fn set_channels(&mut self, red: u16, green: u16, blue: u16) {
            note(&self.trace, "actuate");
            self.calls.push((red, green, blue));
        }
    }

    struct RecordingIndicator {
        trace: Trace,
    }

    impl StatusIndicator for RecordingIndicator {
        fn set_wifi(&mut self, on: bool) {
            note(&self.trace, format!("wifi_led={on}"));
        }

        fn set_broker(&mut self, on: bool) {
            note(&self.trace, format!("broker_led={on}"));
        }

        fn set_idle(&mut self, daytime: bool) {
            note(&self.trace, format!("idle_led={daytime}"));
        }
    }

    struct StubUpdater {
        trace: Trace,
        calls: u32,
        last_request: Option<UpdateRequest>,
    }

    impl FirmwareUpdater for StubUpdater {
        fn check_and_flash(&mut self, request: &UpdateRequest) -> UpdateOutcome {
            self.calls += 1;
            self.last_request = Some(request.clone());
            note(&self.trace, "update_check");
            UpdateOutcome::NoUpdate
        }
    }

    struct CountingPlatform {
        sleeps: u32,
    }

    impl Platform for CountingPlatform {
        fn sleep_ms(&mut self, _ms: u64) {
            self.sleeps += 1;
        }
    }

    struct Rig {
        trace: Trace,
        link: ScriptLink,
        clock: ScriptClock,
        session: ScriptSession,
        sensors: FixedSensors,
        actuator: RecordingActuator,
        indicator: RecordingIndicator,
        updater: StubUpdater,
        platform: CountingPlatform,
    }

    impl Rig {
        fn new() -> Self {
            let trace: Trace = Rc::new(RefCell::new(Vec::new()));
            Self {
                link: ScriptLink {
                    trace: trace.clone(),
                    script: VecDeque::new(),
                    fallback: true,
                    polls: 0,
                },
                clock: ScriptClock {
                    trace: trace.clone(),
                    script: VecDeque::new(),
                    fallback: true,
                    hour: 12,
                },
                session: ScriptSession::new(trace.clone()),
                sensors: FixedSensors {
                    trace: trace.clone(),
                    addresses: vec![SensorAddress(0x28_0000_0000_0001)],
                    sample_c: 21.5,
                },
                actuator: RecordingActuator {
                    trace: trace.clone(),
                    calls: Vec::new(),
                },
                indicator: RecordingIndicator {
                    trace: trace.clone(),
                },
                updater: StubUpdater {
                    trace: trace.clone(),
                    calls: 0,
                    last_request: None,
                },
                platform: CountingPlatform { sleeps: 0 },
                trace,
            }
        }

        fn run(&mut self, config: BridgeConfig) -> (Bridge, Result<BridgeExit, BridgeError>) {
            let mut bridge = Bridge::new(config);
            let exit = bridge.run(&mut Collaborators {
                link: &mut self.link,
                clock: &mut self.clock,
                session: &mut self.session,
                sensors: &mut self.sensors,
                actuator: &mut self.actuator,
                indicator: &mut self.indicator,
                updater: &mut self.updater,
                platform: &mut self.platform,
            });
            (bridge, exit)
        }
    }

    fn test_config(wifi: u32, sync: u32, broker: u32) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.identity = DeviceIdentity::new("X").unwrap();
        config.retry.wifi_poll_attempts = wifi;
        config.retry.sync_poll_attempts = sync;
        config.retry.broker_connect_attempts = broker;
        config
    }

    #[test]
    fn wifi_exhaustion_restarts_without_ever_touching_the_broker() {
        let mut rig = Rig::new();
        rig.link.fallback = false;

        let (_, exit) = rig.run(test_config(5, 3, 3));

        assert_eq!(exit.unwrap(), BridgeExit::Restart);
        assert_eq!(rig.link.polls, 5);
        assert_eq!(rig.platform.sleeps, 4);
        assert_eq!(rig.session.connects, 0);
        assert_eq!(rig.updater.calls, 0);
    }

    #[test]
    fn liveness_failure_ends_the_iteration_early_then_reconnects() {
        let mut rig = Rig::new();
        rig.session.connect_script = VecDeque::from([true]);
        rig.session.liveness_script = VecDeque::from([true, true, true, false]);
        rig.session
            .inbound
            .push_back(InboundMessage {
                topic: "room01/bed/light".to_string(),
                payload: b"16711680".to_vec(),
            });

        let (_, exit) = rig.run(test_config(3, 3, 2));

        // Reconnect attempts after the teardown fail until the broker
        // budget is spent, which is the only way the loop exits.
        assert_eq!(exit.unwrap(), BridgeExit::Restart);

        // Three healthy iterations published, the fourth did not.
        assert_eq!(rig.session.published.len(), 3);
        assert_eq!(
            std::str::from_utf8(&rig.session.published[0].1).unwrap(),
            r#"{"ident":"X","temperature":21.5}"#
        );

        // The scripted command was dispatched exactly once, scaled.
        assert_eq!(rig.actuator.calls, vec![(0, 0, 1020)]);

        // Teardown once on liveness failure, once more before the retry.
        assert_eq!(rig.session.disconnects, 2);
        assert_eq!(rig.session.connects, 3);

        // Nothing was published or drained after the failed probe.
        let trace = rig.trace.borrow();
        let last_liveness = trace.iter().rposition(|e| e == "liveness").unwrap();
        assert!(!trace[last_liveness..].iter().any(|e| e == "publish" || e == "poll_msg"));
    }

    #[test]
    fn steady_iteration_orders_liveness_indicator_publish_drain() {
        let mut rig = Rig::new();
        rig.session.connect_script = VecDeque::from([true]);
        rig.session.liveness_script = VecDeque::from([true]);

        let (_, exit) = rig.run(test_config(3, 3, 1));
        assert_eq!(exit.unwrap(), BridgeExit::Restart);

        let trace = rig.trace.borrow();
        let start = trace.iter().position(|e| e == "liveness").unwrap();
        assert_eq!(
            &trace[start..start + 5],
            &[
                "liveness".to_string(),
                "idle_led=true".to_string(),
                "sample".to_string(),
                "publish".to_string(),
                "poll_msg".to_string(),
            ]
        );
    }

    #[test]
    fn sentinel_sample_publishes_nothing_that_cycle() {
        let mut rig = Rig::new();
        rig.sensors.sample_c = -127.0;
        rig.session.connect_script = VecDeque::from([true]);
        rig.session.liveness_script = VecDeque::from([true]);

        let (_, exit) = rig.run(test_config(3, 3, 1));
        assert_eq!(exit.unwrap(), BridgeExit::Restart);

        assert!(rig.session.published.is_empty());
        // The sample itself was still taken; skipping is not an error.
        assert!(rig.trace.borrow().iter().any(|e| e == "sample"));
    }

    #[test]
    fn update_check_runs_between_wifi_and_time_sync() {
        let mut rig = Rig::new();
        rig.session.liveness_script = VecDeque::from([]);
        rig.session.connect_script = VecDeque::from([true]);

        let (_, exit) = rig.run(test_config(3, 3, 1));
        assert_eq!(exit.unwrap(), BridgeExit::Restart);

        assert_eq!(rig.updater.calls, 1);
        let request = rig.updater.last_request.as_ref().unwrap();
        assert_eq!(request.artifact_path, "/X.bin");
        assert_eq!(request.port, BridgeConfig::default().broker.port + 1);

        let trace = rig.trace.borrow();
        let update = trace.iter().position(|e| e == "update_check").unwrap();
        let wifi_up = trace.iter().position(|e| e == "wifi_led=true").unwrap();
        let sync = trace.iter().position(|e| e == "begin_sync").unwrap();
        assert!(wifi_up < update && update < sync);
    }

    #[test]
    fn sensor_scan_is_capped_at_twenty_addresses() {
        let mut rig = Rig::new();
        rig.sensors.addresses = (0..25u64).map(SensorAddress).collect();
        rig.link.fallback = false;

        let (bridge, exit) = rig.run(test_config(1, 3, 3));
        assert_eq!(exit.unwrap(), BridgeExit::Restart);
        assert_eq!(bridge.discovered_sensors().len(), 20);
    }

    #[test]
    fn foreign_topics_are_ignored_while_draining() {
        let mut rig = Rig::new();
        rig.session.connect_script = VecDeque::from([true]);
        rig.session.liveness_script = VecDeque::from([true]);
        rig.session.inbound = VecDeque::from([
            InboundMessage {
                topic: "room01/other".to_string(),
                payload: b"255".to_vec(),
            },
            InboundMessage {
                topic: "room01/bed/light".to_string(),
                payload: b"255".to_vec(),
            },
        ]);

        let (_, exit) = rig.run(test_config(3, 3, 1));
        assert_eq!(exit.unwrap(), BridgeExit::Restart);
        assert_eq!(rig.actuator.calls, vec![(1020, 0, 0)]);
    }

    #[test]
    fn daytime_window_matches_the_indicator_policy() {
        assert!(!is_daytime_hour(9));
        assert!(is_daytime_hour(10));
        assert!(is_daytime_hour(20));
        assert!(!is_daytime_hour(21));
        assert!(!is_daytime_hour(3));
    }
}
