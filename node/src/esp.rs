use std::ffi::{CStr, CString};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use chrono::Timelike;
use ds18b20::{Ds18b20, Resolution as SensorResolution};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, IOPin, InputOutput, Output, OutputPin, PinDriver, Pull},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration},
    nvs::EspDefaultNvsPartition,
    ota::EspOta,
    sntp::{EspSntp, SyncStatus},
    tls::X509,
    wifi::EspWifi,
};
use log::{info, warn};
use one_wire_bus::OneWire;
use sha2::{Digest, Sha256};

use roombridge_common::{
    Actuator, Bridge, BridgeConfig, BridgeExit, BrokerConfig, BrokerSession, CertFingerprint,
    ClockSync, Collaborators, DeviceIdentity, FirmwareUpdater, InboundMessage, LinkInfo,
    LivenessReport, NetworkLink, Platform, RetryConfig, SensorAddress, SensorBus, SessionError,
    StatusIndicator, UpdateOutcome, UpdateRequest, MAX_SENSOR_ADDRESSES, SENSOR_NOT_READY_C,
};

const TIMEZONE_OFFSET_HOURS: i64 = 3;
const OTA_CHUNK_SIZE: usize = 4096;
const MQTT_EVENT_QUEUE: usize = 16;

fn bridge_config() -> anyhow::Result<BridgeConfig> {
    let mut config = BridgeConfig::default();

    if let Some(ident) = option_env!("NODE_IDENT") {
        config.identity = DeviceIdentity::new(ident).context("invalid NODE_IDENT")?;
    }
    config.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    config.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or("CHANGE_ME").to_string();
    if let Some(host) = option_env!("MQTT_HOST") {
        config.broker.host = host.to_string();
    }
    if let Some(port) = option_env!("MQTT_PORT") {
        config.broker.port = port.parse().context("invalid MQTT_PORT")?;
    }
    config.broker.username = option_env!("MQTT_USER").unwrap_or_default().to_string();
    config.broker.password = option_env!("MQTT_PASS").unwrap_or_default().to_string();
    if let Some(fingerprint) = option_env!("MQTT_FINGERPRINT") {
        config.broker.fingerprint =
            CertFingerprint::parse(fingerprint).context("invalid MQTT_FINGERPRINT")?;
    }

    Ok(config)
}

/// The broker's own certificate, embedded at build time. The TLS layer
/// trusts this certificate and nothing else, which enforces the pin at
/// the transport.
fn broker_certificate() -> anyhow::Result<X509<'static>> {
    let pem =
        option_env!("BROKER_CERT_PEM").ok_or_else(|| anyhow!("BROKER_CERT_PEM not embedded"))?;
    let cstr = CString::new(pem).context("broker certificate contains NUL")?;
    let leaked: &'static CStr = Box::leak(cstr.into_boxed_c_str());
    Ok(X509::pem(leaked))
}

struct WifiLink {
    wifi: EspWifi<'static>,
    ssid: String,
    pass: String,
}

impl NetworkLink for WifiLink {
    fn begin_join(&mut self) {
        let auth_method = if self.pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        let result = self
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))
            .and_then(|ssid| {
                let password = self
                    .pass
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?;
                self.wifi
                    .set_configuration(&Configuration::Client(ClientConfiguration {
                        ssid,
                        password,
                        auth_method,
                        ..Default::default()
                    }))?;
                self.wifi.start()?;
                self.wifi.connect()?;
                Ok(())
            });

        match result {
            Ok(()) => info!("wifi join started for `{}`", self.ssid),
            Err(err) => warn!("wifi join start failed: {err:#}"),
        }
    }

    fn poll_connected(&mut self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn link_info(&self) -> Option<LinkInfo> {
        let ip_info = self.wifi.sta_netif().get_ip_info().ok()?;
        Some(LinkInfo {
            ssid: self.ssid.clone(),
            signal_dbm: 0,
            address: ip_info.ip.to_string(),
        })
    }
}

struct SntpClock {
    sntp: Option<EspSntp<'static>>,
}

impl ClockSync for SntpClock {
    fn begin_sync(&mut self) {
        match EspSntp::new_default() {
            Ok(sntp) => self.sntp = Some(sntp),
            Err(err) => warn!("sntp startup failed: {err:?}"),
        }
    }

    fn poll_synced(&mut self) -> bool {
        self.sntp
            .as_ref()
            .map(|sntp| sntp.get_sync_status() == SyncStatus::Completed)
            .unwrap_or(false)
    }

    fn local_hour(&self) -> u32 {
        (chrono::Utc::now() + chrono::Duration::hours(TIMEZONE_OFFSET_HOURS)).hour()
    }
}

struct OneWireSensors {
    bus: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    delay: Ets,
    first: Option<one_wire_bus::Address>,
}

impl OneWireSensors {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut driver = PinDriver::input_output_od(pin)?;
        driver.set_pull(Pull::Up)?;
        driver.set_high()?;
        let bus = OneWire::new(driver)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;
        Ok(Self {
            bus,
            delay: Ets,
            first: None,
        })
    }
}

impl SensorBus for OneWireSensors {
    fn scan(&mut self) -> Vec<SensorAddress> {
        let mut found = Vec::new();
        for device in self.bus.devices(false, &mut self.delay) {
            match device {
                Ok(address) => {
                    if self.first.is_none() && address.family_code() == ds18b20::FAMILY_CODE {
                        self.first = Some(address);
                    }
                    found.push(SensorAddress(address.0));
                    if found.len() >= MAX_SENSOR_ADDRESSES {
                        break;
                    }
                }
                Err(err) => {
                    warn!("one-wire scan failed: {err:?}");
                    break;
                }
            }
        }
        info!("one-wire scan found {} device(s)", found.len());
        found
    }

    fn sample(&mut self) -> f32 {
        let Some(address) = self.first else {
            return SENSOR_NOT_READY_C;
        };
        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {address:?}: {err:?}");
                return SENSOR_NOT_READY_C;
            }
        };

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.bus, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            return SENSOR_NOT_READY_C;
        }
        SensorResolution::Bits12.delay_for_measurement_time(&mut self.delay);

        match sensor.read_data(&mut self.bus, &mut self.delay) {
            Ok(data) => data.temperature,
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                SENSOR_NOT_READY_C
            }
        }
    }
}

struct LedcRgbActuator {
    red: LedcDriver<'static>,
    green: LedcDriver<'static>,
    blue: LedcDriver<'static>,
}

impl LedcRgbActuator {
    fn set(driver: &mut LedcDriver<'static>, value: u16) {
        // 10-bit input range mapped onto the timer's duty range.
        let max = driver.get_max_duty();
        let duty = u32::from(value.min(1023)) * max / 1023;
        if let Err(err) = driver.set_duty(duty) {
            warn!("failed to set channel duty: {err:?}");
        }
    }
}

impl Actuator for LedcRgbActuator {
    fn set_channels(&mut self, red: u16, green: u16, blue: u16) {
        Self::set(&mut self.red, red);
        Self::set(&mut self.green, green);
        Self::set(&mut self.blue, blue);
    }
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl StatusLed {
    fn apply(&mut self, on: bool) {
        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive status led: {err:?}");
        }
    }
}

impl StatusIndicator for StatusLed {
    fn set_wifi(&mut self, on: bool) {
        self.apply(on);
    }

    fn set_broker(&mut self, on: bool) {
        self.apply(on);
    }

    fn set_idle(&mut self, daytime: bool) {
        self.apply(daytime);
    }
}

/// Pulls a new firmware image from the update server when one is offered.
/// A `200` streams the new image into the inactive OTA slot and reboots;
/// `304` means the running version is current.
struct HttpOtaUpdater;

impl HttpOtaUpdater {
    fn download_and_flash(
        response: &mut embedded_svc::http::client::Response<&mut EspHttpConnection>,
    ) -> anyhow::Result<u64> {
        let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
        let mut update = ota
            .initiate_update()
            .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;

        let mut hasher = Sha256::new();
        let mut total_written = 0_u64;
        let mut chunk = [0_u8; OTA_CHUNK_SIZE];

        loop {
            let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
            if read == 0 {
                break;
            }
            update
                .write(&chunk[..read])
                .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
            hasher.update(&chunk[..read]);
            total_written = total_written.saturating_add(read as u64);
        }

        if total_written == 0 {
            return Err(anyhow!("OTA download body is empty"));
        }

        update
            .complete()
            .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))?;

        let digest = hasher.finalize();
        let mut digest_hex = String::with_capacity(64);
        for byte in digest {
            use core::fmt::Write as _;
            let _ = write!(&mut digest_hex, "{byte:02x}");
        }
        info!("OTA image flashed ({total_written} bytes, sha256 {digest_hex})");
        Ok(total_written)
    }

    fn check(&mut self, request: &UpdateRequest) -> anyhow::Result<UpdateOutcome> {
        let url = format!(
            "http://{}:{}{}",
            request.host, request.port, request.artifact_path
        );

        let http_conf = HttpClientConfiguration {
            timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
        let headers = [("x-firmware-version", request.current_version.as_str())];
        let http_request = client.request(Method::Get, &url, &headers)?;
        let mut response = http_request.submit().map_err(|e| anyhow!("{e:?}"))?;

        match response.status() {
            200 => {
                Self::download_and_flash(&mut response)?;
                info!("rebooting into the new image");
                thread::sleep(Duration::from_millis(800));
                unsafe { esp_idf_svc::sys::esp_restart() }
            }
            304 => Ok(UpdateOutcome::NoUpdate),
            status => Err(anyhow!("update check failed with HTTP {status}")),
        }
    }
}

impl FirmwareUpdater for HttpOtaUpdater {
    fn check_and_flash(&mut self, request: &UpdateRequest) -> UpdateOutcome {
        match self.check(request) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("firmware update check failed: {err:#}");
                UpdateOutcome::Failed
            }
        }
    }
}

enum PumpEvent {
    Connected,
    Subscribed,
    Message(InboundMessage),
}

struct EspSessionHandle {
    client: EspMqttClient<'static>,
    events: Receiver<PumpEvent>,
    connected: Arc<AtomicBool>,
}

/// Broker session backed by the IDF MQTT client. The TLS layer only trusts
/// the embedded broker certificate, so a successfully connected session
/// already implies the pin held.
struct EspBrokerSession {
    client_id: String,
    broker: BrokerConfig,
    connect_timeout: Duration,
    handle: Option<EspSessionHandle>,
}

impl EspBrokerSession {
    fn new(client_id: impl Into<String>, broker: BrokerConfig, retry: &RetryConfig) -> Self {
        Self {
            client_id: client_id.into(),
            broker,
            connect_timeout: Duration::from_millis(retry.connect_timeout_ms),
            handle: None,
        }
    }

    fn open_client(&self) -> anyhow::Result<EspSessionHandle> {
        let url = format!("mqtts://{}:{}", self.broker.host, self.broker.port);
        let conf = MqttClientConfiguration {
            client_id: Some(self.client_id.as_str()),
            username: (!self.broker.username.is_empty()).then_some(self.broker.username.as_str()),
            password: (!self.broker.password.is_empty()).then_some(self.broker.password.as_str()),
            server_certificate: Some(broker_certificate()?),
            keep_alive_interval: Some(Duration::from_secs(u64::from(
                self.broker.keep_alive_secs,
            ))),
            ..Default::default()
        };

        let (client, mut connection) = EspMqttClient::new(&url, &conf)?;
        let (tx, rx) = mpsc::sync_channel(MQTT_EVENT_QUEUE);
        let connected = Arc::new(AtomicBool::new(false));
        let connected_flag = connected.clone();

        thread::Builder::new()
            .name("mqtt-pump".to_string())
            .stack_size(8192)
            .spawn(move || {
                while let Ok(event) = connection.next() {
                    match event.payload() {
                        EventPayload::Connected(_) => {
                            connected_flag.store(true, Ordering::SeqCst);
                            let _ = tx.try_send(PumpEvent::Connected);
                        }
                        EventPayload::Subscribed(_) => {
                            let _ = tx.try_send(PumpEvent::Subscribed);
                        }
                        EventPayload::Disconnected => {
                            connected_flag.store(false, Ordering::SeqCst);
                        }
                        EventPayload::Received {
                            topic: Some(topic),
                            data,
                            ..
                        } => {
                            let message = InboundMessage {
                                topic: topic.to_string(),
                                payload: data.to_vec(),
                            };
                            if let Err(err) = tx.try_send(PumpEvent::Message(message)) {
                                warn!("mqtt event queue full, dropping message: {err}");
                            }
                        }
                        _ => {}
                    }
                }
            })
            .map_err(|err| anyhow!("failed to spawn mqtt pump thread: {err}"))?;

        Ok(EspSessionHandle {
            client,
            events: rx,
            connected,
        })
    }
}

impl BrokerSession for EspBrokerSession {
    fn connect(&mut self) -> Result<(), SessionError> {
        self.disconnect();

        let mut handle = self
            .open_client()
            .map_err(|err| SessionError::ConnectFailed(err.to_string()))?;

        let deadline = Instant::now() + self.connect_timeout;
        let mut conn_acked = false;
        let mut sub_acked = false;
        while !(conn_acked && sub_acked) {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| SessionError::ConnectFailed("handshake timed out".to_string()))?;
            match handle.events.recv_timeout(remaining) {
                Ok(PumpEvent::Connected) => {
                    conn_acked = true;
                    handle
                        .client
                        .subscribe(&self.broker.command_topic, QoS::AtLeastOnce)
                        .map_err(|err| SessionError::ConnectFailed(format!("{err:?}")))?;
                }
                Ok(PumpEvent::Subscribed) => sub_acked = true,
                Ok(PumpEvent::Message(_)) => {}
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SessionError::ConnectFailed("handshake timed out".to_string()));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SessionError::ConnectFailed("event pump ended".to_string()));
                }
            }
        }

        info!("broker session established, command topic subscribed");
        self.handle = Some(handle);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        let handle = self.handle.as_mut().ok_or(SessionError::NotConnected)?;
        handle
            .client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|err| SessionError::PublishFailed(format!("{err:?}")))
    }

    fn poll_for_message(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<InboundMessage>, SessionError> {
        let handle = self.handle.as_mut().ok_or(SessionError::NotConnected)?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return Ok(None),
            };
            match handle.events.recv_timeout(remaining) {
                Ok(PumpEvent::Message(message)) => return Ok(Some(message)),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SessionError::ConnectionLost("event pump ended".to_string()));
                }
            }
        }
    }

    fn liveness_check(&mut self) -> LivenessReport {
        let alive = self
            .handle
            .as_ref()
            .map(|handle| handle.connected.load(Ordering::SeqCst))
            .unwrap_or(false);
        // The transport trusts only the pinned certificate, so a session
        // that is still connected necessarily presented the right leaf.
        LivenessReport {
            ping_ok: alive,
            fingerprint_ok: alive,
        }
    }

    fn disconnect(&mut self) {
        if let Some(handle) = self.handle.take() {
            drop(handle.client);
        }
    }
}

struct EspPlatform;

impl Platform for EspPlatform {
    fn sleep_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

fn build_actuator(
    timer: esp_idf_hal::ledc::TIMER0,
    channel0: esp_idf_hal::ledc::CHANNEL0,
    channel1: esp_idf_hal::ledc::CHANNEL1,
    channel2: esp_idf_hal::ledc::CHANNEL2,
    red: AnyOutputPin,
    green: AnyOutputPin,
    blue: AnyOutputPin,
) -> anyhow::Result<LedcRgbActuator> {
    let timer = LedcTimerDriver::new(
        timer,
        &TimerConfig::default()
            .frequency(1.kHz().into())
            .resolution(Resolution::Bits10),
    )?;

    Ok(LedcRgbActuator {
        red: LedcDriver::new(channel0, &timer, red)?,
        green: LedcDriver::new(channel1, &timer, green)?,
        blue: LedcDriver::new(channel2, &timer, blue)?,
    })
}

fn connect_modem(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
) -> anyhow::Result<EspWifi<'static>> {
    Ok(EspWifi::new(modem, sys_loop, Some(nvs))?)
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let config = bridge_config()?;
    info!("bridge starting as `{}`", config.identity);

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem, pins, ledc, ..
    } = Peripherals::take()?;

    let wifi = connect_modem(modem, sys_loop, nvs).context("wifi startup failed")?;
    let mut link = WifiLink {
        wifi,
        ssid: config.network.wifi_ssid.clone(),
        pass: config.network.wifi_pass.clone(),
    };

    let mut clock = SntpClock { sntp: None };
    let mut sensors =
        OneWireSensors::new(pins.gpio14.downgrade()).context("failed to initialize sensor bus")?;
    let mut actuator = build_actuator(
        ledc.timer0,
        ledc.channel0,
        ledc.channel1,
        ledc.channel2,
        pins.gpio12.downgrade_output(),
        pins.gpio13.downgrade_output(),
        pins.gpio15.downgrade_output(),
    )
    .context("failed to initialize rgb actuator")?;
    let mut indicator = StatusLed {
        pin: PinDriver::output(pins.gpio2.downgrade_output())?,
    };
    let mut updater = HttpOtaUpdater;
    let mut platform = EspPlatform;
    let mut session = EspBrokerSession::new(
        config.identity.as_str(),
        config.broker.clone(),
        &config.retry,
    );

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
            warn!("retry budget exhausted; restarting device");
            thread::sleep(Duration::from_millis(500));
            unsafe { esp_idf_svc::sys::esp_restart() }
        }
    }
}
