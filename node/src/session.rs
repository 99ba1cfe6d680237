//! MQTT broker session over TLS with leaf-certificate pinning.
//!
//! Trust is anchored on the SHA-256 digest of the broker's leaf certificate
//! in DER form, not on a CA chain. The same pinning verifier guards both the
//! session transport and the periodic re-verification probe, so a swapped
//! certificate fails the handshake in either place.

use std::collections::VecDeque;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use rumqttc::tokio_rustls::rustls;
use rumqttc::{
    Client, Connection, ConnectReturnCode, Event, Incoming, MqttOptions, QoS, TlsConfiguration,
    Transport,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

use roombridge_common::{
    BrokerConfig, BrokerSession, CertFingerprint, InboundMessage, LivenessReport, RetryConfig,
    SessionError,
};

/// Accepts exactly one certificate: the one whose DER digest matches the
/// configured pin. Chain building and signature checks are intentionally
/// bypassed; the pin is the entire trust decision.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    fingerprint: CertFingerprint,
}

impl PinnedCertVerifier {
    pub fn new(fingerprint: CertFingerprint) -> Self {
        Self { fingerprint }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let digest = Sha256::digest(end_entity.as_ref());
        if self.fingerprint.matches(digest.as_slice()) {
            Ok(ServerCertVerified::assertion())
        } else {
            warn!("broker presented a certificate that does not match the pin");
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

fn pinned_tls_config(fingerprint: CertFingerprint) -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier::new(fingerprint)))
        .with_no_client_auth()
}

struct SessionHandle {
    client: Client,
    connection: Connection,
}

/// One owned broker session. Holds at most one live handle; every failure
/// path drops the handle wholesale and reconnects from scratch.
///
/// Inbound publishes can arrive whenever the event loop is being driven,
/// not just inside `poll_for_message`. The broker has already received an
/// ack by then, so they are buffered in `pending` and served before the
/// connection is polled again; the buffer survives a reconnect.
pub struct SecureBrokerSession {
    client_id: String,
    broker: BrokerConfig,
    connect_timeout: Duration,
    liveness_window: Duration,
    handle: Option<SessionHandle>,
    pending: VecDeque<InboundMessage>,
}

impl SecureBrokerSession {
    pub fn new(client_id: impl Into<String>, broker: BrokerConfig, retry: &RetryConfig) -> Self {
        Self {
            client_id: client_id.into(),
            broker,
            connect_timeout: Duration::from_millis(retry.connect_timeout_ms),
            liveness_window: Duration::from_millis(retry.liveness_window_ms),
            handle: None,
            pending: VecDeque::new(),
        }
    }

    /// Drives the event loop until both the broker acknowledgment and the
    /// command subscription acknowledgment arrive, or the deadline passes.
    fn await_session_up(&mut self, connection: &mut Connection) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut conn_acked = false;
        let mut sub_acked = false;

        while !(conn_acked && sub_acked) {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| SessionError::ConnectFailed("handshake timed out".to_string()))?;

            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Incoming::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(SessionError::ConnectFailed(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                    }
                    conn_acked = true;
                }
                Ok(Ok(Event::Incoming(Incoming::SubAck(_)))) => {
                    sub_acked = true;
                }
                Ok(Ok(Event::Incoming(Incoming::Publish(publish)))) => {
                    self.pending.push_back(InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Ok(event)) => debug!("event during session bring-up: {event:?}"),
                Ok(Err(err)) => {
                    return Err(SessionError::ConnectFailed(err.to_string()));
                }
                Err(_) => {
                    return Err(SessionError::ConnectFailed("handshake timed out".to_string()));
                }
            }
        }

        Ok(())
    }

    /// Re-verifies the pinned certificate out of band: a throwaway TLS
    /// handshake against the broker that succeeds only if the pinning
    /// verifier accepts the presented leaf.
    fn probe_fingerprint(&self) -> bool {
        match self.run_fingerprint_probe() {
            Ok(()) => true,
            Err(err) => {
                warn!("certificate re-verification failed: {err}");
                false
            }
        }
    }

    fn run_fingerprint_probe(&self) -> Result<(), SessionError> {
        let address = (self.broker.host.as_str(), self.broker.port)
            .to_socket_addrs()
            .map_err(|err| SessionError::ConnectionLost(err.to_string()))?
            .next()
            .ok_or_else(|| {
                SessionError::ConnectionLost(format!("no address for {}", self.broker.host))
            })?;

        let mut tcp = TcpStream::connect_timeout(&address, self.connect_timeout)
            .map_err(|err| SessionError::ConnectionLost(err.to_string()))?;
        tcp.set_read_timeout(Some(self.connect_timeout))
            .and_then(|()| tcp.set_write_timeout(Some(self.connect_timeout)))
            .map_err(|err| SessionError::ConnectionLost(err.to_string()))?;

        let server_name = ServerName::try_from(self.broker.host.clone())
            .map_err(|err| SessionError::ConnectionLost(err.to_string()))?;
        let config = Arc::new(pinned_tls_config(self.broker.fingerprint));
        let mut tls = rustls::ClientConnection::new(config, server_name)
            .map_err(|err| SessionError::ConnectionLost(err.to_string()))?;

        // A pin mismatch surfaces here as a handshake error.
        while tls.is_handshaking() {
            tls.complete_io(&mut tcp)
                .map_err(|err| SessionError::ConnectionLost(err.to_string()))?;
        }

        tls.send_close_notify();
        let _ = tls.complete_io(&mut tcp);
        Ok(())
    }
}

impl BrokerSession for SecureBrokerSession {
    fn connect(&mut self) -> Result<(), SessionError> {
        self.disconnect();

        let mut options = MqttOptions::new(
            self.client_id.clone(),
            self.broker.host.clone(),
            self.broker.port,
        );
        options.set_keep_alive(Duration::from_secs(u64::from(self.broker.keep_alive_secs)));
        if !self.broker.username.is_empty() {
            options.set_credentials(self.broker.username.clone(), self.broker.password.clone());
        }
        options.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(
            pinned_tls_config(self.broker.fingerprint),
        ))));

        let (client, mut connection) = Client::new(options, 16);

        client
            .subscribe(self.broker.command_topic.clone(), QoS::AtLeastOnce)
            .map_err(|err| SessionError::ConnectFailed(err.to_string()))?;

        self.await_session_up(&mut connection)?;

        info!(
            host = %self.broker.host,
            port = self.broker.port,
            "broker session established, command topic subscribed"
        );
        self.handle = Some(SessionHandle { client, connection });
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        let handle = self.handle.as_mut().ok_or(SessionError::NotConnected)?;
        handle
            .client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|err| SessionError::PublishFailed(err.to_string()))
    }

    fn poll_for_message(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<InboundMessage>, SessionError> {
        // Messages already taken off the wire come first; they were acked
        // when the event loop received them.
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }

        let handle = self.handle.as_mut().ok_or(SessionError::NotConnected)?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return Ok(None),
            };

            match handle.connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Incoming::Publish(publish)))) => {
                    return Ok(Some(InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    }));
                }
                // Acks and pings keep the loop warm but are not messages.
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(SessionError::ConnectionLost(err.to_string())),
                Err(_) => return Ok(None),
            }
        }
    }

    fn liveness_check(&mut self) -> LivenessReport {
        let ping_ok = match &mut self.handle {
            Some(handle) => {
                let deadline = Instant::now() + self.liveness_window;
                let mut healthy = true;
                // Drive the event loop for the window; keepalive failures and
                // dead links surface as connection errors here.
                while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                    match handle.connection.recv_timeout(remaining) {
                        Ok(Ok(Event::Incoming(Incoming::Publish(publish)))) => {
                            self.pending.push_back(InboundMessage {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            });
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => {
                            warn!("broker event loop error during liveness window: {err}");
                            healthy = false;
                            break;
                        }
                        Err(_) => break,
                    }
                }
                healthy
            }
            None => false,
        };

        let fingerprint_ok = self.probe_fingerprint();
        LivenessReport {
            ping_ok,
            fingerprint_ok,
        }
    }

    fn disconnect(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.client.disconnect();
            // Give the outgoing DISCONNECT a moment to flush, then drop.
            let mut connection = handle.connection;
            let deadline = Instant::now() + Duration::from_millis(250);
            while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                match connection.recv_timeout(remaining) {
                    Ok(Ok(_)) => {}
                    _ => break,
                }
            }
            debug!("broker session closed");
        }
    }
}
