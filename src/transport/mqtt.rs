//! MQTT result sender.
//!
//! Results are published with QoS 1 to a templated topic. The rumqttc event loop
//! runs on its own thread for the lifetime of the sender; publishing only enqueues
//! and fails instead of blocking once the request queue is full.
//!
//! TLS follows the usual broker setups:
//! - no CA and no client cert: webpki roots
//! - custom CA, optionally with a client cert and key for mutual TLS

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;

use super::template::{resolve_hostname, Substitutions};
use super::ResultSender;
use crate::config::MqttOutputSettings;
use crate::message::ResultMessage;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Publishes buffered while the broker is unreachable.
const REQUEST_CAPACITY: usize = 10;

/// PEM material for TLS connections.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    pub ca: Option<Vec<u8>>,
    /// Client certificate and key, always provided together.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&PathBuf>,
        client_cert_path: Option<&PathBuf>,
        client_key_path: Option<&PathBuf>,
    ) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!(
                        "failed to read MQTT TLS client cert '{}'",
                        cert_path.display()
                    )
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read MQTT TLS client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(anyhow!("MQTT TLS client certificate provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("MQTT TLS client key provided without certificate"))
            }
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `host:port`, `[v6]:port`, `mqtt://host:port` or `mqtts://host:port`.
///
/// Without a TLS scheme, `use_tls` decides; `None` means TLS on port 8883 only.
pub fn parse_mqtt_endpoint(settings: &MqttOutputSettings) -> Result<MqttEndpoint> {
    let mut remainder = settings.broker.trim();
    let mut scheme_tls = None;

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => scheme_tls = Some(false),
            "mqtts" | "ssl" => scheme_tls = Some(true),
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    let use_tls = match (scheme_tls, settings.use_tls) {
        (Some(true), _) => true,
        (Some(false), None) => false,
        _ => settings.tls_enabled_for_port(port),
    };
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

pub fn build_transport(endpoint: &MqttEndpoint, tls: &TlsMaterials) -> Result<Transport> {
    if !endpoint.use_tls {
        if tls.is_configured() {
            return Err(anyhow!(
                "MQTT TLS materials provided but TLS is disabled (set use_tls or use mqtts://)"
            ));
        }
        return Ok(Transport::tcp());
    }

    if !tls.is_configured() {
        return Ok(Transport::tls_with_default_config());
    }

    let ca = tls.ca.clone().ok_or_else(|| {
        anyhow!("MQTT TLS CA certificate is required when providing client certificates")
    })?;
    Ok(Transport::tls(ca, tls.client_auth.clone(), None))
}

struct MqttRuntime {
    client: Client,
    closing: Arc<AtomicBool>,
    connection_handle: Option<std::thread::JoinHandle<()>>,
}

impl MqttRuntime {
    fn new(client: Client, mut connection: Connection) -> Self {
        let closing = Arc::new(AtomicBool::new(false));
        let closing_flag = Arc::clone(&closing);
        let handle = std::thread::spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        if closing_flag.load(Ordering::SeqCst) {
                            break;
                        }
                        log::warn!("MQTT connection error: {}", e);
                        std::thread::sleep(RECONNECT_DELAY);
                    }
                }
            }
        });

        Self {
            client,
            closing,
            connection_handle: Some(handle),
        }
    }

    fn disconnect(&mut self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.client
            .try_disconnect()
            .context("MQTT request queue unavailable")?;
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

pub struct MqttSender {
    topic: String,
    runtime: MqttRuntime,
}

impl MqttSender {
    /// Connect to the configured broker. `${hostname}` in the topic is resolved here.
    pub fn connect(settings: &MqttOutputSettings, hostname: &str) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(settings)?;
        let tls = TlsMaterials::load(
            settings.ca_path.as_ref(),
            settings.client_cert_path.as_ref(),
            settings.client_key_path.as_ref(),
        )?;
        let client_id = format!("pollinator-inference-{}", hostname);

        let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        options.set_transport(build_transport(&endpoint, &tls)?);

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        log::info!(
            "MQTT broker {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );
        Ok(Self {
            topic: resolve_hostname(&settings.topic, hostname),
            runtime: MqttRuntime::new(client, connection),
        })
    }
}

impl ResultSender for MqttSender {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn send(&mut self, message: &ResultMessage, vars: &Substitutions<'_>) -> Result<()> {
        let topic = vars.apply(&self.topic);
        let payload = message.to_json()?;
        // A full request queue means the broker has been unreachable for a while.
        self.runtime
            .client
            .try_publish(topic.as_str(), QoS::AtLeastOnce, false, payload.into_bytes())
            .with_context(|| format!("publish to {} (broker unreachable or queue full)", topic))?;
        log::info!("queued result for MQTT topic {}", topic);
        Ok(())
    }
}

impl Drop for MqttSender {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.disconnect() {
            log::warn!("MQTT disconnect failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_message, sample_vars};
    use std::net::TcpListener;
    use std::sync::mpsc;

    fn settings(broker: &str, use_tls: Option<bool>) -> MqttOutputSettings {
        MqttOutputSettings {
            broker: broker.to_string(),
            topic: "pollinators/${hostname}/${node_id}".to_string(),
            username: None,
            password: None,
            use_tls,
            ca_path: None,
            client_cert_path: None,
            client_key_path: None,
        }
    }

    #[test]
    fn parse_endpoint_plain() {
        let ep = parse_mqtt_endpoint(&settings("127.0.0.1:1883", None)).unwrap();
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 1883);
        assert!(!ep.use_tls);
    }

    #[test]
    fn parse_endpoint_tls_port_default() {
        let ep = parse_mqtt_endpoint(&settings("broker.example.com:8883", None)).unwrap();
        assert!(ep.use_tls);
        let ep = parse_mqtt_endpoint(&settings("broker.example.com:8883", Some(false))).unwrap();
        assert!(!ep.use_tls);
    }

    #[test]
    fn parse_endpoint_mqtts_scheme() {
        let ep = parse_mqtt_endpoint(&settings("mqtts://broker.example.com:9001", None)).unwrap();
        assert_eq!(ep.host, "broker.example.com");
        assert_eq!(ep.port, 9001);
        assert!(ep.use_tls);
    }

    #[test]
    fn parse_endpoint_ipv6() {
        let ep = parse_mqtt_endpoint(&settings("[::1]:1883", None)).unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 1883);
    }

    #[test]
    fn parse_endpoint_rejects_bad_input() {
        assert!(parse_mqtt_endpoint(&settings("ws://broker:80", None)).is_err());
        assert!(parse_mqtt_endpoint(&settings("broker", None)).is_err());
        assert!(parse_mqtt_endpoint(&settings("broker:http", None)).is_err());
    }

    #[test]
    fn tls_materials_requires_both_cert_and_key() {
        let cert_only =
            TlsMaterials::load(None, Some(&PathBuf::from("/nonexistent/cert.pem")), None);
        assert!(cert_only.unwrap_err().to_string().contains("without key"));
    }

    #[test]
    fn plain_transport_rejects_tls_material() {
        let endpoint = MqttEndpoint {
            host: "localhost".into(),
            port: 1883,
            use_tls: false,
        };
        let tls = TlsMaterials {
            ca: Some(b"ca".to_vec()),
            client_auth: None,
        };
        assert!(build_transport(&endpoint, &tls).is_err());
        assert!(build_transport(&endpoint, &TlsMaterials::default()).is_ok());
    }

    #[test]
    fn client_auth_without_ca_is_rejected() {
        let endpoint = MqttEndpoint {
            host: "localhost".into(),
            port: 8883,
            use_tls: true,
        };
        let tls = TlsMaterials {
            ca: None,
            client_auth: Some((b"cert".to_vec(), b"key".to_vec())),
        };
        assert!(build_transport(&endpoint, &tls).is_err());
    }

    #[test]
    fn unreachable_broker_fails_sends_without_blocking() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut sender =
            MqttSender::connect(&settings(&format!("127.0.0.1:{}", port), None), "edge-01")
                .unwrap();

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let results: Vec<bool> = (0..REQUEST_CAPACITY * 3)
                .map(|_| sender.send(&sample_message(), &sample_vars()).is_ok())
                .collect();
            drop(sender);
            tx.send(results).unwrap();
        });

        let results = rx
            .recv_timeout(Duration::from_secs(15))
            .expect("sends and disconnect must not block");
        let queued = results.iter().filter(|ok| **ok).count();
        assert!(queued <= REQUEST_CAPACITY, "queued {}", queued);
        assert!(!results[REQUEST_CAPACITY..].iter().any(|ok| *ok));
    }
}
