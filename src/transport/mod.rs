//! Result senders for MQTT and HTTP.
//!
//! Senders receive a fully serialized message and a set of per-message
//! substitutions; they never see partial results. A failed send is reported to the
//! caller, which logs it and moves on.

pub mod http;
pub mod mqtt;
pub mod template;

use anyhow::Result;

use crate::message::ResultMessage;

pub use http::HttpSender;
pub use mqtt::{parse_mqtt_endpoint, MqttEndpoint, MqttSender, TlsMaterials};
pub use template::{local_hostname, Substitutions};

pub trait ResultSender {
    fn name(&self) -> &str;

    fn send(&mut self, message: &ResultMessage, vars: &Substitutions<'_>) -> Result<()>;
}
