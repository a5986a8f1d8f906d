use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};

use super::template::{resolve_hostname, Substitutions};
use super::ResultSender;
use crate::config::{HttpMethod, HttpOutputSettings};
use crate::message::ResultMessage;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends each result as a JSON body to a templated URL.
pub struct HttpSender {
    agent: ureq::Agent,
    url: String,
    method: HttpMethod,
    authorization: Option<String>,
}

impl HttpSender {
    /// `${hostname}` in the URL is resolved here, the other placeholders per message.
    pub fn new(settings: &HttpOutputSettings, hostname: &str) -> Self {
        let authorization = settings.username.as_deref().map(|user| {
            let password = settings.password.as_deref().unwrap_or_default();
            format!("Basic {}", B64.encode(format!("{}:{}", user, password)))
        });
        Self {
            agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
            url: resolve_hostname(&settings.url, hostname),
            method: settings.method,
            authorization,
        }
    }
}

impl ResultSender for HttpSender {
    fn name(&self) -> &str {
        "http"
    }

    fn send(&mut self, message: &ResultMessage, vars: &Substitutions<'_>) -> Result<()> {
        let url = vars.apply(&self.url);
        let mut request = self
            .agent
            .request(self.method.as_str(), &url)
            .set("Content-Type", "application/json");
        if let Some(auth) = &self.authorization {
            request = request.set("Authorization", auth);
        }
        let response = match request.send_string(&message.to_json()?) {
            Ok(response) => response,
            Err(ureq::Error::Status(status, _)) => {
                return Err(anyhow!(
                    "{} {} returned status {}",
                    self.method.as_str(),
                    url,
                    status
                ));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("{} {}", self.method.as_str(), url));
            }
        };
        let status = response.status();
        log::info!("sent result to {} ({})", url, status);
        Ok(())
    }
}
