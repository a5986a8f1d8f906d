//! Request/reply client for an external work queue.
//!
//! Each request is a bare JSON integer code POSTed to the queue URL. The queue
//! answers with either an object carrying a `filename`, or an integer status code.
//! A request that times out or fails at the transport level is retried with a
//! fresh connection until the retry budget is spent.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

use super::{WorkItem, WorkSource};
use crate::config::QueueSettings;

/// Request codes understood by the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestCode {
    /// Return the head of the queue without removing it.
    Peek = 0,
    /// Return the head of the queue and remove it.
    Pop = 1,
    /// Remove the head of the queue.
    Remove = 2,
}

/// Reply code meaning the queue is empty.
const NO_DATA: i64 = 0;

/// Interpreted queue reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueReply {
    Filename(String),
    Empty,
    Status(i64),
    Malformed(String),
}

impl QueueReply {
    pub fn interpret(reply: Value) -> Self {
        match reply {
            Value::Object(map) => {
                if let Some(Value::String(name)) = map.get("filename") {
                    return Self::Filename(name.clone());
                }
                Self::Malformed(Value::Object(map).to_string())
            }
            Value::Number(code) => match code.as_i64() {
                Some(NO_DATA) => Self::Empty,
                Some(other) => Self::Status(other),
                None => Self::Malformed(code.to_string()),
            },
            other => Self::Malformed(other.to_string()),
        }
    }
}

pub struct QueueSource {
    url: String,
    timeout: Duration,
    retries: u32,
}

impl QueueSource {
    pub fn new(settings: &QueueSettings) -> Result<Self> {
        url::Url::parse(&settings.url)
            .with_context(|| format!("invalid message queue url '{}'", settings.url))?;
        log::info!("message queue at {}", settings.url);
        Ok(Self {
            url: settings.url.clone(),
            timeout: settings.request_timeout,
            retries: settings.request_retries.max(1),
        })
    }

    /// Send one request, reconnecting on failure until the retry budget runs out.
    pub fn request(&self, code: RequestCode) -> Result<Value> {
        log::debug!("queue request code {}", code as u8);
        let mut last_error = None;
        for attempt in 1..=self.retries {
            // A fresh agent per attempt drops any half-open connection.
            let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
            match agent.post(&self.url).send_json(code as u8) {
                Ok(response) => {
                    return response
                        .into_json::<Value>()
                        .context("queue reply was not JSON");
                }
                Err(err) => {
                    log::warn!(
                        "no response from queue ({}), {} retries left",
                        err,
                        self.retries - attempt
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(anyhow!(
            "message queue {} unreachable after {} attempts: {}",
            self.url,
            self.retries,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
    }
}

impl WorkSource for QueueSource {
    fn name(&self) -> &str {
        "message_queue"
    }

    fn next_item(&mut self) -> Result<Option<WorkItem>> {
        match QueueReply::interpret(self.request(RequestCode::Pop)?) {
            QueueReply::Filename(name) => Ok(Some(WorkItem::new(name))),
            QueueReply::Empty => Ok(None),
            QueueReply::Status(code) => {
                log::info!("queue replied with code {}", code);
                Ok(None)
            }
            QueueReply::Malformed(raw) => {
                log::error!("no filename in queue reply: {}", raw);
                Ok(None)
            }
        }
    }
}
