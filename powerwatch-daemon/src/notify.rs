//! Discord and Todoist notifications for appliance transitions.
//!
//! Each notifier looks up the configured text for the event's appliance and
//! transition; without a text nothing is sent. One attempt per event.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use powerwatch::{ApplianceEvent, EventSink};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{DiscordConf, NotifyMessages, TodoistConf};

/// HTTP request timeout for a single notification.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{service} returned HTTP {status}")]
    HttpStatus { service: &'static str, status: u16 },
}

fn http_client() -> Result<reqwest::Client, NotifyError> {
    Ok(reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

async fn post_json<T: Serialize + ?Sized>(
    service: &'static str,
    request: reqwest::RequestBuilder,
    body: &T,
) -> Result<(), NotifyError> {
    let response = request.json(body).send().await?;
    if !response.status().is_success() {
        return Err(NotifyError::HttpStatus {
            service,
            status: response.status().as_u16(),
        });
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct DiscordMessage<'a> {
    content: &'a str,
    username: &'a str,
}

pub struct DiscordNotifier {
    client: reqwest::Client,
    conf: DiscordConf,
    messages: HashMap<String, NotifyMessages>,
}

impl DiscordNotifier {
    pub fn new(
        conf: DiscordConf,
        messages: impl IntoIterator<Item = (String, NotifyMessages)>,
    ) -> Result<Self, NotifyError> {
        Ok(Self {
            client: http_client()?,
            conf,
            messages: messages.into_iter().collect(),
        })
    }
}

#[async_trait]
impl EventSink for DiscordNotifier {
    fn name(&self) -> &str {
        "discord"
    }

    async fn publish(&self, event: &ApplianceEvent) -> anyhow::Result<()> {
        let Some(content) = self
            .messages
            .get(&event.ain)
            .and_then(|m| m.discord(event.transition))
        else {
            debug!(ain = %event.ain, "no discord message configured");
            return Ok(());
        };

        let message = DiscordMessage {
            content,
            username: &self.conf.username,
        };
        post_json("discord", self.client.post(&self.conf.webhook_url), &message).await?;
        info!(ain = %event.ain, "discord notification sent");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct TodoistTask<'a> {
    content: &'a str,
    due_string: &'a str,
    due_lang: &'a str,
    project_id: &'a str,
}

pub struct TodoistNotifier {
    client: reqwest::Client,
    conf: TodoistConf,
    messages: HashMap<String, NotifyMessages>,
}

impl TodoistNotifier {
    pub fn new(
        conf: TodoistConf,
        messages: impl IntoIterator<Item = (String, NotifyMessages)>,
    ) -> Result<Self, NotifyError> {
        Ok(Self {
            client: http_client()?,
            conf,
            messages: messages.into_iter().collect(),
        })
    }
}

#[async_trait]
impl EventSink for TodoistNotifier {
    fn name(&self) -> &str {
        "todoist"
    }

    async fn publish(&self, event: &ApplianceEvent) -> anyhow::Result<()> {
        let Some(content) = self
            .messages
            .get(&event.ain)
            .and_then(|m| m.todoist(event.transition))
        else {
            debug!(ain = %event.ain, "no todoist task configured");
            return Ok(());
        };

        let task = TodoistTask {
            content,
            due_string: "today",
            due_lang: "en",
            project_id: &self.conf.project_id,
        };
        let request = self
            .client
            .post(&self.conf.api_url)
            .bearer_auth(&self.conf.access_token);
        post_json("todoist", request, &task).await?;
        info!(ain = %event.ain, "todoist task created");
        Ok(())
    }
}
