use reqwest::{Client, Url};
use std::fmt;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::graph::truncate_body;
use crate::heartbeat::iso_timestamp;
use crate::model::{HeartbeatReport, NotificationPayload};

pub const SUCCESS_TITLE: &str = "Graph heartbeat";
pub const FAILURE_TITLE: &str = "Graph heartbeat failed";
pub const SUCCESS_COLOR: &str = "0076D7";
pub const FAILURE_COLOR: &str = "D70000";

const WARN_BODY_LIMIT: usize = 300;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("webhook returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// What the run hands to the notifier.
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    Success(&'a HeartbeatReport),
    Failure(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// No webhook configured; nothing was sent.
    Skipped,
    Sent,
    /// Webhook call failed; already logged.
    Failed,
}

pub fn success_text(report: &HeartbeatReport) -> String {
    let mut lines = vec![
        "Graph heartbeat completed:".to_string(),
        format!("- Heartbeat file: {}", report.uploaded_file_name),
    ];
    if let Some(to) = &report.mail_sent_to {
        lines.push(format!("- Mail sent to: {to}"));
    }
    if let Some(event) = &report.calendar_event {
        lines.push(format!("- Calendar event: {}", event.subject));
    }
    lines.push(format!(
        "- OneDrive used/total: {}",
        report.drive_quota.summary()
    ));
    lines.push(format!("Time: {}", iso_timestamp(report.timestamp)));
    lines.join("\n")
}

pub fn render(outcome: Outcome<'_>) -> NotificationPayload {
    match outcome {
        Outcome::Success(report) => {
            NotificationPayload::message_card(SUCCESS_TITLE, SUCCESS_COLOR, success_text(report))
        }
        Outcome::Failure(message) => NotificationPayload::message_card(
            FAILURE_TITLE,
            FAILURE_COLOR,
            format!("Graph heartbeat failed:\n{message}"),
        ),
    }
}

#[derive(Clone)]
pub struct Notifier {
    http: Client,
    webhook: Option<Url>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("configured", &self.webhook.is_some())
            .finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new(http: Client, webhook: Option<Url>) -> Self {
        Self { http, webhook }
    }

    pub fn is_configured(&self) -> bool {
        self.webhook.is_some()
    }

    /// Best effort: logs every failure and never returns an error.
    #[instrument(skip_all)]
    pub async fn notify(&self, outcome: Outcome<'_>) -> Delivery {
        let Some(webhook) = &self.webhook else {
            info!("no webhook configured; skipping notification");
            return Delivery::Skipped;
        };
        let payload = render(outcome);
        match self.send(webhook, &payload).await {
            Ok(()) => {
                info!("webhook notification sent");
                Delivery::Sent
            }
            Err(err) => {
                warn!(%err, "failed to send webhook notification");
                Delivery::Failed
            }
        }
    }

    async fn send(&self, webhook: &Url, payload: &NotificationPayload) -> Result<(), NotifyError> {
        let res = self
            .http
            .post(webhook.clone())
            .json(payload)
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body: truncate_body(&body, WARN_BODY_LIMIT),
            });
        }
        Ok(())
    }
}
