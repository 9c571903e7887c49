use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder rendered wherever Graph omitted a quota number.
pub const NOT_AVAILABLE: &str = "n/a";

/// Bearer token for one run. Never persisted, never refreshed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Step {
    QuotaRead,
    FileWrite,
    MailSend,
    EventCreate,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::QuotaRead => "quota_read",
            Step::FileWrite => "file_write",
            Step::MailSend => "mail_send",
            Step::EventCreate => "event_create",
        }
    }

    /// First step of every run.
    pub fn first() -> Step {
        Step::QuotaRead
    }

    /// Step that follows `self` for the given variant, `None` once the run is done.
    pub fn next(&self, variant: WorkflowVariant) -> Option<Step> {
        match (self, variant) {
            (Step::QuotaRead, _) => Some(Step::FileWrite),
            (Step::FileWrite, WorkflowVariant::Full) => Some(Step::MailSend),
            (Step::FileWrite, WorkflowVariant::StorageOnly) => None,
            (Step::MailSend, _) => Some(Step::EventCreate),
            (Step::EventCreate, _) => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowVariant {
    /// Quota read, file write, mail send and event create.
    #[default]
    Full,
    /// Quota read and file write only.
    #[value(alias = "storage_only")]
    StorageOnly,
}

impl WorkflowVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowVariant::Full => "full",
            WorkflowVariant::StorageOnly => "storage_only",
        }
    }

    /// Steps executed by this variant, in order.
    pub fn steps(&self) -> Vec<Step> {
        let mut steps = vec![Step::first()];
        while let Some(next) = steps.last().and_then(|s| s.next(*self)) {
            steps.push(next);
        }
        steps
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriveQuota {
    pub drive_type: String,
    pub used: Option<u64>,
    pub total: Option<u64>,
}

impl DriveQuota {
    pub fn used_display(&self) -> String {
        display_or_placeholder(self.used)
    }

    pub fn total_display(&self) -> String {
        display_or_placeholder(self.total)
    }

    /// `used / total` with placeholders for missing numbers.
    pub fn summary(&self) -> String {
        format!("{} / {}", self.used_display(), self.total_display())
    }
}

fn display_or_placeholder(value: Option<u64>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalendarEvent {
    pub id: String,
    pub subject: String,
}

/// Outcome of a completed heartbeat. Only built once every step of the
/// chosen variant has succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub timestamp: DateTime<Utc>,
    pub target_identity: String,
    pub drive_quota: DriveQuota,
    pub uploaded_file_name: String,
    pub upload_status_code: u16,
    pub mail_sent_to: Option<String>,
    pub calendar_event: Option<CalendarEvent>,
}

/// Teams incoming-webhook message card.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationPayload {
    #[serde(rename = "@type")]
    pub card_type: String,
    #[serde(rename = "@context")]
    pub context: String,
    pub summary: String,
    #[serde(rename = "themeColor")]
    pub theme_color: String,
    pub title: String,
    pub text: String,
}

impl NotificationPayload {
    pub fn message_card(title: &str, theme_color: &str, text: String) -> Self {
        Self {
            card_type: "MessageCard".into(),
            context: "https://schema.org/extensions".into(),
            summary: "Graph heartbeat".into(),
            theme_color: theme_color.into(),
            title: title.into(),
            text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_variant_walks_all_steps() {
        assert_eq!(
            WorkflowVariant::Full.steps(),
            vec![
                Step::QuotaRead,
                Step::FileWrite,
                Step::MailSend,
                Step::EventCreate
            ]
        );
    }

    #[test]
    fn storage_only_stops_after_file_write() {
        assert_eq!(
            WorkflowVariant::StorageOnly.steps(),
            vec![Step::QuotaRead, Step::FileWrite]
        );
        assert_eq!(Step::FileWrite.next(WorkflowVariant::StorageOnly), None);
    }

    #[test]
    fn quota_summary_uses_placeholder() {
        let quota = DriveQuota {
            drive_type: "business".into(),
            used: Some(42),
            total: None,
        };
        assert_eq!(quota.summary(), "42 / n/a");
    }

    #[test]
    fn credential_debug_redacts_token() {
        let cred = Credential::new("secret-token");
        let rendered = format!("{:?}", cred);
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn message_card_serializes_teams_keys() {
        let card = NotificationPayload::message_card("t", "0076D7", "body".into());
        let value = serde_json::to_value(&card).unwrap();
        assert_eq!(value["@type"], "MessageCard");
        assert_eq!(value["@context"], "https://schema.org/extensions");
        assert_eq!(value["themeColor"], "0076D7");
        assert_eq!(value["text"], "body");
    }
}
