//! The heartbeat workflow: quota read, heartbeat file upload, mail send and
//! calendar event creation, run in order against one bearer token.
//!
//! Every step must succeed before the next one starts. A failure stops the
//! run and is reported as a [`WorkflowError`] naming the step; the partial
//! progress is dropped so callers only ever see a complete
//! [`HeartbeatReport`].

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, instrument};

use crate::config::TargetMode;
use crate::graph::{GatewayError, GraphApi};
use crate::model::{
    CalendarEvent, Credential, DriveQuota, HeartbeatReport, Step, WorkflowVariant, NOT_AVAILABLE,
};

pub const HEARTBEAT_FOLDER: &str = "Dev-Heartbeat";
pub const FILE_PREFIX: &str = "local-heartbeat-";
pub const MAIL_SUBJECT: &str = "[Heartbeat] Graph connectivity check";
pub const EVENT_SUBJECT: &str = "[Heartbeat] Graph connectivity event";
pub const EVENT_LOCATION: &str = "Graph Heartbeat";

const EVENT_LEAD_MINUTES: i64 = 10;
const EVENT_LENGTH_MINUTES: i64 = 30;
const EVENT_WIRE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

static FILE_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2})T(\d{2})-(\d{2})-(\d{2})-(\d{3})Z$").expect("valid regex")
});

#[derive(Debug, Error)]
#[error("heartbeat step {step} failed: {source}")]
pub struct WorkflowError {
    pub step: Step,
    #[source]
    pub source: GatewayError,
}

impl WorkflowError {
    fn at(step: Step) -> impl FnOnce(GatewayError) -> WorkflowError {
        move |source| WorkflowError { step, source }
    }
}

/// `2024-05-01T08:30:15.123Z`, the JavaScript `toISOString` shape.
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Filesystem-safe form of an ISO timestamp: every `:` and `.` becomes `-`.
pub fn file_token(iso: &str) -> String {
    iso.replace([':', '.'], "-")
}

/// Inverse of [`file_token`] for tokens built from [`iso_timestamp`].
pub fn parse_file_token(token: &str) -> Option<DateTime<Utc>> {
    let caps = FILE_TOKEN_RE.captures(token)?;
    let iso = format!(
        "{}T{}:{}:{}.{}Z",
        &caps[1], &caps[2], &caps[3], &caps[4], &caps[5]
    );
    DateTime::parse_from_rfc3339(&iso)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn heartbeat_file_name(at: DateTime<Utc>) -> String {
    format!("{FILE_PREFIX}{}.txt", file_token(&iso_timestamp(at)))
}

/// Timestamp embedded in a heartbeat file name, if it is one of ours.
pub fn parse_heartbeat_file_name(name: &str) -> Option<DateTime<Utc>> {
    let token = name.strip_prefix(FILE_PREFIX)?.strip_suffix(".txt")?;
    parse_file_token(token)
}

/// Plaintext body uploaded as the heartbeat file.
pub fn heartbeat_content(token: &str, target: &str, quota: &DriveQuota) -> String {
    [
        "Graph heartbeat".to_string(),
        format!("timestamp={token}"),
        format!("upn={target}"),
        format!("drive_type={}", quota.drive_type),
        format!("quota_used={}", quota.used_display()),
        format!("quota_total={}", quota.total_display()),
    ]
    .join("\n")
}

/// Calendar window: starts 10 minutes after `now` and lasts 30 minutes.
pub fn event_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now + Duration::minutes(EVENT_LEAD_MINUTES);
    let end = start + Duration::minutes(EVENT_LENGTH_MINUTES);
    (start, end)
}

/// Wire form for Graph `dateTimeTimeZone`: no milliseconds, no offset.
pub fn event_wire_time(at: DateTime<Utc>) -> String {
    at.format(EVENT_WIRE_FORMAT).to_string()
}

pub fn parse_event_wire_time(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, EVENT_WIRE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn mail_body(target: &str, now: DateTime<Utc>, quota: &DriveQuota) -> Value {
    json!({
        "message": {
            "subject": MAIL_SUBJECT,
            "body": {
                "contentType": "Text",
                "content": format!(
                    "This is a test message sent by the Graph heartbeat.\n\nTime: {}\nOneDrive used/total: {}\n",
                    iso_timestamp(now),
                    quota.summary()
                ),
            },
            "toRecipients": [
                { "emailAddress": { "address": target } }
            ],
        },
        "saveToSentItems": true,
    })
}

pub fn event_body(target: &str, now: DateTime<Utc>) -> Value {
    let (start, end) = event_window(now);
    json!({
        "subject": EVENT_SUBJECT,
        "body": {
            "contentType": "HTML",
            "content": format!(
                "<p>Test event created by the Graph heartbeat.</p><p>Time: {} ~ {}</p>",
                iso_timestamp(start),
                iso_timestamp(end)
            ),
        },
        "start": { "dateTime": event_wire_time(start), "timeZone": "UTC" },
        "end": { "dateTime": event_wire_time(end), "timeZone": "UTC" },
        "location": { "displayName": EVENT_LOCATION },
        "attendees": [
            {
                "type": "required",
                "emailAddress": { "address": target }
            }
        ],
    })
}

/// Quota snapshot from a `drive` resource. Missing quota numbers are kept as
/// `None`; a missing `driveType` becomes the placeholder.
pub fn parse_drive_quota(drive: &Value) -> Result<DriveQuota, GatewayError> {
    if !drive.is_object() {
        return Err(GatewayError::UnexpectedBody(
            "drive resource is not a JSON object".into(),
        ));
    }
    let drive_type = drive
        .get("driveType")
        .and_then(Value::as_str)
        .unwrap_or(NOT_AVAILABLE);
    let quota = drive.get("quota");
    let number = |field: &str| quota.and_then(|q| q.get(field)).and_then(Value::as_u64);
    Ok(DriveQuota {
        drive_type: drive_type.to_string(),
        used: number("used"),
        total: number("total"),
    })
}

fn parse_created_event(resp: &Value) -> Result<CalendarEvent, GatewayError> {
    let id = resp
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| GatewayError::UnexpectedBody("created event has no id".into()))?;
    let subject = resp
        .get("subject")
        .and_then(Value::as_str)
        .unwrap_or(EVENT_SUBJECT);
    Ok(CalendarEvent {
        id: id.to_string(),
        subject: subject.to_string(),
    })
}

/// Results gathered so far. Never leaves this module.
#[derive(Default)]
struct Progress {
    quota: Option<DriveQuota>,
    upload: Option<(String, u16)>,
    mail_sent_to: Option<String>,
    event: Option<CalendarEvent>,
}

pub struct HeartbeatWorkflow<'a> {
    api: &'a dyn GraphApi,
    target_identity: String,
    target_mode: TargetMode,
    variant: WorkflowVariant,
}

impl<'a> HeartbeatWorkflow<'a> {
    pub fn new(
        api: &'a dyn GraphApi,
        target_identity: impl Into<String>,
        target_mode: TargetMode,
        variant: WorkflowVariant,
    ) -> Self {
        Self {
            api,
            target_identity: target_identity.into(),
            target_mode,
            variant,
        }
    }

    pub fn target_identity(&self) -> &str {
        &self.target_identity
    }

    /// `me/drive` or `users/{upn}/drive`.
    pub fn drive_path(&self) -> String {
        match self.target_mode {
            TargetMode::Me => "me/drive".to_string(),
            TargetMode::User => format!("users/{}/drive", self.target_identity),
        }
    }

    pub fn upload_path(&self, file_name: &str) -> String {
        format!(
            "{}/root:/{HEARTBEAT_FOLDER}/{file_name}:/content",
            self.drive_path()
        )
    }

    pub async fn run(&self, token: &Credential) -> Result<HeartbeatReport, WorkflowError> {
        self.run_at(token, Utc::now()).await
    }

    #[instrument(skip_all, fields(upn = %self.target_identity, variant = self.variant.as_str()))]
    pub async fn run_at(
        &self,
        token: &Credential,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatReport, WorkflowError> {
        let mut progress = Progress::default();
        let mut step = Some(Step::first());
        while let Some(current) = step {
            self.execute(current, token, now, &mut progress)
                .await
                .map_err(WorkflowError::at(current))?;
            step = current.next(self.variant);
        }
        self.finish(now, progress)
    }

    async fn execute(
        &self,
        step: Step,
        token: &Credential,
        now: DateTime<Utc>,
        progress: &mut Progress,
    ) -> Result<(), GatewayError> {
        match step {
            Step::QuotaRead => {
                info!("reading drive quota");
                let drive = self.api.get(&self.drive_path(), token).await?;
                let quota = parse_drive_quota(&drive)?;
                info!(
                    drive_type = %quota.drive_type,
                    used = %quota.used_display(),
                    total = %quota.total_display(),
                    "drive quota"
                );
                progress.quota = Some(quota);
            }
            Step::FileWrite => {
                let quota = required(&progress.quota, Step::QuotaRead)?;
                let iso = iso_timestamp(now);
                let file_name = heartbeat_file_name(now);
                info!(file = %file_name, "writing heartbeat file");
                let content = heartbeat_content(&file_token(&iso), &self.target_identity, quota);
                let res = self
                    .api
                    .put_raw(&self.upload_path(&file_name), token, content, "text/plain")
                    .await?;
                info!(status = res.status_code, "heartbeat file uploaded");
                progress.upload = Some((file_name, res.status_code));
            }
            Step::MailSend => {
                let quota = required(&progress.quota, Step::QuotaRead)?;
                info!("sending test mail");
                let body = mail_body(&self.target_identity, now, quota);
                self.api.post("me/sendMail", token, &body).await?;
                info!(to = %self.target_identity, "test mail sent");
                progress.mail_sent_to = Some(self.target_identity.clone());
            }
            Step::EventCreate => {
                info!("creating test calendar event");
                let body = event_body(&self.target_identity, now);
                let resp = self.api.post("me/events", token, &body).await?;
                let event = parse_created_event(&resp)?;
                info!(id = %event.id, "calendar event created");
                progress.event = Some(event);
            }
        }
        Ok(())
    }

    fn finish(
        &self,
        now: DateTime<Utc>,
        progress: Progress,
    ) -> Result<HeartbeatReport, WorkflowError> {
        let Progress {
            quota,
            upload,
            mail_sent_to,
            event,
        } = progress;
        let drive_quota = quota.ok_or_else(|| incomplete(Step::QuotaRead))?;
        let (uploaded_file_name, upload_status_code) =
            upload.ok_or_else(|| incomplete(Step::FileWrite))?;
        if self.variant == WorkflowVariant::Full {
            if mail_sent_to.is_none() {
                return Err(incomplete(Step::MailSend));
            }
            if event.is_none() {
                return Err(incomplete(Step::EventCreate));
            }
        }
        Ok(HeartbeatReport {
            timestamp: now,
            target_identity: self.target_identity.clone(),
            drive_quota,
            uploaded_file_name,
            upload_status_code,
            mail_sent_to,
            calendar_event: event,
        })
    }
}

fn required<T>(slot: &Option<T>, producer: Step) -> Result<&T, GatewayError> {
    slot.as_ref().ok_or_else(|| {
        GatewayError::UnexpectedBody(format!("{producer} result missing"))
    })
}

fn incomplete(step: Step) -> WorkflowError {
    WorkflowError {
        step,
        source: GatewayError::UnexpectedBody(format!("{step} did not complete")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 15).unwrap() + Duration::milliseconds(123)
    }

    #[test]
    fn file_token_replaces_colons_and_dots() {
        let iso = iso_timestamp(fixed_now());
        assert_eq!(iso, "2024-05-01T08:30:15.123Z");
        assert_eq!(file_token(&iso), "2024-05-01T08-30-15-123Z");
        assert_eq!(file_token(&iso), file_token(&iso));
    }

    #[test]
    fn file_token_round_trips() {
        let now = fixed_now();
        let token = file_token(&iso_timestamp(now));
        assert_eq!(parse_file_token(&token), Some(now));
        assert_eq!(parse_file_token("2024-05-01T08:30:15.123Z"), None);
        assert_eq!(parse_file_token("not-a-token"), None);
    }

    #[test]
    fn file_name_is_prefixed_and_parseable() {
        let name = heartbeat_file_name(fixed_now());
        assert_eq!(name, "local-heartbeat-2024-05-01T08-30-15-123Z.txt");
        assert_eq!(parse_heartbeat_file_name(&name), Some(fixed_now()));
        assert_eq!(parse_heartbeat_file_name("other.txt"), None);
    }

    #[test]
    fn distinct_milliseconds_give_distinct_names() {
        let a = heartbeat_file_name(fixed_now());
        let b = heartbeat_file_name(fixed_now() + Duration::milliseconds(1));
        assert_ne!(a, b);
    }

    #[test]
    fn content_uses_placeholder_for_missing_quota() {
        let quota = DriveQuota {
            drive_type: "business".into(),
            used: None,
            total: None,
        };
        let content = heartbeat_content("tok", "a@b.com", &quota);
        assert_eq!(
            content,
            "Graph heartbeat\ntimestamp=tok\nupn=a@b.com\ndrive_type=business\nquota_used=n/a\nquota_total=n/a"
        );
    }

    #[test]
    fn parse_drive_quota_tolerates_missing_quota() {
        let quota = parse_drive_quota(&json!({ "driveType": "personal" })).unwrap();
        assert_eq!(quota.used, None);
        assert_eq!(quota.total, None);

        let quota = parse_drive_quota(&json!({
            "driveType": "business",
            "quota": { "used": 10, "total": 100 }
        }))
        .unwrap();
        assert_eq!((quota.used, quota.total), (Some(10), Some(100)));

        assert!(parse_drive_quota(&json!(null)).is_err());
    }

    #[test]
    fn parse_drive_quota_uses_placeholder_for_missing_drive_type() {
        let quota = parse_drive_quota(&json!({ "quota": { "used": 5 } })).unwrap();
        assert_eq!(quota.drive_type, "n/a");
        assert_eq!(quota.used, Some(5));
        assert_eq!(quota.total, None);

        let content = heartbeat_content("tok", "a@b.com", &quota);
        assert!(content.contains("drive_type=n/a\nquota_used=5\nquota_total=n/a"));
    }

    #[test]
    fn event_window_and_wire_format() {
        let (start, end) = event_window(fixed_now());
        assert_eq!(end - start, Duration::minutes(30));
        assert_eq!(start - fixed_now(), Duration::minutes(10));

        let body = event_body("a@b.com", fixed_now());
        assert_eq!(body["start"]["dateTime"], "2024-05-01T08:40:15");
        assert_eq!(body["end"]["dateTime"], "2024-05-01T09:10:15");
        assert_eq!(body["start"]["timeZone"], "UTC");
        assert_eq!(body["attendees"][0]["type"], "required");
        assert_eq!(body["attendees"][0]["emailAddress"]["address"], "a@b.com");
        assert_eq!(
            parse_event_wire_time("2024-05-01T08:40:15"),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 40, 15).unwrap())
        );
    }

    #[test]
    fn mail_body_targets_identity_and_keeps_copy() {
        let quota = DriveQuota {
            drive_type: "business".into(),
            used: Some(1),
            total: Some(2),
        };
        let body = mail_body("a@b.com", fixed_now(), &quota);
        assert_eq!(body["saveToSentItems"], true);
        assert_eq!(
            body["message"]["toRecipients"][0]["emailAddress"]["address"],
            "a@b.com"
        );
        let content = body["message"]["body"]["content"].as_str().unwrap();
        assert!(content.contains("2024-05-01T08:30:15.123Z"));
        assert!(content.contains("1 / 2"));
    }

    #[test]
    fn created_event_requires_id() {
        let event = parse_created_event(&json!({ "id": "evt-1" })).unwrap();
        assert_eq!(event.subject, EVENT_SUBJECT);
        assert!(parse_created_event(&json!({ "subject": "x" })).is_err());
    }
}
