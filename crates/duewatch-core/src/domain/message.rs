//! ReminderMessage - the payload carried on the reminder queue.
//!
//! Field names on the wire are PascalCase (`TaskId`, `Title`, `DueDate`,
//! `UserFullName`, `UserEmail`, `SentAt`) so producers and consumers written
//! against the existing queue keep interoperating.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TaskId, TaskRef};

/// Content type stamped on every published reminder.
pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("encode reminder: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("decode reminder: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("unsupported content type: {0}")]
    ContentType(String),
}

/// One reminder for one overdue task.
///
/// Immutable once built: the scanner constructs it, the queue carries a copy,
/// the consumer decodes its own copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReminderMessage {
    task_id: TaskId,
    title: String,
    #[serde(with = "iso8601")]
    due_date: DateTime<Utc>,
    user_full_name: String,
    user_email: String,
    #[serde(with = "iso8601")]
    sent_at: DateTime<Utc>,
}

impl ReminderMessage {
    pub fn new(
        task_id: TaskId,
        title: impl Into<String>,
        due_date: DateTime<Utc>,
        user_full_name: impl Into<String>,
        user_email: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            title: title.into(),
            due_date,
            user_full_name: user_full_name.into(),
            user_email: user_email.into(),
            sent_at,
        }
    }

    pub fn for_task(task: &TaskRef, sent_at: DateTime<Utc>) -> Self {
        Self::new(
            task.id,
            task.title.clone(),
            task.due_at,
            task.user_full_name.clone(),
            task.user_email.clone(),
            sent_at,
        )
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn due_date(&self) -> DateTime<Utc> {
        self.due_date
    }

    pub fn user_full_name(&self) -> &str {
        &self.user_full_name
    }

    pub fn user_email(&self) -> &str {
        &self.user_email
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    /// UTF-8 JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Encode)
    }

    pub fn decode(body: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(body).map_err(MessageError::Decode)
    }

    /// Decode after checking the transport's content type marker.
    ///
    /// A missing marker is accepted; a different one is not.
    pub fn decode_with_content_type(
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<Self, MessageError> {
        match content_type {
            None => Self::decode(body),
            Some(ct) if is_json_content_type(ct) => Self::decode(body),
            Some(other) => Err(MessageError::ContentType(other.to_string())),
        }
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|essence| essence.trim().eq_ignore_ascii_case(CONTENT_TYPE_JSON))
        .unwrap_or(false)
}

/// ISO-8601 timestamps.
///
/// Always written as UTC with a `Z` suffix. On read, timestamps without an
/// offset (some producers emit `2026-01-01T00:00:00`) are taken as UTC.
mod iso8601 {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Ok(with_offset) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(with_offset.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| D::Error::custom(format!("invalid ISO-8601 timestamp {raw:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RowVersion;
    use chrono::TimeZone;

    fn sample() -> ReminderMessage {
        ReminderMessage::new(
            TaskId::new(100),
            "Set up CI pipeline",
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            "Dana Levi",
            "dana@example.com",
            Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn wire_field_names_are_pascal_case() {
        let body = sample().encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value["TaskId"], 100);
        assert_eq!(value["Title"], "Set up CI pipeline");
        assert_eq!(value["DueDate"], "2026-01-01T00:00:00Z");
        assert_eq!(value["UserFullName"], "Dana Levi");
        assert_eq!(value["UserEmail"], "dana@example.com");
        assert_eq!(value["SentAt"], "2026-01-02T00:00:00Z");
    }

    #[test]
    fn decodes_timestamps_without_offset_as_utc() {
        let body = br#"{
            "TaskId": 7,
            "Title": "Renew certificate",
            "DueDate": "2026-02-21T20:14:11",
            "UserFullName": "Noa Cohen",
            "UserEmail": "noa@example.com",
            "SentAt": "2026-02-22T08:00:00.1234567Z"
        }"#;

        let msg = ReminderMessage::decode(body).unwrap();
        assert_eq!(msg.task_id(), TaskId::new(7));
        assert_eq!(
            msg.due_date(),
            Utc.with_ymd_and_hms(2026, 2, 21, 20, 14, 11).unwrap()
        );
        assert_eq!(msg.user_email(), "noa@example.com");
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(
            ReminderMessage::decode(b"not json"),
            Err(MessageError::Decode(_))
        ));
        // missing SentAt
        let missing = br#"{"TaskId":1,"Title":"t","DueDate":"2026-01-01T00:00:00Z","UserFullName":"a","UserEmail":"b"}"#;
        assert!(ReminderMessage::decode(missing).is_err());
        // TaskId must be an integer
        let wrong_type = br#"{"TaskId":"one","Title":"t","DueDate":"2026-01-01T00:00:00Z","UserFullName":"a","UserEmail":"b","SentAt":"2026-01-01T00:00:00Z"}"#;
        assert!(ReminderMessage::decode(wrong_type).is_err());
    }

    #[test]
    fn content_type_is_checked_when_present() {
        let body = sample().encode().unwrap();

        assert!(ReminderMessage::decode_with_content_type(&body, None).is_ok());
        assert!(
            ReminderMessage::decode_with_content_type(&body, Some("application/json; charset=utf-8"))
                .is_ok()
        );
        assert!(matches!(
            ReminderMessage::decode_with_content_type(&body, Some("text/plain")),
            Err(MessageError::ContentType(ct)) if ct == "text/plain"
        ));
    }

    #[test]
    fn for_task_copies_reminder_fields() {
        let task = TaskRef {
            id: TaskId::new(3),
            title: "Pay invoice".to_string(),
            due_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            user_full_name: "Avi Mor".to_string(),
            user_email: "avi@example.com".to_string(),
            row_version: RowVersion::new(9),
        };
        let sent_at = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();

        let msg = ReminderMessage::for_task(&task, sent_at);
        assert_eq!(msg.task_id(), task.id);
        assert_eq!(msg.title(), "Pay invoice");
        assert_eq!(msg.due_date(), task.due_at);
        assert_eq!(msg.user_full_name(), "Avi Mor");
        assert_eq!(msg.sent_at(), sent_at);
    }
}
