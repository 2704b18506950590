//! Queue rows and the messages built from them

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{NotificationError, NotificationResult};

pub const ATTENDANCE_ALERT_TEMPLATE: &str = "ATTENDANCE_ALERT";
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Queue row lifecycle: PENDING -> PROCESSING -> SENT, or back to PENDING
/// with a later `next_retry_at`, or FAILED once attempts run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "notification_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "PENDING",
            NotificationStatus::Processing => "PROCESSING",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub academy_id: Uuid,
    pub template_code: String,
    /// Phone number or other provider-specific address
    pub recipient: String,
    pub variables: serde_json::Value,
    pub status: NotificationStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<OffsetDateTime>,
    pub provider_message_key: Option<String>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub processed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    pub academy_id: Uuid,
    pub template_code: String,
    pub recipient: String,
    pub variables: serde_json::Value,
    pub max_attempts: i32,
}

impl NewNotification {
    pub fn new(
        academy_id: Uuid,
        template_code: impl Into<String>,
        recipient: impl Into<String>,
        variables: serde_json::Value,
    ) -> Self {
        Self {
            academy_id,
            template_code: template_code.into(),
            recipient: recipient.into(),
            variables,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn validate(&self) -> NotificationResult<()> {
        if self.template_code.trim().is_empty() {
            return Err(NotificationError::InvalidInput(
                "template_code is empty".to_string(),
            ));
        }
        if self.recipient.trim().is_empty() {
            return Err(NotificationError::InvalidInput("recipient is empty".to_string()));
        }
        if self.max_attempts < 1 {
            return Err(NotificationError::InvalidInput(format!(
                "max_attempts must be at least 1, got {}",
                self.max_attempts
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceEvent {
    CheckIn,
    CheckOut,
    Late,
    Absent,
}

impl AttendanceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceEvent::CheckIn => "CHECK_IN",
            AttendanceEvent::CheckOut => "CHECK_OUT",
            AttendanceEvent::Late => "LATE",
            AttendanceEvent::Absent => "ABSENT",
        }
    }
}

/// Alert to a guardian about a student's attendance event
pub fn attendance_alert(
    academy_id: Uuid,
    guardian_phone: &str,
    student_name: &str,
    event: AttendanceEvent,
    occurred_at: OffsetDateTime,
) -> NotificationResult<NewNotification> {
    let occurred_at = occurred_at
        .format(&Rfc3339)
        .map_err(|e| NotificationError::InvalidInput(e.to_string()))?;

    let alert = NewNotification::new(
        academy_id,
        ATTENDANCE_ALERT_TEMPLATE,
        guardian_phone,
        serde_json::json!({
            "studentName": student_name,
            "event": event.as_str(),
            "occurredAt": occurred_at,
        }),
    );
    alert.validate()?;
    Ok(alert)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_attendance_alert_variables() {
        let alert = attendance_alert(
            Uuid::new_v4(),
            "010-1234-5678",
            "Kim Minji",
            AttendanceEvent::CheckIn,
            datetime!(2024-03-05 15:30 +09:00),
        )
        .unwrap();

        assert_eq!(alert.template_code, ATTENDANCE_ALERT_TEMPLATE);
        assert_eq!(alert.recipient, "010-1234-5678");
        assert_eq!(alert.max_attempts, 3);
        assert_eq!(alert.variables["event"], "CHECK_IN");
        assert_eq!(alert.variables["studentName"], "Kim Minji");
        assert_eq!(alert.variables["occurredAt"], "2024-03-05T15:30:00+09:00");
    }

    #[test]
    fn test_empty_recipient_rejected() {
        let result = attendance_alert(
            Uuid::new_v4(),
            "  ",
            "Kim Minji",
            AttendanceEvent::Absent,
            datetime!(2024-03-05 15:30 UTC),
        );
        assert!(matches!(result, Err(NotificationError::InvalidInput(_))));
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let mut alert = NewNotification::new(Uuid::new_v4(), "T", "r", serde_json::json!({}));
        alert.max_attempts = 0;
        assert!(alert.validate().is_err());
    }
}
