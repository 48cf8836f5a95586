use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a delivery log entry.
///
/// ```text
/// queued --> processing --> sent
///                 |
///                 +--> queued  (retry scheduled)
///                 +--> failed  (retries exhausted)
/// ```
///
/// `pending` and `success` are accepted from older rows: `pending` is retryable,
/// `success` counts as delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Queued,
    Processing,
    Pending,
    Sent,
    Failed,
    Success,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 6] = [
        DeliveryStatus::Queued,
        DeliveryStatus::Processing,
        DeliveryStatus::Pending,
        DeliveryStatus::Sent,
        DeliveryStatus::Failed,
        DeliveryStatus::Success,
    ];

    /// Terminal success.
    pub fn is_delivered(self) -> bool {
        matches!(self, DeliveryStatus::Sent | DeliveryStatus::Success)
    }

    /// States from which a manual retry may be requested.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Failed | DeliveryStatus::Pending | DeliveryStatus::Queued
        )
    }

    /// Not yet terminal.
    pub fn is_outstanding(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Queued | DeliveryStatus::Processing | DeliveryStatus::Pending
        )
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Queued => write!(f, "queued"),
            DeliveryStatus::Processing => write!(f, "processing"),
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Success => write!(f, "success"),
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeliveryStatus::ALL
            .into_iter()
            .find(|status| status.to_string() == s)
            .ok_or_else(|| format!("unknown delivery status '{}'", s))
    }
}

/// Kind of transactional email. Selects template sections and defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EmailKind {
    Otp,
    Confirmation,
    ResetLink,
    #[default]
    General,
    Test,
}

impl EmailKind {
    pub const ALL: [EmailKind; 5] = [
        EmailKind::Otp,
        EmailKind::Confirmation,
        EmailKind::ResetLink,
        EmailKind::General,
        EmailKind::Test,
    ];
}

impl std::fmt::Display for EmailKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmailKind::Otp => write!(f, "otp"),
            EmailKind::Confirmation => write!(f, "confirmation"),
            EmailKind::ResetLink => write!(f, "reset_link"),
            EmailKind::General => write!(f, "general"),
            EmailKind::Test => write!(f, "test"),
        }
    }
}

impl std::str::FromStr for EmailKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EmailKind::ALL
            .into_iter()
            .find(|kind| kind.to_string() == s)
            .ok_or_else(|| format!("unknown email kind '{}'", s))
    }
}

/// Which execution path handled a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPath {
    /// Accepted by the asynchronous worker pool.
    Queued,
    /// Rendered and sent inside the caller's request.
    Direct,
}

impl std::fmt::Display for DispatchPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchPath::Queued => write!(f, "queued"),
            DispatchPath::Direct => write!(f, "direct"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchOutcome {
    Success,
    Failure,
}

/// Persistent record of one notification's send attempts and final outcome.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryLogEntry {
    pub id: Uuid,
    pub recipient: String,
    pub kind: EmailKind,
    pub subject: String,
    pub action: String,
    pub message: String,
    pub otp: Option<String>,
    pub link: Option<String>,
    pub link_text: Option<String>,
    /// Allow-listed extra template variables, stored so retries resend the same payload.
    pub extra: serde_json::Value,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Attempts since creation or the last manual resubmission.
    pub attempts: i32,
    /// When the current or most recent attempt moved the entry to `processing`.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl DeliveryLogEntry {
    /// Extra template variables as a string map. Non-string values are skipped.
    pub fn extra_map(&self) -> BTreeMap<String, String> {
        self.extra
            .as_object()
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rebuild the request that produced this entry, bound to the entry's id.
    pub fn to_request(&self) -> DispatchRequest {
        DispatchRequest {
            recipient: self.recipient.clone(),
            kind: self.kind,
            subject: Some(self.subject.clone()),
            action: Some(self.action.clone()),
            message: Some(self.message.clone()),
            otp: self.otp.clone(),
            link: self.link.clone(),
            link_text: self.link_text.clone(),
            extra: self.extra_map(),
            log_id: Some(self.id),
        }
    }
}

/// A notification send request, as received from a caller.
///
/// Optional text fields are filled with defaults during validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchRequest {
    #[serde(default, alias = "user_email")]
    pub recipient: String,
    #[serde(default, alias = "email_type")]
    pub kind: EmailKind,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub otp: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub link_text: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
    /// Existing log entry to reuse (retry path).
    #[serde(default)]
    pub log_id: Option<Uuid>,
}

impl DispatchRequest {
    pub fn new(recipient: impl Into<String>, kind: EmailKind) -> Self {
        Self {
            recipient: recipient.into(),
            kind,
            ..Default::default()
        }
    }
}

/// Result of `submit` / `retry`, always carrying a log id the caller can poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub outcome: DispatchOutcome,
    pub status: DeliveryStatus,
    pub log_id: Uuid,
    pub path: DispatchPath,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchResult {
    pub fn accepted(log_id: Uuid) -> Self {
        Self {
            outcome: DispatchOutcome::Success,
            status: DeliveryStatus::Queued,
            log_id,
            path: DispatchPath::Queued,
            error: None,
        }
    }

    pub fn sent(log_id: Uuid) -> Self {
        Self {
            outcome: DispatchOutcome::Success,
            status: DeliveryStatus::Sent,
            log_id,
            path: DispatchPath::Direct,
            error: None,
        }
    }

    pub fn failed(log_id: Uuid, error: String) -> Self {
        Self {
            outcome: DispatchOutcome::Failure,
            status: DeliveryStatus::Failed,
            log_id,
            path: DispatchPath::Direct,
            error: Some(error),
        }
    }
}
