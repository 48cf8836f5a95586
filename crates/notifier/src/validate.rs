//! Request validation and normalisation.
//!
//! Turns a caller-supplied `DispatchRequest` into a fully populated `EmailPayload`
//! or rejects it with `AppError::Validation` before anything is persisted.

use std::collections::BTreeMap;

use mailroom_common::error::AppError;
use mailroom_common::types::{DispatchRequest, EmailKind};

pub const DEFAULT_SUBJECT: &str = "Notification";
pub const DEFAULT_ACTION: &str = "notification";
pub const DEFAULT_MESSAGE: &str = "You have a new notification.";
pub const DEFAULT_RESET_LINK_TEXT: &str = "Reset Password";

const MAX_SUBJECT_LEN: usize = 255;
const MAX_ACTION_LEN: usize = 100;
const MAX_OTP_LEN: usize = 10;
const MAX_LINK_TEXT_LEN: usize = 100;
const MAX_EXTRA_VALUE_LEN: usize = 500;

/// Extra template variables callers may supply.
pub const ALLOWED_EXTRA_KEYS: &[&str] = &[
    "first_name",
    "last_name",
    "user_name",
    "expires_in",
    "ip_address",
    "device",
    "location",
    "reference",
];

/// A validated, defaulted notification ready to be logged and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailPayload {
    pub recipient: String,
    pub kind: EmailKind,
    pub subject: String,
    pub action: String,
    pub message: String,
    pub otp: Option<String>,
    pub link: Option<String>,
    pub link_text: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl EmailPayload {
    pub fn extra_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.extra
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }
}

/// Validate and normalise a request.
pub fn validate_request(req: &DispatchRequest) -> Result<EmailPayload, AppError> {
    let recipient = normalize_recipient(&req.recipient)?;

    let subject = text_or_default(&req.subject, DEFAULT_SUBJECT);
    check_len("subject", &subject, MAX_SUBJECT_LEN)?;
    let action = text_or_default(&req.action, DEFAULT_ACTION);
    check_len("action", &action, MAX_ACTION_LEN)?;
    let message = text_or_default(&req.message, DEFAULT_MESSAGE);

    if req.kind == EmailKind::Otp && matches!(req.otp.as_deref(), Some(s) if s.trim().is_empty())
    {
        return Err(AppError::Validation(
            "otp is required for otp email type".to_string(),
        ));
    }
    if req.kind == EmailKind::ResetLink
        && matches!(req.link.as_deref(), Some(s) if s.trim().is_empty())
    {
        return Err(AppError::Validation(
            "link is required for reset_link email type".to_string(),
        ));
    }

    let otp = non_blank(&req.otp);
    if let Some(otp) = &otp {
        check_len("otp", otp, MAX_OTP_LEN)?;
    }

    let link = non_blank(&req.link);
    if let Some(link) = &link
        && !(link.starts_with("https://") || link.starts_with("http://"))
    {
        return Err(AppError::Validation(format!(
            "link must be an http(s) URL, got '{}'",
            link
        )));
    }

    let mut link_text = non_blank(&req.link_text);
    if req.kind == EmailKind::ResetLink && link.is_some() && link_text.is_none() {
        link_text = Some(DEFAULT_RESET_LINK_TEXT.to_string());
    }
    if let Some(text) = &link_text {
        check_len("link_text", text, MAX_LINK_TEXT_LEN)?;
    }

    let extra = validate_extra(&req.extra)?;

    Ok(EmailPayload {
        recipient,
        kind: req.kind,
        subject,
        action,
        message,
        otp,
        link,
        link_text,
        extra,
    })
}

/// Trim, lowercase and check the address has a local part and a dotted domain.
pub fn normalize_recipient(raw: &str) -> Result<String, AppError> {
    let addr = raw.trim().to_lowercase();
    let invalid = || AppError::Validation(format!("Invalid email address '{}'", raw.trim()));

    let (local, domain) = addr.split_once('@').ok_or_else(invalid)?;
    let domain_ok = !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.');
    if local.is_empty() || !domain_ok || addr.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    Ok(addr)
}

fn validate_extra(extra: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>, AppError> {
    for (key, value) in extra {
        if !ALLOWED_EXTRA_KEYS.contains(&key.as_str()) {
            return Err(AppError::Validation(format!(
                "Unsupported extra field '{}'. Allowed: {}",
                key,
                ALLOWED_EXTRA_KEYS.join(", ")
            )));
        }
        check_len(key, value, MAX_EXTRA_VALUE_LEN)?;
    }
    Ok(extra.clone())
}

fn text_or_default(value: &Option<String>, default: &str) -> String {
    non_blank(value).unwrap_or_else(|| default.to_string())
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), AppError> {
    if value.chars().count() > max {
        return Err(AppError::Validation(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(recipient: &str, kind: EmailKind) -> DispatchRequest {
        DispatchRequest::new(recipient, kind)
    }

    #[test]
    fn test_minimal_request_gets_defaults() {
        let payload =
            validate_request(&request("  User@Example.COM ", EmailKind::General)).unwrap();
        assert_eq!(payload.recipient, "user@example.com");
        assert_eq!(payload.subject, DEFAULT_SUBJECT);
        assert_eq!(payload.action, DEFAULT_ACTION);
        assert_eq!(payload.message, DEFAULT_MESSAGE);
        assert!(payload.otp.is_none());
    }

    #[test]
    fn test_recipient_without_at_is_rejected() {
        let err = validate_request(&request("not-an-email", EmailKind::General)).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_recipient_without_dotted_domain_is_rejected() {
        for addr in ["a@localhost", "a@.com", "a@b.", "@b.com", "a@b@c.com", "a b@c.com", ""] {
            assert!(normalize_recipient(addr).is_err(), "{} should be rejected", addr);
        }
        assert_eq!(normalize_recipient("a@b.com").unwrap(), "a@b.com");
    }

    #[test]
    fn test_otp_kind_with_blank_otp_is_rejected() {
        let mut req = request("a@b.com", EmailKind::Otp);
        req.otp = Some("  ".to_string());
        assert!(validate_request(&req).is_err());

        req.otp = None;
        assert!(validate_request(&req).is_ok());
    }

    #[test]
    fn test_otp_length_cap() {
        let mut req = request("a@b.com", EmailKind::Otp);
        req.otp = Some("12345678901".to_string());
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_reset_link_gets_default_label() {
        let mut req = request("a@b.com", EmailKind::ResetLink);
        req.link = Some("https://example.com/reset".to_string());
        let payload = validate_request(&req).unwrap();
        assert_eq!(payload.link_text.as_deref(), Some(DEFAULT_RESET_LINK_TEXT));
    }

    #[test]
    fn test_reset_link_with_blank_link_is_rejected() {
        let mut req = request("a@b.com", EmailKind::ResetLink);
        req.link = Some(String::new());
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_non_http_link_is_rejected() {
        let mut req = request("a@b.com", EmailKind::Confirmation);
        req.link = Some("javascript:alert(1)".to_string());
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_subject_length_cap() {
        let mut req = request("a@b.com", EmailKind::General);
        req.subject = Some("x".repeat(256));
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_extra_allow_list() {
        let mut req = request("a@b.com", EmailKind::General);
        req.extra.insert("first_name".to_string(), "Ada".to_string());
        assert_eq!(validate_request(&req).unwrap().extra.len(), 1);

        req.extra.insert("brand_name".to_string(), "Evil".to_string());
        let err = validate_request(&req).unwrap_err();
        assert!(err.to_string().contains("brand_name"));
    }

    #[test]
    fn test_extra_json_is_an_object_of_strings() {
        let mut req = request("a@b.com", EmailKind::General);
        req.extra.insert("device".to_string(), "iPhone".to_string());
        let payload = validate_request(&req).unwrap();
        assert_eq!(payload.extra_json(), serde_json::json!({ "device": "iPhone" }));
    }
}
