//! Remote visitor identification and attendance service.

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5000/api/v1";

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("service returned {status}: {message}")]
    Status { status: u16, message: String },
    /// Business-rule refusal reported by the service, e.g. a duplicate check-in.
    #[error("{0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("request cancelled")]
    Cancelled,
}

/// Attendance timestamps as reported by the service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attendance {
    #[serde(default)]
    pub check_in: Option<String>,
    #[serde(default)]
    pub check_out: Option<String>,
    /// Visit duration computed by the service on check-out.
    #[serde(default)]
    pub duration: Option<serde_json::Value>,
}

/// Registered visitor record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visitor {
    #[serde(alias = "full_name")]
    pub full_name: String,
    #[serde(default)]
    pub nik: Option<String>,
    #[serde(default, alias = "company_name")]
    pub company_name: Option<String>,
    #[serde(default)]
    pub attendance: Option<Attendance>,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    image: &'a str,
}

#[derive(Deserialize)]
struct VisitorResponse {
    #[serde(default)]
    visitor: Option<Visitor>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Base64-encode an image for the service's `{"image": ...}` payload.
pub fn encode_image(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Remote identification and attendance operations, each taking a
/// base64-encoded image.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Identify the face in `image`. `Ok(None)` means the service found no match.
    async fn identify(&self, image: &str) -> Result<Option<Visitor>, ServiceError>;
    /// Record a check-in for the face in `image`.
    async fn check_in(&self, image: &str) -> Result<Visitor, ServiceError>;
    /// Record a check-out for the face in `image`.
    async fn check_out(&self, image: &str) -> Result<Visitor, ServiceError>;
}

/// JSON-over-HTTP client for the visitor service.
pub struct HttpIdentityService {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpIdentityService {
    pub fn new(base_url: Option<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self { base_url, http_client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(StatusCode, String), ServiceError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn identify(&self, image: &str) -> Result<Option<Visitor>, ServiceError> {
        let url = format!("{}/identify-face-visitor", self.base_url);
        let (status, body) = self
            .send(self.http_client.post(&url).json(&ImageRequest { image }))
            .await?;
        parse_identify(status, &body)
    }

    async fn check_in(&self, image: &str) -> Result<Visitor, ServiceError> {
        let url = format!("{}/attendance/check-in", self.base_url);
        let (status, body) = self
            .send(self.http_client.post(&url).json(&ImageRequest { image }))
            .await?;
        parse_attendance(status, &body)
    }

    async fn check_out(&self, image: &str) -> Result<Visitor, ServiceError> {
        let url = format!("{}/attendance/check-out", self.base_url);
        let (status, body) = self
            .send(self.http_client.put(&url).json(&ImageRequest { image }))
            .await?;
        parse_attendance(status, &body)
    }
}

/// 404 and bodies without a visitor are "no match"; other failures are errors.
fn parse_identify(status: StatusCode, body: &str) -> Result<Option<Visitor>, ServiceError> {
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(ServiceError::Status {
            status: status.as_u16(),
            message: error_message(body),
        });
    }
    if body.trim().is_empty() {
        return Ok(None);
    }
    let response: VisitorResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::InvalidResponse(format!("identify: {e}")))?;
    Ok(response.visitor)
}

/// Client errors carry the service's own wording and are surfaced as rejections.
fn parse_attendance(status: StatusCode, body: &str) -> Result<Visitor, ServiceError> {
    if status.is_client_error() {
        return Err(ServiceError::Rejected(error_message(body)));
    }
    if !status.is_success() {
        return Err(ServiceError::Status {
            status: status.as_u16(),
            message: error_message(body),
        });
    }
    let response: VisitorResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::InvalidResponse(format!("attendance: {e}")))?;
    response
        .visitor
        .ok_or_else(|| ServiceError::InvalidResponse("attendance: missing visitor".into()))
}

fn error_message(body: &str) -> String {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    parsed
        .error
        .or(parsed.message)
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_match() {
        let body = r#"{"visitor":{"fullName":"Jane Doe","nik":"317","companyName":"Acme"}}"#;
        let visitor = parse_identify(StatusCode::OK, body).unwrap().unwrap();
        assert_eq!(visitor.full_name, "Jane Doe");
        assert_eq!(visitor.company_name.as_deref(), Some("Acme"));
    }

    #[test]
    fn test_identify_snake_case_fields() {
        let body = r#"{"visitor":{"full_name":"John Roe","company_name":"Initech"}}"#;
        let visitor = parse_identify(StatusCode::OK, body).unwrap().unwrap();
        assert_eq!(visitor.full_name, "John Roe");
        assert_eq!(visitor.company_name.as_deref(), Some("Initech"));
    }

    #[test]
    fn test_identify_no_match_variants() {
        assert!(parse_identify(StatusCode::OK, "").unwrap().is_none());
        assert!(parse_identify(StatusCode::OK, "{}").unwrap().is_none());
        assert!(parse_identify(StatusCode::OK, r#"{"visitor":null}"#).unwrap().is_none());
        assert!(parse_identify(StatusCode::NOT_FOUND, r#"{"error":"Visitor not found"}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_identify_failures() {
        assert!(matches!(
            parse_identify(StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"boom"}"#),
            Err(ServiceError::Status { status: 500, ref message }) if message == "boom"
        ));
        assert!(matches!(
            parse_identify(StatusCode::OK, "<html>"),
            Err(ServiceError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_attendance_success() {
        let body = r#"{"visitor":{"fullName":"Jane Doe","attendance":{"check_in":"2024-05-01T08:00:00","check_out":"2024-05-01T09:30:00","duration":"1:30:00"}}}"#;
        let visitor = parse_attendance(StatusCode::OK, body).unwrap();
        let attendance = visitor.attendance.unwrap();
        assert_eq!(attendance.check_in.as_deref(), Some("2024-05-01T08:00:00"));
        assert!(attendance.duration.is_some());
    }

    #[test]
    fn test_attendance_rejection_verbatim() {
        let err = parse_attendance(
            StatusCode::BAD_REQUEST,
            r#"{"message":"You are already checked in and has not checked out yet."}"#,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "You are already checked in and has not checked out yet."
        );
    }

    #[test]
    fn test_attendance_plain_text_error() {
        let err = parse_attendance(StatusCode::CONFLICT, "already checked in\n").unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(ref m) if m == "already checked in"));
    }

    #[test]
    fn test_attendance_missing_visitor() {
        assert!(matches!(
            parse_attendance(StatusCode::OK, "{}"),
            Err(ServiceError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_encode_image_has_no_data_url_prefix() {
        assert_eq!(encode_image(&[0xFF, 0xD8, 0xFF]), "/9j/");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let svc = HttpIdentityService::new(Some("http://host/api/v1/".into()), Duration::from_secs(1))
            .unwrap();
        assert_eq!(svc.base_url(), "http://host/api/v1");
    }
}
