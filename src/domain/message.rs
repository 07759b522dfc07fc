//! Render requests, results, and the correlated queue envelopes.

use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::template::DocumentTemplate;

/// One unit of work for the pipeline.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub job_id: Uuid,
    pub template: DocumentTemplate,
    pub created_at: OffsetDateTime,
}

impl RenderRequest {
    /// Build a request with a freshly generated job id.
    pub fn new(template: DocumentTemplate) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            template,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_job_id(job_id: Uuid, template: DocumentTemplate, created_at: OffsetDateTime) -> Self {
        Self {
            job_id,
            template,
            created_at,
        }
    }
}

/// Outcome of a successful pipeline run. Values are written once.
#[derive(Debug, Clone)]
pub struct RenderResult {
    pub job_id: Uuid,
    pub document_type: String,
    pub pdf_bytes: Vec<u8>,
    pub elapsed: Duration,
}

/// Inbound queue envelope, one per device request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequestEnvelope {
    pub correlation_id: Uuid,
    pub device_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub template: DocumentTemplate,
    #[serde(default = "default_inline")]
    pub return_pdf_inline: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
}

fn default_inline() -> bool {
    true
}

/// Outbound queue envelope. Exactly one of `pdf_base64`/`pdf_path` is set
/// on success, `error_message` only on failure; the ids always echo the
/// request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderReplyEnvelope {
    pub correlation_id: Uuid,
    pub device_id: String,
    pub session_id: Option<String>,
    pub document_type: String,
    pub success: bool,
    pub pdf_base64: Option<String>,
    pub pdf_path: Option<String>,
    pub error_message: Option<String>,
    pub elapsed_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
}

impl RenderRequestEnvelope {
    pub fn reply_inline(&self, result: &RenderResult) -> RenderReplyEnvelope {
        let mut reply = self.reply_base(true, result.elapsed);
        reply.pdf_base64 = Some(BASE64.encode(&result.pdf_bytes));
        reply
    }

    pub fn reply_path(&self, result: &RenderResult, path: &Path) -> RenderReplyEnvelope {
        let mut reply = self.reply_base(true, result.elapsed);
        reply.pdf_path = Some(path.display().to_string());
        reply
    }

    pub fn reply_failure(&self, message: impl Into<String>) -> RenderReplyEnvelope {
        let mut reply = self.reply_base(false, Duration::ZERO);
        reply.error_message = Some(message.into());
        reply
    }

    fn reply_base(&self, success: bool, elapsed: Duration) -> RenderReplyEnvelope {
        RenderReplyEnvelope {
            correlation_id: self.correlation_id,
            device_id: self.device_id.clone(),
            session_id: self.session_id.clone(),
            document_type: self.template.document_type.clone(),
            success,
            pdf_base64: None,
            pdf_path: None,
            error_message: None,
            elapsed_ms: elapsed.as_millis() as u64,
            completed_at: OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> RenderRequestEnvelope {
        serde_json::from_str(
            r#"{
                "correlationId": "6f2d3c44-9f10-4c1f-8c53-0c51a8b9a001",
                "deviceId": "till-7",
                "sessionId": "s-19",
                "template": {"documentType": "receipt", "template": {"html": "<p>x</p>"}},
                "requestedAt": "2026-07-01T09:30:00Z"
            }"#,
        )
        .expect("decode envelope")
    }

    fn result(elapsed_ms: u64) -> RenderResult {
        RenderResult {
            job_id: Uuid::new_v4(),
            document_type: "receipt".to_string(),
            pdf_bytes: vec![0x25, 0x50, 0x44, 0x46],
            elapsed: Duration::from_millis(elapsed_ms),
        }
    }

    #[test]
    fn return_pdf_inline_defaults_to_true() {
        assert!(envelope().return_pdf_inline);
    }

    #[test]
    fn inline_reply_encodes_standard_base64() {
        let reply = envelope().reply_inline(&result(120));

        assert!(reply.success);
        assert_eq!(reply.pdf_base64.as_deref(), Some("JVBERg=="));
        assert!(reply.pdf_path.is_none());
        assert!(reply.error_message.is_none());
        assert_eq!(reply.elapsed_ms, 120);
    }

    #[test]
    fn path_reply_excludes_inline_bytes() {
        let reply = envelope().reply_path(&result(80), Path::new("/data/out/receipt_a1.pdf"));

        assert!(reply.success);
        assert!(reply.pdf_base64.is_none());
        assert_eq!(reply.pdf_path.as_deref(), Some("/data/out/receipt_a1.pdf"));
    }

    #[test]
    fn replies_echo_request_identity() {
        let request = envelope();
        let reply = request.reply_failure("render failed");

        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_eq!(reply.device_id, request.device_id);
        assert_eq!(reply.session_id, request.session_id);
        assert_eq!(reply.document_type, "receipt");
        assert!(!reply.success);
        assert_eq!(reply.error_message.as_deref(), Some("render failed"));
        assert!(reply.pdf_base64.is_none() && reply.pdf_path.is_none());
    }

    #[test]
    fn reply_wire_format_is_camel_case() {
        let reply = envelope().reply_inline(&result(5));
        let wire = serde_json::to_value(&reply).expect("encode");

        assert!(wire.get("correlationId").is_some());
        assert!(wire.get("pdfBase64").is_some());
        assert!(wire.get("completedAt").is_some());
    }
}
