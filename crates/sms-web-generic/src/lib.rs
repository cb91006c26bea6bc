use serde::{Deserialize, Serialize};
use sms_core::{ConnectionState, DataCoding, OutboundMessage, SubmitError, Submitter};
use std::sync::Arc;
use std::time::Duration;

/// HTTP status code for web responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    Ok = 200,
    BadRequest = 400,
    TooManyRequests = 429,
    BadGateway = 502,
    ServiceUnavailable = 503,
}

impl HttpStatus {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Form fields accepted by the submit endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SubmitForm {
    pub source: String,
    pub target: String,
    pub text: String,
    /// `ucs2` (default) or `default` for text already in the SMSC alphabet
    #[serde(default)]
    pub coding: Option<String>,
    /// Request a final delivery receipt (default: true)
    #[serde(default)]
    pub receipt: Option<bool>,
}

impl SubmitForm {
    pub fn into_message(self) -> Result<OutboundMessage, SubmitError> {
        let message = match self.coding.as_deref() {
            None | Some("ucs2") => OutboundMessage::ucs2(self.source, self.target, &self.text),
            Some("default") => OutboundMessage::new(self.source, self.target, self.text.into_bytes())
                .with_coding(DataCoding::Default),
            Some(other) => {
                return Err(SubmitError::Invalid(format!("unsupported coding: {}", other)))
            }
        };
        Ok(message.with_delivery_receipt(self.receipt.unwrap_or(true)))
    }
}

/// Generic response that can be converted to any framework's response type
#[derive(Debug, Clone)]
pub struct SubmitHttpResponse {
    pub status: HttpStatus,
    pub body: String,
    pub content_type: String,
    /// Seconds for a `Retry-After` header
    pub retry_after: Option<u64>,
}

impl SubmitHttpResponse {
    pub fn success(message_id: &str) -> Self {
        Self {
            status: HttpStatus::Ok,
            body: serde_json::json!({ "message_id": message_id }).to_string(),
            content_type: "application/json".to_string(),
            retry_after: None,
        }
    }

    pub fn error(status: HttpStatus, message: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": message }).to_string(),
            content_type: "application/json".to_string(),
            retry_after: None,
        }
    }

    fn with_retry_after(mut self, wait: Duration) -> Self {
        // Round up so a client never retries early.
        let secs = wait.as_secs().saturating_add(u64::from(wait.subsec_nanos() > 0));
        self.retry_after = Some(secs.max(1));
        self
    }
}

/// Framework-agnostic submission processor that handles the core request logic
#[derive(Clone)]
pub struct SubmissionProcessor {
    submitter: Arc<dyn Submitter>,
}

impl SubmissionProcessor {
    pub fn new(submitter: Arc<dyn Submitter>) -> Self {
        Self { submitter }
    }

    /// Decode an `application/x-www-form-urlencoded` body and submit it.
    pub async fn process_form(&self, body: &[u8]) -> SubmitHttpResponse {
        match serde_urlencoded::from_bytes::<SubmitForm>(body) {
            Ok(form) => self.process_submit(form).await,
            Err(e) => SubmitHttpResponse::error(
                HttpStatus::BadRequest,
                &format!("invalid form: {}", e),
            ),
        }
    }

    pub async fn process_submit(&self, form: SubmitForm) -> SubmitHttpResponse {
        let result = match form.into_message() {
            Ok(message) => self.submitter.submit(&message).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(sent) => SubmitHttpResponse::success(&sent.message_id),
            Err(e) => self.error_to_response(e),
        }
    }

    /// 200 while connected, 503 otherwise.
    pub fn readiness(&self) -> SubmitHttpResponse {
        let state = self.submitter.state();
        let status = if state == ConnectionState::Connected {
            HttpStatus::Ok
        } else {
            HttpStatus::ServiceUnavailable
        };
        SubmitHttpResponse {
            status,
            body: serde_json::json!({ "state": state }).to_string(),
            content_type: "application/json".to_string(),
            retry_after: None,
        }
    }

    fn error_to_response(&self, error: SubmitError) -> SubmitHttpResponse {
        match error {
            SubmitError::NotConnected => SubmitHttpResponse::error(
                HttpStatus::ServiceUnavailable,
                "Not connected to SMPP gateway.",
            ),
            SubmitError::RateLimited { retry_after } => {
                SubmitHttpResponse::error(HttpStatus::TooManyRequests, "rate limited")
                    .with_retry_after(retry_after)
            }
            SubmitError::Transport(e) => {
                SubmitHttpResponse::error(HttpStatus::BadGateway, &format!("transport error: {}", e))
            }
            SubmitError::Invalid(msg) => SubmitHttpResponse::error(HttpStatus::BadRequest, &msg),
        }
    }
}

/// Helper trait for framework adapters to convert responses
pub trait ResponseConverter {
    type ResponseType;

    fn from_submit_response(response: SubmitHttpResponse) -> Self::ResponseType;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sms_core::{SubmissionResult, SubmitResponse, TransportError};
    use std::sync::Mutex;

    struct FakeSubmitter {
        outcome: SubmissionResult,
        seen: Mutex<Vec<OutboundMessage>>,
    }

    impl FakeSubmitter {
        fn new(outcome: SubmissionResult) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Submitter for FakeSubmitter {
        async fn submit(&self, message: &OutboundMessage) -> SubmissionResult {
            self.seen.lock().unwrap().push(message.clone());
            self.outcome.clone()
        }

        fn state(&self) -> ConnectionState {
            match self.outcome {
                Err(SubmitError::NotConnected) => ConnectionState::Disconnected,
                _ => ConnectionState::Connected,
            }
        }
    }

    #[tokio::test]
    async fn form_is_submitted_as_ucs2_with_receipt() {
        let fake = FakeSubmitter::new(Ok(SubmitResponse {
            message_id: "abc".into(),
        }));
        let processor = SubmissionProcessor::new(fake.clone());

        let response = processor
            .process_form(b"source=6791&target=996771977377&text=hi")
            .await;
        assert_eq!(response.status.as_u16(), 200);
        assert!(response.body.contains("abc"));

        let seen = fake.seen.lock().unwrap();
        assert_eq!(seen[0].destination, "996771977377");
        assert_eq!(seen[0].coding, DataCoding::Ucs2);
        assert_eq!(seen[0].body, vec![0x00, b'h', 0x00, b'i']);
        assert!(seen[0].register_delivery);
    }

    #[tokio::test]
    async fn not_connected_maps_to_503() {
        let processor =
            SubmissionProcessor::new(FakeSubmitter::new(Err(SubmitError::NotConnected)));
        let response = processor.process_form(b"source=1&target=2&text=x").await;
        assert_eq!(response.status.as_u16(), 503);
        assert!(response.body.contains("Not connected"));
        assert_eq!(processor.readiness().status.as_u16(), 503);
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() {
        let processor = SubmissionProcessor::new(FakeSubmitter::new(Err(
            SubmitError::RateLimited {
                retry_after: Duration::from_millis(1500),
            },
        )));
        let response = processor.process_form(b"source=1&target=2&text=x").await;
        assert_eq!(response.status.as_u16(), 429);
        assert_eq!(response.retry_after, Some(2));
    }

    #[tokio::test]
    async fn unbounded_wait_saturates_retry_after() {
        let processor = SubmissionProcessor::new(FakeSubmitter::new(Err(
            SubmitError::RateLimited {
                retry_after: Duration::MAX,
            },
        )));
        let response = processor.process_form(b"source=1&target=2&text=x").await;
        assert_eq!(response.status.as_u16(), 429);
        assert_eq!(response.retry_after, Some(u64::MAX));
    }

    #[tokio::test]
    async fn transport_error_maps_to_502() {
        let processor = SubmissionProcessor::new(FakeSubmitter::new(Err(
            SubmitError::Transport(TransportError::Io("reset".into())),
        )));
        let response = processor.process_form(b"source=1&target=2&text=x").await;
        assert_eq!(response.status.as_u16(), 502);
        assert!(response.body.contains("reset"));
    }

    #[tokio::test]
    async fn malformed_form_is_rejected_before_submitting() {
        let fake = FakeSubmitter::new(Ok(SubmitResponse {
            message_id: "x".into(),
        }));
        let processor = SubmissionProcessor::new(fake.clone());

        let response = processor.process_form(b"source=1").await;
        assert_eq!(response.status.as_u16(), 400);

        let response = processor
            .process_form(b"source=1&target=2&text=x&coding=klingon")
            .await;
        assert_eq!(response.status.as_u16(), 400);
        assert!(fake.seen.lock().unwrap().is_empty());
    }
}
