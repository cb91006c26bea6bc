use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use sms_core::Submitter;
use sms_web_generic::{ResponseConverter, SubmissionProcessor, SubmitHttpResponse};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub processor: SubmissionProcessor,
}

impl AppState {
    pub fn new(submitter: Arc<dyn Submitter>) -> Self {
        Self {
            processor: SubmissionProcessor::new(submitter),
        }
    }
}

/// Axum-specific response converter
pub struct AxumResponseConverter;

impl ResponseConverter for AxumResponseConverter {
    type ResponseType = Response;

    fn from_submit_response(response: SubmitHttpResponse) -> Self::ResponseType {
        let status = StatusCode::from_u16(response.status.as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut res = (status, response.body).into_response();
        if let Ok(content_type) = HeaderValue::from_str(&response.content_type) {
            res.headers_mut().insert(header::CONTENT_TYPE, content_type);
        }
        if let Some(secs) = response.retry_after {
            res.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        res
    }
}

/// Submit handler: POST / with form fields `source`, `target`, `text`
pub async fn submit(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let response = state.processor.process_form(&body).await;
    AxumResponseConverter::from_submit_response(response)
}

/// Readiness handler: GET /ready
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    AxumResponseConverter::from_submit_response(state.processor.readiness())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(submit))
        .route("/ready", get(ready))
        .with_state(state)
}
