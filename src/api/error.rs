use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde_json::{json, Value};
use std::fmt;

use crate::core::{PipelineError, StorageError};

#[derive(Debug)]
pub struct ApiError {
    message: String,
    status_code: StatusCode,
    details: Option<Value>,
}

impl ApiError {
    pub fn new(message: impl Into<String>, status_code: StatusCode) -> Self {
        ApiError {
            message: message.into(),
            status_code,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(message, StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(message, StatusCode::BAD_REQUEST)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(message, StatusCode::NOT_FOUND)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(message, StatusCode::CONFLICT)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(message, StatusCode::TOO_MANY_REQUESTS)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(message, StatusCode::SERVICE_UNAVAILABLE)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let mut body = json!({
            "error": self.message,
            "status": self.status_code.as_u16()
        });
        if let (Some(Value::Object(extra)), Value::Object(map)) = (&self.details, &mut body) {
            map.extend(extra.clone());
        }
        HttpResponse::build(self.status_code).json(body)
    }

    fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        match err {
            PipelineError::QuotaExceeded { usage, limit } => {
                ApiError::too_many_requests(message).with_details(json!({ "usage": usage, "limit": limit }))
            }
            PipelineError::NotFound(_) => ApiError::not_found(message),
            PipelineError::UnsupportedMediaType(_) | PipelineError::FileTooLarge { .. } => {
                ApiError::bad_request(message)
            }
            PipelineError::InvalidTransition(_) => ApiError::conflict(message),
            PipelineError::ShuttingDown => ApiError::service_unavailable(message),
            _ => ApiError::internal_server_error(message),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => ApiError::not_found(err.to_string()),
            StorageError::Backend(_) => ApiError::internal_server_error(err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pipeline_errors_map_to_status_codes() {
        let cases = [
            (PipelineError::QuotaExceeded { usage: 50, limit: 50 }, StatusCode::TOO_MANY_REQUESTS),
            (PipelineError::NotFound("job".into()), StatusCode::NOT_FOUND),
            (PipelineError::UnsupportedMediaType("text/plain".into()), StatusCode::BAD_REQUEST),
            (PipelineError::InvalidTransition("completed".into()), StatusCode::CONFLICT),
            (PipelineError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
            (PipelineError::Record("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[actix_rt::test]
    async fn test_quota_body_carries_usage_and_limit() {
        let response = ApiError::from(PipelineError::QuotaExceeded { usage: 50, limit: 50 }).error_response();
        let body = actix_web::body::to_bytes(response.into_body()).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["usage"], 50);
        assert_eq!(json["limit"], 50);
        assert_eq!(json["status"], 429);
    }
}
