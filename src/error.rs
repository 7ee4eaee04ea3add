use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Unauthenticated")]
    Unauthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    StateConflict(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Payload exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("Range not satisfiable for {size} bytes")]
    RangeUnsatisfiable { size: u64 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::StateConflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::RangeUnsatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            AppError::Parse(_) => StatusCode::BAD_REQUEST,
            AppError::Storage(_)
            | AppError::Database(_)
            | AppError::Pool(_)
            | AppError::Io(_)
            | AppError::Internal(_)
            | AppError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Blob or database failures; reads of these are retried once.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            AppError::Storage(_) | AppError::Database(_) | AppError::Pool(_) | AppError::Io(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let (message, data) = match &self {
            AppError::Validation(reason) => {
                ("Invalid input".to_string(), json!({ "reason": reason }))
            }
            AppError::Parse(reason) => (
                "Novel could not be parsed".to_string(),
                json!({ "reason": reason }),
            ),
            AppError::Unauthenticated => ("Unauthenticated".to_string(), Value::Null),
            AppError::Forbidden(msg) => (msg.clone(), Value::Null),
            AppError::NotFound(what) => (format!("{} not found", what), Value::Null),
            AppError::StateConflict(msg) => (msg.clone(), Value::Null),
            AppError::RateLimited => ("Too many requests".to_string(), Value::Null),
            AppError::TooLarge { limit } => {
                (format!("Payload exceeds {} bytes", limit), Value::Null)
            }
            AppError::RangeUnsatisfiable { .. } => {
                ("Range not satisfiable".to_string(), Value::Null)
            }
            _ => {
                let correlation_id = uuid::Uuid::now_v7().to_string();
                tracing::error!(correlation_id = %correlation_id, error = %self, "request failed");
                (
                    "Internal server error".to_string(),
                    json!({ "correlation_id": correlation_id }),
                )
            }
        };

        let body = Json(json!({
            "code": status.as_u16(),
            "message": message,
            "data": data,
        }));

        let mut response = (status, body).into_response();

        if let AppError::RangeUnsatisfiable { size } = self {
            let headers = response.headers_mut();
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                headers.insert(header::CONTENT_RANGE, value);
            }
        }

        response
    }
}

pub type AppResult<T> = Result<T, AppError>;
