use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    SlotUnavailable(String),

    #[error("Hold has expired")]
    HoldExpired,

    #[error("NDA must be signed before confirming")]
    NdaRequired,

    #[error("invalid webhook signature")]
    WebhookAuth,

    #[error("rate limit exceeded")]
    RateLimited(u64),

    #[error("internal error: {0}")]
    Transient(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::SlotUnavailable(_) => StatusCode::CONFLICT,
            AppError::HoldExpired => StatusCode::BAD_REQUEST,
            AppError::NdaRequired => StatusCode::BAD_REQUEST,
            AppError::WebhookAuth => StatusCode::UNAUTHORIZED,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if let AppError::Transient(ref e) = self {
            tracing::error!(error = %e, "request failed");
        }

        let body = serde_json::json!({ "error": self.to_string() });

        match self {
            AppError::RateLimited(retry_after) => (
                status,
                [("Retry-After", retry_after.to_string())],
                axum::Json(body),
            )
                .into_response(),
            _ => (status, axum::Json(body)).into_response(),
        }
    }
}
