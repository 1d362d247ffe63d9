use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

pub const RATE_LIMIT_MESSAGE: &str = "Daily vent limit reached. Sign in for more vents.";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    /// Body extraction failure other than a semantic one; keeps the
    /// rejection's own status (400, 413, 415).
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },
    #[error("rate limited")]
    RateLimited { retry_after: u64 },
    #[error("rate limiter unavailable")]
    CacheUnavailable,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Rejected { status, .. } => *status,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::CacheUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let status = rejection.status();
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            ApiError::Validation(rejection.body_text())
        } else {
            ApiError::Rejected {
                status,
                message: rejection.body_text(),
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, code) = match &self {
            ApiError::Validation(msg) | ApiError::Rejected { message: msg, .. } => {
                (msg.clone(), format!("HTTP_{}", status.as_u16()))
            }
            ApiError::RateLimited { .. } => {
                (RATE_LIMIT_MESSAGE.to_string(), "HTTP_429".to_string())
            }
            ApiError::CacheUnavailable => {
                ("Rate limiter unavailable".to_string(), "HTTP_503".to_string())
            }
        };

        let mut response = (
            status,
            axum::Json(serde_json::json!({ "error": message, "code": code })),
        )
            .into_response();

        if let ApiError::RateLimited { retry_after } = self {
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            headers.insert("x-remaining-vents", HeaderValue::from_static("0"));
            headers.insert("x-reset-seconds", HeaderValue::from(retry_after));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn rate_limited_returns_429_with_retry_after() {
        let resp = ApiError::RateLimited { retry_after: 3600 }.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "3600");
        assert_eq!(resp.headers()["x-remaining-vents"], "0");
        let json = body_json(resp).await;
        assert_eq!(json["error"], RATE_LIMIT_MESSAGE);
        assert_eq!(json["code"], "HTTP_429");
    }

    #[tokio::test]
    async fn validation_returns_422() {
        let resp = ApiError::Validation("content must not be empty".into()).into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "content must not be empty");
        assert_eq!(json["code"], "HTTP_422");
    }

    #[tokio::test]
    async fn cache_unavailable_returns_503() {
        let resp = ApiError::CacheUnavailable.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["code"], "HTTP_503");
    }

    #[tokio::test]
    async fn rejected_keeps_its_status_in_the_code() {
        let resp = ApiError::Rejected {
            status: StatusCode::UNSUPPORTED_MEDIA_TYPE,
            message: "Expected request with `Content-Type: application/json`".into(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body_json(resp).await["code"], "HTTP_415");
    }
}
