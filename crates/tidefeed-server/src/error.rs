use axum::extract::ws::{close_code, CloseFrame};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Server is full ({max} peers)")]
    Full { max: usize },

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl ServerError {
    /// Close frame sent to a signaling socket rejected with this error.
    pub fn close_frame(&self) -> CloseFrame<'static> {
        let code = match self {
            ServerError::Full { .. } => close_code::AGAIN,
            ServerError::Protocol(_) => close_code::POLICY,
        };
        CloseFrame {
            code,
            reason: self.to_string().into(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Full { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Protocol(_) => StatusCode::BAD_REQUEST,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_close_codes() {
        let full = ServerError::Full { max: 3 };
        assert_eq!(full.close_frame().code, close_code::AGAIN);
        assert_eq!(full.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);

        let bad = ServerError::Protocol("expected register".into());
        assert_eq!(bad.close_frame().code, close_code::POLICY);
        assert_eq!(bad.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
