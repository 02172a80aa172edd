use crate::engine::EngineError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{Map, Value};

/// Which endpoint an error is reported from. Recognition replies carry their
/// message under `"usn"`, every other endpoint under `"message"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Enroll,
    Recognize,
    Students,
}

impl Endpoint {
    fn key(self) -> &'static str {
        match self {
            Endpoint::Recognize => "usn",
            Endpoint::Enroll | Endpoint::Students => "message",
        }
    }

    fn missing_field_message(self) -> &'static str {
        match self {
            Endpoint::Enroll => "USN or image data is missing",
            Endpoint::Recognize => "No image data",
            Endpoint::Students => "USN is missing",
        }
    }
}

/// An HTTP error reply: status plus a single-key JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    key: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, endpoint: Endpoint, message: impl Into<String>) -> Self {
        Self {
            status,
            key: endpoint.key(),
            message: message.into(),
        }
    }

    pub fn missing_field(endpoint: Endpoint) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            endpoint,
            endpoint.missing_field_message(),
        )
    }

    pub fn not_found(usn: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            Endpoint::Students,
            format!("Student {usn} not found"),
        )
    }

    /// Map an engine failure to the reply for `endpoint`.
    pub fn engine(endpoint: Endpoint, err: EngineError) -> Self {
        let bad_request = |msg: &str| Self::new(StatusCode::BAD_REQUEST, endpoint, msg);
        match err {
            EngineError::InvalidIdentity(_) => bad_request("Invalid USN"),
            EngineError::InvalidImage(ref e) => {
                tracing::debug!(error = %e, "rejecting undecodable image");
                bad_request("Invalid image format")
            }
            EngineError::NoFaceDetected => bad_request("No face detected"),
            EngineError::NoEnrolledIdentities => bad_request("No enrolled students yet"),
            EngineError::Store(_)
            | EngineError::Model(_)
            | EngineError::Spawn(_)
            | EngineError::ChannelClosed => {
                tracing::error!(error = %err, ?endpoint, "request failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    endpoint,
                    "Internal server error",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = Map::new();
        body.insert(self.key.to_string(), Value::String(self.message));
        (self.status, Json(Value::Object(body))).into_response()
    }
}
