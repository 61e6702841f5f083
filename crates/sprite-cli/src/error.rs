use std::fmt;

use actix_web::error::ResponseError;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde_json::json;
use sprite_contracts::{SpriteError, SpriteErrorKind};

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Everything a handler can fail with. Pipeline failures keep their kind so
/// clients can tell a bad photo from an upstream outage.
#[derive(Debug)]
pub enum ApiError {
    Sprite(SpriteError),
    BadRequest(String),
    PayloadTooLarge(usize),
    Internal(String),
}

impl ApiError {
    fn kind_label(&self) -> &'static str {
        match self {
            ApiError::Sprite(err) => err.kind.as_str(),
            ApiError::BadRequest(_) => "invalid_input",
            ApiError::PayloadTooLarge(_) => "payload_too_large",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Sprite(err) => write!(f, "{}", err.detail),
            ApiError::BadRequest(msg) => write!(f, "Bad request: {msg}"),
            ApiError::PayloadTooLarge(limit) => write!(f, "upload exceeds {limit} bytes"),
            ApiError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Sprite(err) => match err.kind {
                SpriteErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                SpriteErrorKind::MissingAsset | SpriteErrorKind::LocalIo => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                SpriteErrorKind::GenerationEmpty
                | SpriteErrorKind::GenerationTransport
                | SpriteErrorKind::Publish => StatusCode::BAD_GATEWAY,
                SpriteErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "detail": self.to_string(),
            "kind": self.kind_label(),
        }))
    }
}

impl From<SpriteError> for ApiError {
    fn from(err: SpriteError) -> Self {
        ApiError::Sprite(err)
    }
}

impl From<actix_web::error::BlockingError> for ApiError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_kinds_map_to_statuses() {
        let cases = [
            (SpriteErrorKind::InvalidInput, 400),
            (SpriteErrorKind::MissingAsset, 500),
            (SpriteErrorKind::LocalIo, 500),
            (SpriteErrorKind::GenerationEmpty, 502),
            (SpriteErrorKind::GenerationTransport, 502),
            (SpriteErrorKind::Publish, 502),
            (SpriteErrorKind::Timeout, 504),
        ];
        for (kind, status) in cases {
            let err = ApiError::from(SpriteError::new(kind, "x"));
            assert_eq!(err.status_code().as_u16(), status, "{kind:?}");
        }
    }

    #[test]
    fn body_carries_detail_and_kind() {
        let err = ApiError::from(SpriteError::new(
            SpriteErrorKind::GenerationEmpty,
            "no image after 3 attempts",
        ));
        assert_eq!(err.to_string(), "no image after 3 attempts");
        assert_eq!(err.kind_label(), "generation_empty");
        assert_eq!(ApiError::PayloadTooLarge(10).status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
