use fleet_proto::{Response, StatusCode};

/// Every way a request can fail, each mapped onto one wire status code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("address {0} is not registered")]
    Unauthorized(String),
    #[error("not acceptable: {0}")]
    NotAcceptable(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not implemented")]
    NotImplemented,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BadRequest,
            ApiError::Unauthorized(_) => StatusCode::Unauthorized,
            ApiError::NotAcceptable(_) => StatusCode::NotAcceptable,
            ApiError::Internal(_) => StatusCode::InternalServerError,
            ApiError::NotImplemented => StatusCode::NotImplemented,
        }
    }

    /// Internal details stay in the logs; callers only get the canonical phrase.
    pub fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::BadRequest(detail) | ApiError::NotAcceptable(detail) => {
                Response::rejected(status, detail)
            }
            _ => Response::new(status, None),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_details_are_not_exposed() {
        let resp = ApiError::Internal("index out of bounds at ledger.rs:42".into()).into_response();
        assert_eq!(resp.status_code, 500);
        assert!(resp.data.is_none());
        assert_eq!(resp.reason, "Internal Server Error");
    }

    #[test]
    fn test_validation_errors_carry_detail() {
        let err: ApiError = serde_json::from_str::<fleet_proto::HeartbeatPacket>("{}")
            .unwrap_err()
            .into();
        let resp = err.into_response();
        assert_eq!(resp.status_code, 400);
        assert!(resp.detail().contains("hostname"));
    }
}
