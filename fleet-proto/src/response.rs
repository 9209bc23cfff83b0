use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{now_ts, Timestamp};

/// Status codes carried inside every [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    BadRequest,
    Unauthorized,
    NotAcceptable,
    InternalServerError,
    NotImplemented,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::NotAcceptable => 406,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            200 => StatusCode::Ok,
            400 => StatusCode::BadRequest,
            401 => StatusCode::Unauthorized,
            406 => StatusCode::NotAcceptable,
            500 => StatusCode::InternalServerError,
            501 => StatusCode::NotImplemented,
            _ => return None,
        })
    }

    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::NotAcceptable => "Not Acceptable",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::NotImplemented => "Not Implemented",
        }
    }
}

/// Structured acknowledgement returned by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status_code: u16,
    pub reason: String,
    pub ts: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn new(status: StatusCode, data: Option<Value>) -> Self {
        Self {
            status_code: status.as_u16(),
            reason: status.reason().to_string(),
            ts: now_ts(),
            data,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, None)
    }

    pub fn ok_with(data: Value) -> Self {
        Self::new(StatusCode::Ok, Some(data))
    }

    /// Error response whose human-readable detail travels in `data.reason`.
    pub fn rejected(status: StatusCode, detail: impl Into<String>) -> Self {
        Self::new(status, Some(serde_json::json!({ "reason": detail.into() })))
    }

    pub fn status(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.status_code)
    }

    pub fn is_ok(&self) -> bool {
        self.status_code == StatusCode::Ok.as_u16()
    }

    /// Detail reason if present, otherwise the canonical phrase.
    pub fn detail(&self) -> &str {
        self.data
            .as_ref()
            .and_then(|d| d.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or(&self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_roundtrip() {
        for code in [200, 400, 401, 406, 500, 501] {
            assert_eq!(StatusCode::from_u16(code).map(StatusCode::as_u16), Some(code));
        }
        assert_eq!(StatusCode::from_u16(418), None);
    }

    #[test]
    fn test_rejected_carries_detail() {
        let resp = Response::rejected(StatusCode::NotAcceptable, "requested host not found");
        assert_eq!(resp.status_code, 406);
        assert_eq!(resp.reason, "Not Acceptable");
        assert_eq!(resp.detail(), "requested host not found");
        assert!(!resp.is_ok());
    }

    #[test]
    fn test_ok_omits_empty_data() {
        let value = serde_json::to_value(Response::ok()).unwrap();
        assert!(value.get("data").is_none());
        assert_eq!(value["status_code"], 200);
    }
}
