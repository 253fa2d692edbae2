//! JSON bodies of the view API.

use crate::error::SnapshotError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// View not found.
pub const CODE_NOT_FOUND: u32 = 44404;
/// Malformed request body.
pub const CODE_INVALID_REQUEST: u32 = 44400;
/// Store or transport failure.
pub const CODE_INTERNAL: u32 = 44500;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateViewRequest {
    pub subscriber: String,
    pub collection: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateViewReply {
    pub id: String,
    pub subscriber: String,
    pub collection: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteViewRequest {
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteViewReply {
    pub id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullViewRequest {
    pub id: String,
    /// Base64 of the last key received; empty to start from the beginning.
    #[serde(default)]
    pub last_key: String,
    #[serde(default)]
    pub after_last_key: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullViewReply {
    pub id: String,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&SnapshotError> for ErrorBody {
    fn from(err: &SnapshotError) -> Self {
        match err {
            SnapshotError::ViewNotFound(_) => ErrorBody::new(CODE_NOT_FOUND, "Not found view"),
            SnapshotError::Deserialization(msg) | SnapshotError::InvalidOperation(msg) => {
                ErrorBody::new(CODE_INVALID_REQUEST, format!("Invalid request: {}", msg))
            }
            other => ErrorBody::new(CODE_INTERNAL, other.to_string()),
        }
    }
}

/// `{"error": {...}}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: ErrorBody,
}

/// A reply that is either the operation's result or a coded error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply<T> {
    Error(ErrorReply),
    Ok(T),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pull_request_defaults() {
        let req: PullViewRequest = serde_json::from_value(json!({"id": "v"})).unwrap();
        assert_eq!(req.last_key, "");
        assert!(!req.after_last_key);

        let req: PullViewRequest =
            serde_json::from_value(json!({"id": "v", "lastKey": "YQ==", "afterLastKey": true})).unwrap();
        assert_eq!(req.last_key, "YQ==");
        assert!(req.after_last_key);
    }

    #[test]
    fn test_error_codes() {
        let not_found = ErrorBody::from(&SnapshotError::ViewNotFound("x".into()));
        assert_eq!(not_found, ErrorBody::new(44404, "Not found view"));

        let invalid = ErrorBody::from(&SnapshotError::Deserialization("bad".into()));
        assert_eq!(invalid.code, 44400);

        let internal = ErrorBody::from(&SnapshotError::Disconnected);
        assert_eq!(internal.code, 44500);
    }

    #[test]
    fn test_reply_shapes() {
        let err: Reply<PullViewReply> =
            serde_json::from_value(json!({"error": {"code": 44404, "message": "Not found view"}})).unwrap();
        assert!(matches!(err, Reply::Error(_)));

        let ok: Reply<PullViewReply> = serde_json::from_value(json!({"id": "v", "count": 3})).unwrap();
        assert_eq!(
            ok,
            Reply::Ok(PullViewReply {
                id: "v".into(),
                count: 3
            })
        );
    }
}
