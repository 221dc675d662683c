//! Wire envelope of the cross-store protocol
//!
//! Every call is one `POST /rpc` carrying an [`RpcRequest`] and answered by
//! an [`RpcResponse`]. Field names are camelCase on the wire. Errors carry
//! their stable [`ErrorCode`] plus the serialized [`StrandError`] so the
//! client can rebuild the exact variant.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use strand_core::{
    now_ms, BlockId, ErrorCode, Message, MessageCursor, MessageQuery, Result, SeqId, StrandError,
    TimelineKey,
};

/// Remote procedures a Store serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcMethod {
    /// Timeline summary
    GetTimeline,
    /// Create an empty timeline
    CreateTimeline,
    /// Delete a timeline
    DeleteTimeline,
    /// Ingest migrated messages, keeping their sequence numbers
    MigrateTimeline,
    /// Append with fan-out
    AddMessage,
    /// Paginated read
    GetMessages,
    /// One block with its messages
    GetTimelineBlock,
    /// Store counters
    GetStoreStats,
    /// Store health
    HealthCheck,
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    /// Correlation id echoed in the response
    pub request_id: String,
    /// Procedure to run
    pub method: RpcMethod,
    /// Method parameters
    #[serde(default)]
    pub params: serde_json::Value,
    /// Send time, Unix milliseconds
    pub timestamp: u64,
    /// Budget for the call in milliseconds; 0 means none
    #[serde(default)]
    pub timeout: u64,
}

impl RpcRequest {
    /// Envelope for `method` with serialized `params`
    pub fn new<P: Serialize>(method: RpcMethod, params: &P, timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            request_id: Uuid::new_v4().to_string(),
            method,
            params: serde_json::to_value(params)?,
            timestamp: now_ms(),
            timeout: timeout_ms,
        })
    }

    /// Decode the parameters
    pub fn params<P: DeserializeOwned>(&self) -> Result<P> {
        serde_json::from_value(self.params.clone()).map_err(|e| {
            StrandError::invalid(format!("bad params for {}: {e}", self.method))
        })
    }
}

/// Error half of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcError {
    /// Stable error code
    pub code: ErrorCode,
    /// Human-readable text
    pub message: String,
    /// The serialized error, for structured variants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl From<&StrandError> for RpcError {
    fn from(err: &StrandError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            detail: serde_json::to_value(err).ok(),
        }
    }
}

impl From<RpcError> for StrandError {
    fn from(err: RpcError) -> Self {
        StrandError::from_wire(err.code, err.message, err.detail)
    }
}

/// Response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    /// Correlation id of the request
    pub request_id: String,
    /// Whether `data` holds the result
    pub success: bool,
    /// Result on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Failure otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Response time, Unix milliseconds
    pub timestamp: u64,
}

impl RpcResponse {
    /// Successful response
    pub fn ok(request_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            data: Some(data),
            error: None,
            timestamp: now_ms(),
        }
    }

    /// Failed response
    pub fn err(request_id: impl Into<String>, err: &StrandError) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            data: None,
            error: Some(RpcError::from(err)),
            timestamp: now_ms(),
        }
    }

    /// Decode the result, or rebuild the remote error
    pub fn into_result<R: DeserializeOwned>(self) -> Result<R> {
        if !self.success {
            let err = self.error.unwrap_or(RpcError {
                code: ErrorCode::Internal,
                message: "failed response without error".to_string(),
                detail: None,
            });
            return Err(err.into());
        }
        let data = self.data.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data)
            .map_err(|e| StrandError::serialization(format!("bad response data: {e}")))
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// Parameters naming one timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineParams {
    /// Timeline key
    pub key: TimelineKey,
}

/// `GetMessages` parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesParams {
    /// Timeline key
    pub key: TimelineKey,
    /// Page size
    pub limit: usize,
    /// Only messages older than this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<SeqId>,
    /// Only messages newer than this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<SeqId>,
}

impl MessagesParams {
    /// Parameters for `query` on `key`
    pub fn new(key: &TimelineKey, query: MessageQuery) -> Self {
        let (before, after) = match query.cursor {
            MessageCursor::Latest => (None, None),
            MessageCursor::Before(seq) => (Some(seq), None),
            MessageCursor::After(seq) => (None, Some(seq)),
        };
        Self {
            key: key.clone(),
            limit: query.limit,
            before,
            after,
        }
    }

    /// Query the parameters describe
    pub fn query(&self) -> Result<MessageQuery> {
        Ok(MessageQuery {
            limit: self.limit,
            cursor: MessageCursor::from_bounds(self.before, self.after)?,
        })
    }
}

/// `MigrateTimeline` parameters: one batch of migrated messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateParams {
    /// Receiving timeline
    pub key: TimelineKey,
    /// Messages with their original sequence numbers
    pub messages: Vec<Message>,
}

/// `GetTimelineBlock` parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockParams {
    /// Block to fetch
    pub block_id: BlockId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_field_names() {
        let request = RpcRequest::new(
            RpcMethod::GetTimeline,
            &TimelineParams {
                key: TimelineKey::conversation("c1"),
            },
            500,
        )
        .unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["method"], "GetTimeline");
        assert_eq!(json["timeout"], 500);
        assert!(json["requestId"].is_string());
        assert!(json["params"]["key"].is_object());
    }

    #[test]
    fn test_error_response_rebuilds_variant() {
        let err = StrandError::already_locked("timeline:conv:c1", "txn-1");
        let response = RpcResponse::err("r1", &err);
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("\"data\""));

        let back: RpcResponse = serde_json::from_str(&json).unwrap();
        let rebuilt = back.into_result::<()>().unwrap_err();
        assert_eq!(rebuilt, err);
    }

    #[test]
    fn test_message_params_reject_two_bounds() {
        let params = MessagesParams {
            key: TimelineKey::inbox("bob"),
            limit: 10,
            before: Some(9),
            after: Some(3),
        };
        assert!(matches!(params.query(), Err(StrandError::Invalid { .. })));

        let query = MessageQuery::before(9, 10);
        assert_eq!(MessagesParams::new(&TimelineKey::inbox("bob"), query).query().unwrap(), query);
    }
}
