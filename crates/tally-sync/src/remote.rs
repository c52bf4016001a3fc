//! # Remote Store
//!
//! The seam between the coordinator and the authoritative server.
//!
//! ## Error Classification
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       HTTP answer → RemoteError                         │
//! │                                                                         │
//! │  2xx ──► parse SyncResponse                                            │
//! │           ├── result applied   ──► PushAck                             │
//! │           ├── result rejected  ──► Rejected        (park, no retry)    │
//! │           └── result conflict  ──► Conflict        (resolver)          │
//! │  409 ──► Conflict { server version }                                   │
//! │  4xx ──► Rejected                                                      │
//! │  5xx ──► Server                                     (retry, backoff)   │
//! │  connect / reset ──► Network                        (retry, backoff)   │
//! │  deadline        ──► Timeout                        (retry, backoff)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ChangeStatus, ClientChange, ServerChange, SyncRequest, SyncResponse};

// =============================================================================
// Trait
// =============================================================================

/// The server accepted a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushAck {
    /// The record's server id. For creates this is newly assigned.
    pub server_id: String,
    pub server_timestamp: DateTime<Utc>,
}

/// Server-side changes since a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct PullResponse {
    pub server_timestamp: DateTime<Utc>,
    pub changes: Vec<ServerChange>,
}

/// Why a remote call failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0} seconds")]
    Timeout(u64),

    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The server holds a newer version. `server_data` is `None` when the
    /// server deleted the record.
    #[error("conflict with server version from {server_updated_at}")]
    Conflict {
        server_data: Option<Value>,
        server_updated_at: DateTime<Utc>,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Network trouble and server-side faults are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Network(_)
                | RemoteError::Timeout(_)
                | RemoteError::Server { .. }
                | RemoteError::InvalidResponse(_)
        )
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network(message) => SyncError::NetworkUnavailable(message),
            RemoteError::Timeout(secs) => SyncError::Timeout(secs),
            RemoteError::Server { status, message } => {
                SyncError::NetworkUnavailable(format!("server error {}: {}", status, message))
            }
            RemoteError::Rejected { status, message } => {
                SyncError::ServerRejected { status, message }
            }
            RemoteError::Conflict {
                server_updated_at, ..
            } => SyncError::ServerRejected {
                status: 409,
                message: format!("conflict with server version from {}", server_updated_at),
            },
            RemoteError::InvalidResponse(message) => SyncError::SerializationFailed(message),
        }
    }
}

/// The authoritative store the coordinator syncs with.
///
/// Implementations must treat a repeated create with the same client id as
/// the same record.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Sends one local change.
    async fn push(&self, change: &ClientChange) -> Result<PushAck, RemoteError>;

    /// Fetches every change after `since` (everything when `None`).
    async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<PullResponse, RemoteError>;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

/// `RemoteStore` over HTTP: `POST {base_url}/sync` with a JSON
/// [`SyncRequest`].
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    endpoint: Url,
    device_id: String,
    timeout: Duration,
}

impl HttpRemote {
    /// Creates a remote for `base_url`.
    pub fn new(base_url: &str, device_id: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let endpoint = sync_endpoint(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(HttpRemote {
            client,
            endpoint,
            device_id: device_id.into(),
            timeout,
        })
    }

    /// Creates a remote from the `[remote]` and `[sync]` config sections.
    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        let base_url = config
            .remote_url()
            .ok_or_else(|| SyncError::InvalidConfig("remote.base_url is not set".into()))?;

        Self::new(base_url, config.device_id(), config.sync.request_timeout())
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn send(&self, request: &SyncRequest) -> Result<SyncResponse, RemoteError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("X-Device-Id", &self.device_id)
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| RemoteError::InvalidResponse(e.to_string()));
        }

        debug!(status = status.as_u16(), "Remote answered with an error status");
        Err(classify_status(status, &body))
    }

    fn transport_error(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.timeout.as_secs())
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn push(&self, change: &ClientChange) -> Result<PushAck, RemoteError> {
        let response = self.send(&SyncRequest::push(change.clone())).await?;
        interpret_push(change, response)
    }

    async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<PullResponse, RemoteError> {
        let response = self.send(&SyncRequest::pull(since)).await?;

        Ok(PullResponse {
            server_timestamp: response.server_timestamp,
            changes: response.changes,
        })
    }
}

/// `{base_url}/sync`, keeping any path prefix of the base URL.
fn sync_endpoint(base_url: &str) -> SyncResult<Url> {
    let mut base = Url::parse(base_url)?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(SyncError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            base.scheme()
        )));
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join("sync")?)
}

fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    if status == StatusCode::CONFLICT {
        return match serde_json::from_str::<SyncResponse>(body) {
            Ok(response) => {
                let conflict = response.conflicts.into_iter().next();
                RemoteError::Conflict {
                    server_updated_at: conflict
                        .as_ref()
                        .and_then(|c| c.server_timestamp)
                        .unwrap_or(response.server_timestamp),
                    server_data: conflict.and_then(|c| c.server_data),
                }
            }
            Err(e) => RemoteError::InvalidResponse(format!("409 body: {}", e)),
        };
    }

    let message = if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("no reason given")
            .to_string()
    } else {
        body.chars().take(512).collect()
    };

    if status.is_client_error() {
        RemoteError::Rejected {
            status: status.as_u16(),
            message,
        }
    } else {
        RemoteError::Server {
            status: status.as_u16(),
            message,
        }
    }
}

/// Reads the outcome of a single-change push out of a 2xx response.
fn interpret_push(change: &ClientChange, response: SyncResponse) -> Result<PushAck, RemoteError> {
    let result = response
        .results
        .iter()
        .find(|r| r.id == change.id)
        .or_else(|| response.results.first());

    let Some(result) = result else {
        // Servers without per-change results: a 2xx means applied.
        return Ok(PushAck {
            server_id: change.id.clone(),
            server_timestamp: response.server_timestamp,
        });
    };

    match result.status {
        ChangeStatus::Applied => Ok(PushAck {
            server_id: result.server_id.clone().unwrap_or_else(|| change.id.clone()),
            server_timestamp: result.server_timestamp.unwrap_or(response.server_timestamp),
        }),
        ChangeStatus::Rejected => Err(RemoteError::Rejected {
            status: 422,
            message: result
                .error
                .clone()
                .unwrap_or_else(|| "rejected by server".to_string()),
        }),
        ChangeStatus::Conflict => {
            let conflict = response.conflicts.iter().find(|c| c.id == change.id);
            if conflict.is_none() {
                warn!(id = %change.id, "Conflict result without server version");
            }
            Err(RemoteError::Conflict {
                server_data: conflict.and_then(|c| c.server_data.clone()),
                server_updated_at: result
                    .server_timestamp
                    .or_else(|| conflict.and_then(|c| c.server_timestamp))
                    .unwrap_or(response.server_timestamp),
            })
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tally_core::{EntityTable, SyncOperation};

    fn change(id: &str) -> ClientChange {
        ClientChange {
            table: EntityTable::Customers,
            operation: SyncOperation::Create,
            id: id.into(),
            data: Some(json!({ "name": "Ada" })),
            client_timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
            base_synced_at: None,
        }
    }

    fn response(value: Value) -> SyncResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_endpoint_keeps_path_prefix() {
        assert_eq!(
            sync_endpoint("https://pos.example.com").unwrap().as_str(),
            "https://pos.example.com/sync"
        );
        assert_eq!(
            sync_endpoint("https://pos.example.com/api/v1").unwrap().as_str(),
            "https://pos.example.com/api/v1/sync"
        );
        assert!(sync_endpoint("ftp://pos.example.com").is_err());
        assert!(sync_endpoint("not a url").is_err());
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad sku"),
            RemoteError::Rejected { status: 422, ref message } if message == "bad sku"
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            RemoteError::Server { status: 502, .. }
        ));
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_retryable());
    }

    #[test]
    fn test_conflict_carries_server_version() {
        let body = json!({
            "serverTimestamp": "2024-05-01T10:00:00Z",
            "conflicts": [{
                "table": "customers", "id": "srv-1",
                "serverData": { "name": "Bob" },
                "resolution": "manual",
                "serverTimestamp": "2024-05-01T09:30:00Z"
            }]
        })
        .to_string();

        match classify_status(StatusCode::CONFLICT, &body) {
            RemoteError::Conflict {
                server_data,
                server_updated_at,
            } => {
                assert_eq!(server_data, Some(json!({ "name": "Bob" })));
                assert_eq!(
                    server_updated_at,
                    Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap()
                );
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_applied_result_assigns_server_id() {
        let ack = interpret_push(
            &change("c-1"),
            response(json!({
                "serverTimestamp": "2024-05-01T10:00:00Z",
                "results": [{ "id": "c-1", "status": "applied", "serverId": "srv-1" }]
            })),
        )
        .unwrap();

        assert_eq!(ack.server_id, "srv-1");
        assert_eq!(
            ack.server_timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_bare_success_keeps_sent_id() {
        let ack = interpret_push(
            &change("srv-4"),
            response(json!({ "serverTimestamp": "2024-05-01T10:00:00Z" })),
        )
        .unwrap();
        assert_eq!(ack.server_id, "srv-4");
    }

    #[test]
    fn test_rejected_result_is_not_retryable() {
        let err = interpret_push(
            &change("c-1"),
            response(json!({
                "serverTimestamp": "2024-05-01T10:00:00Z",
                "results": [{ "id": "c-1", "status": "rejected", "error": "name required" }]
            })),
        )
        .unwrap_err();

        assert!(!err.is_retryable());
        let sync_err: SyncError = err.into();
        assert!(matches!(sync_err, SyncError::ServerRejected { status: 422, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_retryable() {
        let remote = HttpRemote::new("http://127.0.0.1:9", "dev-1", Duration::from_secs(2)).unwrap();
        assert_eq!(remote.endpoint().as_str(), "http://127.0.0.1:9/sync");

        let err = remote.pull(None).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {:?}", err);
    }
}
