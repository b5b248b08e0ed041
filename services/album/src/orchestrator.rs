//! Client side of the upload protocol.
//!
//! An upload is two requests: ask the service for an [`UploadTarget`], then PUT
//! the payload to the target's URL. [`UploadOrchestrator`] drives both steps and
//! publishes its progress as an [`UploadState`] over a watch channel so a UI can
//! render it.

use crate::api::{ErrorResponse, IssueResponse, ListResponse, PutResponse, ISSUE_PATH};
use crate::config::ClientConfig;
use crate::issuer::UploadTarget;
use crate::storage_key::StorageKey;
use crate::store::UploadAck;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Progress of the most recent upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    AwaitingTarget,
    Transmitting,
    Succeeded,
    Failed,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Succeeded | UploadState::Failed)
    }
}

/// Failures talking to the album service
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server responded with {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_decode() {
            TransportError::InvalidResponse(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Outcome of a failed upload, by the step that failed
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Failed to get upload URL: {0}")]
    TargetUnavailable(#[source] TransportError),

    #[error("Failed to upload image: {0}")]
    TransmissionFailed(#[source] TransportError),
}

/// The two requests an upload is made of
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Ask the service for a fresh upload target
    async fn fetch_target(&self) -> Result<UploadTarget, TransportError>;

    /// PUT `payload` to the target's URL
    async fn deliver(
        &self,
        target: &UploadTarget,
        content_type: &str,
        payload: Bytes,
    ) -> Result<UploadAck, TransportError>;
}

/// Decode an issue response into a target
pub fn target_from_response(response: IssueResponse) -> Result<UploadTarget, TransportError> {
    let key = StorageKey::parse(&response.key)
        .map_err(|_| TransportError::InvalidResponse("issued key is empty".to_string()))?;
    Ok(UploadTarget {
        target_url: response.url,
        key,
    })
}

/// Decode a store response into an acknowledgement
pub fn ack_from_response(response: PutResponse) -> Result<UploadAck, TransportError> {
    let key = StorageKey::parse(&response.key)
        .map_err(|_| TransportError::InvalidResponse("acknowledged key is empty".to_string()))?;
    if !response.success {
        return Err(TransportError::InvalidResponse(format!(
            "upload of {key} was not acknowledged"
        )));
    }
    Ok(UploadAck {
        key,
        success: response.success,
    })
}

/// Transport over HTTP
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Resolve a possibly relative URL against the base URL
    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    /// Fetch the album listing
    pub async fn list_uploads(&self) -> Result<ListResponse, TransportError> {
        let response = self
            .client
            .get(self.resolve(crate::issuer::STORE_PATH))
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

/// Turn a non-2xx response into `TransportError::Status`
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or(body);

    Err(TransportError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn fetch_target(&self) -> Result<UploadTarget, TransportError> {
        let response = self.client.get(self.resolve(ISSUE_PATH)).send().await?;
        let response = check_status(response).await?;
        target_from_response(response.json().await?)
    }

    async fn deliver(
        &self,
        target: &UploadTarget,
        content_type: &str,
        payload: Bytes,
    ) -> Result<UploadAck, TransportError> {
        let response = self
            .client
            .put(self.resolve(&target.target_url))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(payload)
            .send()
            .await?;
        let response = check_status(response).await?;
        ack_from_response(response.json().await?)
    }
}

/// Drives the issue-then-deliver sequence.
///
/// Uploads are not queued or deduplicated; concurrent calls run independently
/// and the published state follows whichever call moved last.
pub struct UploadOrchestrator<T> {
    transport: Arc<T>,
    state: Arc<watch::Sender<UploadState>>,
    display_delay: Duration,
    generation: Arc<AtomicU64>,
}

impl<T: UploadTransport + 'static> UploadOrchestrator<T> {
    pub fn new(transport: T, display_delay: Duration) -> Self {
        let (state, _) = watch::channel(UploadState::Idle);
        Self {
            transport: Arc::new(transport),
            state: Arc::new(state),
            display_delay,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<UploadState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> UploadState {
        *self.state.borrow()
    }

    /// Request a target and deliver `payload` to it
    #[instrument(skip(self, payload), fields(size_bytes = payload.len()))]
    pub async fn perform_upload(
        &self,
        payload: Bytes,
        content_type: &str,
    ) -> Result<UploadAck, UploadError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.state.send_replace(UploadState::AwaitingTarget);
        let target = match self.transport.fetch_target().await {
            Ok(target) => target,
            Err(e) => {
                warn!(error = %e, "Upload target unavailable");
                self.finish(UploadState::Failed, generation);
                return Err(UploadError::TargetUnavailable(e));
            }
        };
        debug!(key = %target.key, "Received upload target");

        self.state.send_replace(UploadState::Transmitting);
        match self.transport.deliver(&target, content_type, payload).await {
            Ok(ack) => {
                info!(key = %ack.key, "Upload succeeded");
                self.finish(UploadState::Succeeded, generation);
                Ok(ack)
            }
            Err(e) => {
                warn!(key = %target.key, error = %e, "Upload transmission failed");
                self.finish(UploadState::Failed, generation);
                Err(UploadError::TransmissionFailed(e))
            }
        }
    }

    /// Publish a terminal state and fall back to idle after the display delay,
    /// unless another upload has started meanwhile
    fn finish(&self, terminal: UploadState, generation: u64) {
        self.state.send_replace(terminal);

        let state = self.state.clone();
        let current = self.generation.clone();
        let delay = self.display_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state.send_if_modified(|s| {
                if current.load(Ordering::SeqCst) == generation && s.is_terminal() {
                    *s = UploadState::Idle;
                    true
                } else {
                    false
                }
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(3000);

    fn target() -> UploadTarget {
        UploadTarget {
            target_url: "/store?key=wedding-uploads%2F1-abc.jpg".to_string(),
            key: StorageKey::parse("wedding-uploads/1-abc.jpg").unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_upload_returns_to_idle() {
        let mut transport = MockUploadTransport::new();
        transport
            .expect_fetch_target()
            .times(1)
            .returning(|| Ok(target()));
        transport
            .expect_deliver()
            .withf(|t, ct, payload| {
                t.key.as_str() == "wedding-uploads/1-abc.jpg"
                    && ct == "image/jpeg"
                    && payload.len() == 3
            })
            .times(1)
            .returning(|t, _, _| {
                Ok(UploadAck {
                    key: t.key.clone(),
                    success: true,
                })
            });

        let orchestrator = UploadOrchestrator::new(transport, DELAY);
        let mut rx = orchestrator.subscribe();

        let ack = orchestrator
            .perform_upload(Bytes::from_static(b"abc"), "image/jpeg")
            .await
            .unwrap();
        assert_eq!(ack.key.as_str(), "wedding-uploads/1-abc.jpg");
        assert_eq!(*rx.borrow_and_update(), UploadState::Succeeded);

        tokio::time::timeout(DELAY * 2, rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow(), UploadState::Idle);
    }

    #[tokio::test]
    async fn test_target_failure_skips_delivery() {
        let mut transport = MockUploadTransport::new();
        transport
            .expect_fetch_target()
            .times(1)
            .returning(|| {
                Err(TransportError::Status {
                    status: 500,
                    message: "Failed to generate upload URL".to_string(),
                })
            });
        transport.expect_deliver().times(0);

        let orchestrator = UploadOrchestrator::new(transport, DELAY);
        let err = orchestrator
            .perform_upload(Bytes::from_static(b"abc"), "image/jpeg")
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::TargetUnavailable(_)));
        assert_eq!(orchestrator.state(), UploadState::Failed);
    }

    #[tokio::test]
    async fn test_delivery_failure_reported() {
        let mut transport = MockUploadTransport::new();
        transport
            .expect_fetch_target()
            .returning(|| Ok(target()));
        transport
            .expect_deliver()
            .returning(|_, _, _| Err(TransportError::Timeout));

        let orchestrator = UploadOrchestrator::new(transport, DELAY);
        let err = orchestrator
            .perform_upload(Bytes::new(), "image/jpeg")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::TransmissionFailed(TransportError::Timeout)
        ));
        assert_eq!(err.to_string(), "Failed to upload image: Request timed out");
        assert_eq!(orchestrator.state(), UploadState::Failed);
    }

    #[test]
    fn test_unacknowledged_put_is_an_error() {
        let response = PutResponse {
            success: false,
            key: "k".to_string(),
            message: String::new(),
        };
        assert!(matches!(
            ack_from_response(response),
            Err(TransportError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_empty_issued_key_is_an_error() {
        let response = IssueResponse {
            url: "/store?key=".to_string(),
            key: String::new(),
            is_mock: true,
        };
        assert!(target_from_response(response).is_err());
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let transport = HttpTransport::new(&ClientConfig {
            base_url: "http://album.local:8080/".to_string(),
            ..ClientConfig::default()
        })
        .unwrap();

        assert_eq!(
            transport.resolve("/store?key=a"),
            "http://album.local:8080/store?key=a"
        );
        assert_eq!(
            transport.resolve("https://cdn.example/put"),
            "https://cdn.example/put"
        );
    }
}
