use crate::infra::MonitorConfig;
use crate::infra::api::authorize;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use thiserror::Error;
use url::Url;

pub type EventByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid stream url for session {session_id}: {source}")]
    StreamUrl {
        session_id: String,
        source: url::ParseError,
    },

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("stream read failed: {0}")]
    Read(String),
}

/// Source of raw event-stream bytes for one session. The controller's stream
/// task consumes this; swapping in a channel-backed source is how the
/// lifecycle tests run without a server.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    async fn open(&self, session_id: &str) -> Result<EventByteStream, StreamError>;
}

/// Real transport: a long-lived GET against the backend's SSE endpoint.
#[derive(Clone, Debug)]
pub struct SseEventSource {
    http: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl SseEventSource {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            auth_token: config.auth_token.clone(),
        }
    }

    fn stream_url(&self, session_id: &str) -> Result<Url, StreamError> {
        self.base_url
            .join(&format!("api/sessions/{session_id}/events"))
            .map_err(|source| StreamError::StreamUrl {
                session_id: session_id.to_string(),
                source,
            })
    }
}

#[async_trait::async_trait]
impl EventSource for SseEventSource {
    async fn open(&self, session_id: &str) -> Result<EventByteStream, StreamError> {
        let url = self.stream_url(session_id)?;
        tracing::debug!(%url, "opening event stream");

        let request = authorize(self.http.get(url), self.auth_token.as_deref())
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let response = request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|error| StreamError::Connect(error.to_string()))?;

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|error| StreamError::Read(error.to_string())))
            .boxed())
    }
}
