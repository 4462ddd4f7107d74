use crate::domain::{Session, SessionMode};
use crate::infra::MonitorConfig;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Request/response client for the backend's session API. Base URL and
/// credential are injected at construction so independent controllers never
/// share ambient state.
#[derive(Clone, Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid endpoint path {path}: {source}")]
    Endpoint {
        path: String,
        source: url::ParseError,
    },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("unexpected mode {0:?} in status response")]
    UnknownMode(String),
}

#[derive(Debug, Deserialize)]
struct SessionStatusBody {
    id: String,
    #[serde(default)]
    iteration: u64,
    #[serde(default)]
    hat: Option<String>,
    mode: String,
    #[serde(default)]
    elapsed_secs: f64,
}

impl ApiClient {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            auth_token: config.auth_token.clone(),
        }
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|source| ApiError::Endpoint {
                path: path.to_string(),
                source,
            })
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        authorize(self.http.get(url), self.auth_token.as_deref())
    }

    fn post(&self, url: Url) -> reqwest::RequestBuilder {
        authorize(self.http.post(url), self.auth_token.as_deref())
    }

    fn delete(&self, url: Url) -> reqwest::RequestBuilder {
        authorize(self.http.delete(url), self.auth_token.as_deref())
    }

    /// GET /api/sessions/{id}/status. `mode` is the backend's sole liveness
    /// signal; the returned session carries no local status.
    pub async fn fetch_session_status(&self, session_id: &str) -> Result<Session, ApiError> {
        let url = self.endpoint(&format!("api/sessions/{session_id}/status"))?;
        let response = self.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ApiError::SessionNotFound(session_id.to_string()));
        }
        let body: SessionStatusBody = response.error_for_status()?.json().await?;

        let mode = match body.mode.as_str() {
            "live" => SessionMode::Live,
            "complete" => SessionMode::Complete,
            other => return Err(ApiError::UnknownMode(other.to_string())),
        };

        Ok(Session {
            id: body.id,
            mode,
            local_status: None,
            iteration: body.iteration,
            hat: body.hat.unwrap_or_default(),
            elapsed_secs: body.elapsed_secs,
        })
    }

    /// POST /api/sessions/{id}/pause. Fire-and-forget from the stream
    /// subsystem's point of view; failure surfaces as an error here only.
    pub async fn pause_session(&self, session_id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("api/sessions/{session_id}/pause"))?;
        self.post(url).send().await?.error_for_status()?;
        Ok(())
    }

    /// POST /api/sessions/{id}/resume.
    pub async fn resume_session(&self, session_id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("api/sessions/{session_id}/resume"))?;
        self.post(url).send().await?.error_for_status()?;
        Ok(())
    }

    /// DELETE /api/sessions/{id}.
    pub async fn stop_session(&self, session_id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("api/sessions/{session_id}"))?;
        self.delete(url).send().await?.error_for_status()?;
        Ok(())
    }
}

pub(crate) fn authorize(
    builder: reqwest::RequestBuilder,
    token: Option<&str>,
) -> reqwest::RequestBuilder {
    match token {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}
