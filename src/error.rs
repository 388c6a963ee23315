use reqwest::StatusCode;

/// Failure of a call to the remote generation API.
#[derive(Debug, thiserror::Error)]
pub enum RemoteServiceError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("requested entity was not found: {0}")]
    EntityNotFound(String),

    #[error("no image data returned from API")]
    NoImageData,

    #[error("video generation failed - no URI")]
    NoVideoUri,

    #[error("video generation timed out after {0}s")]
    TimedOut(u64),

    #[error("no API credential configured")]
    MissingCredential,

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteServiceError {
    /// The credential in use does not reach the requested model or project.
    pub fn is_entity_not_found(&self) -> bool {
        matches!(self, Self::EntityNotFound(_))
    }

    /// The user has to pick a (different) API credential before retrying.
    pub fn needs_credential(&self) -> bool {
        matches!(self, Self::EntityNotFound(_) | Self::MissingCredential)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// Classify a non-success API reply from its status and JSON error body.
    pub fn from_api_reply(status: StatusCode, body: &str) -> Self {
        let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
        let error = parsed.as_ref().and_then(|v| v.get("error"));
        let message = error
            .and_then(|e| e.get("message"))
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| body.trim().to_string());
        let api_status = error
            .and_then(|e| e.get("status"))
            .and_then(serde_json::Value::as_str);

        if status == StatusCode::NOT_FOUND || api_status == Some("NOT_FOUND") {
            return Self::EntityNotFound(message);
        }
        Self::Api {
            status: status.as_u16(),
            message,
        }
    }
}

impl From<reqwest::Error> for RemoteServiceError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Failure of the local history store.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("history store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt history record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// The expansion model answered with something that is not a JSON array of strings.
#[derive(Debug, thiserror::Error)]
#[error("malformed expansion response: {0}")]
pub struct MalformedResponseError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum InvalidConfig {
    #[error("scene count must be between 1 and 5, got {0}")]
    SceneCount(u8),

    #[error("reference image mime type must be an image type, got {0}")]
    ReferenceMime(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("prompt expansion failed: {0}")]
    Expansion(#[source] RemoteServiceError),

    #[error(transparent)]
    InvalidConfig(#[from] InvalidConfig),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("job {0} already has a video in progress")]
    VideoInProgress(String),

    #[error("job {0} is still generating its image")]
    ImageInProgress(String),

    #[error("job {id} has no {kind} to download")]
    MediaUnavailable { id: String, kind: &'static str },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("export failed: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_not_found_status() {
        let err = RemoteServiceError::from_api_reply(StatusCode::NOT_FOUND, "gone");
        assert!(err.is_entity_not_found());
    }

    #[test]
    fn classifies_not_found_error_body() {
        let body = r#"{"error":{"code":400,"message":"Requested entity was not found.","status":"NOT_FOUND"}}"#;
        let err = RemoteServiceError::from_api_reply(StatusCode::BAD_REQUEST, body);
        assert!(err.is_entity_not_found());
        assert!(err.to_string().contains("Requested entity was not found."));
    }

    #[test]
    fn other_failures_keep_status_and_message() {
        let body = r#"{"error":{"code":429,"message":"quota exhausted","status":"RESOURCE_EXHAUSTED"}}"#;
        let err = RemoteServiceError::from_api_reply(StatusCode::TOO_MANY_REQUESTS, body);
        assert!(!err.is_entity_not_found());
        assert!(
            matches!(err, RemoteServiceError::Api { status: 429, ref message } if message == "quota exhausted")
        );
    }

    #[test]
    fn non_json_body_is_used_verbatim() {
        let err = RemoteServiceError::from_api_reply(StatusCode::BAD_GATEWAY, " upstream down \n");
        assert!(
            matches!(err, RemoteServiceError::Api { status: 502, ref message } if message == "upstream down")
        );
    }
}
