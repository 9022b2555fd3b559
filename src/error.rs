use thiserror::Error;

/// Failures of a chat or listing request against the inference service.
///
/// The display strings are shown to the user as-is.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("The local model service is not available yet. Activate a model first.")]
    NoEndpoint,

    #[error("The model took too long to answer (request timed out).")]
    Timeout,

    #[error("Could not connect to the local model service: {0}")]
    Connection(String),

    #[error("The connection to the local model service was interrupted: {0}")]
    Interrupted(String),

    #[error("The local model service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Unexpected response from the local model service: {0}")]
    InvalidResponse(String),

    #[error("The model returned an empty reply.")]
    EmptyReply,

    #[error("Request cancelled.")]
    Cancelled,
}

/// Terminal failures of one model activation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Local model service is unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Failed to download model '{alias}': {detail}")]
    DownloadFailed { alias: String, detail: String },

    #[error("Failed to load model '{alias}': {detail}")]
    LoadFailed { alias: String, detail: String },

    #[error("Model '{alias}' was loaded but the service did not answer the health check: {detail}")]
    HealthCheckFailed { alias: String, detail: String },

    #[error("Model '{0}' was loaded but the service does not report it as running")]
    NotReported(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Operation cancelled.")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
