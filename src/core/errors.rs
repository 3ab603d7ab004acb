// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all failures the runtime core distinguishes.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum KubedeckError {
    #[error("Authentication failure: {0}")]
    AuthFailure(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Permission issue on {resource}: {message}")]
    PermissionIssue { resource: String, message: String },

    #[error("API status {code}: {message}")]
    ApiStatus { code: u16, message: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Operation canceled")]
    Canceled,

    #[error("Selection superseded by a newer generation")]
    Superseded,

    #[error("Cluster '{0}' is not active")]
    ClusterUnavailable(String),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    #[error("Cluster clients unavailable: {0}")]
    ClientsUnavailable(String),

    #[error("Refresh job '{0}' not found")]
    JobNotFound(String),

    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Substring patterns that identify a failed client-go style exec credential
/// plugin. These surface as plain process errors rather than HTTP statuses,
/// so they must be recognized textually.
const EXEC_CREDENTIAL_PATTERNS: [&str; 2] = ["getting credentials: exec:", "exec plugin"];

/// Returns true when an error message matches a known exec credential plugin
/// failure. The structured API status (401/403) always wins over this check;
/// it exists for process-level failures that never reach the API server.
pub fn is_exec_credential_error(message: &str) -> bool {
    if EXEC_CREDENTIAL_PATTERNS.iter().any(|p| message.contains(p)) {
        return true;
    }
    // "executable <path> failed with exit code N"
    message.contains("executable") && message.contains("failed")
}

impl KubedeckError {
    /// True for errors worth retrying: timeouts, transport-layer failures,
    /// unexpected EOF, API 5xx, and 429 TooManyRequests.
    pub fn is_retryable(&self) -> bool {
        match self {
            KubedeckError::Timeout(_)
            | KubedeckError::TransportFailure(_)
            | KubedeckError::UnexpectedEof => true,
            KubedeckError::ApiStatus { code, .. } => *code >= 500 || *code == 429,
            KubedeckError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// True when the error indicates invalid or expired credentials, either by
    /// HTTP status (401/403) or by an exec credential plugin pattern.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            KubedeckError::AuthFailure(_) => true,
            KubedeckError::ApiStatus { code, .. } => *code == 401 || *code == 403,
            KubedeckError::TransportFailure(msg) | KubedeckError::Internal(msg) => {
                is_exec_credential_error(msg)
            }
            _ => false,
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for KubedeckError {
    fn from(e: std::io::Error) -> Self {
        KubedeckError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for KubedeckError {
    fn from(e: serde_json::Error) -> Self {
        KubedeckError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<kube::Error> for KubedeckError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(status) => {
                if status.code == 401 || status.code == 403 {
                    KubedeckError::AuthFailure(status.message)
                } else {
                    KubedeckError::ApiStatus {
                        code: status.code,
                        message: status.message,
                    }
                }
            }
            kube::Error::Auth(e) => KubedeckError::AuthFailure(e.to_string()),
            other => {
                let text = other.to_string();
                if is_exec_credential_error(&text) {
                    KubedeckError::AuthFailure(text)
                } else {
                    KubedeckError::TransportFailure(text)
                }
            }
        }
    }
}

impl From<kube::config::KubeconfigError> for KubedeckError {
    fn from(e: kube::config::KubeconfigError) -> Self {
        KubedeckError::Kubeconfig(e.to_string())
    }
}
