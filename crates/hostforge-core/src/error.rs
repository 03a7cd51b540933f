use thiserror::Error;

/// Whether a failed certificate issuance may succeed if tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceErrorKind {
    /// Rate limiting, transient validation or connection failures.
    Retryable,
    /// Domain ownership cannot be proven; retrying will not help.
    Fatal,
}

#[derive(Debug, Error)]
pub enum HostforgeError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("failed to acquire '{artifact}' after {attempts} attempt(s): {reason}")]
    ResourceAcquisition {
        artifact: String,
        attempts: u32,
        reason: String,
    },

    #[error("step '{0}' did not reach its expected state")]
    Postcondition(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("service '{service}' did not become healthy after {attempts} attempt(s)\n--- last output ---\n{diagnostics}")]
    ServiceStart {
        service: String,
        attempts: u32,
        diagnostics: String,
    },

    #[error("certificate issuance failed ({kind:?}): {message}")]
    CertificateIssuance {
        kind: IssuanceErrorKind,
        message: String,
    },

    #[error("another run holds the lock at {0}")]
    Locked(String),

    #[error("command '{command}' failed: {detail}")]
    Command { command: String, detail: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("aborted by operator: {0}")]
    Aborted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HostforgeError {
    /// True for failures the retry loop may attempt again.
    pub fn is_retryable(&self) -> bool {
        match self {
            HostforgeError::ResourceAcquisition { .. }
            | HostforgeError::Http(_)
            | HostforgeError::Command { .. }
            | HostforgeError::Io(_) => true,
            HostforgeError::CertificateIssuance { kind, .. } => {
                *kind == IssuanceErrorKind::Retryable
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, HostforgeError>;
