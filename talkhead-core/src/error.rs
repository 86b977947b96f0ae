use std::process::ExitStatus;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GenerateError>;

#[derive(Debug, Error)]
pub enum GenerateError {
    /// Weights or the generation script are missing on disk.
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("inference failed ({status}): {diagnostics}")]
    InferenceFailed {
        status: String,
        diagnostics: String,
    },
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error while {action}: {source}")]
    Io {
        action: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize input descriptor: {0}")]
    Json(#[from] serde_json::Error),
}

impl GenerateError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn io(action: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            action: action.into(),
            source,
        }
    }

    /// A blocking filesystem task that panicked or was cancelled.
    pub(crate) fn blocking(action: impl Into<String>, err: tokio::task::JoinError) -> Self {
        Self::io(action, std::io::Error::other(err))
    }

    pub(crate) fn inference(status: Option<ExitStatus>, diagnostics: impl Into<String>) -> Self {
        let status = match status {
            Some(status) => match status.code() {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            },
            None => "no exit status".to_string(),
        };
        Self::InferenceFailed {
            status,
            diagnostics: diagnostics.into(),
        }
    }

    /// True for failures caused by the caller rather than the host.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }
}
