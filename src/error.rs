//! Error taxonomy for the sandbox core.
//!
//! Components below the Lifecycle Controller propagate these as values; the
//! controller itself converts them into an `OperationResult`, and the exec
//! channel into an `ExecResult`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the core components.
#[derive(Debug, Error)]
pub enum Error {
    /// Spec rejected before any cluster mutation.
    #[error("{0}")]
    Validation(String),

    /// Resource already exists for this (namespace, name).
    #[error("{0}")]
    Conflict(String),

    /// Sandbox or derived resource is missing.
    #[error("{0}")]
    NotFound(String),

    /// The cluster rejected the request (non-2xx other than 404/409).
    #[error("{0}")]
    Cluster(String),

    /// Cluster unreachable, credentials unusable, or stream broken.
    #[error("{0}")]
    Transport(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => Error::NotFound(resp.message),
                409 => Error::Conflict(resp.message),
                _ => Error::Cluster(resp.message),
            },
            other => Error::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {}", code),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_api_status_mapping() {
        assert!(Error::from(api_error(404)).is_not_found());
        assert!(Error::from(api_error(409)).is_conflict());
        assert!(matches!(Error::from(api_error(422)), Error::Cluster(_)));
        assert!(matches!(Error::from(api_error(500)), Error::Cluster(_)));
    }
}
