use nix::errno::Errno;
use thiserror::Error;

use crate::provider::ProviderId;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{op} failed: {cause}")]
    OsRouting { op: &'static str, cause: Errno },

    #[error("link {0:?} not found -- has the tunnel device been created?")]
    LinkNotFound(String),

    #[error("teardown incomplete, failed operations: {}", failed_ops.join("; "))]
    PartialTeardown { failed_ops: Vec<String> },

    #[error("no server of provider {provider} matches the selection")]
    NoMatchingServer { provider: ProviderId },

    #[error("server {name:?} not found for provider {provider}")]
    ServerNotFound { provider: ProviderId, name: String },

    #[error("unknown provider {0:?}")]
    UnknownProvider(String),

    #[error("provider {0} does not support catalog updates")]
    UpdateUnsupported(ProviderId),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// The kernel reported that the object to act on does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AppError::OsRouting {
                cause: Errno::ENOENT | Errno::ESRCH | Errno::ENODEV | Errno::EADDRNOTAVAIL,
                ..
            }
        )
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            AppError::OsRouting {
                cause: Errno::EEXIST,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_classification() {
        let missing = AppError::OsRouting {
            op: "RouteDel",
            cause: Errno::ESRCH,
        };
        assert!(missing.is_not_found());
        assert!(!missing.is_already_exists());

        let exists = AppError::OsRouting {
            op: "AddrAdd",
            cause: Errno::EEXIST,
        };
        assert!(exists.is_already_exists());
        assert!(!exists.is_not_found());

        assert!(!AppError::LinkNotFound("wg0".into()).is_not_found());
    }

    #[test]
    fn test_partial_teardown_message_lists_ops() {
        let err = AppError::PartialTeardown {
            failed_ops: vec!["RuleDel prio 100".into(), "AddrDel 10.2.0.2/32".into()],
        };
        let text = err.to_string();
        assert!(text.contains("RuleDel prio 100"));
        assert!(text.contains("AddrDel 10.2.0.2/32"));
    }
}
