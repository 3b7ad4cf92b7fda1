//! Error types shared by the export crates

use thiserror::Error;

/// Storage fault raised by writers, tables and file systems.
///
/// Transient faults are retried by whoever owns the storage client. A
/// non-transient fault means retrying cannot help (container gone,
/// credentials revoked), so the caller stops sending data to that target.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("non-transient storage error {code}: {message}")]
    NonTransient { code: String, message: String },

    #[error("transient storage error {code}: {message}")]
    Transient { code: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn non_transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::NonTransient {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::Transient {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_non_transient(&self) -> bool {
        matches!(self, StorageError::NonTransient { .. })
    }

    /// Error code, when the backend reported one.
    pub fn code(&self) -> Option<&str> {
        match self {
            StorageError::NonTransient { code, .. } | StorageError::Transient { code, .. } => {
                Some(code.as_str())
            },
            _ => None,
        }
    }
}

/// True when any error in the chain is a [`StorageError`].
pub fn is_storage_error(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.downcast_ref::<StorageError>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_transient_classification() {
        let err = StorageError::non_transient("ContainerNotFound", "gone");
        assert!(err.is_non_transient());
        assert_eq!(err.code(), Some("ContainerNotFound"));

        let err = StorageError::transient("ServerBusy", "retry");
        assert!(!err.is_non_transient());
    }

    #[test]
    fn test_is_storage_error_walks_context() {
        let err = anyhow::Error::new(StorageError::transient("Timeout", "slow"))
            .context("inserting row counts");
        assert!(is_storage_error(&err));

        let other = anyhow::anyhow!("not storage");
        assert!(!is_storage_error(&other));
    }
}
