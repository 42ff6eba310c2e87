//! Error types and the fixed error vocabulary.
//!
//! Every failure the crate reports maps onto one of the vocabulary keys
//! operators see during setup and on sync runs: `failed_to_connect`,
//! `failed_cert`, `failed_file`, `failed_unknown` and `already_configured`.

use serde::{Deserialize, Serialize};

/// Closed set of operator-visible error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No reachable endpoint, or the endpoint timed out
    FailedToConnect,
    /// TLS trust failure
    FailedCert,
    /// Budget file unknown or inaccessible on the endpoint
    FailedFile,
    /// Anything else, including authentication and decryption failures
    FailedUnknown,
    /// Setup-time only: the endpoint and file pair is already configured
    AlreadyConfigured,
}

impl ErrorKind {
    /// The vocabulary key for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::FailedToConnect => "failed_to_connect",
            ErrorKind::FailedCert => "failed_cert",
            ErrorKind::FailedFile => "failed_file",
            ErrorKind::FailedUnknown => "failed_unknown",
            ErrorKind::AlreadyConfigured => "already_configured",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for sync operations.
///
/// Messages never contain credentials; callers pass only endpoint paths and
/// field names into them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Certificate error: {0}")]
    Cert(String),

    #[error("File error: {0}")]
    File(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Already configured: {0}")]
    AlreadyConfigured(String),

    /// Provider rejected the stored credentials; retrying will not help.
    #[error("Re-authentication required: {0}")]
    ReauthRequired(String),

    #[error("Sync already running for instance {0}")]
    AlreadyRunning(String),

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Map onto the operator-visible vocabulary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect(_) => ErrorKind::FailedToConnect,
            Self::Cert(_) => ErrorKind::FailedCert,
            Self::File(_) => ErrorKind::FailedFile,
            Self::AlreadyConfigured(_) => ErrorKind::AlreadyConfigured,
            Self::Unknown(_)
            | Self::ReauthRequired(_)
            | Self::AlreadyRunning(_)
            | Self::NotFound(_)
            | Self::Cancelled => ErrorKind::FailedUnknown,
        }
    }

    /// Whether a sync attempt failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Unknown(_))
    }

    /// Combine the error of an earlier attempt with the error of a later one.
    ///
    /// A later `Unknown` never replaces a more specific earlier error, while a
    /// more specific later error replaces an earlier `Unknown`.
    pub fn narrow(self, later: SyncError) -> SyncError {
        match (&self, &later) {
            (Self::Unknown(_), _) => later,
            (_, Self::Unknown(_)) => self,
            _ => later,
        }
    }

    /// Classify a transport error from reqwest.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if is_certificate_failure(err) {
            Self::Cert(format!("TLS verification failed: {}", root_cause(err)))
        } else if err.is_timeout() {
            Self::Connect("Request timed out".to_string())
        } else if err.is_connect() {
            Self::Connect(format!("Connection failed: {}", root_cause(err)))
        } else if err.is_decode() {
            Self::Unknown(format!("Malformed response: {}", err))
        } else {
            Self::Unknown(format!("Request error: {}", err))
        }
    }
}

/// Walk an error chain looking for a TLS trust failure.
pub(crate) fn is_certificate_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        let message = e.to_string().to_lowercase();
        if message.contains("certificate") || message.contains("unknownissuer") {
            return true;
        }
        current = e.source();
    }
    false
}

fn root_cause(err: &(dyn std::error::Error + 'static)) -> String {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Wrapped {
        message: &'static str,
        source: Option<Box<Wrapped>>,
    }

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.message)
        }
    }

    impl std::error::Error for Wrapped {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            self.source
                .as_deref()
                .map(|s| s as &(dyn std::error::Error + 'static))
        }
    }

    #[test]
    fn test_vocabulary_keys() {
        assert_eq!(SyncError::Connect("x".into()).kind().as_str(), "failed_to_connect");
        assert_eq!(SyncError::Cert("x".into()).kind().as_str(), "failed_cert");
        assert_eq!(SyncError::File("x".into()).kind().as_str(), "failed_file");
        assert_eq!(SyncError::Unknown("x".into()).kind().as_str(), "failed_unknown");
        assert_eq!(
            SyncError::AlreadyConfigured("x".into()).kind().as_str(),
            "already_configured"
        );
        assert_eq!(SyncError::ReauthRequired("x".into()).kind(), ErrorKind::FailedUnknown);
    }

    #[test]
    fn test_retry_policy() {
        assert!(SyncError::Connect("x".into()).is_retryable());
        assert!(SyncError::Unknown("x".into()).is_retryable());
        assert!(!SyncError::Cert("x".into()).is_retryable());
        assert!(!SyncError::File("x".into()).is_retryable());
        assert!(!SyncError::ReauthRequired("x".into()).is_retryable());
    }

    #[test]
    fn test_narrow_never_widens() {
        let kept = SyncError::Connect("down".into()).narrow(SyncError::Unknown("later".into()));
        assert_eq!(kept.kind(), ErrorKind::FailedToConnect);

        let narrowed = SyncError::Unknown("first".into()).narrow(SyncError::File("gone".into()));
        assert_eq!(narrowed.kind(), ErrorKind::FailedFile);
    }

    #[test]
    fn test_certificate_failure_in_source_chain() {
        let err = Wrapped {
            message: "error sending request",
            source: Some(Box::new(Wrapped {
                message: "invalid peer certificate: UnknownIssuer",
                source: None,
            })),
        };
        assert!(is_certificate_failure(&err));

        let refused = Wrapped {
            message: "error sending request",
            source: Some(Box::new(Wrapped {
                message: "Connection refused (os error 111)",
                source: None,
            })),
        };
        assert!(!is_certificate_failure(&refused));
        assert_eq!(root_cause(&refused), "Connection refused (os error 111)");
    }
}
