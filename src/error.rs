use itertools::Itertools;
use std::fmt;

/// One group of batch failures sharing the same error signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorGroup {
    pub message: String,
    pub services: Vec<String>,
}

impl fmt::Display for ErrorGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (services: {})", self.message, self.services.join(", "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RdirError {
    /// No rdir is linked to the volume. Expected on the read path; drives
    /// the assignment write path.
    #[error("no rdir assigned to volume {0}")]
    NotLinked(String),

    /// No healthy backend of a required kind is available.
    #[error("{0}")]
    Unavailable(String),

    /// Transport-level failure (connection refused, timeout, reset). The
    /// only class eligible for backoff retry; triggers address cache
    /// invalidation.
    #[error("network error: {0}")]
    Network(String),

    /// Application-level error from a remote service, carrying the HTTP
    /// status so callers can decide retry eligibility case by case.
    #[error("status {status}: {message}")]
    Status { status: u16, message: String },

    /// A remote answer failed an internal consistency check.
    #[error("incoherent server response: {0}")]
    Incoherent(String),

    /// A whole batch failed with a single error kind; carries every
    /// affected volume id.
    #[error("{source} (services: {})", services.join(", "))]
    BatchFailed {
        source: Box<RdirError>,
        services: Vec<String>,
    },

    /// A batch failed with several distinct error kinds.
    #[error("several errors encountered: {}", .0.iter().map(|g| g.to_string()).join("; "))]
    Aggregate(Vec<ErrorGroup>),
}

impl RdirError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RdirError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Signature used to group per-item batch failures: failures with the
    /// same signature are reported once, with all affected services.
    fn signature(&self) -> String {
        self.to_string()
    }
}

impl From<reqwest::Error> for RdirError {
    fn from(err: reqwest::Error) -> Self {
        // Same classification as a health prober: only errors that indicate
        // the peer is unreachable count as network failures.
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            RdirError::Network(err.to_string())
        } else if let Some(status) = err.status() {
            RdirError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            RdirError::Incoherent(err.to_string())
        }
    }
}

/// Collapses per-service failures collected over a batch into one error.
///
/// A single distinct signature is re-raised as [`RdirError::BatchFailed`]
/// wrapping the first occurrence, so a systemic failure is not misreported
/// as N unrelated ones. Mixed signatures become [`RdirError::Aggregate`]
/// with one group per signature.
pub fn group_batch_errors(errors: Vec<(String, RdirError)>) -> Option<RdirError> {
    if errors.is_empty() {
        return None;
    }

    let mut groups: Vec<(String, RdirError, Vec<String>)> = Vec::new();
    for (service, err) in errors {
        let sig = err.signature();
        match groups.iter_mut().find(|(s, _, _)| *s == sig) {
            Some((_, _, services)) => services.push(service),
            None => groups.push((sig, err, vec![service])),
        }
    }

    if groups.len() == 1 {
        let (_, err, services) = groups.pop()?;
        Some(RdirError::BatchFailed {
            source: Box::new(err),
            services,
        })
    } else {
        Some(RdirError::Aggregate(
            groups
                .into_iter()
                .map(|(message, _, services)| ErrorGroup { message, services })
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_empty() {
        assert!(group_batch_errors(Vec::new()).is_none());
    }

    #[test]
    fn test_group_single_kind() {
        let errors = vec![
            (
                "127.0.0.1:6001".to_string(),
                RdirError::Unavailable("no valid rdir".to_string()),
            ),
            (
                "127.0.0.1:6002".to_string(),
                RdirError::Unavailable("no valid rdir".to_string()),
            ),
        ];

        match group_batch_errors(errors) {
            Some(RdirError::BatchFailed { source, services }) => {
                assert!(matches!(*source, RdirError::Unavailable(_)));
                assert_eq!(services, vec!["127.0.0.1:6001", "127.0.0.1:6002"]);
            }
            other => panic!("expected BatchFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_group_mixed_kinds() {
        let errors = vec![
            (
                "127.0.0.1:6001".to_string(),
                RdirError::Unavailable("no valid rdir".to_string()),
            ),
            (
                "127.0.0.1:6002".to_string(),
                RdirError::Status {
                    status: 503,
                    message: "busy".to_string(),
                },
            ),
        ];

        match group_batch_errors(errors) {
            Some(RdirError::Aggregate(groups)) => {
                assert_eq!(groups.len(), 2);
                assert_eq!(groups[0].services, vec!["127.0.0.1:6001"]);
                assert_eq!(groups[1].services, vec!["127.0.0.1:6002"]);
            }
            other => panic!("expected Aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_status_accessor() {
        let err = RdirError::Status {
            status: 481,
            message: "no candidate".to_string(),
        };
        assert_eq!(err.status(), Some(481));
        assert_eq!(RdirError::NotLinked("v".to_string()).status(), None);
    }
}
