use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed key {key:?}: {reason}")]
    MalformedKey { key: String, reason: &'static str },

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("watch stream closed by server")]
    WatchClosed,

    #[error("watch canceled: {reason}")]
    WatchCanceled { reason: String },

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    #[error("failed to write {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode target groups: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    /// True for failures of the store connection or subscription, which the
    /// reconciler retries with backoff.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Error::Etcd(_) | Error::ConnectTimeout(_) | Error::WatchClosed | Error::WatchCanceled { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_classified() {
        assert!(Error::WatchClosed.is_connection());
        assert!(Error::ConnectTimeout(Duration::from_secs(5)).is_connection());
        assert!(Error::WatchCanceled {
            reason: "compacted".to_string()
        }
        .is_connection());

        let malformed = Error::MalformedKey {
            key: "/services/".to_string(),
            reason: "missing service segment",
        };
        assert!(!malformed.is_connection());
    }

    #[test]
    fn persist_error_names_the_path() {
        let err = Error::Persist {
            path: PathBuf::from("/tmp/tg_group.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/tg_group.json"));
        assert!(msg.contains("denied"));
    }
}
