//! Error type shared by the gRPC server and its clients.
//!
//! `From<Error> for Status` turns server-side failures into gRPC statuses;
//! `From<Status> for Error` recovers the typed error on the client. Fields
//! that the status message cannot carry losslessly travel as metadata:
//!
//! - clock rollback: `snowfleet-behind-ms`, `snowfleet-last-timestamp`,
//!   `snowfleet-now`
//! - invalid batch size: `snowfleet-requested`
//! - unknown worker: `snowfleet-worker-id`

use tonic::{Code, Status, metadata::MetadataMap};

use crate::common::types::MAX_BATCH_SIZE;

pub type Result<T> = core::result::Result<T, Error>;

pub const BEHIND_MS_KEY: &str = "snowfleet-behind-ms";
const LAST_TIMESTAMP_KEY: &str = "snowfleet-last-timestamp";
const NOW_KEY: &str = "snowfleet-now";
const REQUESTED_KEY: &str = "snowfleet-requested";
const WORKER_ID_KEY: &str = "snowfleet-worker-id";

/// Unified error type for the ID RPC.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The generator refused the request.
    #[error("ID generation failed: {0}")]
    IdGeneration(#[from] snowfleet::Error),

    /// The server does not serve the requested worker slot.
    #[error("worker {worker_id} is not served by this node")]
    UnknownWorker { worker_id: i64 },

    /// The client request was invalid or exceeded constraints.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// The call never reached a working server (connection refused, reset,
    /// deadline exceeded, server unavailable).
    #[error("transport failure: {reason}")]
    Transport { reason: String },

    /// Any other server-side failure.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl Error {
    /// Whether another endpoint may succeed where this call failed.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::ServiceShutdown)
    }
}

fn insert(metadata: &mut MetadataMap, key: &'static str, value: impl ToString) {
    if let Ok(value) = value.to_string().parse() {
        metadata.insert(key, value);
    }
}

fn read<T: core::str::FromStr>(metadata: &MetadataMap, key: &str) -> Option<T> {
    metadata.get(key)?.to_str().ok()?.parse().ok()
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::IdGeneration(e) => match e {
                snowfleet::Error::ClockRollback {
                    last_timestamp,
                    now,
                } => {
                    let mut status = Status::failed_precondition(message);
                    let metadata = status.metadata_mut();
                    insert(metadata, BEHIND_MS_KEY, e.behind_ms());
                    insert(metadata, LAST_TIMESTAMP_KEY, last_timestamp);
                    insert(metadata, NOW_KEY, now);
                    status
                }
                snowfleet::Error::InvalidCount { requested, .. } => {
                    let mut status = Status::invalid_argument(message);
                    insert(status.metadata_mut(), REQUESTED_KEY, requested);
                    status
                }
                _ => Status::internal(message),
            },
            Error::UnknownWorker { worker_id } => {
                let mut status = Status::not_found(message);
                insert(status.metadata_mut(), WORKER_ID_KEY, worker_id);
                status
            }
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::ServiceShutdown => Status::unavailable(message),
            Error::Transport { reason } => Status::unavailable(reason),
            Error::Internal { reason } => Status::internal(reason),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        let metadata = status.metadata();
        let reason = status.message().to_string();
        match status.code() {
            Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::Unknown => {
                Self::Transport { reason }
            }
            Code::FailedPrecondition => {
                match (
                    read(metadata, LAST_TIMESTAMP_KEY),
                    read(metadata, NOW_KEY),
                ) {
                    (Some(last_timestamp), Some(now)) => {
                        Self::IdGeneration(snowfleet::Error::ClockRollback {
                            last_timestamp,
                            now,
                        })
                    }
                    _ => Self::Internal { reason },
                }
            }
            Code::InvalidArgument => match read(metadata, REQUESTED_KEY) {
                Some(requested) => Self::IdGeneration(snowfleet::Error::InvalidCount {
                    requested,
                    max: MAX_BATCH_SIZE,
                }),
                None => Self::InvalidRequest { reason },
            },
            Code::NotFound => match read(metadata, WORKER_ID_KEY) {
                Some(worker_id) => Self::UnknownWorker { worker_id },
                None => Self::Internal { reason },
            },
            _ => Self::Internal { reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn through_status(err: Error) -> (Code, Error) {
        let status = Status::from(err);
        (status.code(), Error::from(status))
    }

    #[test]
    fn clock_rollback_keeps_its_fields() {
        let err = Error::IdGeneration(snowfleet::Error::ClockRollback {
            last_timestamp: 1_700_000_000_500,
            now: 1_700_000_000_000,
        });
        let status = Status::from(err.clone());
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(
            status
                .metadata()
                .get(BEHIND_MS_KEY)
                .and_then(|v| v.to_str().ok()),
            Some("500")
        );
        assert_eq!(Error::from(status), err);
    }

    #[test]
    fn invalid_count_maps_to_invalid_argument() {
        let err = Error::IdGeneration(snowfleet::Error::InvalidCount {
            requested: -3,
            max: MAX_BATCH_SIZE,
        });
        assert_eq!(through_status(err.clone()), (Code::InvalidArgument, err));

        let err = Error::InvalidRequest {
            reason: "missing body".into(),
        };
        assert_eq!(through_status(err.clone()), (Code::InvalidArgument, err));
    }

    #[test]
    fn unknown_worker_maps_to_not_found() {
        let err = Error::UnknownWorker { worker_id: 9 };
        assert_eq!(through_status(err.clone()), (Code::NotFound, err));
    }

    #[test]
    fn shutdown_and_transport_failures_are_retryable() {
        let (code, decoded) = through_status(Error::ServiceShutdown);
        assert_eq!(code, Code::Unavailable);
        assert!(decoded.is_transport());

        for code in [
            Code::Unavailable,
            Code::DeadlineExceeded,
            Code::Cancelled,
            Code::Unknown,
        ] {
            assert!(Error::from(Status::new(code, "boom")).is_transport());
        }
        assert!(!Error::from(Status::internal("boom")).is_transport());
    }

    #[test]
    fn other_generator_faults_are_internal() {
        let (code, decoded) =
            through_status(Error::IdGeneration(snowfleet::Error::LockPoisoned));
        assert_eq!(code, Code::Internal);
        assert!(matches!(decoded, Error::Internal { .. }));
    }
}
