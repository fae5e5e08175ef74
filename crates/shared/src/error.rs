use serde::{Deserialize, Serialize};

/// Flat classification of core failures for callers that only need to branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AlreadyExists,
    NotFound,
    AlreadyConnected,
    NotConnected,
    Cancelled,
    CorruptSnapshot,
    TransportFailure,
    AggregateFailure,
    Validation,
    Internal,
}
