use crate::types::Timestamp;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by the device collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device is busy")]
    Busy,

    #[error("device disconnected")]
    Disconnected,

    #[error("capture session closed")]
    SessionClosed,

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Engine-level failure taxonomy surfaced to callers.
///
/// Command failures are logged at the worker loop and never abort it;
/// a failed capture or scan resolves its handle with one of these instead
/// of propagating past the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("request has no output streams")]
    NoStreams,

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("frame at timestamp {0} dropped before delivery")]
    FrameDropped(Timestamp),

    #[error("no correlated frame within {0:?}")]
    CorrelationTimeout(Duration),

    #[error("focus scan did not settle within {0:?}")]
    ScanTimeout(Duration),

    #[error("a focus scan is already running")]
    ScanInProgress,

    #[error("focus scan cancelled")]
    ScanCancelled,

    #[error("engine is shut down")]
    ShutDown,
}
