use crate::errors::DeviceError;
use crate::request::CaptureRequest;
use crate::types::{FrameMetadata, RawFrame, RequestId, Timestamp};
use async_trait::async_trait;
use std::sync::Arc;

/// How a request is scheduled on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionMode {
    /// One exposure.
    Single,
    /// Resubmitted continuously until stopped or superseded.
    Repeating,
}

/// Events the device pushes back to the engine.
///
/// For each exposure the device emits `ExposureStarted`, then one
/// `FrameAvailable` per output stream, then `MetadataAvailable`. Frames and
/// metadata share one strictly increasing timestamp domain; arrival order at
/// the engine is otherwise unspecified.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    ExposureStarted {
        request: RequestId,
        timestamp: Timestamp,
    },
    FrameAvailable(RawFrame),
    MetadataAvailable {
        request: RequestId,
        metadata: FrameMetadata,
    },
}

/// Boundary to the capture hardware (or a synthetic stand-in).
///
/// The engine allocates the request id before calling `submit`, so every
/// event the device emits can be resolved even if it races the submit call's
/// return.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn submit(
        &self,
        id: RequestId,
        request: Arc<CaptureRequest>,
        mode: SubmissionMode,
    ) -> Result<(), DeviceError>;

    /// Stops the active repeating request, if any.
    async fn stop_repeating(&self) -> Result<(), DeviceError>;
}
