use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sensor timestamp in nanoseconds.
///
/// The device stamps every exposure with a strictly increasing value, which
/// is the correlation key shared by frames, metadata and in-flight captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn as_nanos(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One output destination attached to the device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl StreamId {
    /// Allocates a process-unique stream id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One submitted capture request.
///
/// Ids are handed out by the frame server before the request reaches the
/// device, so a device event can always be resolved back to its request.
/// Allocation order makes the ordering meaningful: a larger id was
/// submitted later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub(crate) u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Axis-aligned pixel rectangle in sensor active-array coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Weighted metering rectangle used as a 3A (AF/AE) region hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeteringRegion {
    pub rect: PixelRect,
    pub weight: u32,
}

/// Quarter-turn orientation, clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Orientation {
    pub fn degrees(self) -> u32 {
        match self {
            Orientation::Deg0 => 0,
            Orientation::Deg90 => 90,
            Orientation::Deg180 => 180,
            Orientation::Deg270 => 270,
        }
    }

    /// Snaps an angle in degrees to the nearest quarter turn.
    pub fn from_degrees(degrees: u32) -> Self {
        match ((degrees + 45) / 90) % 4 {
            1 => Orientation::Deg90,
            2 => Orientation::Deg180,
            3 => Orientation::Deg270,
            _ => Orientation::Deg0,
        }
    }
}

/// Focus signal the device reports in each metadata bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusSignal {
    /// No scan in progress.
    Inactive,
    /// A scan is sweeping the lens.
    Scanning,
    /// The scan settled on a focus distance.
    Converged,
    /// The scan ended without finding focus.
    Unable,
}

/// One buffer delivered by the device. The payload is opaque to the engine;
/// downstream consumers interpret the pixel layout.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub stream: StreamId,
    pub timestamp: Timestamp,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Per-exposure result bundle, delivered asynchronously in the same
/// timestamp domain as frames.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub timestamp: Timestamp,
    pub frame_number: u64,
    pub focus: FocusSignal,
    /// Crop region the device actually applied, when one was requested.
    pub crop_region: Option<PixelRect>,
}
