use crate::errors::CaptureError;
use crate::types::{FrameMetadata, MeteringRegion, PixelRect, RequestId, StreamId, Timestamp};
use std::sync::Arc;

/// Autofocus mode carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfMode {
    ContinuousPicture,
    Auto,
}

/// One-shot autofocus trigger overlaid on a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfTrigger {
    Start,
    Cancel,
}

/// One request control. The variant is the key: setting a control whose key
/// is already present replaces the earlier value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    CropRegion(PixelRect),
    AfRegions(Vec<MeteringRegion>),
    AeRegions(Vec<MeteringRegion>),
    AfMode(AfMode),
    AfTrigger(AfTrigger),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKey {
    CropRegion,
    AfRegions,
    AeRegions,
    AfMode,
    AfTrigger,
}

impl Control {
    pub fn key(&self) -> ControlKey {
        match self {
            Control::CropRegion(_) => ControlKey::CropRegion,
            Control::AfRegions(_) => ControlKey::AfRegions,
            Control::AeRegions(_) => ControlKey::AeRegions,
            Control::AfMode(_) => ControlKey::AfMode,
            Control::AfTrigger(_) => ControlKey::AfTrigger,
        }
    }
}

/// Observes responses for every request built from a template carrying the
/// listener, regardless of whether the request drove preview or a capture.
pub trait ResponseListener: Send + Sync {
    /// Called when the sensor starts exposing a frame for `request`.
    fn on_exposure_started(&self, _request: RequestId, _timestamp: Timestamp) {}

    /// Called when the full result bundle for an exposure arrives.
    fn on_metadata(&self, _request: RequestId, _metadata: &FrameMetadata) {}
}

/// Distinguishes the device-side processing template of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Preview,
    StillCapture,
}

/// An immutable, fully resolved capture request. Dynamic control suppliers
/// were read at build time; nothing in here changes after construction.
#[derive(Clone)]
pub struct CaptureRequest {
    pub kind: RequestKind,
    pub streams: Vec<StreamId>,
    controls: Vec<Control>,
    listeners: Vec<Arc<dyn ResponseListener>>,
}

impl std::fmt::Debug for CaptureRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureRequest")
            .field("kind", &self.kind)
            .field("streams", &self.streams)
            .field("controls", &self.controls)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl CaptureRequest {
    pub fn controls(&self) -> &[Control] {
        &self.controls
    }

    pub fn control(&self, key: ControlKey) -> Option<&Control> {
        self.controls.iter().find(|c| c.key() == key)
    }

    pub(crate) fn listeners(&self) -> &[Arc<dyn ResponseListener>] {
        &self.listeners
    }

    /// Copy of this request with one control overlaid, replacing any value
    /// under the same key. Used for one-shot trigger/cancel submissions.
    pub(crate) fn with_control(&self, control: Control) -> CaptureRequest {
        let mut copy = self.clone();
        set_control(&mut copy.controls, control);
        copy
    }
}

fn set_control(controls: &mut Vec<Control>, control: Control) {
    match controls.iter_mut().find(|c| c.key() == control.key()) {
        Some(slot) => *slot = control,
        None => controls.push(control),
    }
}

enum Binding {
    Fixed(Control),
    Supplied(Arc<dyn Fn() -> Control + Send + Sync>),
}

/// Accumulates the streams, listeners and controls shared by every request
/// the engine submits.
///
/// Accumulation only ever grows: extras passed to [`build`](Self::build) are
/// per-call and never remove base entries. A control bound to a supplier is
/// resolved on each build, so requests always reflect the supplier's value
/// at build time rather than at bind time.
pub struct RequestTemplate {
    streams: Vec<StreamId>,
    listeners: Vec<Arc<dyn ResponseListener>>,
    bindings: Vec<Binding>,
}

impl Default for RequestTemplate {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTemplate {
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
            listeners: Vec::new(),
            bindings: Vec::new(),
        }
    }

    pub fn add_stream(&mut self, stream: StreamId) {
        if !self.streams.contains(&stream) {
            self.streams.push(stream);
        }
    }

    pub fn add_response_listener(&mut self, listener: Arc<dyn ResponseListener>) {
        self.listeners.push(listener);
    }

    /// Sets a fixed control value.
    pub fn set_control(&mut self, control: Control) {
        self.bindings.push(Binding::Fixed(control));
    }

    /// Binds a control to a supplier read on every build.
    pub fn bind_control(&mut self, supplier: impl Fn() -> Control + Send + Sync + 'static) {
        self.bindings.push(Binding::Supplied(Arc::new(supplier)));
    }

    /// Snapshots the accumulated state plus the per-call extras into an
    /// immutable request. Later writes to a control key win, suppliers are
    /// resolved now, and a request without a single output stream is
    /// rejected.
    pub fn build(
        &self,
        kind: RequestKind,
        extra_streams: &[StreamId],
        extra_listeners: &[Arc<dyn ResponseListener>],
    ) -> Result<CaptureRequest, CaptureError> {
        let mut streams = self.streams.clone();
        for stream in extra_streams {
            if !streams.contains(stream) {
                streams.push(*stream);
            }
        }
        if streams.is_empty() {
            return Err(CaptureError::NoStreams);
        }

        let mut controls = Vec::new();
        for binding in &self.bindings {
            let control = match binding {
                Binding::Fixed(control) => control.clone(),
                Binding::Supplied(supplier) => supplier(),
            };
            set_control(&mut controls, control);
        }

        let mut listeners = self.listeners.clone();
        listeners.extend(extra_listeners.iter().cloned());

        Ok(CaptureRequest {
            kind,
            streams,
            controls,
            listeners,
        })
    }
}
