use crate::device::{CaptureDevice, DeviceEvent, SubmissionMode};
use crate::errors::DeviceError;
use crate::request::{AfTrigger, CaptureRequest, Control, ControlKey};
use crate::types::{FocusSignal, FrameMetadata, PixelRect, RawFrame, RequestId, Timestamp};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Exposures a scripted focus scan spends sweeping before it converges.
const SCAN_EXPOSURES: u32 = 3;

/// A virtual capture device that fabricates exposures.
///
/// Repeating submissions tick at the configured rate; singles expose
/// immediately. Every exposure emits the started/frame/metadata triple with
/// gradient-patterned pixels, echoes the request's crop region into its
/// metadata and advances the scripted focus state. The ticker holds the
/// device alive until the event receiver goes away.
pub struct SyntheticDevice {
    events: mpsc::UnboundedSender<DeviceEvent>,
    self_ref: Weak<SyntheticDevice>,
    state: Mutex<DeviceState>,
    focus: Mutex<FocusPhase>,
    clock: AtomicU64,
    frame_number: AtomicU64,
    frame_interval: Duration,
    width: u32,
    height: u32,
}

struct DeviceState {
    ticker: Option<JoinHandle<()>>,
}

enum FocusPhase {
    Passive,
    Scanning { remaining: u32 },
    Held,
}

impl FocusPhase {
    fn advance(&mut self) -> FocusSignal {
        match self {
            FocusPhase::Passive => FocusSignal::Inactive,
            FocusPhase::Scanning { remaining } if *remaining > 0 => {
                *remaining -= 1;
                FocusSignal::Scanning
            }
            FocusPhase::Scanning { .. } => {
                *self = FocusPhase::Held;
                FocusSignal::Converged
            }
            FocusPhase::Held => FocusSignal::Converged,
        }
    }
}

impl SyntheticDevice {
    /// Creates the device and the channel its events arrive on.
    pub fn connect(
        frame_interval: Duration,
        width: u32,
        height: u32,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let interval_ns = frame_interval.as_nanos() as u64;
        let device = Arc::new_cyclic(|weak| Self {
            events: tx,
            self_ref: weak.clone(),
            state: Mutex::new(DeviceState { ticker: None }),
            focus: Mutex::new(FocusPhase::Passive),
            clock: AtomicU64::new(interval_ns.max(1)),
            frame_number: AtomicU64::new(0),
            frame_interval,
            width,
            height,
        });
        (device, rx)
    }

    fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn next_timestamp(&self) -> Timestamp {
        let interval_ns = (self.frame_interval.as_nanos() as u64).max(1);
        Timestamp(self.clock.fetch_add(interval_ns, Ordering::Relaxed))
    }

    fn apply_triggers(&self, request: &CaptureRequest) {
        let Some(Control::AfTrigger(trigger)) = request.control(ControlKey::AfTrigger) else {
            return;
        };
        let mut focus = match self.focus.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *focus = match trigger {
            AfTrigger::Start => FocusPhase::Scanning {
                remaining: SCAN_EXPOSURES,
            },
            AfTrigger::Cancel => FocusPhase::Passive,
        };
    }

    fn crop_of(request: &CaptureRequest) -> Option<PixelRect> {
        match request.control(ControlKey::CropRegion) {
            Some(Control::CropRegion(rect)) => Some(*rect),
            _ => None,
        }
    }

    /// Emits one full exposure for `request`. False once the receiver is
    /// gone.
    fn emit_exposure(&self, id: RequestId, request: &CaptureRequest) -> bool {
        let timestamp = self.next_timestamp();
        let frame_number = self.frame_number.fetch_add(1, Ordering::Relaxed) + 1;

        if self
            .events
            .send(DeviceEvent::ExposureStarted {
                request: id,
                timestamp,
            })
            .is_err()
        {
            return false;
        }

        for stream in &request.streams {
            let frame = RawFrame {
                stream: *stream,
                timestamp,
                width: self.width,
                height: self.height,
                data: gradient_pixels(self.width, self.height, frame_number as u8),
            };
            if self.events.send(DeviceEvent::FrameAvailable(frame)).is_err() {
                return false;
            }
        }

        let focus = match self.focus.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
        .advance();
        let metadata = FrameMetadata {
            timestamp,
            frame_number,
            focus,
            crop_region: Self::crop_of(request),
        };
        self.events
            .send(DeviceEvent::MetadataAvailable {
                request: id,
                metadata,
            })
            .is_ok()
    }
}

#[async_trait]
impl CaptureDevice for SyntheticDevice {
    async fn submit(
        &self,
        id: RequestId,
        request: Arc<CaptureRequest>,
        mode: SubmissionMode,
    ) -> Result<(), DeviceError> {
        if self.events.is_closed() {
            return Err(DeviceError::Disconnected);
        }
        self.apply_triggers(&request);

        match mode {
            SubmissionMode::Single => {
                if !self.emit_exposure(id, &request) {
                    return Err(DeviceError::Disconnected);
                }
            }
            SubmissionMode::Repeating => {
                let Some(device) = self.self_ref.upgrade() else {
                    return Err(DeviceError::Disconnected);
                };
                let ticker = tokio::spawn(async move {
                    let mut interval = tokio::time::interval(device.frame_interval);
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        interval.tick().await;
                        if !device.emit_exposure(id, &request) {
                            break;
                        }
                    }
                });
                let mut state = self.lock_state();
                if let Some(old) = state.ticker.replace(ticker) {
                    old.abort();
                }
            }
        }
        Ok(())
    }

    async fn stop_repeating(&self) -> Result<(), DeviceError> {
        if let Some(ticker) = self.lock_state().ticker.take() {
            ticker.abort();
        }
        Ok(())
    }
}

/// Gradient test pattern, offset per frame so consecutive frames differ.
fn gradient_pixels(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let mut data = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let luma = ((x * 255 / width.max(1)) as u8)
                .wrapping_add((y * 255 / height.max(1)) as u8)
                .wrapping_add(seed);
            data.push(luma);
        }
    }
    data
}
