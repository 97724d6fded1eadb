use crate::types::PixelRect;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;

/// Observable zoom ratio.
///
/// `set` publishes atomically and posts the value to every subscriber's own
/// queue: a slow subscriber builds a backlog instead of stalling the setter
/// or other subscribers, and no accepted value is ever skipped.
pub struct ZoomState {
    bits: AtomicU32,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<f32>>>,
}

impl ZoomState {
    pub fn new(initial: f32) -> Self {
        Self {
            bits: AtomicU32::new(initial.to_bits()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn set(&self, ratio: f32) {
        self.bits.store(ratio.to_bits(), Ordering::Release);
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|tx| tx.send(ratio).is_ok());
    }

    /// Registers a new observer. Values set after this call are delivered in
    /// set order; the subscription ends when the receiver is dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<f32> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.push(tx);
        rx
    }
}

/// Crop rectangle implementing digital zoom: the centered sub-region of the
/// active array whose dimensions shrink by the zoom factor. Ratios below 1.0
/// are treated as 1.0.
pub fn zoomed_crop_region(active_array: PixelRect, zoom: f32) -> PixelRect {
    let zoom = if zoom < 1.0 { 1.0 } else { zoom };
    let width = (active_array.width as f32 / zoom) as u32;
    let height = (active_array.height as f32 / zoom) as u32;
    PixelRect {
        x: active_array.x + (active_array.width - width) / 2,
        y: active_array.y + (active_array.height - height) / 2,
        width,
        height,
    }
}
