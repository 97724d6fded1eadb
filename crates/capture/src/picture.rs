use crate::commands::{CameraCommand, CommandExecutor};
use crate::distributor::{
    ConsumerEvent, ConsumerFilter, FrameConsumer, FrameDistributor, FrameLease,
};
use crate::errors::CaptureError;
use crate::frame_server::FrameServer;
use crate::request::{RequestKind, RequestTemplate, ResponseListener};
use crate::types::{FrameMetadata, Orientation, RequestId, StreamId, Timestamp};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// A correlated still capture ready for persistence.
pub struct Picture {
    pub frame: FrameLease,
    pub metadata: FrameMetadata,
    /// Clockwise rotation to apply so the image displays upright.
    pub rotation: Orientation,
}

/// Persistence collaborator. Encoding and storage live behind this seam;
/// the engine hands a picture over and only observes the verdict.
#[async_trait]
pub trait ImageSaver: Send + Sync {
    async fn save(&self, picture: Picture) -> anyhow::Result<()>;
}

/// Clockwise rotation that brings a sensor-oriented image upright on a
/// device held at `device` orientation.
pub fn image_rotation(sensor: Orientation, device: Orientation) -> Orientation {
    Orientation::from_degrees((sensor.degrees() + 360 - device.degrees()) % 360)
}

/// Resolves with the exposure timestamp once the capture has been
/// correlated and handed to the saver.
pub struct CaptureHandle {
    rx: oneshot::Receiver<Result<Timestamp, CaptureError>>,
}

impl CaptureHandle {
    pub async fn outcome(self) -> Result<Timestamp, CaptureError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::ShutDown),
        }
    }
}

/// Still-capture front end.
///
/// Every capture gets its own stream id and a consumer registered for it
/// before the device sees the request, so the frame cannot slip past the
/// distributor unclaimed. The image rotation is fixed at construction from
/// the sensor and device orientations.
pub struct PictureTaker {
    executor: Arc<CommandExecutor>,
    template: Arc<RequestTemplate>,
    server: Arc<FrameServer>,
    distributor: Arc<FrameDistributor>,
    saver: Arc<dyn ImageSaver>,
    rotation: Orientation,
    capture_window: Duration,
}

impl PictureTaker {
    pub fn new(
        executor: Arc<CommandExecutor>,
        template: Arc<RequestTemplate>,
        server: Arc<FrameServer>,
        distributor: Arc<FrameDistributor>,
        saver: Arc<dyn ImageSaver>,
        rotation: Orientation,
        capture_window: Duration,
    ) -> Self {
        Self {
            executor,
            template,
            server,
            distributor,
            saver,
            rotation,
            capture_window,
        }
    }

    /// Takes one still picture. The handle resolves once the frame and its
    /// metadata have been paired and handed to the saver, or with the
    /// failure that ended the attempt.
    pub fn capture(&self) -> CaptureHandle {
        let (tx, rx) = oneshot::channel();
        let command = StillCaptureCommand {
            template: self.template.clone(),
            server: self.server.clone(),
            distributor: self.distributor.clone(),
            saver: self.saver.clone(),
            rotation: self.rotation,
            capture_window: self.capture_window,
            outcome_tx: Mutex::new(Some(tx)),
        };
        // A rejected enqueue drops the command, which closes the channel
        // and resolves the handle as shut down.
        if let Err(e) = self.executor.execute(Box::new(command)) {
            tracing::debug!(error = %e, "capture not enqueued");
        }
        CaptureHandle { rx }
    }
}

/// Logs the shutter moment of a still exposure.
struct Shutter;

impl ResponseListener for Shutter {
    fn on_exposure_started(&self, request: RequestId, timestamp: Timestamp) {
        tracing::info!(request = %request, %timestamp, "still exposure started");
    }
}

struct StillCaptureCommand {
    template: Arc<RequestTemplate>,
    server: Arc<FrameServer>,
    distributor: Arc<FrameDistributor>,
    saver: Arc<dyn ImageSaver>,
    rotation: Orientation,
    capture_window: Duration,
    outcome_tx: Mutex<Option<oneshot::Sender<Result<Timestamp, CaptureError>>>>,
}

#[async_trait]
impl CameraCommand for StillCaptureCommand {
    fn name(&self) -> &'static str {
        "take_picture"
    }

    async fn run(&self) -> Result<(), CaptureError> {
        let taken = match self.outcome_tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
        .take();
        let Some(outcome_tx) = taken else {
            return Ok(());
        };

        // Register before submitting so the very first frame on the fresh
        // stream already has its consumer.
        let stream = StreamId::next();
        let consumer = self.distributor.register(ConsumerFilter::Stream(stream));

        let shutter: Arc<dyn ResponseListener> = Arc::new(Shutter);
        let request = match self
            .template
            .build(RequestKind::StillCapture, &[stream], &[shutter])
        {
            Ok(request) => request,
            Err(e) => {
                let _ = outcome_tx.send(Err(e.clone()));
                return Err(e);
            }
        };

        let submitted = {
            let mut session = match self.server.exclusive_session().await {
                Ok(session) => session,
                Err(e) => {
                    let _ = outcome_tx.send(Err(e.clone().into()));
                    return Err(e.into());
                }
            };
            session.submit(request).await
        };
        let request_id = match submitted {
            Ok(id) => id,
            Err(e) => {
                let _ = outcome_tx.send(Err(e.clone()));
                return Err(e);
            }
        };

        // The worker moves on; correlation and handoff run off it.
        let saver = self.saver.clone();
        let rotation = self.rotation;
        let window = self.capture_window;
        tokio::spawn(complete_capture(
            request_id, consumer, saver, rotation, window, outcome_tx,
        ));
        Ok(())
    }
}

async fn complete_capture(
    request: RequestId,
    mut consumer: FrameConsumer,
    saver: Arc<dyn ImageSaver>,
    rotation: Orientation,
    window: Duration,
    outcome_tx: oneshot::Sender<Result<Timestamp, CaptureError>>,
) {
    let waited = tokio::time::timeout(window, consumer.next_event()).await;
    let failure = match waited {
        Ok(Some(ConsumerEvent::Frame(frame, metadata))) => {
            let timestamp = frame.timestamp();
            tracing::info!(request = %request, %timestamp, "still capture correlated");
            let picture = Picture {
                frame,
                metadata,
                rotation,
            };
            // Handoff ends the engine's responsibility; the saver's verdict
            // is observed only.
            let _ = outcome_tx.send(Ok(timestamp));
            if let Err(e) = saver.save(picture).await {
                tracing::error!(%timestamp, error = %e, "image saver failed");
            }
            return;
        }
        Ok(Some(ConsumerEvent::Dropped { timestamp, .. })) => {
            CaptureError::FrameDropped(timestamp)
        }
        Ok(None) => CaptureError::ShutDown,
        Err(_) => CaptureError::CorrelationTimeout(window),
    };
    // Dropping the consumer releases anything still pending for the stream.
    tracing::warn!(request = %request, error = %failure, "still capture failed");
    let _ = outcome_tx.send(Err(failure));
}
