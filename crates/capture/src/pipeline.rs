use crate::autofocus::{AfCore, AutofocusController};
use crate::commands::{CommandExecutor, PreviewRunner};
use crate::config::PipelineConfig;
use crate::device::{CaptureDevice, DeviceEvent};
use crate::distributor::{ConsumerFilter, FrameConsumer, FrameDistributor};
use crate::frame_server::{FrameServer, RequestRegistry};
use crate::picture::{image_rotation, ImageSaver, PictureTaker};
use crate::request::{Control, RequestTemplate, ResponseListener};
use crate::types::StreamId;
use crate::zoom::{zoomed_crop_region, ZoomState};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The assembled capture engine.
///
/// `start` wires every collaborator around one shared request template and
/// one device session, starts the background tasks and kicks off the first
/// preview. The pipeline stays alive until [`shutdown`](Self::shutdown).
pub struct CapturePipeline {
    executor: Arc<CommandExecutor>,
    server: Arc<FrameServer>,
    distributor: Arc<FrameDistributor>,
    zoom: Arc<ZoomState>,
    autofocus: AutofocusController,
    taker: PictureTaker,
    preview_stream: StreamId,
    ingest: JoinHandle<()>,
    zoom_watcher: JoinHandle<()>,
}

impl CapturePipeline {
    pub fn start(
        device: Arc<dyn CaptureDevice>,
        events: mpsc::UnboundedReceiver<DeviceEvent>,
        saver: Arc<dyn ImageSaver>,
        observers: Vec<Arc<dyn ResponseListener>>,
        config: PipelineConfig,
    ) -> Self {
        let registry = Arc::new(RequestRegistry::new());
        let server = Arc::new(FrameServer::new(device, registry.clone()));
        let distributor = Arc::new(FrameDistributor::new(
            config.pool_capacity,
            config.pairing_window,
        ));

        let zoom = Arc::new(ZoomState::new(1.0));
        let core = Arc::new(AfCore::new());

        // The template shared by every operation. Streams, listeners and
        // controls added here ride on every request sent to the device.
        let mut template = RequestTemplate::new();
        for observer in observers {
            template.add_response_listener(observer);
        }
        {
            let zoom = zoom.clone();
            let active_array = config.active_array();
            template.bind_control(move || {
                Control::CropRegion(zoomed_crop_region(active_array, zoom.get()))
            });
        }
        let preview_stream = StreamId::next();
        template.add_stream(preview_stream);

        template.add_response_listener(core.watcher());
        {
            let core = core.clone();
            template.bind_control(move || Control::AfMode(core.focus_mode()));
        }
        {
            let core = core.clone();
            template.bind_control(move || Control::AfRegions(core.regions()));
        }
        {
            let core = core.clone();
            template.bind_control(move || Control::AeRegions(core.regions()));
        }
        let template = Arc::new(template);

        let executor = Arc::new(CommandExecutor::start());
        let preview = PreviewRunner::new(executor.clone(), template.clone(), server.clone());

        // Restart the preview whenever the zoom changes.
        let zoom_watcher = tokio::spawn(watch_zoom(zoom.subscribe(), preview.clone()));

        let autofocus = AutofocusController::new(
            core,
            template.clone(),
            executor.clone(),
            server.clone(),
            config.scan_timeout,
        );

        let rotation = image_rotation(config.sensor_orientation, config.device_orientation);
        let taker = PictureTaker::new(
            executor.clone(),
            template,
            server.clone(),
            distributor.clone(),
            saver,
            rotation,
            config.capture_window,
        );

        let ingest = tokio::spawn(ingest_events(events, registry, distributor.clone()));

        preview.run();
        tracing::info!(
            environment = config.environment.as_str(),
            pool_capacity = config.pool_capacity,
            rotation = rotation.degrees(),
            "capture pipeline started"
        );

        Self {
            executor,
            server,
            distributor,
            zoom,
            autofocus,
            taker,
            preview_stream,
            ingest,
            zoom_watcher,
        }
    }

    pub fn zoom(&self) -> &Arc<ZoomState> {
        &self.zoom
    }

    pub fn autofocus(&self) -> &AutofocusController {
        &self.autofocus
    }

    pub fn picture(&self) -> &PictureTaker {
        &self.taker
    }

    /// Registers a consumer for correlated preview frames.
    pub fn preview_frames(&self) -> FrameConsumer {
        self.distributor
            .register(ConsumerFilter::Stream(self.preview_stream))
    }

    /// Tears the engine down: closes the session, drains the command
    /// worker, then stops the background tasks. Held frame leases stay
    /// readable until their owners drop them.
    pub async fn shutdown(&self) {
        match self.server.exclusive_session().await {
            Ok(mut lease) => lease.close().await,
            Err(e) => tracing::debug!(error = %e, "session already closed"),
        }
        self.executor.shutdown().await;
        self.ingest.abort();
        self.zoom_watcher.abort();
        self.distributor.close();
        tracing::info!("capture pipeline shut down");
    }
}

async fn watch_zoom(mut levels: mpsc::UnboundedReceiver<f32>, preview: PreviewRunner) {
    while let Some(level) = levels.recv().await {
        tracing::debug!(zoom = level, "zoom changed");
        preview.run();
    }
}

/// Routes device events: responses to the submitted request's listeners,
/// frames and metadata into the distributor.
async fn ingest_events(
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    registry: Arc<RequestRegistry>,
    distributor: Arc<FrameDistributor>,
) {
    while let Some(event) = events.recv().await {
        match event {
            DeviceEvent::ExposureStarted { request, timestamp } => {
                if let Some(submitted) = registry.lookup(request) {
                    for listener in submitted.listeners() {
                        listener.on_exposure_started(request, timestamp);
                    }
                }
            }
            DeviceEvent::FrameAvailable(frame) => distributor.on_frame(frame),
            DeviceEvent::MetadataAvailable { request, metadata } => {
                if let Some(submitted) = registry.lookup(request) {
                    for listener in submitted.listeners() {
                        listener.on_metadata(request, &metadata);
                    }
                }
                registry.settle(request);
                distributor.on_metadata(metadata);
            }
        }
    }
    tracing::debug!("device event channel closed");
}
