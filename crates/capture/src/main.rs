use async_trait::async_trait;
use capture::config::PipelineConfig;
use capture::picture::{ImageSaver, Picture};
use capture::pipeline::CapturePipeline;
use capture::synthetic::SyntheticDevice;
use capture::types::{MeteringRegion, PixelRect};
use capture::ConsumerEvent;
use common::setup_logging;
use std::sync::Arc;
use std::time::Duration;

const PREVIEW_WIDTH: u32 = 320;
const PREVIEW_HEIGHT: u32 = 240;

/// Logs each handed-over picture instead of persisting it.
struct LoggingSaver;

#[async_trait]
impl ImageSaver for LoggingSaver {
    async fn save(&self, picture: Picture) -> anyhow::Result<()> {
        tracing::info!(
            timestamp = %picture.frame.timestamp(),
            bytes = picture.frame.frame().data.len(),
            rotation = picture.rotation.degrees(),
            "picture saved"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();
    setup_logging(config.environment);

    let (device, events) =
        SyntheticDevice::connect(config.frame_interval, PREVIEW_WIDTH, PREVIEW_HEIGHT);
    let pipeline = CapturePipeline::start(
        device,
        events,
        Arc::new(LoggingSaver),
        Vec::new(),
        config,
    );

    let mut preview = pipeline.preview_frames();
    let preview_task = tokio::spawn(async move {
        let mut delivered = 0u64;
        while let Some(event) = preview.next_event().await {
            match event {
                ConsumerEvent::Frame(frame, metadata) => {
                    delivered += 1;
                    if delivered.is_multiple_of(30) {
                        tracing::info!(
                            timestamp = %frame.timestamp(),
                            frame_number = metadata.frame_number,
                            crop = ?metadata.crop_region,
                            delivered,
                            "preview running"
                        );
                    }
                }
                ConsumerEvent::Dropped { timestamp, reason } => {
                    tracing::debug!(%timestamp, ?reason, "preview frame dropped");
                }
            }
        }
    });

    // Let the preview settle, then walk through the main operations once.
    tokio::time::sleep(Duration::from_millis(500)).await;

    for level in [1.5_f32, 2.0, 1.0] {
        tracing::info!(zoom = level, "setting zoom");
        pipeline.zoom().set(level);
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    let tap = MeteringRegion {
        rect: PixelRect {
            x: 140,
            y: 100,
            width: 40,
            height: 40,
        },
        weight: 1_000,
    };
    match pipeline.autofocus().trigger(vec![tap]) {
        Ok(handle) => match handle.outcome().await {
            Ok(outcome) => tracing::info!(?outcome, "focus scan finished"),
            Err(e) => tracing::warn!(error = %e, "focus scan did not finish"),
        },
        Err(e) => tracing::warn!(error = %e, "focus scan rejected"),
    }

    match pipeline.picture().capture().outcome().await {
        Ok(timestamp) => tracing::info!(%timestamp, "still capture done"),
        Err(e) => tracing::warn!(error = %e, "still capture failed"),
    }

    if let Err(e) = pipeline.autofocus().cancel() {
        tracing::warn!(error = %e, "focus cancel failed");
    }

    tracing::info!("press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    pipeline.shutdown().await;
    let _ = preview_task.await;
    tracing::info!("stopped");
    Ok(())
}
