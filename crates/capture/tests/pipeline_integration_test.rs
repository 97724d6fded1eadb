use async_trait::async_trait;
use capture::autofocus::AfState;
use capture::config::PipelineConfig;
use capture::device::{CaptureDevice, DeviceEvent, SubmissionMode};
use capture::errors::{CaptureError, DeviceError};
use capture::picture::{ImageSaver, Picture};
use capture::pipeline::CapturePipeline;
use capture::request::{AfMode, AfTrigger, CaptureRequest, Control, ControlKey, RequestKind};
use capture::types::{
    FocusSignal, FrameMetadata, MeteringRegion, PixelRect, RawFrame, RequestId, StreamId,
    Timestamp,
};
use capture::ConsumerEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Records everything the engine submits; the test script plays the device's
/// responses back through the event channel.
struct ScriptedDevice {
    submissions: Mutex<Vec<(RequestId, Arc<CaptureRequest>, SubmissionMode)>>,
    stops: AtomicU64,
}

impl ScriptedDevice {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            submissions: Mutex::new(Vec::new()),
            stops: AtomicU64::new(0),
        })
    }

    fn submission(&self, index: usize) -> (RequestId, Arc<CaptureRequest>, SubmissionMode) {
        self.submissions.lock().unwrap()[index].clone()
    }

    fn count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }
}

#[async_trait]
impl CaptureDevice for ScriptedDevice {
    async fn submit(
        &self,
        id: RequestId,
        request: Arc<CaptureRequest>,
        mode: SubmissionMode,
    ) -> Result<(), DeviceError> {
        self.submissions.lock().unwrap().push((id, request, mode));
        Ok(())
    }

    async fn stop_repeating(&self) -> Result<(), DeviceError> {
        self.stops.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

struct RecordingSaver {
    pictures: Mutex<Vec<Picture>>,
}

impl RecordingSaver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pictures: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.pictures.lock().unwrap().len()
    }
}

#[async_trait]
impl ImageSaver for RecordingSaver {
    async fn save(&self, picture: Picture) -> anyhow::Result<()> {
        self.pictures.lock().unwrap().push(picture);
        Ok(())
    }
}

struct Rig {
    pipeline: CapturePipeline,
    device: Arc<ScriptedDevice>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    saver: Arc<RecordingSaver>,
}

fn rig(config: PipelineConfig) -> Rig {
    let device = ScriptedDevice::new();
    let saver = RecordingSaver::new();
    let (events, rx) = mpsc::unbounded_channel();
    let pipeline = CapturePipeline::start(device.clone(), rx, saver.clone(), Vec::new(), config);
    Rig {
        pipeline,
        device,
        events,
        saver,
    }
}

async fn wait_for_submissions(device: &ScriptedDevice, count: usize) {
    for _ in 0..1_000 {
        if device.count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!(
        "device saw {} submissions, expected {count}",
        device.count()
    );
}

fn raw_frame(stream: StreamId, timestamp: Timestamp) -> RawFrame {
    RawFrame {
        stream,
        timestamp,
        width: 32,
        height: 24,
        data: vec![0x5A; 32 * 24],
    }
}

fn metadata(timestamp: Timestamp, focus: FocusSignal) -> FrameMetadata {
    FrameMetadata {
        timestamp,
        frame_number: timestamp.as_nanos(),
        focus,
        crop_region: None,
    }
}

fn preview_stream_of(request: &CaptureRequest) -> StreamId {
    request.streams[0]
}

fn tap_region() -> MeteringRegion {
    MeteringRegion {
        rect: PixelRect {
            x: 400,
            y: 300,
            width: 80,
            height: 80,
        },
        weight: 1_000,
    }
}

/// Full exposure for one request: started, one frame per stream, metadata.
fn play_exposure(
    events: &mpsc::UnboundedSender<DeviceEvent>,
    id: RequestId,
    request: &CaptureRequest,
    timestamp: Timestamp,
    focus: FocusSignal,
) {
    events
        .send(DeviceEvent::ExposureStarted {
            request: id,
            timestamp,
        })
        .unwrap();
    for stream in &request.streams {
        events
            .send(DeviceEvent::FrameAvailable(raw_frame(*stream, timestamp)))
            .unwrap();
    }
    events
        .send(DeviceEvent::MetadataAvailable {
            request: id,
            metadata: metadata(timestamp, focus),
        })
        .unwrap();
}

/// Startup and zoom behavior.
///
/// Tests:
/// - The first submission is the repeating preview at zoom 1.0 (full array)
/// - A zoom change restarts the preview with a centered, tighter crop
/// - The restart runs before a capture enqueued after the zoom change
#[tokio::test(start_paused = true)]
async fn zoom_change_restarts_preview_before_later_work() {
    let rig = rig(PipelineConfig::default());
    wait_for_submissions(&rig.device, 1).await;

    let (_, first, mode) = rig.device.submission(0);
    assert_eq!(mode, SubmissionMode::Repeating);
    assert_eq!(first.kind, RequestKind::Preview);
    assert_eq!(
        first.control(ControlKey::CropRegion),
        Some(&Control::CropRegion(PixelRect::full(4_000, 3_000))),
        "zoom 1.0 must use the whole active array"
    );

    rig.pipeline.zoom().set(2.0);
    // Let the zoom watcher enqueue the restart before the capture.
    tokio::time::sleep(Duration::from_millis(1)).await;
    let _handle = rig.pipeline.picture().capture();
    wait_for_submissions(&rig.device, 3).await;

    let (_, restarted, mode) = rig.device.submission(1);
    assert_eq!(mode, SubmissionMode::Repeating);
    assert_eq!(
        restarted.control(ControlKey::CropRegion),
        Some(&Control::CropRegion(PixelRect {
            x: 1_000,
            y: 750,
            width: 2_000,
            height: 1_500,
        })),
        "2x zoom must crop to the centered half"
    );

    let (_, still, mode) = rig.device.submission(2);
    assert_eq!(mode, SubmissionMode::Single);
    assert_eq!(
        still.kind,
        RequestKind::StillCapture,
        "the capture must run after the zoom restart"
    );
}

/// Still capture through the full event path.
///
/// Tests:
/// - The still request carries the preview stream plus a fresh one
/// - Metadata arriving before the frame still correlates
/// - The saver receives the picture with the static rotation applied
/// - A preview consumer sees the same exposure via the shared slot
#[tokio::test(start_paused = true)]
async fn still_capture_correlates_and_reaches_the_saver() {
    let rig = rig(PipelineConfig::default());
    wait_for_submissions(&rig.device, 1).await;
    let (_, preview, _) = rig.device.submission(0);
    let preview_stream = preview_stream_of(&preview);

    let mut preview_frames = rig.pipeline.preview_frames();

    let handle = rig.pipeline.picture().capture();
    wait_for_submissions(&rig.device, 2).await;
    let (still_id, still, _) = rig.device.submission(1);
    assert_eq!(still.streams.len(), 2);
    assert!(still.streams.contains(&preview_stream));

    // Metadata first, then the frames of the exposure.
    let timestamp = Timestamp(40_000);
    rig.events
        .send(DeviceEvent::MetadataAvailable {
            request: still_id,
            metadata: metadata(timestamp, FocusSignal::Inactive),
        })
        .unwrap();
    for stream in &still.streams {
        rig.events
            .send(DeviceEvent::FrameAvailable(raw_frame(*stream, timestamp)))
            .unwrap();
    }

    assert_eq!(handle.outcome().await, Ok(timestamp));
    for _ in 0..1_000 {
        if rig.saver.count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    {
        let pictures = rig.saver.pictures.lock().unwrap();
        assert_eq!(pictures.len(), 1);
        assert_eq!(pictures[0].frame.timestamp(), timestamp);
        assert_eq!(pictures[0].rotation.degrees(), 90, "sensor 90, device 0");
    }

    match preview_frames.next_event().await {
        Some(ConsumerEvent::Frame(lease, paired)) => {
            assert_eq!(lease.timestamp(), timestamp);
            assert_eq!(paired.timestamp, timestamp);
        }
        other => panic!("preview consumer expected the exposure, got {other:?}"),
    }
}

/// Focus scan driven by played-back metadata.
///
/// Tests:
/// - Trigger restarts the preview with scan controls and fires the trigger
/// - Scanning reports keep the scan open; converged locks it
/// - Cancel restores the passive preview chain
#[tokio::test(start_paused = true)]
async fn focus_scan_locks_and_cancel_restores_passive_preview() {
    let rig = rig(PipelineConfig::default());
    wait_for_submissions(&rig.device, 1).await;

    let handle = rig
        .pipeline
        .autofocus()
        .trigger(vec![tap_region()])
        .unwrap();
    wait_for_submissions(&rig.device, 3).await;

    let (scan_id, scan, mode) = rig.device.submission(1);
    assert_eq!(mode, SubmissionMode::Repeating);
    assert_eq!(
        scan.control(ControlKey::AfMode),
        Some(&Control::AfMode(AfMode::Auto))
    );
    assert_eq!(
        scan.control(ControlKey::AfRegions),
        Some(&Control::AfRegions(vec![tap_region()]))
    );
    assert_eq!(
        scan.control(ControlKey::AeRegions),
        Some(&Control::AeRegions(vec![tap_region()])),
        "the tap must meter exposure as well"
    );
    let (_, trigger, mode) = rig.device.submission(2);
    assert_eq!(mode, SubmissionMode::Single);
    assert_eq!(
        trigger.control(ControlKey::AfTrigger),
        Some(&Control::AfTrigger(AfTrigger::Start))
    );

    play_exposure(
        &rig.events,
        scan_id,
        &scan,
        Timestamp(10_000),
        FocusSignal::Scanning,
    );
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(rig.pipeline.autofocus().state(), AfState::Scanning);

    play_exposure(
        &rig.events,
        scan_id,
        &scan,
        Timestamp(20_000),
        FocusSignal::Converged,
    );
    assert_eq!(
        handle.outcome().await,
        Ok(capture::ScanOutcome::Locked),
        "converged metadata must lock the scan"
    );
    assert_eq!(rig.pipeline.autofocus().state(), AfState::Locked);

    rig.pipeline.autofocus().cancel().unwrap();
    assert_eq!(rig.pipeline.autofocus().state(), AfState::Idle);
    wait_for_submissions(&rig.device, 5).await;

    let (_, cancel, mode) = rig.device.submission(3);
    assert_eq!(mode, SubmissionMode::Single);
    assert_eq!(
        cancel.control(ControlKey::AfTrigger),
        Some(&Control::AfTrigger(AfTrigger::Cancel))
    );
    let (_, passive, mode) = rig.device.submission(4);
    assert_eq!(mode, SubmissionMode::Repeating);
    assert_eq!(
        passive.control(ControlKey::AfMode),
        Some(&Control::AfMode(AfMode::ContinuousPicture))
    );
    assert_eq!(
        passive.control(ControlKey::AfRegions),
        Some(&Control::AfRegions(Vec::new())),
        "cancel must clear the metering aim"
    );
}

/// Scan watchdog.
///
/// Tests:
/// - A scan with no terminal signal fails after the configured timeout
/// - The engine restores passive focus on its own
#[tokio::test(start_paused = true)]
async fn scan_timeout_fails_and_restores_passive_focus() {
    let config = PipelineConfig {
        scan_timeout: Duration::from_millis(100),
        ..PipelineConfig::default()
    };
    let rig = rig(config);
    wait_for_submissions(&rig.device, 1).await;

    let handle = rig
        .pipeline
        .autofocus()
        .trigger(vec![tap_region()])
        .unwrap();
    wait_for_submissions(&rig.device, 3).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        handle.outcome().await,
        Err(CaptureError::ScanTimeout(Duration::from_millis(100)))
    );
    assert_eq!(rig.pipeline.autofocus().state(), AfState::Idle);

    wait_for_submissions(&rig.device, 5).await;
    let (_, passive, mode) = rig.device.submission(4);
    assert_eq!(mode, SubmissionMode::Repeating);
    assert_eq!(
        passive.control(ControlKey::AfMode),
        Some(&Control::AfMode(AfMode::ContinuousPicture))
    );
}

/// Pool backpressure under a stalled consumer.
///
/// Tests:
/// - Delivered-but-unreleased frames hold pool slots
/// - At capacity the oldest outstanding frame is evicted and exactly its
///   consumer is notified
/// - An evicted-but-held lease stays readable
#[tokio::test(start_paused = true)]
async fn overflow_evicts_the_oldest_and_notifies_its_consumer() {
    let config = PipelineConfig {
        pool_capacity: 2,
        ..PipelineConfig::default()
    };
    let rig = rig(config);
    wait_for_submissions(&rig.device, 1).await;
    let (preview_id, preview, _) = rig.device.submission(0);

    let mut frames = rig.pipeline.preview_frames();

    for timestamp in [Timestamp(1_000), Timestamp(2_000), Timestamp(3_000)] {
        play_exposure(
            &rig.events,
            preview_id,
            &preview,
            timestamp,
            FocusSignal::Inactive,
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // The consumer never released anything, so the third exposure had to
    // push out the first.
    let first = match frames.next_event().await {
        Some(ConsumerEvent::Frame(lease, _)) => lease,
        other => panic!("expected the first pair, got {other:?}"),
    };
    assert_eq!(first.timestamp(), Timestamp(1_000));
    let second = match frames.next_event().await {
        Some(ConsumerEvent::Frame(lease, _)) => lease,
        other => panic!("expected the second pair, got {other:?}"),
    };
    assert_eq!(second.timestamp(), Timestamp(2_000));

    match frames.next_event().await {
        Some(ConsumerEvent::Dropped { timestamp, .. }) => {
            assert_eq!(timestamp, Timestamp(1_000), "the oldest must be evicted");
        }
        other => panic!("expected a drop notice, got {other:?}"),
    }
    assert_eq!(
        first.frame().data.len(),
        32 * 24,
        "an evicted lease stays readable until dropped"
    );

    match frames.next_event().await {
        Some(ConsumerEvent::Frame(lease, _)) => {
            assert_eq!(lease.timestamp(), Timestamp(3_000));
        }
        other => panic!("expected the third pair, got {other:?}"),
    }
}

/// Still capture through a full frame pool.
///
/// Tests:
/// - Admission for the capture evicts the oldest held frames
/// - The capture still correlates and reaches the saver
/// - The saver sees only the new exposure, never an evicted one
#[tokio::test(start_paused = true)]
async fn capture_at_capacity_evicts_and_saves_the_new_exposure() {
    let config = PipelineConfig {
        pool_capacity: 2,
        ..PipelineConfig::default()
    };
    let rig = rig(config);
    wait_for_submissions(&rig.device, 1).await;
    let (preview_id, preview, _) = rig.device.submission(0);
    let preview_stream = preview_stream_of(&preview);

    let mut stalled = rig.pipeline.preview_frames();
    for timestamp in [Timestamp(1_000), Timestamp(2_000)] {
        play_exposure(
            &rig.events,
            preview_id,
            &preview,
            timestamp,
            FocusSignal::Inactive,
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let handle = rig.pipeline.picture().capture();
    wait_for_submissions(&rig.device, 2).await;
    let (still_id, still, _) = rig.device.submission(1);
    let capture_stream = still
        .streams
        .iter()
        .copied()
        .find(|stream| *stream != preview_stream)
        .unwrap();

    play_exposure(
        &rig.events,
        still_id,
        &still,
        Timestamp(3_000),
        FocusSignal::Inactive,
    );

    assert_eq!(handle.outcome().await, Ok(Timestamp(3_000)));
    for _ in 0..1_000 {
        if rig.saver.count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    {
        let pictures = rig.saver.pictures.lock().unwrap();
        assert_eq!(pictures.len(), 1, "exactly one save for one capture");
        assert_eq!(pictures[0].frame.timestamp(), Timestamp(3_000));
        assert_eq!(
            pictures[0].frame.frame().stream,
            capture_stream,
            "the saver must get the capture stream, not a preview leftover"
        );
    }

    // Both held preview frames were pushed out to make room.
    for expected in [Timestamp(1_000), Timestamp(2_000)] {
        match stalled.next_event().await {
            Some(ConsumerEvent::Frame(lease, _)) => assert_eq!(lease.timestamp(), expected),
            other => panic!("expected a delivery, got {other:?}"),
        }
    }
    for expected in [Timestamp(1_000), Timestamp(2_000)] {
        match stalled.next_event().await {
            Some(ConsumerEvent::Dropped { timestamp, .. }) => assert_eq!(timestamp, expected),
            other => panic!("expected a drop notice, got {other:?}"),
        }
    }
    match stalled.next_event().await {
        Some(ConsumerEvent::Frame(lease, _)) => {
            assert_eq!(lease.timestamp(), Timestamp(3_000));
        }
        other => panic!("expected the capture's preview pair, got {other:?}"),
    }
}

/// Teardown.
///
/// Tests:
/// - Shutdown stops the repeating request and closes the session
/// - Later operations fail fast instead of hanging
/// - Open consumers end instead of blocking forever
#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_session_and_ends_consumers() {
    let rig = rig(PipelineConfig::default());
    wait_for_submissions(&rig.device, 1).await;
    let mut frames = rig.pipeline.preview_frames();

    rig.pipeline.shutdown().await;

    assert_eq!(rig.device.stops.load(Ordering::Acquire), 1);
    assert!(frames.next_event().await.is_none(), "consumers must end");

    let capture = rig.pipeline.picture().capture();
    assert_eq!(capture.outcome().await, Err(CaptureError::ShutDown));
    assert_eq!(
        rig.pipeline
            .autofocus()
            .trigger(vec![tap_region()])
            .err(),
        Some(CaptureError::ShutDown)
    );
}
