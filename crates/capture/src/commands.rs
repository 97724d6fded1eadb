use crate::errors::CaptureError;
use crate::frame_server::FrameServer;
use crate::request::{RequestKind, RequestTemplate};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One serialized unit of work against the device session.
#[async_trait]
pub trait CameraCommand: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self) -> Result<(), CaptureError>;
}

/// Single-worker serialization point for every operation that touches the
/// session.
///
/// Commands run strictly in submission order and never overlap. A failing
/// command is logged with its name and the worker moves on; the queue is
/// never coalesced, so a rapid burst of restarts runs one by one.
pub struct CommandExecutor {
    tx: Mutex<Option<mpsc::UnboundedSender<Box<dyn CameraCommand>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandExecutor {
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Box<dyn CameraCommand>>();
        let worker = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                tracing::debug!(command = command.name(), "command running");
                if let Err(e) = command.run().await {
                    tracing::warn!(command = command.name(), error = %e, "command failed");
                }
            }
            tracing::debug!("command worker drained");
        });
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueues a command behind everything submitted before it.
    pub fn execute(&self, command: Box<dyn CameraCommand>) -> Result<(), CaptureError> {
        let tx = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match tx.as_ref() {
            Some(tx) => tx.send(command).map_err(|_| CaptureError::ShutDown),
            None => Err(CaptureError::ShutDown),
        }
    }

    /// Stops accepting new commands, runs the backlog to completion and
    /// joins the worker.
    pub async fn shutdown(&self) {
        let tx = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
        .take();
        drop(tx);

        let worker = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
        .take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            tracing::error!(error = %e, "command worker ended abnormally");
        }
    }
}

/// Enqueues preview (re)starts: each call is one fresh command, so a zoom
/// drag queues exactly one restart per observed change.
#[derive(Clone)]
pub struct PreviewRunner {
    executor: Arc<CommandExecutor>,
    template: Arc<RequestTemplate>,
    server: Arc<FrameServer>,
}

impl PreviewRunner {
    pub fn new(
        executor: Arc<CommandExecutor>,
        template: Arc<RequestTemplate>,
        server: Arc<FrameServer>,
    ) -> Self {
        Self {
            executor,
            template,
            server,
        }
    }

    pub fn run(&self) {
        let command = RestartPreviewCommand {
            template: self.template.clone(),
            server: self.server.clone(),
        };
        if let Err(e) = self.executor.execute(Box::new(command)) {
            tracing::debug!(error = %e, "preview restart not enqueued");
        }
    }
}

struct RestartPreviewCommand {
    template: Arc<RequestTemplate>,
    server: Arc<FrameServer>,
}

#[async_trait]
impl CameraCommand for RestartPreviewCommand {
    fn name(&self) -> &'static str {
        "restart_preview"
    }

    async fn run(&self) -> Result<(), CaptureError> {
        let request = self.template.build(RequestKind::Preview, &[], &[])?;
        let mut session = self.server.exclusive_session().await?;
        session.submit_repeating(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    struct RecordingCommand {
        tag: u32,
        log: Arc<Mutex<Vec<u32>>>,
        fail: bool,
        in_flight: Arc<AtomicBool>,
        overlaps: Arc<AtomicU32>,
    }

    #[async_trait]
    impl CameraCommand for RecordingCommand {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn run(&self) -> Result<(), CaptureError> {
            if self.in_flight.swap(true, Ordering::AcqRel) {
                self.overlaps.fetch_add(1, Ordering::AcqRel);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.log.lock().unwrap().push(self.tag);
            self.in_flight.store(false, Ordering::Release);
            if self.fail {
                return Err(CaptureError::NoStreams);
            }
            Ok(())
        }
    }

    struct Harness {
        log: Arc<Mutex<Vec<u32>>>,
        in_flight: Arc<AtomicBool>,
        overlaps: Arc<AtomicU32>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                in_flight: Arc::new(AtomicBool::new(false)),
                overlaps: Arc::new(AtomicU32::new(0)),
            }
        }

        fn command(&self, tag: u32, fail: bool) -> Box<dyn CameraCommand> {
            Box::new(RecordingCommand {
                tag,
                log: self.log.clone(),
                fail,
                in_flight: self.in_flight.clone(),
                overlaps: self.overlaps.clone(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn commands_run_in_submission_order_without_overlap() {
        let executor = CommandExecutor::start();
        let harness = Harness::new();

        for tag in 0..5 {
            executor.execute(harness.command(tag, false)).unwrap();
        }
        executor.shutdown().await;

        assert_eq!(harness.log.lock().unwrap().as_slice(), &[0, 1, 2, 3, 4]);
        assert_eq!(
            harness.overlaps.load(Ordering::Acquire),
            0,
            "at most one command may run at a time"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_failing_command_does_not_halt_the_worker() {
        let executor = CommandExecutor::start();
        let harness = Harness::new();

        executor.execute(harness.command(0, true)).unwrap();
        executor.execute(harness.command(1, false)).unwrap();
        executor.shutdown().await;

        assert_eq!(
            harness.log.lock().unwrap().as_slice(),
            &[0, 1],
            "the command after a failure must still run"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_the_backlog() {
        let executor = CommandExecutor::start();
        let harness = Harness::new();

        for tag in 0..3 {
            executor.execute(harness.command(tag, false)).unwrap();
        }
        executor.shutdown().await;

        assert_eq!(harness.log.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn execute_after_shutdown_is_rejected() {
        let executor = CommandExecutor::start();
        executor.shutdown().await;

        let harness = Harness::new();
        let result = executor.execute(harness.command(0, false));
        assert_eq!(result.unwrap_err(), CaptureError::ShutDown);
    }
}
