use crate::commands::{CameraCommand, CommandExecutor};
use crate::errors::CaptureError;
use crate::frame_server::FrameServer;
use crate::request::{
    AfMode, AfTrigger, Control, RequestKind, RequestTemplate, ResponseListener,
};
use crate::types::{FocusSignal, FrameMetadata, MeteringRegion, RequestId};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfState {
    Idle,
    Scanning,
    Locked,
    Failed,
}

/// How a scan concluded on the device side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Locked,
    Failed,
}

/// Focus scan lifecycle, driven purely by the signals fed into it.
///
/// The generation counter fences asynchronous observers: a signal or timer
/// produced for scan N can never conclude scan N+1.
pub struct AfMachine {
    state: AfState,
    generation: u64,
}

impl Default for AfMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AfMachine {
    pub fn new() -> Self {
        Self {
            state: AfState::Idle,
            generation: 0,
        }
    }

    pub fn state(&self) -> AfState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Starts a scan. Allowed from every state except an active scan; a held
    /// lock or earlier failure is replaced by the new scan.
    pub fn begin_scan(&mut self) -> Result<u64, CaptureError> {
        if self.state == AfState::Scanning {
            return Err(CaptureError::ScanInProgress);
        }
        self.generation += 1;
        self.state = AfState::Scanning;
        Ok(self.generation)
    }

    /// Feeds one focus signal into the scan identified by `generation`.
    /// Returns the outcome when this signal concludes it.
    pub fn observe(&mut self, generation: u64, focus: FocusSignal) -> Option<ScanOutcome> {
        if self.state != AfState::Scanning || generation != self.generation {
            return None;
        }
        match focus {
            FocusSignal::Converged => {
                self.state = AfState::Locked;
                Some(ScanOutcome::Locked)
            }
            FocusSignal::Unable => {
                self.state = AfState::Failed;
                Some(ScanOutcome::Failed)
            }
            FocusSignal::Scanning | FocusSignal::Inactive => None,
        }
    }

    /// Fails an overdue scan. True when the scan was still running.
    pub fn expire(&mut self, generation: u64) -> bool {
        if self.state == AfState::Scanning && generation == self.generation {
            self.state = AfState::Failed;
            true
        } else {
            false
        }
    }

    /// Returns to passive focus from any state.
    pub fn reset(&mut self) {
        self.state = AfState::Idle;
    }
}

struct PendingScan {
    generation: u64,
    /// First request id of the scan's own repeating chain. Responses from
    /// exposures submitted before the scan restart carry smaller ids and
    /// must not conclude it.
    armed_after: Option<RequestId>,
    outcome_tx: oneshot::Sender<Result<ScanOutcome, CaptureError>>,
}

struct ScanSlot {
    machine: AfMachine,
    pending: Option<PendingScan>,
}

/// Shared focus state: read by the template's control suppliers on every
/// request build, fed by the response listener on every result bundle.
pub struct AfCore {
    slot: Mutex<ScanSlot>,
    regions: Mutex<Vec<MeteringRegion>>,
}

impl Default for AfCore {
    fn default() -> Self {
        Self::new()
    }
}

impl AfCore {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(ScanSlot {
                machine: AfMachine::new(),
                pending: None,
            }),
            regions: Mutex::new(Vec::new()),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, ScanSlot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_regions(&self) -> MutexGuard<'_, Vec<MeteringRegion>> {
        match self.regions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> AfState {
        self.lock_slot().machine.state()
    }

    /// Focus mode the next built request should carry. Passive continuous
    /// focus while idle; the active mode from the first trigger until a
    /// cancel, so a preview restart mid-scan does not drop the lock.
    pub fn focus_mode(&self) -> AfMode {
        match self.state() {
            AfState::Idle => AfMode::ContinuousPicture,
            AfState::Scanning | AfState::Locked | AfState::Failed => AfMode::Auto,
        }
    }

    /// Metering regions the last trigger aimed at. Empty while idle.
    pub fn regions(&self) -> Vec<MeteringRegion> {
        self.lock_regions().clone()
    }

    /// Listener to install on the preview template. Every result bundle's
    /// focus signal flows through it into the scan.
    pub fn watcher(self: &Arc<Self>) -> Arc<dyn ResponseListener> {
        Arc::new(FocusWatcher { core: self.clone() })
    }

    fn begin(
        &self,
        regions: Vec<MeteringRegion>,
    ) -> Result<(u64, oneshot::Receiver<Result<ScanOutcome, CaptureError>>), CaptureError> {
        let mut slot = self.lock_slot();
        let generation = slot.machine.begin_scan()?;
        let (tx, rx) = oneshot::channel();
        slot.pending = Some(PendingScan {
            generation,
            armed_after: None,
            outcome_tx: tx,
        });
        *self.lock_regions() = regions;
        Ok((generation, rx))
    }

    fn arm(&self, generation: u64, boundary: RequestId) {
        let mut slot = self.lock_slot();
        if let Some(pending) = slot.pending.as_mut()
            && pending.generation == generation
        {
            pending.armed_after = Some(boundary);
        }
    }

    fn observe(&self, request: RequestId, focus: FocusSignal) {
        let mut guard = self.lock_slot();
        let slot = &mut *guard;
        let Some((generation, armed)) = slot
            .pending
            .as_ref()
            .map(|p| (p.generation, p.armed_after))
        else {
            return;
        };
        if !armed.is_some_and(|boundary| request >= boundary) {
            return;
        }
        if let Some(outcome) = slot.machine.observe(generation, focus)
            && let Some(pending) = slot.pending.take()
        {
            tracing::info!(generation, ?outcome, "focus scan concluded");
            let _ = pending.outcome_tx.send(Ok(outcome));
        }
    }

    /// Times out an overdue scan and falls straight back to passive focus.
    /// True when there was a scan to expire.
    fn expire(&self, generation: u64, after: Duration) -> bool {
        let mut slot = self.lock_slot();
        if !slot.machine.expire(generation) {
            return false;
        }
        if let Some(pending) = slot.pending.take() {
            let _ = pending.outcome_tx.send(Err(CaptureError::ScanTimeout(after)));
        }
        slot.machine.reset();
        self.lock_regions().clear();
        true
    }

    /// Drops any scan state. True when there was anything to undo.
    fn cancel(&self) -> bool {
        let mut slot = self.lock_slot();
        let had_scan = slot.machine.state() != AfState::Idle || slot.pending.is_some();
        if let Some(pending) = slot.pending.take() {
            let _ = pending.outcome_tx.send(Err(CaptureError::ScanCancelled));
        }
        slot.machine.reset();
        self.lock_regions().clear();
        had_scan
    }
}

struct FocusWatcher {
    core: Arc<AfCore>,
}

impl ResponseListener for FocusWatcher {
    fn on_metadata(&self, request: RequestId, metadata: &FrameMetadata) {
        self.core.observe(request, metadata.focus);
    }
}

/// Resolves with the scan's conclusion: lock, device-reported failure, or an
/// error when the scan timed out or was cancelled.
pub struct ScanHandle {
    rx: oneshot::Receiver<Result<ScanOutcome, CaptureError>>,
}

impl ScanHandle {
    pub async fn outcome(self) -> Result<ScanOutcome, CaptureError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::ScanCancelled),
        }
    }
}

/// Tap-to-focus front end.
///
/// A trigger aims the metering regions, restarts the repeating request in
/// the active scan mode and fires the one-shot trigger, then resolves once
/// the device reports convergence or failure. An overdue scan is failed by
/// the watchdog and passive focus is restored without user involvement.
pub struct AutofocusController {
    core: Arc<AfCore>,
    template: Arc<RequestTemplate>,
    executor: Arc<CommandExecutor>,
    server: Arc<FrameServer>,
    scan_timeout: Duration,
}

impl AutofocusController {
    pub fn new(
        core: Arc<AfCore>,
        template: Arc<RequestTemplate>,
        executor: Arc<CommandExecutor>,
        server: Arc<FrameServer>,
        scan_timeout: Duration,
    ) -> Self {
        Self {
            core,
            template,
            executor,
            server,
            scan_timeout,
        }
    }

    pub fn state(&self) -> AfState {
        self.core.state()
    }

    /// Starts a scan aimed at `regions`. Rejected while another scan runs.
    pub fn trigger(&self, regions: Vec<MeteringRegion>) -> Result<ScanHandle, CaptureError> {
        let (generation, rx) = self.core.begin(regions)?;
        tracing::info!(generation, "focus scan triggered");

        let command = StartScanCommand {
            core: self.core.clone(),
            template: self.template.clone(),
            server: self.server.clone(),
            generation,
        };
        if let Err(e) = self.executor.execute(Box::new(command)) {
            self.core.cancel();
            return Err(e);
        }

        let core = self.core.clone();
        let executor = self.executor.clone();
        let template = self.template.clone();
        let server = self.server.clone();
        let timeout = self.scan_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if core.expire(generation, timeout) {
                tracing::warn!(generation, ?timeout, "focus scan timed out");
                let command = CancelScanCommand { template, server };
                if let Err(e) = executor.execute(Box::new(command)) {
                    tracing::debug!(error = %e, "focus restore not enqueued");
                }
            }
        });

        Ok(ScanHandle { rx })
    }

    /// Returns to passive continuous focus, dropping any lock and resolving
    /// an in-flight scan as cancelled. A no-op while already idle.
    pub fn cancel(&self) -> Result<(), CaptureError> {
        if !self.core.cancel() {
            return Ok(());
        }
        tracing::info!("focus scan cancelled");
        self.executor.execute(Box::new(CancelScanCommand {
            template: self.template.clone(),
            server: self.server.clone(),
        }))
    }
}

struct StartScanCommand {
    core: Arc<AfCore>,
    template: Arc<RequestTemplate>,
    server: Arc<FrameServer>,
    generation: u64,
}

#[async_trait]
impl CameraCommand for StartScanCommand {
    fn name(&self) -> &'static str {
        "start_focus_scan"
    }

    async fn run(&self) -> Result<(), CaptureError> {
        // Suppliers already see the scanning state, so both requests carry
        // the active mode and the aimed regions.
        let repeating = self.template.build(RequestKind::Preview, &[], &[])?;
        let trigger = repeating.with_control(Control::AfTrigger(AfTrigger::Start));

        let mut session = self.server.exclusive_session().await?;
        let boundary = session.submit_repeating(repeating).await?;
        self.core.arm(self.generation, boundary);
        session.submit(trigger).await?;
        Ok(())
    }
}

struct CancelScanCommand {
    template: Arc<RequestTemplate>,
    server: Arc<FrameServer>,
}

#[async_trait]
impl CameraCommand for CancelScanCommand {
    fn name(&self) -> &'static str {
        "cancel_focus_scan"
    }

    async fn run(&self) -> Result<(), CaptureError> {
        let repeating = self.template.build(RequestKind::Preview, &[], &[])?;
        let cancel = repeating.with_control(Control::AfTrigger(AfTrigger::Cancel));

        let mut session = self.server.exclusive_session().await?;
        session.submit(cancel).await?;
        session.submit_repeating(repeating).await?;
        Ok(())
    }
}
