use crate::device::{CaptureDevice, SubmissionMode};
use crate::errors::{CaptureError, DeviceError};
use crate::request::CaptureRequest;
use crate::types::RequestId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Maps in-flight request ids to their immutable requests so device events
/// can always be dispatched to the right listeners.
///
/// Ids are allocated and registered before the device sees the submission;
/// an event can therefore never reference an id the registry does not know.
pub struct RequestRegistry {
    next_id: AtomicU64,
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    entries: HashMap<RequestId, RegistryEntry>,
    /// Superseded repeating request, kept until the new chain's first
    /// metadata confirms the device switched over.
    retiring: Option<(RequestId, RequestId)>,
}

struct RegistryEntry {
    request: Arc<CaptureRequest>,
    mode: SubmissionMode,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(RegistryInner {
                entries: HashMap::new(),
                retiring: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register(&self, request: Arc<CaptureRequest>, mode: SubmissionMode) -> RequestId {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entries
            .insert(id, RegistryEntry { request, mode });
        id
    }

    pub fn lookup(&self, id: RequestId) -> Option<Arc<CaptureRequest>> {
        self.lock().entries.get(&id).map(|e| e.request.clone())
    }

    /// Requests currently known to the registry.
    pub fn in_flight(&self) -> usize {
        self.lock().entries.len()
    }

    fn remove(&self, id: RequestId) {
        self.lock().entries.remove(&id);
    }

    fn supersede(&self, old: RequestId, new: RequestId) {
        let mut inner = self.lock();
        if let Some((stale, _)) = inner.retiring.replace((old, new)) {
            inner.entries.remove(&stale);
        }
    }

    /// Called once a request's metadata has been dispatched. Single-shot
    /// entries are reaped here; a superseded repeating entry is reaped when
    /// its successor produces metadata.
    pub fn settle(&self, id: RequestId) {
        let mut inner = self.lock();
        let single = inner
            .entries
            .get(&id)
            .is_some_and(|e| e.mode == SubmissionMode::Single);
        if single {
            inner.entries.remove(&id);
        }
        if let Some((old, new)) = inner.retiring
            && id == new
        {
            inner.entries.remove(&old);
            inner.retiring = None;
        }
    }
}

struct SessionState {
    closed: bool,
    repeating: Option<RequestId>,
}

/// Owns the single device session.
///
/// Submission happens through the exclusive lease returned by
/// [`exclusive_session`](Self::exclusive_session); at most one holder at a
/// time, with waiters served in arrival order.
pub struct FrameServer {
    device: Arc<dyn CaptureDevice>,
    registry: Arc<RequestRegistry>,
    session: tokio::sync::Mutex<SessionState>,
}

impl FrameServer {
    pub fn new(device: Arc<dyn CaptureDevice>, registry: Arc<RequestRegistry>) -> Self {
        Self {
            device,
            registry,
            session: tokio::sync::Mutex::new(SessionState {
                closed: false,
                repeating: None,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    /// Waits for the exclusive right to submit. Fails fast once the session
    /// has been closed.
    pub async fn exclusive_session(&self) -> Result<SessionLease<'_>, DeviceError> {
        let state = self.session.lock().await;
        if state.closed {
            return Err(DeviceError::SessionClosed);
        }
        Ok(SessionLease {
            server: self,
            state,
        })
    }
}

/// The lease: exclusive session access for the duration of one command.
/// Dropping it releases the session to the next waiter.
pub struct SessionLease<'a> {
    server: &'a FrameServer,
    state: tokio::sync::MutexGuard<'a, SessionState>,
}

impl SessionLease<'_> {
    /// Submits one exposure.
    pub async fn submit(&mut self, request: CaptureRequest) -> Result<RequestId, CaptureError> {
        self.submit_with_mode(request, SubmissionMode::Single)
            .await
    }

    /// Starts a repeating request, superseding any active one.
    pub async fn submit_repeating(
        &mut self,
        request: CaptureRequest,
    ) -> Result<RequestId, CaptureError> {
        let id = self
            .submit_with_mode(request, SubmissionMode::Repeating)
            .await?;
        if let Some(old) = self.state.repeating.replace(id) {
            self.server.registry.supersede(old, id);
        }
        Ok(id)
    }

    async fn submit_with_mode(
        &mut self,
        request: CaptureRequest,
        mode: SubmissionMode,
    ) -> Result<RequestId, CaptureError> {
        if self.state.closed {
            return Err(DeviceError::SessionClosed.into());
        }
        let request = Arc::new(request);
        let id = self.server.registry.register(request.clone(), mode);
        match self.server.device.submit(id, request, mode).await {
            Ok(()) => {
                tracing::debug!(request = %id, mode = ?mode, "request submitted");
                Ok(id)
            }
            Err(e) => {
                self.server.registry.remove(id);
                Err(e.into())
            }
        }
    }

    /// Stops the active repeating request. Calling with none active is a
    /// no-op.
    pub async fn stop_repeating(&mut self) -> Result<(), CaptureError> {
        let Some(id) = self.state.repeating.take() else {
            return Ok(());
        };
        self.server.device.stop_repeating().await?;
        self.server.registry.remove(id);
        tracing::debug!(request = %id, "repeating request stopped");
        Ok(())
    }

    /// Stops any repeating request and closes the session; later
    /// submissions and lease acquisitions fail with `SessionClosed`.
    pub(crate) async fn close(&mut self) {
        if let Err(e) = self.stop_repeating().await {
            tracing::warn!(error = %e, "failed to stop repeating request during close");
        }
        self.state.closed = true;
    }
}
