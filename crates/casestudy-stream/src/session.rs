use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt as _;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::accumulator::{ApplyOutcome, SectionAccumulator};
use crate::config::SessionConfig;
use crate::errors::{SessionError, SessionFailure, failure_from_transport_error};
use crate::event::StreamEvent;
use crate::parser::{Frame, FrameDecoder, parse_frame};
use crate::progress;
use crate::request::GenerationRequest;
use crate::snapshot::{SessionSnapshot, SessionStatus};
use crate::subscribers::{SubscriberRegistry, Subscription};
use crate::transport::TransportFactory;

/// Metadata key the backend sets on its final event.
const GENERATION_COMPLETE_KEY: &str = "generation_complete";

/// Drives one generation: opens the transport, folds frames into sections,
/// and publishes a snapshot after every state change.
///
/// One instance serves one generation (plus explicit retries of it); start a
/// new instance for the next one. Handles are cheap to clone and share state.
#[derive(Clone)]
pub struct StreamingSession {
    shared: Arc<Shared>,
}

struct Shared {
    session_id: uuid::Uuid,
    transport: Arc<dyn TransportFactory>,
    config: SessionConfig,
    core: Mutex<Core>,
    published: watch::Sender<Arc<SessionSnapshot>>,
    subscribers: Arc<SubscriberRegistry>,
}

struct Core {
    status: SessionStatus,
    attempt: u32,
    revision: u64,
    accumulator: SectionAccumulator,
    progress: u8,
    failure: Option<SessionFailure>,
    warnings: Vec<String>,
    frames_applied: u64,
    parse_errors: u64,
    request: Option<GenerationRequest>,
    abort: Option<watch::Sender<bool>>,
}

impl Core {
    fn new() -> Self {
        Self {
            status: SessionStatus::Idle,
            attempt: 1,
            revision: 0,
            accumulator: SectionAccumulator::new(),
            progress: 0,
            failure: None,
            warnings: Vec::new(),
            frames_applied: 0,
            parse_errors: 0,
            request: None,
            abort: None,
        }
    }

    /// Whether the driver for `attempt` may still change state.
    fn accepts(&self, attempt: u32) -> bool {
        self.attempt == attempt && !self.status.is_terminal()
    }

    fn snapshot(&self, session_id: uuid::Uuid) -> SessionSnapshot {
        SessionSnapshot {
            session_id,
            attempt: self.attempt,
            revision: self.revision,
            status: self.status,
            sections: self.accumulator.sections().to_vec(),
            unsectioned: self.accumulator.unsectioned_shared(),
            metadata: self.accumulator.metadata().clone(),
            progress_percent: self.progress,
            current_section: self
                .accumulator
                .current_section()
                .map(|section| section.name.clone()),
            error_message: self.failure.as_ref().map(ToString::to_string),
            warnings: self.warnings.clone(),
            frames_applied: self.frames_applied,
            parse_errors: self.parse_errors,
        }
    }

    fn fail(&mut self, failure: SessionFailure) {
        self.status = SessionStatus::Failed;
        self.failure = Some(failure);
    }

    fn complete(&mut self) {
        self.status = SessionStatus::Completed;
        self.progress = 100;
    }

    fn saw_completion_marker(&self) -> bool {
        self.accumulator
            .metadata()
            .get(GENERATION_COMPLETE_KEY)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

impl StreamingSession {
    /// Creates an idle session with default configuration.
    pub fn new(transport: Arc<dyn TransportFactory>) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: Arc<dyn TransportFactory>, config: SessionConfig) -> Self {
        let session_id = uuid::Uuid::new_v4();
        let (published, _) = watch::channel(Arc::new(SessionSnapshot::idle(session_id)));
        Self {
            shared: Arc::new(Shared {
                session_id,
                transport,
                config,
                core: Mutex::new(Core::new()),
                published,
                subscribers: Arc::new(SubscriberRegistry::default()),
            }),
        }
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.shared.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.published.borrow().status
    }

    /// Starts streaming `request`.
    ///
    /// Returns `InvalidState` unless the session is `Idle`. Must be called
    /// from within a tokio runtime. Stream failures never surface here; they
    /// land in the snapshot.
    pub fn start(&self, request: GenerationRequest) -> Result<(), SessionError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            SessionError::Config("StreamingSession::start requires a tokio runtime".into())
        })?;
        let shared = &self.shared;
        let mut core = shared.lock();
        if core.status != SessionStatus::Idle {
            return Err(SessionError::invalid_state("start", core.status));
        }
        shared.config.validate()?;
        request.validate()?;

        core.request = Some(request.clone());
        let (attempt, abort_rx) = shared.begin_attempt(&mut core);
        drop(core);
        shared.subscribers.drain();

        info!(
            session_id = %shared.session_id,
            attempt,
            transport = shared.transport.name(),
            project = %request.project_name,
            "starting generation stream"
        );
        runtime.spawn(drive(shared.clone(), request, attempt, abort_rx));
        Ok(())
    }

    /// Starts a fresh attempt after `Failed`, discarding accumulated content.
    ///
    /// Generation is not idempotent, so nothing from the failed attempt is
    /// carried over.
    pub fn retry(&self) -> Result<(), SessionError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            SessionError::Config("StreamingSession::retry requires a tokio runtime".into())
        })?;
        let shared = &self.shared;
        let mut core = shared.lock();
        if core.status != SessionStatus::Failed {
            return Err(SessionError::invalid_state("retry", core.status));
        }
        let Some(request) = core.request.clone() else {
            return Err(SessionError::invalid_state("retry", core.status));
        };

        core.attempt = core.attempt.saturating_add(1);
        core.accumulator = SectionAccumulator::new();
        core.progress = 0;
        core.failure = None;
        core.warnings.clear();
        core.frames_applied = 0;
        core.parse_errors = 0;
        let (attempt, abort_rx) = shared.begin_attempt(&mut core);
        drop(core);
        shared.subscribers.drain();

        info!(session_id = %shared.session_id, attempt, "retrying generation stream");
        runtime.spawn(drive(shared.clone(), request, attempt, abort_rx));
        Ok(())
    }

    /// Cancels the generation and aborts the transport.
    ///
    /// Takes effect synchronously: frames already buffered or in flight are
    /// dropped. No-op once the session is terminal.
    pub fn cancel(&self) {
        let shared = &self.shared;
        let mut core = shared.lock();
        if core.status.is_terminal() {
            return;
        }
        let previous = core.status;
        core.status = SessionStatus::Cancelled;
        if let Some(abort) = core.abort.take() {
            abort.send_replace(true);
        }
        shared.publish(&mut core);
        drop(core);
        shared.subscribers.drain();
        info!(session_id = %shared.session_id, from = %previous, "generation cancelled");
    }

    /// Latest published snapshot.
    pub fn get_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::clone(&self.shared.published.borrow())
    }

    /// Registers `callback` for every snapshot published from now on.
    ///
    /// Callbacks run on whichever thread published the change, one at a time
    /// and in revision order. They may call back into the session.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        self.shared.subscribers.add(callback)
    }

    /// Watch channel of the latest snapshot, for async consumers that only
    /// need the most recent state.
    pub fn updates(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.shared.published.subscribe()
    }

    /// Resolves with the first terminal snapshot.
    ///
    /// Never resolves for a session that is never started or cancelled.
    pub async fn finished(&self) -> SessionSnapshot {
        let mut rx = self.updates();
        match rx.wait_for(|snapshot| snapshot.status.is_terminal()).await {
            Ok(snapshot) => SessionSnapshot::clone(&snapshot),
            Err(_) => self.get_snapshot(),
        }
    }

    /// Like [`finished`](Self::finished) but maps the terminal status to a
    /// `Result`.
    pub async fn outcome(&self) -> Result<SessionSnapshot, SessionError> {
        let snapshot = self.finished().await;
        match snapshot.status {
            SessionStatus::Completed => Ok(snapshot),
            SessionStatus::Cancelled => Err(SessionError::Cancelled),
            _ => {
                let failure = self
                    .shared
                    .lock()
                    .failure
                    .clone()
                    .unwrap_or(SessionFailure::Disconnected);
                Err(SessionError::Failed(failure))
            }
        }
    }

    /// Terminal failure of the current attempt, if any.
    pub fn failure(&self) -> Option<SessionFailure> {
        self.shared.lock().failure.clone()
    }
}

impl std::fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSession")
            .field("session_id", &self.shared.session_id)
            .field("status", &self.status())
            .field("subscribers", &self.shared.subscribers)
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes the current state. Called with the core lock held so
    /// revisions are queued in order; deliver with `subscribers.drain()`
    /// after releasing the lock.
    fn publish(&self, core: &mut Core) {
        core.revision = core.revision.saturating_add(1);
        let snapshot = Arc::new(core.snapshot(self.session_id));
        self.published.send_replace(snapshot.clone());
        self.subscribers.enqueue(snapshot);
    }

    fn begin_attempt(&self, core: &mut Core) -> (u32, watch::Receiver<bool>) {
        let (abort_tx, abort_rx) = watch::channel(false);
        core.abort = Some(abort_tx);
        core.status = SessionStatus::Connecting;
        self.publish(core);
        (core.attempt, abort_rx)
    }

    /// Applies `change` if `attempt` is still live, then publishes and
    /// delivers. Returns `Flow::Stop` when the driver should exit.
    fn update(&self, attempt: u32, change: impl FnOnce(&mut Core)) -> Flow {
        let mut core = self.lock();
        if !core.accepts(attempt) {
            return Flow::Stop;
        }
        change(&mut core);
        self.publish(&mut core);
        let flow = if core.status.is_terminal() {
            Flow::Stop
        } else {
            Flow::Continue
        };
        drop(core);
        self.subscribers.drain();
        flow
    }

    fn fail(&self, attempt: u32, failure: SessionFailure) {
        warn!(session_id = %self.session_id, attempt, error = %failure, "generation failed");
        self.update(attempt, |core| core.fail(failure));
    }

    fn mark_streaming(&self, attempt: u32) -> Flow {
        {
            let core = self.lock();
            if !core.accepts(attempt) {
                return Flow::Stop;
            }
            if core.status != SessionStatus::Connecting {
                return Flow::Continue;
            }
        }
        debug!(session_id = %self.session_id, attempt, "first bytes received");
        self.update(attempt, |core| {
            if core.status == SessionStatus::Connecting {
                core.status = SessionStatus::Streaming;
            }
        })
    }

    fn apply_frame(&self, attempt: u32, frame: &Frame) -> Flow {
        let events = match parse_frame(frame) {
            Ok(events) if events.is_empty() => return Flow::Continue,
            Ok(events) => events,
            Err(err) => {
                warn!(
                    session_id = %self.session_id,
                    attempt,
                    error = %err,
                    raw = err.raw(),
                    "skipping undecodable frame"
                );
                let strict = self.config.strict_parsing;
                return self.update(attempt, |core| {
                    core.parse_errors = core.parse_errors.saturating_add(1);
                    if strict {
                        core.fail(SessionFailure::Parse {
                            message: err.to_string(),
                        });
                    }
                });
            }
        };

        self.update(attempt, |core| {
            core.frames_applied = core.frames_applied.saturating_add(1);
            for event in &events {
                self.apply_event(core, attempt, event);
                if core.status.is_terminal() {
                    break;
                }
            }
        })
    }

    fn apply_event(&self, core: &mut Core, attempt: u32, event: &StreamEvent) {
        let session_id = self.session_id;
        match event {
            StreamEvent::Done => {
                info!(%session_id, attempt, frames = core.frames_applied, "generation completed");
                core.complete();
            }
            StreamEvent::Error {
                message,
                recoverable: false,
            } => {
                warn!(%session_id, attempt, error = %message, "upstream reported a fatal error");
                core.fail(SessionFailure::Upstream {
                    message: message.clone(),
                });
            }
            StreamEvent::Error {
                message,
                recoverable: true,
            } => {
                warn!(%session_id, attempt, error = %message, "upstream reported a recoverable error");
                core.warnings.push(message.clone());
            }
            other => {
                match core.accumulator.apply_event(other) {
                    ApplyOutcome::DuplicateStart => {
                        warn!(%session_id, attempt, event = other.kind(), "ignoring start of already active section");
                    }
                    ApplyOutcome::UnmatchedEnd => {
                        debug!(%session_id, attempt, event = other.kind(), "ignoring end of section that is not open");
                    }
                    ApplyOutcome::Applied | ApplyOutcome::Skipped => {}
                }
                core.progress = core.progress.max(progress::estimate(&core.accumulator));
            }
        }
    }

    /// Clean end of the byte stream.
    fn close(&self, attempt: u32) {
        let session_id = self.session_id;
        self.update(attempt, |core| {
            if core.saw_completion_marker() {
                info!(%session_id, attempt, "stream closed after completion marker");
                core.complete();
            } else {
                warn!(%session_id, attempt, "stream closed before generation finished");
                core.fail(SessionFailure::Disconnected);
            }
        });
    }
}

async fn aborted(abort_rx: &mut watch::Receiver<bool>) {
    // A dropped sender means this attempt was superseded; stop either way.
    let _ = abort_rx.wait_for(|aborted| *aborted).await;
}

async fn drive(
    shared: Arc<Shared>,
    request: GenerationRequest,
    attempt: u32,
    mut abort_rx: watch::Receiver<bool>,
) {
    let window = shared.config.inactivity_timeout;
    let timeout_failure = || SessionFailure::Timeout {
        seconds: window.as_secs(),
    };

    let opened = tokio::select! {
        biased;
        _ = aborted(&mut abort_rx) => return,
        opened = tokio::time::timeout(window, shared.transport.open(&request)) => opened,
    };
    let handle = match opened {
        Ok(Ok(handle)) => handle,
        Ok(Err(err)) => {
            shared.fail(attempt, failure_from_transport_error(&err, true));
            return;
        }
        Err(_) => {
            shared.fail(attempt, timeout_failure());
            return;
        }
    };
    debug!(session_id = %shared.session_id, attempt, framing = ?handle.framing, "transport opened");

    let mut body = handle.body;
    let mut decoder = FrameDecoder::new(handle.framing);
    loop {
        let next = tokio::select! {
            biased;
            _ = aborted(&mut abort_rx) => return,
            next = tokio::time::timeout(window, body.next()) => next,
        };
        match next {
            Ok(Some(Ok(chunk))) => {
                if chunk.is_empty() {
                    continue;
                }
                if shared.mark_streaming(attempt) == Flow::Stop {
                    return;
                }
                for frame in decoder.push_chunk(&chunk) {
                    if shared.apply_frame(attempt, &frame) == Flow::Stop {
                        return;
                    }
                }
            }
            Ok(Some(Err(err))) => {
                shared.fail(attempt, failure_from_transport_error(&err, false));
                return;
            }
            Ok(None) => {
                if let Some(frame) = decoder.finish()
                    && shared.apply_frame(attempt, &frame) == Flow::Stop
                {
                    return;
                }
                shared.close(attempt);
                return;
            }
            Err(_) => {
                shared.fail(attempt, timeout_failure());
                return;
            }
        }
    }
}
