//! Consumer-side bindings: render models, document persistence, and the
//! controller that owns the active generation.
//!
//! Consumers only ever see [`SessionSnapshot`] values. They never reach into
//! accumulator state and never drive transitions other than `cancel()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::accumulator::Section;
use crate::config::SessionConfig;
use crate::errors::SessionError;
use crate::event::MetadataMap;
use crate::request::{GenerationRequest, TemplateType};
use crate::session::StreamingSession;
use crate::snapshot::{SessionSnapshot, SessionStatus};
use crate::subscribers::Subscription;
use crate::transport::TransportFactory;

/// Anything that renders session state.
pub trait SessionConsumer: Send + Sync {
    fn render(&self, snapshot: &SessionSnapshot);
}

impl<F> SessionConsumer for F
where
    F: Fn(&SessionSnapshot) + Send + Sync,
{
    fn render(&self, snapshot: &SessionSnapshot) {
        self(snapshot)
    }
}

/// Renders the current snapshot, then every later one.
///
/// Snapshots are rendered in revision order and none is rendered twice.
pub fn bind(session: &StreamingSession, consumer: Arc<dyn SessionConsumer>) -> Subscription {
    // One past the highest revision rendered so far.
    let rendered = Arc::new(AtomicU64::new(0));
    let subscription = {
        let rendered = rendered.clone();
        let consumer = consumer.clone();
        session.subscribe(move |snapshot| {
            if claim(&rendered, snapshot.revision) {
                consumer.render(snapshot);
            }
        })
    };
    let current = session.get_snapshot();
    if claim(&rendered, current.revision) {
        consumer.render(&current);
    }
    subscription
}

fn claim(rendered: &AtomicU64, revision: u64) -> bool {
    let next = revision.saturating_add(1);
    rendered.fetch_max(next, Ordering::AcqRel) < next
}

/// What a UI should show for one snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerView {
    pub status: SessionStatus,
    /// True only while connecting or streaming.
    pub show_spinner: bool,
    /// Failure notice. `None` for cancellation, which is not an error.
    pub banner: Option<String>,
    pub progress_percent: u8,
    pub current_section: Option<String>,
    /// Ordered by start.
    pub sections: Vec<Section>,
    pub warnings: Vec<String>,
    /// Content should be labelled incomplete wherever it is shown or exported.
    pub incomplete: bool,
    /// There is settled content worth exporting.
    pub exportable: bool,
}

impl From<&SessionSnapshot> for ConsumerView {
    fn from(snapshot: &SessionSnapshot) -> Self {
        let banner = match snapshot.status {
            SessionStatus::Failed => Some(match &snapshot.error_message {
                Some(message) => format!("Generation failed: {message}. Partial content shown."),
                None => "Generation failed. Partial content shown.".to_string(),
            }),
            _ => None,
        };
        let has_content = !snapshot.unsectioned.is_empty()
            || snapshot.sections.iter().any(|s| !s.text().is_empty());
        Self {
            status: snapshot.status,
            show_spinner: snapshot.status.is_running(),
            banner,
            progress_percent: snapshot.progress_percent,
            current_section: snapshot.current_section.clone(),
            sections: snapshot.sections.clone(),
            warnings: snapshot.warnings.clone(),
            incomplete: snapshot.is_incomplete(),
            exportable: snapshot.status.is_terminal() && has_content,
        }
    }
}

/// One section of a saved document.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DocumentSection {
    pub name: String,
    pub text: String,
}

/// Final document handed to a [`DocumentSink`] once a generation completes.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CaseStudyDocument {
    pub session_id: uuid::Uuid,
    pub title: String,
    pub project_name: String,
    pub template_type: TemplateType,
    pub model_name: String,
    pub sections: Vec<DocumentSection>,
    pub metadata: MetadataMap,
    pub markdown: String,
    pub completed_at: DateTime<Utc>,
}

impl CaseStudyDocument {
    pub fn from_snapshot(request: &GenerationRequest, snapshot: &SessionSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            title: format!("{} case study", request.project_name.trim()),
            project_name: request.project_name.clone(),
            template_type: request.template_type,
            model_name: request.model_name.clone(),
            sections: snapshot
                .sections
                .iter()
                .map(|section| DocumentSection {
                    name: section.name.clone(),
                    text: section.text().to_string(),
                })
                .collect(),
            metadata: snapshot.metadata.clone(),
            markdown: snapshot.to_markdown(),
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("document sink failed: {0}")]
pub struct DocumentSinkError(pub String);

/// Persists completed documents. Implement and pass to the controller.
#[async_trait::async_trait]
pub trait DocumentSink: Send + Sync {
    async fn save(&self, document: CaseStudyDocument) -> Result<(), DocumentSinkError>;
}

struct ActiveGeneration {
    session: StreamingSession,
    subscriptions: Vec<Subscription>,
}

impl ActiveGeneration {
    fn stop(self) {
        self.session.cancel();
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
    }
}

/// Owns the single active generation and wires consumers to it.
///
/// Each `generate` call builds a fresh session; the previous one is cancelled
/// and its consumers detached.
pub struct GenerationController {
    transport: Arc<dyn TransportFactory>,
    config: SessionConfig,
    consumers: Vec<Arc<dyn SessionConsumer>>,
    sink: Option<Arc<dyn DocumentSink>>,
    active: Mutex<Option<ActiveGeneration>>,
}

impl GenerationController {
    pub fn new(transport: Arc<dyn TransportFactory>) -> Self {
        Self {
            transport,
            config: SessionConfig::default(),
            consumers: Vec::new(),
            sink: None,
            active: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn SessionConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    /// Saves each completed document, including ones completed by a retry.
    pub fn with_sink(mut self, sink: Arc<dyn DocumentSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Cancels any running generation and starts a new one for `request`.
    pub fn generate(&self, request: GenerationRequest) -> Result<StreamingSession, SessionError> {
        self.cancel_active();

        let session = StreamingSession::with_config(self.transport.clone(), self.config.clone());
        let subscriptions: Vec<Subscription> = self
            .consumers
            .iter()
            .map(|consumer| bind(&session, consumer.clone()))
            .collect();
        if let Err(err) = session.start(request.clone()) {
            for subscription in &subscriptions {
                subscription.unsubscribe();
            }
            return Err(err);
        }

        if let Some(sink) = self.sink.clone() {
            tokio::spawn(save_when_completed(session.updates(), request, sink));
        }
        let replaced = self.lock().replace(ActiveGeneration {
            session: session.clone(),
            subscriptions,
        });
        // A concurrent `generate` may have stored its session after our
        // `cancel_active`; whatever this store displaced is no longer tracked.
        if let Some(replaced) = replaced {
            replaced.stop();
        }
        Ok(session)
    }

    /// Session of the current generation, if any.
    pub fn active(&self) -> Option<StreamingSession> {
        self.lock().as_ref().map(|active| active.session.clone())
    }

    /// Cancels the current generation and detaches its consumers.
    pub fn cancel_active(&self) {
        let previous = self.lock().take();
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActiveGeneration>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Waits for the session to complete, following retries, then saves once.
///
/// Holds only a watch receiver so it exits when the last session handle drops.
async fn save_when_completed(
    mut updates: tokio::sync::watch::Receiver<Arc<SessionSnapshot>>,
    request: GenerationRequest,
    sink: Arc<dyn DocumentSink>,
) {
    loop {
        let terminal = match updates.wait_for(|s| s.status.is_terminal()).await {
            Ok(snapshot) => SessionSnapshot::clone(&snapshot),
            Err(_) => return,
        };
        match terminal.status {
            SessionStatus::Completed => {
                let document = CaseStudyDocument::from_snapshot(&request, &terminal);
                let sections = document.sections.len();
                match sink.save(document).await {
                    Ok(()) => {
                        info!(session_id = %terminal.session_id, sections, "saved case study document")
                    }
                    Err(err) => {
                        warn!(session_id = %terminal.session_id, error = %err, "failed to save case study document")
                    }
                }
                return;
            }
            SessionStatus::Failed => {
                let attempt = terminal.attempt;
                if updates.wait_for(|s| s.attempt > attempt).await.is_err() {
                    return;
                }
            }
            _ => return,
        }
    }
}
