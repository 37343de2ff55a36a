use std::env;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use pixelswap_contracts::events::{emit_quiet, EventPayload, EventWriter};
use pixelswap_contracts::messages::{ExtensionMessage, ImageJob};
use pixelswap_contracts::params::{GenerationRequest, ModelParams, DEFAULT_MODEL};
use pixelswap_contracts::session::SessionStore;
use serde_json::{json, Value};

use crate::bus::TabRouter;
use crate::providers::{truncate_text, ImageProviderRegistry};

/// Pause before each generation request so a freshly loaded page does not
/// flood the service.
pub const DEFAULT_DISPATCH_DELAY: Duration = Duration::from_millis(300);
const MAX_DISPATCH_DELAY_MS: u64 = 10_000;

/// Per-request counters for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub completed: usize,
    pub failed: usize,
}

/// Background side of the bus: turns `processImages` batches into paced
/// generation calls and routes each result back to the active tab.
pub struct GenerationDispatcher {
    providers: ImageProviderRegistry,
    provider: String,
    model: String,
    params: ModelParams,
    delay: Duration,
    session: SessionStore,
    router: TabRouter,
    events: Option<EventWriter>,
}

impl GenerationDispatcher {
    pub fn new(
        providers: ImageProviderRegistry,
        provider: &str,
        session: SessionStore,
        router: TabRouter,
    ) -> Result<Self> {
        if providers.get(provider).is_none() {
            bail!(
                "unknown provider '{provider}' (available: {})",
                providers.names().join(", ")
            );
        }
        Ok(Self {
            providers,
            provider: provider.to_string(),
            model: DEFAULT_MODEL.to_string(),
            params: ModelParams::default(),
            delay: dispatch_delay_from_env(),
            session,
            router,
            events: None,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    /// Handles messages until every sender is gone.
    pub fn run(mut self, inbox: mpsc::Receiver<ExtensionMessage>) -> BatchOutcome {
        let mut total = BatchOutcome::default();
        while let Ok(message) = inbox.recv() {
            let outcome = self.handle(message);
            total.completed += outcome.completed;
            total.failed += outcome.failed;
        }
        total
    }

    pub fn handle(&mut self, message: ExtensionMessage) -> BatchOutcome {
        match message {
            ExtensionMessage::ProcessImages { images } => self.process_batch(&images),
            ExtensionMessage::ReplaceImages { enabled } => {
                self.emit("toggle_observed", json!({ "enabled": enabled }));
                BatchOutcome::default()
            }
            ExtensionMessage::UpdateSingleImage { .. } => BatchOutcome::default(),
        }
    }

    /// One request per job, each preceded by the dispatch delay. A failed job
    /// is logged and skipped; it never stops the rest of the batch.
    pub fn process_batch(&mut self, images: &[ImageJob]) -> BatchOutcome {
        let user_prompt = self.session.user_prompt();
        let mut outcome = BatchOutcome::default();
        for job in images {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            let request = GenerationRequest::for_job(job, &user_prompt, &self.model, &self.params);
            self.emit(
                "generation_requested",
                json!({
                    "request_id": request.request_id,
                    "provider": self.provider,
                    "model": request.model,
                }),
            );

            let Some(provider) = self.providers.get(&self.provider) else {
                outcome.failed += 1;
                continue;
            };
            match provider.generate(&request) {
                Ok(result) => {
                    outcome.completed += 1;
                    self.emit(
                        "generation_completed",
                        json!({
                            "request_id": result.request_id,
                            "image_url": result.image_url,
                        }),
                    );
                    self.router.send_to_active(ExtensionMessage::UpdateSingleImage {
                        original_url: result.request_id,
                        new_image_url: result.image_url,
                    });
                }
                Err(err) => {
                    outcome.failed += 1;
                    self.emit(
                        "generation_failed",
                        json!({
                            "request_id": request.request_id,
                            "error": error_chain_text(&err, 512),
                        }),
                    );
                }
            }
        }
        outcome
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let payload = payload.as_object().cloned().unwrap_or_else(EventPayload::new);
        emit_quiet(self.events.as_ref(), event_type, payload);
    }
}

fn dispatch_delay_from_env() -> Duration {
    env::var("PIXELSWAP_DISPATCH_DELAY_MS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(|value| Duration::from_millis(value.min(MAX_DISPATCH_DELAY_MS)))
        .unwrap_or(DEFAULT_DISPATCH_DELAY)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() || parts.last().map(String::as_str) == Some(trimmed) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}
