use anyhow::Result;
use pixelswap_contracts::events::{emit_quiet, EventPayload, EventWriter};
use pixelswap_contracts::images::{is_eligible, CandidateImage, ImageRegistry};
use pixelswap_contracts::messages::{ExtensionMessage, ImageJob};
use pixelswap_contracts::session::BadgeState;
use serde_json::{json, Value};

use crate::clock::{Clock, SystemClock};
use crate::page::{Document, MutationBatch};
use crate::srcset;

/// The page's outbound side: the message bus and the toolbar indicator.
pub trait HostBridge {
    /// Fire-and-forget. Implementations drop (and log) what they cannot deliver.
    fn send(&mut self, message: ExtensionMessage);
    fn store_indicator(&mut self, state: BadgeState) -> Result<()>;
}

/// Page-resident replacement state: the enabled flag, the registry, and the
/// document they are applied to.
///
/// Every entry point takes `&mut self`; the engine is driven from a single
/// event loop and never shares its registry.
pub struct ReplaceEngine<D: Document, B: HostBridge> {
    document: D,
    bridge: B,
    registry: ImageRegistry,
    enabled: bool,
    clock: Box<dyn Clock>,
    events: Option<EventWriter>,
}

impl<D: Document, B: HostBridge> ReplaceEngine<D, B> {
    /// `indicator` is the persisted badge state the flag is seeded from.
    pub fn new(document: D, bridge: B, indicator: BadgeState) -> Self {
        Self {
            document,
            bridge,
            registry: ImageRegistry::new(),
            enabled: indicator.is_on(),
            clock: Box::new(SystemClock),
            events: None,
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn registry(&self) -> &ImageRegistry {
        &self.registry
    }

    pub fn document(&self) -> &D {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut D {
        &mut self.document
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    pub fn into_parts(self) -> (D, B, ImageRegistry) {
        (self.document, self.bridge, self.registry)
    }

    /// Initial pass for a page loaded while replacement is already on.
    pub fn start(&mut self) {
        if self.enabled {
            self.scan();
            self.apply_rewrite();
        }
    }

    /// Sends every newly eligible image for generation. Returns the URLs
    /// dispatched, in document order.
    pub fn scan(&mut self) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }

        let now = self.clock.now();
        let mut dispatched = Vec::new();
        for image in self.document.images() {
            // Originals with a result and images already showing one are done.
            if self.registry.contains(&image.src)
                || self.registry.lookup_original(&image.src).is_some()
            {
                continue;
            }
            let candidate = CandidateImage {
                url: &image.src,
                alt: &image.alt,
                width: image.width,
                height: image.height,
            };
            if !is_eligible(&candidate, &self.registry, now) {
                continue;
            }
            self.registry.mark_dispatched(&image.src, now);
            dispatched.push(image.src);
        }

        if !dispatched.is_empty() {
            self.emit(
                "images_dispatched",
                json!({
                    "count": dispatched.len(),
                    "urls": &dispatched,
                }),
            );
            self.bridge.send(ExtensionMessage::ProcessImages {
                images: dispatched.iter().map(ImageJob::for_url).collect(),
            });
        }
        dispatched
    }

    /// Brings every rendered URL in line with the flag: generated URLs while
    /// on, originals while off. Returns the number of attribute writes.
    pub fn apply_rewrite(&mut self) -> usize {
        let mut writes = 0;

        for image in self.document.images() {
            let target = if self.enabled {
                self.registry.resolve_forward(&image.src)
            } else {
                self.registry.resolve_original(&image.src)
            };
            if let Some(target) = target {
                let target = target.to_string();
                self.document.set_image_src(image.id, &target);
                writes += 1;
            }
        }

        let mut skipped_sources = 0;
        for source in self.document.sources() {
            if srcset::extract_urls(&source.srcset).is_empty() {
                skipped_sources += 1;
                continue;
            }
            let registry = &self.registry;
            let enabled = self.enabled;
            let rewritten = srcset::substitute_urls(&source.srcset, |url| {
                if enabled {
                    registry.resolve_forward(url).map(str::to_string)
                } else {
                    registry.resolve_original(url).map(str::to_string)
                }
            });
            if let Some(rewritten) = rewritten {
                self.document.set_source_srcset(source.id, &rewritten);
                writes += 1;
            }
        }

        if writes > 0 {
            self.emit(
                "rewrite_applied",
                json!({
                    "enabled": self.enabled,
                    "writes": writes,
                    "skipped_sources": skipped_sources,
                }),
            );
        }
        writes
    }

    pub fn on_generation_result(&mut self, original_url: &str, generated_url: &str) -> usize {
        self.registry.record_result(original_url, generated_url);
        self.emit(
            "generation_result",
            json!({
                "original_url": original_url,
                "generated_url": generated_url,
            }),
        );
        self.apply_rewrite()
    }

    pub fn on_toggle(&mut self, enabled: bool) {
        self.enabled = enabled;
        let indicator = BadgeState::from_enabled(enabled);
        if let Err(err) = self.bridge.store_indicator(indicator) {
            self.emit(
                "indicator_failed",
                json!({
                    "badge": indicator.text(),
                    "error": format!("{err:#}"),
                }),
            );
        }
        self.bridge.send(ExtensionMessage::ReplaceImages { enabled });
        self.emit("toggle", json!({ "enabled": enabled }));

        self.scan();
        self.apply_rewrite();
    }

    /// Reacts to a structural change batch. Only added nodes re-trigger a
    /// scan; attribute changes (including the engine's own rewrites) do not.
    pub fn on_mutation(&mut self, batch: &MutationBatch) -> bool {
        if !self.enabled || !batch.has_additions() {
            return false;
        }
        self.scan();
        self.apply_rewrite();
        true
    }

    /// Drains the document's pending mutations and reacts to them.
    pub fn poll_mutations(&mut self) -> bool {
        let batch = self.document.take_mutations();
        self.on_mutation(&batch)
    }

    pub fn handle_message(&mut self, message: ExtensionMessage) {
        match message {
            ExtensionMessage::UpdateSingleImage {
                original_url,
                new_image_url,
            } => {
                self.on_generation_result(&original_url, &new_image_url);
            }
            ExtensionMessage::ReplaceImages { enabled } => self.on_toggle(enabled),
            ExtensionMessage::ProcessImages { .. } => {}
        }
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let payload = match payload {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        emit_quiet(self.events.as_ref(), event_type, payload);
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use pixelswap_contracts::events::{read_event_types, EventWriter};
    use pixelswap_contracts::messages::{ExtensionMessage, ImageJob};
    use pixelswap_contracts::session::BadgeState;

    use super::{HostBridge, ReplaceEngine};
    use crate::clock::ManualClock;
    use crate::page::{MutationBatch, PageSnapshot};

    #[derive(Debug, Default)]
    struct RecordingBridge {
        sent: Vec<ExtensionMessage>,
        indicators: Vec<BadgeState>,
    }

    impl RecordingBridge {
        fn dispatched_urls(&self) -> Vec<String> {
            self.sent
                .iter()
                .filter_map(|message| match message {
                    ExtensionMessage::ProcessImages { images } => Some(images),
                    _ => None,
                })
                .flatten()
                .map(|job| job.image_url.clone())
                .collect()
        }
    }

    impl HostBridge for RecordingBridge {
        fn send(&mut self, message: ExtensionMessage) {
            self.sent.push(message);
        }

        fn store_indicator(&mut self, state: BadgeState) -> Result<()> {
            self.indicators.push(state);
            Ok(())
        }
    }

    type TestEngine = ReplaceEngine<PageSnapshot, RecordingBridge>;

    fn engine_for(page: PageSnapshot) -> (TestEngine, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let engine = ReplaceEngine::new(page, RecordingBridge::default(), BadgeState::Off)
            .with_clock(clock.clone());
        (engine, clock)
    }

    fn photo_page() -> PageSnapshot {
        PageSnapshot::default()
            .with_image("https://a.test/a.jpg", "harbour", 640.0, 480.0)
            .with_image("https://a.test/b.jpg", "market", 800.0, 600.0)
    }

    #[test]
    fn off_rewrite_leaves_untouched_images_alone() {
        let page = PageSnapshot::default().with_image("a.jpg", "", 300.0, 300.0);
        let (mut engine, _) = engine_for(page);
        assert_eq!(engine.apply_rewrite(), 0);
        assert_eq!(engine.document().image_src(0), Some("a.jpg"));
    }

    #[test]
    fn recorded_result_is_shown_once_enabled() {
        let page = PageSnapshot::default().with_image("a.jpg", "", 300.0, 300.0);
        let (mut engine, _) = engine_for(page);
        engine.on_generation_result("a.jpg", "gen1.jpg");
        assert_eq!(engine.document().image_src(0), Some("a.jpg"));

        engine.on_toggle(true);
        assert_eq!(engine.document().image_src(0), Some("gen1.jpg"));
    }

    #[test]
    fn rewrite_is_idempotent() {
        let (mut engine, _) = engine_for(photo_page().with_source("https://a.test/a.jpg 1x"));
        engine.on_toggle(true);
        engine.on_generation_result("https://a.test/a.jpg", "https://gen.test/a.png");
        let writes = engine.document().attribute_writes();
        assert_eq!(writes, 2);

        assert_eq!(engine.apply_rewrite(), 0);
        assert_eq!(engine.document().attribute_writes(), writes);
    }

    #[test]
    fn toggle_round_trip_restores_generated_urls() {
        let page = photo_page().with_source("https://a.test/b.jpg 1x, https://a.test/a.jpg 2x");
        let (mut engine, _) = engine_for(page);
        engine.on_toggle(true);
        engine.on_generation_result("https://a.test/a.jpg", "https://gen.test/a.png");
        engine.on_generation_result("https://a.test/b.jpg", "https://gen.test/b.png");
        let generated = engine.document().clone();
        assert_eq!(
            generated.source_srcset(0),
            Some("https://gen.test/b.png 1x, https://gen.test/a.png 2x")
        );

        engine.on_toggle(false);
        assert_eq!(engine.document().image_src(0), Some("https://a.test/a.jpg"));
        assert_eq!(engine.document().image_src(1), Some("https://a.test/b.jpg"));
        assert_eq!(
            engine.document().source_srcset(0),
            Some("https://a.test/b.jpg 1x, https://a.test/a.jpg 2x")
        );
        assert_eq!(engine.registry().len(), 2);

        engine.on_toggle(true);
        assert_eq!(engine.document().images, generated.images);
        assert_eq!(engine.document().sources, generated.sources);
    }

    #[test]
    fn retry_window_gates_redispatch() {
        let (mut engine, clock) = engine_for(photo_page());
        engine.on_toggle(true);
        assert_eq!(engine.bridge().dispatched_urls().len(), 2);

        clock.advance_ms(1000);
        assert!(engine.scan().is_empty());

        clock.advance_ms(2100);
        assert_eq!(
            engine.scan(),
            vec!["https://a.test/a.jpg".to_string(), "https://a.test/b.jpg".to_string()]
        );
    }

    #[test]
    fn scan_skips_resolved_and_already_replaced_images() {
        let (mut engine, clock) = engine_for(photo_page());
        engine.on_toggle(true);
        engine.on_generation_result("https://a.test/a.jpg", "https://gen.test/a.png");

        clock.advance_ms(5000);
        assert_eq!(engine.scan(), vec!["https://a.test/b.jpg".to_string()]);
    }

    #[test]
    fn scan_is_a_noop_while_off_and_dedupes_repeated_urls() {
        let page = photo_page().with_image("https://a.test/a.jpg", "harbour again", 640.0, 480.0);
        let (mut engine, _) = engine_for(page);
        assert!(engine.scan().is_empty());
        assert!(engine.bridge().sent.is_empty());

        engine.on_toggle(true);
        assert_eq!(
            engine.bridge().dispatched_urls(),
            vec!["https://a.test/a.jpg".to_string(), "https://a.test/b.jpg".to_string()]
        );
    }

    #[test]
    fn toggle_persists_indicator_and_broadcasts_flag() {
        let (mut engine, _) = engine_for(PageSnapshot::default());
        engine.on_toggle(true);
        engine.on_toggle(false);

        assert_eq!(engine.bridge().indicators, vec![BadgeState::On, BadgeState::Off]);
        assert_eq!(
            engine.bridge().sent,
            vec![
                ExtensionMessage::ReplaceImages { enabled: true },
                ExtensionMessage::ReplaceImages { enabled: false },
            ]
        );
    }

    #[test]
    fn only_added_nodes_trigger_rescans() {
        let (mut engine, _) = engine_for(photo_page());
        engine.on_toggle(true);
        engine.on_generation_result("https://a.test/a.jpg", "https://gen.test/a.png");

        // The rewrite above queued an attribute-only batch.
        assert!(!engine.poll_mutations());

        engine
            .document_mut()
            .append(PageSnapshot::default().with_image("https://a.test/c.jpg", "", 900.0, 700.0));
        assert!(engine.poll_mutations());
        assert!(engine
            .bridge()
            .dispatched_urls()
            .contains(&"https://a.test/c.jpg".to_string()));
    }

    #[test]
    fn mutations_are_ignored_while_off() {
        let (mut engine, _) = engine_for(photo_page());
        let batch = MutationBatch {
            added_nodes: 3,
            attribute_changes: 0,
        };
        assert!(!engine.on_mutation(&batch));
        assert!(engine.bridge().sent.is_empty());
    }

    #[test]
    fn lazily_added_images_pick_up_existing_results() {
        let (mut engine, _) = engine_for(photo_page());
        engine.on_toggle(true);
        engine.on_generation_result("https://a.test/a.jpg", "https://gen.test/a.png");

        engine
            .document_mut()
            .append(PageSnapshot::default().with_image("https://a.test/a.jpg", "", 640.0, 480.0));
        engine.poll_mutations();
        assert_eq!(engine.document().image_src(2), Some("https://gen.test/a.png"));
    }

    #[test]
    fn results_arriving_while_off_render_on_next_toggle() {
        let (mut engine, _) = engine_for(photo_page());
        engine.on_toggle(true);
        engine.on_toggle(false);

        engine.handle_message(ExtensionMessage::UpdateSingleImage {
            original_url: "https://a.test/b.jpg".to_string(),
            new_image_url: "https://gen.test/b.png".to_string(),
        });
        assert_eq!(engine.document().image_src(1), Some("https://a.test/b.jpg"));

        engine.handle_message(ExtensionMessage::ReplaceImages { enabled: true });
        assert_eq!(engine.document().image_src(1), Some("https://gen.test/b.png"));
    }

    #[test]
    fn later_result_does_not_reach_elements_showing_the_older_one() {
        let (mut engine, _) = engine_for(photo_page());
        engine.on_toggle(true);
        engine.on_generation_result("https://a.test/a.jpg", "https://gen.test/a1.png");
        engine.on_generation_result("https://a.test/a.jpg", "https://gen.test/a2.png");

        assert_eq!(
            engine.registry().lookup_forward("https://a.test/a.jpg"),
            Some("https://gen.test/a2.png")
        );
        // The element already shows a1, which is no longer a registry value.
        assert_eq!(engine.document().image_src(0), Some("https://gen.test/a1.png"));

        // Nothing maps a1 back, so turning off cannot restore the original.
        engine.on_toggle(false);
        assert_eq!(engine.registry().lookup_original("https://gen.test/a1.png"), None);
        assert_eq!(engine.document().image_src(0), Some("https://gen.test/a1.png"));
        assert_eq!(engine.document().image_src(1), Some("https://a.test/b.jpg"));
    }

    #[test]
    fn self_mapped_result_is_not_rewritten_while_off() {
        let (mut engine, _) = engine_for(photo_page());
        engine.on_generation_result("https://a.test/a.jpg", "https://a.test/a.jpg");

        let writes_before = engine.document().attribute_writes();
        assert_eq!(engine.apply_rewrite(), 0);
        assert_eq!(engine.apply_rewrite(), 0);
        assert_eq!(engine.document().attribute_writes(), writes_before);
        assert_eq!(engine.document().image_src(0), Some("https://a.test/a.jpg"));
    }

    #[test]
    fn result_cycle_settles_without_rewrites() {
        let page = PageSnapshot::default()
            .with_image("https://a.test/a.jpg", "", 640.0, 480.0)
            .with_source("https://a.test/a.jpg 1x, https://a.test/b.jpg 2x");
        let (mut engine, _) = engine_for(page);
        engine.on_generation_result("https://a.test/a.jpg", "https://a.test/b.jpg");
        engine.on_generation_result("https://a.test/b.jpg", "https://a.test/a.jpg");

        assert_eq!(engine.apply_rewrite(), 0);
        assert_eq!(engine.document().image_src(0), Some("https://a.test/a.jpg"));
        // b was restored to a while only a -> b existed.
        assert_eq!(
            engine.document().source_srcset(0),
            Some("https://a.test/a.jpg 1x, https://a.test/a.jpg 2x")
        );

        engine.on_toggle(true);
        assert_eq!(engine.apply_rewrite(), 0);
        assert_eq!(engine.document().image_src(0), Some("https://a.test/a.jpg"));
    }

    #[test]
    fn seeded_on_state_scans_at_start() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let mut engine =
            ReplaceEngine::new(photo_page(), RecordingBridge::default(), BadgeState::On)
                .with_clock(clock);
        assert!(engine.is_enabled());

        engine.start();
        assert_eq!(
            engine.bridge().sent,
            vec![ExtensionMessage::ProcessImages {
                images: vec![
                    ImageJob::for_url("https://a.test/a.jpg"),
                    ImageJob::for_url("https://a.test/b.jpg"),
                ],
            }]
        );
    }

    #[test]
    fn engine_records_lifecycle_events() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let (engine, _) = engine_for(photo_page());
        let mut engine = engine.with_events(EventWriter::new(&path, "session-test"));

        engine.on_toggle(true);
        engine.on_generation_result("https://a.test/a.jpg", "https://gen.test/a.png");

        assert_eq!(
            read_event_types(&path)?,
            vec!["toggle", "images_dispatched", "generation_result", "rewrite_applied"]
        );
        Ok(())
    }
}
