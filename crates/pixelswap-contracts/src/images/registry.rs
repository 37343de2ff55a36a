use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

/// Minimum time in milliseconds before an already dispatched image may be
/// dispatched again.
pub const RETRY_WINDOW_MS: i64 = 3000;

/// Original image URL → generated image URL, plus the time each original was
/// last sent for generation.
///
/// Entries are only ever added or overwritten; nothing is removed for the
/// lifetime of a page session, so toggling the effect off and back on reuses
/// earlier generations.
#[derive(Debug, Clone, Default)]
pub struct ImageRegistry {
    generated: IndexMap<String, String>,
    dispatched_at: HashMap<String, DateTime<Utc>>,
}

impl ImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins. No request ordering is tracked, so a late result for
    /// an older request overwrites a newer one.
    pub fn record_result(&mut self, original: &str, generated: &str) {
        self.generated
            .insert(original.to_string(), generated.to_string());
    }

    pub fn lookup_forward(&self, original: &str) -> Option<&str> {
        self.generated.get(original).map(String::as_str)
    }

    /// Finds the original whose generated URL is `current`. `None` means
    /// `current` was never produced by a generation.
    pub fn lookup_original(&self, current: &str) -> Option<&str> {
        self.generated
            .iter()
            .find(|(_, generated)| generated.as_str() == current)
            .map(|(original, _)| original.as_str())
    }

    /// Follows forward mappings from `url` to the last generated URL.
    pub fn resolve_forward(&self, url: &str) -> Option<&str> {
        self.resolve(url, |key| self.lookup_forward(key))
    }

    /// Follows reverse mappings from `url` back to the first original.
    pub fn resolve_original(&self, url: &str) -> Option<&str> {
        self.resolve(url, |key| self.lookup_original(key))
    }

    /// `None` when nothing maps `url` elsewhere, or when the mappings loop
    /// (`a -> a`, `a -> b -> a`). A resolved target never resolves further,
    /// so rewriting to it is stable.
    fn resolve<'a, F>(&'a self, url: &str, step: F) -> Option<&'a str>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let mut current = step(url)?;
        let mut hops = 1;
        while let Some(next) = step(current) {
            if next == url || next == current || hops > self.generated.len() {
                return None;
            }
            current = next;
            hops += 1;
        }
        (current != url).then_some(current)
    }

    pub fn contains(&self, original: &str) -> bool {
        self.generated.contains_key(original)
    }

    pub fn mark_dispatched(&mut self, original: &str, now: DateTime<Utc>) {
        self.dispatched_at.insert(original.to_string(), now);
    }

    pub fn pending_since(&self, original: &str) -> Option<DateTime<Utc>> {
        self.dispatched_at.get(original).copied()
    }

    pub fn is_retry_window_elapsed(&self, original: &str, now: DateTime<Utc>) -> bool {
        match self.dispatched_at.get(original) {
            None => true,
            Some(started) => {
                now.signed_duration_since(*started).num_milliseconds() > RETRY_WINDOW_MS
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.generated
            .iter()
            .map(|(original, generated)| (original.as_str(), generated.as_str()))
    }

    pub fn len(&self) -> usize {
        self.generated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generated.is_empty()
    }

    pub fn dispatched_count(&self) -> usize {
        self.dispatched_at.len()
    }
}
