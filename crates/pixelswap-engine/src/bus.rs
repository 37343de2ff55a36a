use std::collections::BTreeMap;
use std::sync::mpsc;

use anyhow::Result;
use pixelswap_contracts::events::{emit_quiet, EventPayload, EventWriter};
use pixelswap_contracts::messages::ExtensionMessage;
use pixelswap_contracts::session::{BadgeState, SessionStore};
use serde_json::{json, Value};

use crate::engine::HostBridge;

pub type TabId = u32;

/// Delivers background-side messages to the page of the active tab.
///
/// Delivery is best effort: with no active tab, or a tab whose page is gone,
/// the message is logged and dropped.
#[derive(Debug, Default)]
pub struct TabRouter {
    tabs: BTreeMap<TabId, mpsc::Sender<ExtensionMessage>>,
    active: Option<TabId>,
    events: Option<EventWriter>,
}

impl TabRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn register(&mut self, tab: TabId, page: mpsc::Sender<ExtensionMessage>) {
        self.tabs.insert(tab, page);
    }

    pub fn activate(&mut self, tab: TabId) {
        self.active = Some(tab);
    }

    pub fn active_tab(&self) -> Option<TabId> {
        self.active.filter(|tab| self.tabs.contains_key(tab))
    }

    pub fn send_to_active(&self, message: ExtensionMessage) -> bool {
        let Some(tab) = self.active_tab() else {
            self.emit("tab_missing", json!({ "message": message.kind() }));
            return false;
        };
        let Some(page) = self.tabs.get(&tab) else {
            return false;
        };
        let kind = message.kind();
        if page.send(message).is_err() {
            self.emit("bus_dropped", json!({ "message": kind, "tab": tab }));
            return false;
        }
        true
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let payload = payload.as_object().cloned().unwrap_or_else(EventPayload::new);
        emit_quiet(self.events.as_ref(), event_type, payload);
    }
}

/// `HostBridge` for a page running on an in-process bus: outbound messages go
/// to the background channel, the indicator goes to the session store.
#[derive(Debug)]
pub struct ChannelBridge {
    outbound: Option<mpsc::Sender<ExtensionMessage>>,
    session: SessionStore,
    events: Option<EventWriter>,
}

impl ChannelBridge {
    pub fn new(outbound: mpsc::Sender<ExtensionMessage>, session: SessionStore) -> Self {
        Self {
            outbound: Some(outbound),
            session,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    /// Drops the outbound sender so the background side sees the bus close.
    pub fn close(&mut self) {
        self.outbound = None;
    }
}

impl HostBridge for ChannelBridge {
    fn send(&mut self, message: ExtensionMessage) {
        let kind = message.kind();
        let delivered = self
            .outbound
            .as_ref()
            .map(|outbound| outbound.send(message).is_ok())
            .unwrap_or(false);
        if !delivered {
            let mut payload = EventPayload::new();
            payload.insert("message".to_string(), Value::String(kind.to_string()));
            emit_quiet(self.events.as_ref(), "bus_dropped", payload);
        }
    }

    fn store_indicator(&mut self, state: BadgeState) -> Result<()> {
        self.session.set_badge(state)
    }
}
