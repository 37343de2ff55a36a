use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

const BADGE_TEXT_KEY: &str = "badge_text";
const BADGE_COLOR_KEY: &str = "badge_color";
const USER_PROMPT_KEY: &str = "user_prompt";

/// Two-valued toolbar indicator mirroring whether replacement is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadgeState {
    On,
    Off,
}

impl BadgeState {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Self::On
        } else {
            Self::Off
        }
    }

    /// Anything other than `ON` reads as off.
    pub fn from_text(text: &str) -> Self {
        Self::from_enabled(text == "ON")
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }

    pub fn text(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            Self::On => "#90EE90",
            Self::Off => "#D3D3D3",
        }
    }
}

/// Session-scoped key/value strings (badge indicator and user prompt) kept in
/// one JSON object on disk.
///
/// Every read goes to disk and every write merges only the touched keys into
/// the current file contents, so several handles on the same path (popup,
/// page, CLI invocations) do not clobber each other.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        read_json_object(&self.path)?
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn set_strings(&self, entries: &[(&str, &str)]) -> anyhow::Result<()> {
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        let mut changed = false;
        for (key, value) in entries {
            let value = Value::String((*value).to_string());
            if on_disk.get(*key) == Some(&value) {
                continue;
            }
            on_disk.insert((*key).to_string(), value);
            changed = true;
        }
        if !changed {
            return Ok(());
        }
        write_json_object(&self.path, &on_disk)
    }

    pub fn badge(&self) -> BadgeState {
        self.get_string(BADGE_TEXT_KEY)
            .map(|text| BadgeState::from_text(&text))
            .unwrap_or(BadgeState::Off)
    }

    pub fn badge_color(&self) -> Option<String> {
        self.get_string(BADGE_COLOR_KEY)
    }

    pub fn set_badge(&self, state: BadgeState) -> anyhow::Result<()> {
        self.set_strings(&[(BADGE_TEXT_KEY, state.text()), (BADGE_COLOR_KEY, state.color())])
    }

    /// Empty when no prompt was ever entered.
    pub fn user_prompt(&self) -> String {
        self.get_string(USER_PROMPT_KEY).unwrap_or_default()
    }

    pub fn set_user_prompt(&self, prompt: &str) -> anyhow::Result<()> {
        self.set_strings(&[(USER_PROMPT_KEY, prompt)])
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{BadgeState, SessionStore};

    #[test]
    fn missing_file_reads_as_off_with_empty_prompt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SessionStore::new(temp.path().join("session.json"));
        assert_eq!(store.badge(), BadgeState::Off);
        assert_eq!(store.user_prompt(), "");
        assert_eq!(store.badge_color(), None);
        Ok(())
    }

    #[test]
    fn badge_round_trips_text_and_color() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("session.json");
        let store = SessionStore::new(&path);
        store.set_badge(BadgeState::On)?;

        let reopened = SessionStore::new(&path);
        assert_eq!(reopened.badge(), BadgeState::On);
        assert_eq!(reopened.badge_color().as_deref(), Some("#90EE90"));

        reopened.set_badge(BadgeState::Off)?;
        assert_eq!(store.badge(), BadgeState::Off);
        assert_eq!(store.badge_color().as_deref(), Some("#D3D3D3"));
        Ok(())
    }

    #[test]
    fn writers_on_the_same_path_merge_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("session.json");
        let popup = SessionStore::new(&path);
        let page = SessionStore::new(&path);

        popup.set_user_prompt("watercolor city")?;
        page.set_badge(BadgeState::On)?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(parsed["user_prompt"], json!("watercolor city"));
        assert_eq!(parsed["badge_text"], json!("ON"));
        Ok(())
    }

    #[test]
    fn unknown_badge_text_reads_as_off() {
        assert_eq!(BadgeState::from_text("on"), BadgeState::Off);
        assert_eq!(BadgeState::from_text(""), BadgeState::Off);
        assert!(BadgeState::from_text("ON").is_on());
    }
}
