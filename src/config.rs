use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock};

pub const DEFAULT_FOCUS_PERIOD_SECS: u64 = 25 * 60;
pub const DEFAULT_BREAK_PERIOD_SECS: u64 = 5 * 60;

/// Countdown period lengths. The 25/5 split is a default, not business law.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerSettings {
    pub focus_period_secs: u64,
    pub break_period_secs: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            focus_period_secs: DEFAULT_FOCUS_PERIOD_SECS,
            break_period_secs: DEFAULT_BREAK_PERIOD_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UserSettings {
    timer: TimerSettings,
}

/// JSON-file-backed settings, loaded once at startup and guarded by a lock.
/// Unreadable or malformed files fall back to defaults rather than failing
/// startup.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn timer(&self) -> TimerSettings {
        self.data.read().unwrap().timer
    }

    pub fn update_timer(&self, settings: TimerSettings) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.timer = settings;
        self.persist(&guard)?;
        Ok(())
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)?;
        let data: UserSettings = serde_json::from_str(&contents)?;
        let mut guard = self.data.write().unwrap();
        *guard = data;
        Ok(())
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
