use dashmap::DashMap;

use crate::limits::MAX_COOLDOWN_DAYS;

pub const COOLDOWN_DAYS: &str = "cooldown_days";

/// Mutable key/value settings shared by the engine.
///
/// Values are stored as text, the way they travel over the wire and through
/// the WAL; typed accessors fall back to the configured default when a key
/// is missing or does not parse.
pub struct Settings {
    values: DashMap<String, String>,
    default_cooldown_days: u32,
}

impl Settings {
    pub fn new(default_cooldown_days: u32) -> Self {
        Self {
            values: DashMap::new(),
            default_cooldown_days,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn cooldown_days(&self) -> u32 {
        self.values
            .get(COOLDOWN_DAYS)
            .and_then(|v| v.value().trim().parse().ok())
            .filter(|d| *d <= MAX_COOLDOWN_DAYS)
            .unwrap_or(self.default_cooldown_days)
    }

    /// Explicitly set keys only, sorted by key.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort();
        out
    }

    /// All explicitly set keys plus the effective `cooldown_days`, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let mut out = self.entries();
        if !self.values.contains_key(COOLDOWN_DAYS) {
            out.push((COOLDOWN_DAYS.to_string(), self.cooldown_days().to_string()));
        }
        out.sort();
        out
    }
}
