//! Durable key/value preferences

use ahash::AHashMap;
use parking_lot::RwLock;

/// Key holding the gradient palette preference
pub const GRADIENT_KEY: &str = "colors.gradient";
/// Key holding the plot configuration
pub const PLOT_CONFIG_KEY: &str = "plot.config";

/// Key holding the color overrides for one classification family
pub fn classification_key(family: &str) -> String {
    format!("colors.{}", family)
}

/// Storage for small JSON preference values that survive restarts
pub trait PreferenceStore: Send + Sync {
    /// Load the raw JSON stored under `key`
    fn load(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Store raw JSON under `key`, replacing any previous value
    fn save(&self, key: &str, value: &str) -> anyhow::Result<()>;

    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// Process-local preferences, used when nothing durable is configured
#[derive(Debug, Default)]
pub struct InMemoryPreferences {
    values: RwLock<AHashMap<String, String>>,
}

impl InMemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for InMemoryPreferences {
    fn load(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.values.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_round_trip() {
        let prefs = InMemoryPreferences::new();
        assert_eq!(prefs.load("a").unwrap(), None);
        prefs.save("a", "[1,2]").unwrap();
        assert_eq!(prefs.load("a").unwrap().as_deref(), Some("[1,2]"));
        prefs.remove("a").unwrap();
        assert_eq!(prefs.load("a").unwrap(), None);
    }

    #[test]
    fn test_classification_key() {
        assert_eq!(classification_key("atl08_class"), "colors.atl08_class");
    }
}
