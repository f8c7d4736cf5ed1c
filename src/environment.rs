use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::process::Command;

/// Environment overrides applied on top of the harness's own environment
/// when a component is launched.
///
/// Ordered so that rendered specs and log lines are stable between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Sets an override, replacing any earlier value for the same name.
    ///
    /// # Arguments
    /// * `key` - The environment variable name
    /// * `value` - The value the component will see
    ///
    /// # Examples
    /// ```
    /// use cellharness::environment::Environment;
    ///
    /// let mut env = Environment::new();
    /// env.set("CELL_ID", "cell-a");
    /// assert_eq!(env.get("CELL_ID").map(String::as_str), Some("cell-a"));
    /// ```
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Gets the override for a variable.
    ///
    /// # Arguments
    /// * `key` - The environment variable name to look up
    ///
    /// # Returns
    /// * `Some(&String)` - The overriding value
    /// * `None` - The component inherits the harness's value, if any
    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    /// Returns a copy with every value passed through `render`.
    ///
    /// # Arguments
    /// * `render` - Maps a raw template value to its final form
    pub fn map_values(&self, mut render: impl FnMut(&str) -> String) -> Self {
        Self(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), render(v)))
                .collect(),
        )
    }

    /// Applies the overrides to a command. The inherited environment is kept.
    pub fn apply_to(&self, command: &mut Command) {
        for (key, value) in &self.0 {
            command.env(key, value);
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
