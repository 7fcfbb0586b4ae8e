use serde::Serialize;
use tracing::warn;

/// Names picked from one selector, in the order they were first chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SelectionSet {
    names: Vec<String>,
}

impl SelectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `incoming` into the set. Names already present keep their position.
    pub fn add<I, S>(&mut self, incoming: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in incoming {
            let name = name.into();
            if !self.contains(&name) {
                self.names.push(name);
            }
        }
    }

    /// Union a raw selector event payload into the set.
    ///
    /// Anything other than a JSON array is treated as an empty selection, and
    /// non-string elements are skipped. Returns how many names were added.
    pub fn add_payload(&mut self, payload: &serde_json::Value) -> usize {
        let before = self.names.len();
        match payload.as_array() {
            Some(values) => {
                let names = values.iter().filter_map(|v| match v.as_str() {
                    Some(name) => Some(name.to_string()),
                    None => {
                        warn!("Ignoring non-string selection value: {}", v);
                        None
                    }
                });
                self.add(names);
            }
            None => warn!("Ignoring selection payload that is not an array: {}", payload),
        }
        self.names.len() - before
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn join(&self, separator: &str) -> String {
        self.names.join(separator)
    }
}

impl<S: Into<String>> FromIterator<S> for SelectionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = SelectionSet::new();
        set.add(iter);
        set
    }
}
