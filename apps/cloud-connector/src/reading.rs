use crate::ordered::OrderedEntries;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One device's named measurements taken at one instant, in the order the
/// device produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    values: Vec<(String, f64)>,
}

impl Reading {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name`, replacing an earlier value in place.
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        match self.values.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drops NaN and infinite values, returning the names that were removed.
    pub fn retain_finite(&mut self) -> Vec<String> {
        let mut dropped = Vec::new();
        self.values.retain(|(name, value)| {
            if value.is_finite() {
                true
            } else {
                dropped.push(name.clone());
                false
            }
        });
        dropped
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for Reading {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        let mut reading = Reading::new();
        for (name, value) in iter {
            reading.insert(name, value);
        }
        reading
    }
}

impl Serialize for Reading {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Reading {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries = OrderedEntries::<f64>::deserialize(deserializer)?;
        Ok(entries.into_inner().into_iter().collect())
    }
}
