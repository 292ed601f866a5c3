use parking_lot::RwLock;
use std::collections::HashMap;

use crate::core::{Measurement, MeasurementKey};

/// Most recent value received for each key, independent of frame publication
#[derive(Debug, Default)]
pub struct LatestMeasurements {
    values: RwLock<HashMap<MeasurementKey, Measurement>>,
}

impl LatestMeasurements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps `measurement` unless a newer timestamp is already stored for its key
    pub fn update(&self, measurement: &Measurement) {
        let mut values = self.values.write();
        match values.get(&measurement.key) {
            Some(existing) if existing.timestamp > measurement.timestamp => {}
            _ => {
                values.insert(measurement.key.clone(), measurement.clone());
            }
        }
    }

    pub fn get(&self, key: &MeasurementKey) -> Option<Measurement> {
        self.values.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// Values ordered by key
    pub fn snapshot(&self) -> Vec<Measurement> {
        let mut values: Vec<Measurement> = self.values.read().values().cloned().collect();
        values.sort_by(|a, b| a.key.cmp(&b.key));
        values
    }

    pub fn clear(&self) {
        self.values.write().clear();
    }
}
