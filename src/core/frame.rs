use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::{DownsamplingMethod, Measurement, MeasurementFilter, MeasurementKey, Ticks};

/// Result of offering a measurement to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Measurement now occupies (or contributes to) its slot. `displaced` is set when an
    /// earlier candidate for the same key was dropped or folded into an aggregate.
    Accepted { displaced: bool },
    /// An existing candidate was the better choice; the incoming one was down-sampled away
    Superseded,
    /// Frame already published, nothing can be added
    Published,
}

#[derive(Default)]
struct Slots {
    measurements: HashMap<MeasurementKey, Measurement>,
    candidates: HashMap<MeasurementKey, Vec<Measurement>>,
    last_sorted: Option<Measurement>,
}

/// Time bucket holding the best-available value of every signal for one aligned timestamp
pub struct Frame {
    timestamp: Ticks,
    created: Ticks,
    method: DownsamplingMethod,
    filter: Option<Arc<dyn MeasurementFilter>>,
    // Merges hold the read side, publication takes the write side
    gate: RwLock<bool>,
    published: AtomicBool,
    slots: Mutex<Slots>,
    downsampled: AtomicU64,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("timestamp", &self.timestamp)
            .field("created", &self.created)
            .field("method", &self.method)
            .field("published", &self.is_published())
            .field("sorted", &self.sorted_count())
            .finish()
    }
}

impl Frame {
    pub fn new(timestamp: Ticks, created: Ticks, method: DownsamplingMethod) -> Self {
        Self {
            timestamp,
            created,
            method,
            filter: None,
            gate: RwLock::new(false),
            published: AtomicBool::new(false),
            slots: Mutex::new(Slots::default()),
            downsampled: AtomicU64::new(0),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn MeasurementFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn timestamp(&self) -> Ticks {
        self.timestamp
    }

    /// Wall time at which the frame was created
    pub fn created(&self) -> Ticks {
        self.created
    }

    pub fn method(&self) -> DownsamplingMethod {
        self.method
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// Number of distinct keys holding a value
    pub fn sorted_count(&self) -> usize {
        let slots = self.slots.lock();
        match self.method {
            DownsamplingMethod::Filtered if !self.is_published() => slots.candidates.len(),
            _ => slots.measurements.len(),
        }
    }

    /// Candidates dropped or folded by down-sampling so far
    pub fn downsampled_count(&self) -> u64 {
        self.downsampled.load(Ordering::Relaxed)
    }

    pub fn last_sorted_measurement(&self) -> Option<Measurement> {
        self.slots.lock().last_sorted.clone()
    }

    /// Offer a measurement to this frame using the configured down-sampling policy
    pub fn merge(&self, incoming: &Measurement) -> MergeOutcome {
        let gate = self.gate.read();
        if *gate {
            return MergeOutcome::Published;
        }

        let mut slots = self.slots.lock();

        let outcome = match self.method {
            DownsamplingMethod::Filtered => {
                let candidates = slots.candidates.entry(incoming.key.clone()).or_default();
                let displaced = !candidates.is_empty();
                candidates.push(incoming.clone());
                MergeOutcome::Accepted { displaced }
            }
            method => {
                let replaces = slots
                    .measurements
                    .get(&incoming.key)
                    .map(|existing| self.replaces(method, existing, incoming));

                match replaces {
                    None => {
                        slots.measurements.insert(incoming.key.clone(), incoming.clone());
                        MergeOutcome::Accepted { displaced: false }
                    }
                    Some(true) => {
                        slots.measurements.insert(incoming.key.clone(), incoming.clone());
                        MergeOutcome::Accepted { displaced: true }
                    }
                    Some(false) => MergeOutcome::Superseded,
                }
            }
        };

        match outcome {
            MergeOutcome::Accepted { displaced } => {
                slots.last_sorted = Some(incoming.clone());
                if displaced {
                    self.downsampled.fetch_add(1, Ordering::Relaxed);
                }
            }
            MergeOutcome::Superseded => {
                self.downsampled.fetch_add(1, Ordering::Relaxed);
            }
            MergeOutcome::Published => {}
        }

        drop(slots);
        drop(gate);
        outcome
    }

    fn replaces(&self, method: DownsamplingMethod, existing: &Measurement, incoming: &Measurement) -> bool {
        match method {
            DownsamplingMethod::LastReceived | DownsamplingMethod::Filtered => true,
            DownsamplingMethod::Closest => self.distance(incoming) < self.distance(existing),
            DownsamplingMethod::BestQuality => {
                let incoming_good = incoming.flags.has_good_quality();
                let existing_good = existing.flags.has_good_quality();

                if incoming_good != existing_good {
                    incoming_good
                } else {
                    self.distance(incoming) < self.distance(existing)
                }
            }
        }
    }

    fn distance(&self, measurement: &Measurement) -> u64 {
        (measurement.timestamp.value() - self.timestamp.value()).unsigned_abs()
    }

    /// One-shot transition to published. Returns false if the frame was already published.
    ///
    /// Taking the exclusive side of the gate waits for in-flight merges to finish, so nothing
    /// lands after this returns. Filtered frames collapse their candidates here; without a
    /// filter the last received candidate per key is kept.
    pub fn mark_published(&self) -> bool {
        let mut gate = self.gate.write();
        if *gate {
            return false;
        }

        if self.method == DownsamplingMethod::Filtered {
            let mut slots = self.slots.lock();
            let candidates = std::mem::take(&mut slots.candidates);

            for (key, values) in candidates {
                let aggregate = match &self.filter {
                    Some(filter) => filter.aggregate(&values, self.timestamp),
                    None => values.last().cloned(),
                };

                if let Some(measurement) = aggregate {
                    slots.measurements.insert(key, measurement);
                }
            }
        }

        *gate = true;
        self.published.store(true, Ordering::Release);
        true
    }

    pub fn measurement(&self, key: &MeasurementKey) -> Option<Measurement> {
        self.slots.lock().measurements.get(key).cloned()
    }

    /// Snapshot of the slot values ordered by key
    pub fn measurements(&self) -> Vec<Measurement> {
        let slots = self.slots.lock();
        let mut values: Vec<Measurement> = slots.measurements.values().cloned().collect();
        values.sort_by(|a, b| a.key.cmp(&b.key));
        values
    }

    /// Owned copy suitable for handing across threads or channels
    pub fn to_published(&self, index: usize) -> PublishedFrame {
        PublishedFrame {
            timestamp: self.timestamp,
            index,
            measurements: self.measurements(),
            downsampled: self.downsampled_count(),
        }
    }
}

/// Owned snapshot of a published frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedFrame {
    pub timestamp: Ticks,
    /// Position of the frame within its second
    pub index: usize,
    pub measurements: Vec<Measurement>,
    pub downsampled: u64,
}

impl PublishedFrame {
    pub fn get(&self, key: &MeasurementKey) -> Option<&Measurement> {
        self.measurements.iter().find(|m| &m.key == key)
    }
}
