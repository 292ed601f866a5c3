use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Measurement, MeasurementFlags, Ticks};

/// Policy for selecting one representative value per signal per frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DownsamplingMethod {
    /// Latest arrival wins
    #[default]
    LastReceived,
    /// Candidate nearest the frame timestamp wins
    Closest,
    /// All candidates are aggregated by a filter when the frame is published
    Filtered,
    /// Good-quality candidates win over bad ones, then nearest the frame timestamp
    BestQuality,
}

impl fmt::Display for DownsamplingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LastReceived => "LastReceived",
            Self::Closest => "Closest",
            Self::Filtered => "Filtered",
            Self::BestQuality => "BestQuality",
        };
        f.write_str(name)
    }
}

/// Aggregates every candidate received for one key into the published value
pub trait MeasurementFilter: Send + Sync {
    /// `candidates` is never empty and is in arrival order
    fn aggregate(&self, candidates: &[Measurement], frame_timestamp: Ticks) -> Option<Measurement>;
}

impl<F> MeasurementFilter for F
where
    F: Fn(&[Measurement], Ticks) -> Option<Measurement> + Send + Sync,
{
    fn aggregate(&self, candidates: &[Measurement], frame_timestamp: Ticks) -> Option<Measurement> {
        self(candidates, frame_timestamp)
    }
}

/// Arithmetic mean of candidate values
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanFilter;

impl MeasurementFilter for MeanFilter {
    fn aggregate(&self, candidates: &[Measurement], frame_timestamp: Ticks) -> Option<Measurement> {
        let first = candidates.first()?;
        let sum: f64 = candidates.iter().map(|m| m.value).sum();
        let flags = candidates
            .iter()
            .fold(MeasurementFlags::NORMAL, |acc, m| acc | m.flags);

        Some(Measurement {
            key: first.key.clone(),
            timestamp: frame_timestamp,
            value: sum / candidates.len() as f64,
            flags,
            metadata: first.metadata.clone(),
        })
    }
}

/// Most frequent candidate value; ties go to the most recent arrival
#[derive(Debug, Default, Clone, Copy)]
pub struct MajorityFilter;

impl MeasurementFilter for MajorityFilter {
    fn aggregate(&self, candidates: &[Measurement], _frame_timestamp: Ticks) -> Option<Measurement> {
        let mut best: Option<(usize, usize)> = None;

        for (index, candidate) in candidates.iter().enumerate() {
            let votes = candidates
                .iter()
                .filter(|m| m.value.to_bits() == candidate.value.to_bits())
                .count();

            match best {
                Some((best_votes, _)) if votes < best_votes => {}
                _ => best = Some((votes, index)),
            }
        }

        best.map(|(_, index)| candidates[index].clone())
    }
}
