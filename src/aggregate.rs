use serde::{Deserialize, Serialize};

/// Summary statistics over one sample's classifier scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub mean: f64,
    pub median: f64,
    pub p90: f64,
    /// Number of scores the statistics were computed from.
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregateError {
    #[error("cannot aggregate an empty sample")]
    EmptySample,
}

/// Index of the 90th percentile in an ascending vector of `count` scores:
/// `ceil(0.9 * count) - 1`, clamped to `[0, count - 1]`.
pub fn p90_index(count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    (9 * count).div_ceil(10).saturating_sub(1).min(count - 1)
}

/// Compute mean, median and 90th percentile of `scores`.
///
/// Callers are expected to skip entities that produced no content before
/// classification; an empty vector is an error, never a zero aggregate.
pub fn aggregate(scores: &[f64]) -> Result<Aggregate, AggregateError> {
    if scores.is_empty() {
        return Err(AggregateError::EmptySample);
    }

    let count = scores.len();
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mean = sorted.iter().sum::<f64>() / count as f64;
    let median = if count % 2 == 1 {
        sorted[count / 2]
    } else {
        (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
    };
    let p90 = sorted[p90_index(count)];

    Ok(Aggregate {
        mean,
        median,
        p90,
        count,
    })
}
