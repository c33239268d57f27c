use crate::aggregate::Aggregate;
use serde::{Deserialize, Serialize};

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub flagged: bool,
    /// Rendering of the values that triggered the flag; empty when clean.
    pub reason: String,
}

impl Verdict {
    pub fn clean() -> Self {
        Self {
            flagged: false,
            reason: String::new(),
        }
    }
}

/// Flag the entity when either the mean or the 90th percentile reaches
/// `threshold`.
pub fn decide(aggregate: &Aggregate, threshold: f64) -> Verdict {
    if aggregate.mean >= threshold || aggregate.p90 >= threshold {
        Verdict {
            flagged: true,
            reason: render_reason(aggregate),
        }
    } else {
        Verdict::clean()
    }
}

pub fn render_reason(aggregate: &Aggregate) -> String {
    format!("avg:{:.3} pct90:{:.3}", aggregate.mean, aggregate.p90)
}
