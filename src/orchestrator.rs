use crate::aggregate::{aggregate, Aggregate};
use crate::classifier::Scorer;
use crate::config::Config;
use crate::entity::{Entity, SourceKind};
use crate::policy::{decide, Verdict};
use crate::rate_gate::RateGate;
use crate::source::{SourceAdapter, SourceError};
use crate::store::{DedupCache, ResultStore, SuspiciousRecord};
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The subset of configuration the evaluation loop reads.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub sample_size: usize,
    pub max_items_per_entity: usize,
    pub suspicion_threshold: f64,
    pub recheck_cool_down: Duration,
    pub join_before_sample: bool,
    pub max_rate_limit_retries: u32,
    pub max_snippet_length: usize,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            sample_size: config.sample_size,
            max_items_per_entity: config.max_items_per_entity,
            suspicion_threshold: config.suspicion_threshold,
            recheck_cool_down: config.recheck_cool_down(),
            join_before_sample: config.join_before_sample,
            max_rate_limit_retries: config.max_rate_limit_retries,
            max_snippet_length: config.max_snippet_length,
        }
    }
}

/// Scores, statistics and decision for one completed evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub aggregate: Aggregate,
    pub verdict: Verdict,
    /// Items that were scored 0.0 because the classifier call failed.
    pub classifier_failures: usize,
}

/// Terminal state of one entity within a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Checked recently enough that the cool-down still holds.
    SkippedCoolDown,
    /// Sampling produced no text; nothing is recorded so it is retried next run.
    SkippedNoContent,
    SkippedError(String),
    /// Run was cancelled mid-entity; partial work is discarded.
    Cancelled,
    Clean(Assessment),
    Flagged {
        assessment: Assessment,
        persisted: bool,
    },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::SkippedCoolDown => f.write_str("skipped (checked recently)"),
            Outcome::SkippedNoContent => f.write_str("skipped (no text content)"),
            Outcome::SkippedError(e) => write!(f, "skipped ({e})"),
            Outcome::Cancelled => f.write_str("cancelled"),
            Outcome::Clean(a) => write!(f, "clean {}", render_stats(&a.aggregate)),
            Outcome::Flagged {
                assessment,
                persisted,
            } => write!(
                f,
                "FLAGGED {} [{}]{}",
                render_stats(&assessment.aggregate),
                assessment.verdict.reason,
                if *persisted { "" } else { " (not stored)" }
            ),
        }
    }
}

fn render_stats(aggregate: &Aggregate) -> String {
    format!(
        "mean={:.3} median={:.3} p90={:.3} n={}",
        aggregate.mean, aggregate.median, aggregate.p90, aggregate.count
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub queries: usize,
    pub candidates: usize,
    pub duplicates: usize,
    pub skipped_cool_down: usize,
    pub skipped_no_content: usize,
    pub skipped_error: usize,
    pub clean: usize,
    pub flagged: usize,
    pub persistence_failures: usize,
    pub classifier_failures: usize,
    /// False when the run was cancelled before the worklist was exhausted.
    pub completed: bool,
}

impl RunSummary {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::SkippedCoolDown => self.skipped_cool_down += 1,
            Outcome::SkippedNoContent => self.skipped_no_content += 1,
            Outcome::SkippedError(_) => self.skipped_error += 1,
            Outcome::Cancelled => {}
            Outcome::Clean(assessment) => {
                self.clean += 1;
                self.classifier_failures += assessment.classifier_failures;
            }
            Outcome::Flagged {
                assessment,
                persisted,
            } => {
                self.flagged += 1;
                self.classifier_failures += assessment.classifier_failures;
                if !persisted {
                    self.persistence_failures += 1;
                }
            }
        }
    }

    pub fn evaluated(&self) -> usize {
        self.clean + self.flagged
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queries={} candidates={} duplicates={} evaluated={} flagged={} clean={} \
             skipped_recent={} skipped_empty={} skipped_error={} classifier_failures={} \
             persistence_failures={} completed={}",
            self.queries,
            self.candidates,
            self.duplicates,
            self.evaluated(),
            self.flagged,
            self.clean,
            self.skipped_cool_down,
            self.skipped_no_content,
            self.skipped_error,
            self.classifier_failures,
            self.persistence_failures,
            self.completed
        )
    }
}

/// Drives discovery and per-entity evaluation for one source.
///
/// Entities are evaluated one at a time in discovery order. Every outbound
/// provider call passes `provider_gate`, every classifier call passes
/// `classifier_gate`. Errors never escape an entity: they end it in one of
/// the skip outcomes and the loop moves on.
pub struct Orchestrator {
    source: Arc<dyn SourceAdapter>,
    scorer: Arc<dyn Scorer>,
    cache: Arc<dyn DedupCache>,
    results: Arc<dyn ResultStore>,
    provider_gate: RateGate,
    classifier_gate: RateGate,
    settings: PipelineSettings,
    cancelled: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn SourceAdapter>,
        scorer: Arc<dyn Scorer>,
        cache: Arc<dyn DedupCache>,
        results: Arc<dyn ResultStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            scorer,
            cache,
            results,
            provider_gate: RateGate::new(Duration::ZERO),
            classifier_gate: RateGate::new(Duration::ZERO),
            settings,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_gates(mut self, provider_gate: RateGate, classifier_gate: RateGate) -> Self {
        self.provider_gate = provider_gate;
        self.classifier_gate = classifier_gate;
        self
    }

    /// Flag that stops the run at the next entity boundary once set.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Evaluate every candidate of every query, in order.
    pub async fn run(&self, queries: &[String]) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut seen: HashSet<String> = HashSet::new();

        for query in queries {
            if self.is_cancelled() {
                log::warn!("Run cancelled before query '{query}'");
                return summary;
            }
            summary.queries += 1;

            log::info!("Searching {} source for: {query}", self.source.kind());
            let candidates = self.discover_with_retry(query).await;
            log::info!("Found {} candidates for '{query}'", candidates.len());

            for entity in candidates {
                if self.is_cancelled() {
                    log::warn!("Run cancelled, stopping before {entity}");
                    return summary;
                }
                summary.candidates += 1;

                if !seen.insert(entity.canonical_id().to_string()) {
                    log::debug!("{entity} already handled in this run");
                    summary.duplicates += 1;
                    continue;
                }

                let outcome = self.evaluate_entity(&entity).await;
                log::info!("{entity}: {outcome}");
                if outcome == Outcome::Cancelled {
                    return summary;
                }
                summary.record(&outcome);
            }
        }

        if summary.candidates == 0 {
            log::warn!("No candidates discovered for any of {} queries", queries.len());
        }
        summary.completed = true;
        summary
    }

    async fn discover_with_retry(&self, query: &str) -> Vec<Entity> {
        let mut retries = 0;
        loop {
            self.provider_gate.wait().await;
            match self.source.discover(query).await {
                Ok(entities) => return entities,
                Err(SourceError::RateLimited { wait })
                    if retries < self.settings.max_rate_limit_retries =>
                {
                    retries += 1;
                    log::warn!(
                        "Discovery for '{query}' rate limited, waiting {wait:?} (retry {retries}/{})",
                        self.settings.max_rate_limit_retries
                    );
                    self.provider_gate.pause(wait).await;
                }
                Err(e) => {
                    log::warn!("Discovery for '{query}' failed: {e}");
                    return Vec::new();
                }
            }
        }
    }

    /// Run one entity through the full evaluation pass.
    pub async fn evaluate_entity(&self, entity: &Entity) -> Outcome {
        let id = entity.canonical_id();

        match self
            .cache
            .should_evaluate(id, self.settings.recheck_cool_down)
        {
            Ok(true) => {}
            Ok(false) => return Outcome::SkippedCoolDown,
            Err(e) => {
                log::error!("Could not read check history for {entity}: {e}");
                return Outcome::SkippedError(format!("cache read failed: {e}"));
            }
        }

        if self.settings.join_before_sample {
            self.join(entity).await;
        }

        let texts = match self.sample_with_retry(entity).await {
            Ok(texts) => texts,
            Err(e) => return Outcome::SkippedError(e.to_string()),
        };
        let texts: Vec<String> = texts
            .into_iter()
            .filter(|t| !t.trim().is_empty())
            .take(self.settings.sample_size)
            .collect();
        if texts.is_empty() {
            return Outcome::SkippedNoContent;
        }

        log::info!("Classifying {} items from {entity}", texts.len());
        let Some((scores, classifier_failures)) = self.score_sample(entity, &texts).await else {
            return Outcome::Cancelled;
        };

        let aggregate = match aggregate(&scores) {
            Ok(aggregate) => aggregate,
            Err(e) => return Outcome::SkippedError(e.to_string()),
        };
        let verdict = decide(&aggregate, self.settings.suspicion_threshold);

        if let Err(e) = self.cache.record_check(id, aggregate.mean) {
            log::error!("Failed to record check for {entity}: {e}");
        }

        let assessment = Assessment {
            aggregate,
            verdict,
            classifier_failures,
        };
        if !assessment.verdict.flagged {
            return Outcome::Clean(assessment);
        }

        let record = SuspiciousRecord::new(
            entity,
            aggregate,
            assessment.verdict.reason.clone(),
            self.raw_metadata(entity, &assessment, &texts),
            Utc::now(),
        );
        let persisted = match self.results.append(&record) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to store suspicious record for {entity}: {e}");
                false
            }
        };

        Outcome::Flagged {
            assessment,
            persisted,
        }
    }

    async fn join(&self, entity: &Entity) {
        self.provider_gate.wait().await;
        match self.source.prepare(entity).await {
            Ok(()) => {}
            Err(SourceError::RateLimited { wait }) => {
                log::warn!("Join of {entity} rate limited, waiting {wait:?} then sampling anyway");
                self.provider_gate.pause(wait).await;
            }
            Err(e) => log::warn!("Join of {entity} failed, sampling anyway: {e}"),
        }
    }

    async fn sample_with_retry(&self, entity: &Entity) -> Result<Vec<String>, SourceError> {
        let mut retries = 0;
        loop {
            self.provider_gate.wait().await;
            match self
                .source
                .sample(entity, self.settings.max_items_per_entity)
                .await
            {
                Err(SourceError::RateLimited { wait }) => {
                    if retries >= self.settings.max_rate_limit_retries {
                        return Err(SourceError::Unavailable(format!(
                            "still rate limited after {retries} retries"
                        )));
                    }
                    retries += 1;
                    log::warn!(
                        "Sampling {entity} rate limited, pausing all calls for {wait:?} (retry {retries}/{})",
                        self.settings.max_rate_limit_retries
                    );
                    self.provider_gate.pause(wait).await;
                }
                other => return other,
            }
        }
    }

    /// Score every item, substituting 0.0 for items the classifier could not
    /// score. Returns `None` if the run was cancelled part way.
    async fn score_sample(&self, entity: &Entity, texts: &[String]) -> Option<(Vec<f64>, usize)> {
        let source_url = match entity.source_kind {
            SourceKind::Web => Some(entity.canonical_id()),
            SourceKind::Messaging => None,
        };

        let mut scores = Vec::with_capacity(texts.len());
        let mut failures = 0;
        for (index, text) in texts.iter().enumerate() {
            if self.is_cancelled() {
                return None;
            }
            self.classifier_gate.wait().await;
            match self.scorer.score(text, source_url).await {
                Ok(score) if score.is_finite() => scores.push(score.clamp(0.0, 1.0)),
                Ok(score) => {
                    log::warn!("Classifier returned {score} for item {index} of {entity}, using 0.0");
                    failures += 1;
                    scores.push(0.0);
                }
                Err(e) => {
                    log::warn!("Classifier failed for item {index} of {entity}, using 0.0: {e}");
                    failures += 1;
                    scores.push(0.0);
                }
            }
        }
        Some((scores, failures))
    }

    fn raw_metadata(
        &self,
        entity: &Entity,
        assessment: &Assessment,
        texts: &[String],
    ) -> serde_json::Value {
        let snippet: Option<String> = texts
            .first()
            .map(|t| t.chars().take(self.settings.max_snippet_length).collect());
        json!({
            "sample_count": assessment.aggregate.count,
            "avg_prob": assessment.aggregate.mean,
            "median_prob": assessment.aggregate.median,
            "pct90_prob": assessment.aggregate.p90,
            "title": entity.display_title,
            "source": entity.source_kind,
            "provider_id": entity.provider_id,
            "classifier_failures": assessment.classifier_failures,
            "snippet": snippet,
        })
    }
}
