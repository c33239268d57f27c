use crate::entity::SourceKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for any configured spacing between outbound calls.
const MAX_SPACING_SECS: f64 = 3600.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_classifier_endpoint")]
    pub classifier_endpoint: String,
    #[serde(default = "default_classifier_timeout_secs")]
    pub classifier_timeout_secs: u64,
    /// Seconds between two classifier calls.
    #[serde(default = "default_classifier_spacing")]
    pub classifier_spacing: f64,
    /// Maximum number of text items scored per entity.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    /// Maximum number of raw items requested from the source per entity.
    #[serde(default = "default_sample_size")]
    pub max_items_per_entity: usize,
    #[serde(default = "default_suspicion_threshold")]
    pub suspicion_threshold: f64,
    /// Seconds between two calls to the content provider.
    #[serde(default = "default_min_request_spacing")]
    pub min_request_spacing: f64,
    /// Seconds an evaluated entity is left alone before it is checked again.
    #[serde(default = "default_recheck_cool_down")]
    pub recheck_cool_down: u64,
    #[serde(default = "default_true")]
    pub join_before_sample: bool,
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    /// Longest cool-down, in seconds, honoured when a provider throttles us.
    #[serde(default = "default_max_rate_limit_wait")]
    pub max_rate_limit_wait: u64,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_max_snippet_length")]
    pub max_snippet_length: usize,
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
    #[serde(default = "default_source")]
    pub source: SourceKind,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Candidates taken from each keyword search.
    #[serde(default = "default_limit_per_query")]
    pub limit_per_query: usize,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Characters kept per extracted text block.
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
    #[serde(default)]
    pub seeds_file: Option<String>,
}

fn default_classifier_endpoint() -> String {
    "http://127.0.0.1:8000/predict".to_string()
}

fn default_classifier_timeout_secs() -> u64 {
    10
}

fn default_classifier_spacing() -> f64 {
    0.1
}

fn default_sample_size() -> usize {
    200
}

fn default_suspicion_threshold() -> f64 {
    0.6
}

fn default_min_request_spacing() -> f64 {
    1.0
}

fn default_recheck_cool_down() -> u64 {
    24 * 60 * 60
}

fn default_true() -> bool {
    true
}

fn default_max_rate_limit_retries() -> u32 {
    3
}

fn default_max_rate_limit_wait() -> u64 {
    15 * 60
}

fn default_database_path() -> String {
    "suspicious.db".to_string()
}

fn default_max_snippet_length() -> usize {
    2000
}

fn default_keywords() -> Vec<String> {
    [
        "goa",
        "escorts",
        "gambling",
        "loan offer",
        "work from home",
        "job offer",
        "dating",
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
}

fn default_source() -> SourceKind {
    SourceKind::Messaging
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:8200/".to_string()
}

fn default_limit_per_query() -> usize {
    20
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_user_agent() -> String {
    concat!("fraud-scout/", env!("CARGO_PKG_VERSION"), " (+contact: abuse desk)").to_string()
}

fn default_max_text_length() -> usize {
    20000
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            limit_per_query: default_limit_per_query(),
            api_token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            max_text_length: default_max_text_length(),
            seeds_file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            classifier_endpoint: default_classifier_endpoint(),
            classifier_timeout_secs: default_classifier_timeout_secs(),
            classifier_spacing: default_classifier_spacing(),
            sample_size: default_sample_size(),
            max_items_per_entity: default_sample_size(),
            suspicion_threshold: default_suspicion_threshold(),
            min_request_spacing: default_min_request_spacing(),
            recheck_cool_down: default_recheck_cool_down(),
            join_before_sample: true,
            max_rate_limit_retries: default_max_rate_limit_retries(),
            max_rate_limit_wait: default_max_rate_limit_wait(),
            database_path: default_database_path(),
            max_snippet_length: default_max_snippet_length(),
            keywords: default_keywords(),
            source: default_source(),
            messaging: MessagingConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.suspicion_threshold) {
            anyhow::bail!(
                "suspicion_threshold must be within [0, 1], got {}",
                self.suspicion_threshold
            );
        }
        if self.sample_size == 0 {
            anyhow::bail!("sample_size must be greater than 0");
        }
        if self.max_items_per_entity == 0 {
            anyhow::bail!("max_items_per_entity must be greater than 0");
        }
        for (name, value) in [
            ("min_request_spacing", self.min_request_spacing),
            ("classifier_spacing", self.classifier_spacing),
        ] {
            if !value.is_finite() || !(0.0..=MAX_SPACING_SECS).contains(&value) {
                anyhow::bail!(
                    "{name} must be between 0 and {MAX_SPACING_SECS} seconds, got {value}"
                );
            }
        }
        if self.max_rate_limit_wait == 0 {
            anyhow::bail!("max_rate_limit_wait must be greater than 0");
        }
        url::Url::parse(&self.classifier_endpoint).map_err(|e| {
            anyhow::anyhow!("invalid classifier_endpoint '{}': {e}", self.classifier_endpoint)
        })?;
        if self.source == SourceKind::Messaging {
            url::Url::parse(&self.messaging.gateway_url).map_err(|e| {
                anyhow::anyhow!("invalid messaging.gateway_url '{}': {e}", self.messaging.gateway_url)
            })?;
        }
        Ok(())
    }

    pub fn recheck_cool_down(&self) -> Duration {
        Duration::from_secs(self.recheck_cool_down)
    }

    pub fn min_request_spacing(&self) -> Duration {
        spacing(self.min_request_spacing)
    }

    pub fn classifier_spacing(&self) -> Duration {
        spacing(self.classifier_spacing)
    }

    pub fn max_rate_limit_wait(&self) -> Duration {
        Duration::from_secs(self.max_rate_limit_wait)
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_secs(self.classifier_timeout_secs)
    }
}

fn spacing(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.clamp(0.0, MAX_SPACING_SECS)).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sample_size, 200);
        assert_eq!(config.suspicion_threshold, 0.6);
        assert_eq!(config.min_request_spacing(), Duration::from_secs(1));
        assert_eq!(config.recheck_cool_down(), Duration::from_secs(86400));
        assert!(config.join_before_sample);
        assert_eq!(config.keywords.len(), 7);
        assert_eq!(config.max_rate_limit_wait(), Duration::from_secs(900));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
classifier_endpoint: "http://classifier.internal:8100/predict"
suspicion_threshold: 0.75
source: web
web:
  seeds_file: baseurl.txt
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.classifier_endpoint, "http://classifier.internal:8100/predict");
        assert_eq!(config.suspicion_threshold, 0.75);
        assert_eq!(config.source, SourceKind::Web);
        assert_eq!(config.web.seeds_file.as_deref(), Some("baseurl.txt"));
        assert_eq!(config.web.max_text_length, 20000);
        assert_eq!(config.sample_size, 200);
        assert_eq!(config.messaging.limit_per_query, 20);
    }

    #[test]
    fn test_round_trip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scout.yaml");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.keywords = vec!["lottery".to_string()];
        config.recheck_cool_down = 3600;
        config.to_file(path).unwrap();

        let loaded = Config::from_file(path).unwrap();
        assert_eq!(loaded.keywords, vec!["lottery"]);
        assert_eq!(loaded.recheck_cool_down(), Duration::from_secs(3600));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.suspicion_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sample_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.min_request_spacing = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.classifier_endpoint = "localhost predict".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_rate_limit_wait = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_spacing_rejected_and_bounded() {
        let mut config = Config::default();
        config.min_request_spacing = 1e30;
        config.classifier_spacing = f64::NAN;
        assert!(config.validate().is_err());
        assert_eq!(config.min_request_spacing(), Duration::from_secs(3600));
        assert_eq!(config.classifier_spacing(), Duration::ZERO);

        let mut config = Config::default();
        config.classifier_spacing = 7200.0;
        assert!(config.validate().is_err());
    }
}
