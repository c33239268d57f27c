use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier request failed: {0}")]
    Network(String),
    #[error("classifier request timed out")]
    Timeout,
    #[error("classifier returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unusable classifier response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ClassifierError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClassifierError::Timeout
        } else {
            ClassifierError::Network(err.to_string())
        }
    }
}

/// Anything that can turn one text item into a fraud probability.
#[async_trait]
pub trait Scorer: Send + Sync {
    /// Score `text`; `source_url` is passed through to the classifier as an
    /// advisory field when the item came from a web page.
    async fn score(&self, text: &str, source_url: Option<&str>) -> Result<f64, ClassifierError>;
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
}

/// HTTP client for the external text classifier.
#[derive(Debug, Clone)]
pub struct ClassifierClient {
    client: Client,
    endpoint: Url,
}

impl ClassifierClient {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("Invalid classifier endpoint: {endpoint}"))?;
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fraud-scout/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build classifier HTTP client")?;

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Scorer for ClassifierClient {
    async fn score(&self, text: &str, source_url: Option<&str>) -> Result<f64, ClassifierError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&ScoreRequest {
                text,
                url: source_url,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ClassifierError::Parse(e.to_string()))?;
        parse_score_response(&body)
    }
}

/// Extract a probability from any of the response shapes classifiers in the
/// wild return. Probed in order: `prob_fraud`, `score`, `prob.fraud`,
/// `probability`, then `label_bin` as 1.0/0.0. Values are clamped to [0, 1].
pub fn parse_score_response(body: &Value) -> Result<f64, ClassifierError> {
    let probability = body
        .get("prob_fraud")
        .and_then(Value::as_f64)
        .or_else(|| body.get("score").and_then(Value::as_f64))
        .or_else(|| body.pointer("/prob/fraud").and_then(Value::as_f64))
        .or_else(|| body.get("probability").and_then(Value::as_f64));

    if let Some(p) = probability {
        if !p.is_finite() {
            return Err(ClassifierError::Parse(format!("non-finite score {p}")));
        }
        return Ok(p.clamp(0.0, 1.0));
    }

    match body.get("label_bin") {
        Some(Value::Number(n)) => match n.as_f64() {
            Some(bin) => Ok(if bin != 0.0 { 1.0 } else { 0.0 }),
            None => Err(ClassifierError::Parse(format!("bad label_bin {n}"))),
        },
        Some(Value::Bool(b)) => Ok(if *b { 1.0 } else { 0.0 }),
        _ => Err(ClassifierError::Parse(format!(
            "no score field in response: {}",
            truncate(&body.to_string(), 200)
        ))),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_prob_fraud_shape() {
        let body = json!({"label_pred": 1, "prob_fraud": 0.87});
        assert_eq!(parse_score_response(&body).unwrap(), 0.87);
    }

    #[test]
    fn test_score_shape() {
        let body = json!({"label": "spam", "score": 0.42});
        assert_eq!(parse_score_response(&body).unwrap(), 0.42);
    }

    #[test]
    fn test_label_bin_fallback() {
        assert_eq!(
            parse_score_response(&json!({"label": "fraud", "label_bin": 1})).unwrap(),
            1.0
        );
        assert_eq!(
            parse_score_response(&json!({"label": "normal", "label_bin": 0})).unwrap(),
            0.0
        );
    }

    #[test]
    fn test_priority_order() {
        let body = json!({"score": 0.1, "prob_fraud": 0.9, "label_bin": 0});
        assert_eq!(parse_score_response(&body).unwrap(), 0.9);

        let body = json!({"score": 0.3, "label_bin": 1});
        assert_eq!(parse_score_response(&body).unwrap(), 0.3);
    }

    #[test]
    fn test_nested_and_legacy_probability_keys() {
        assert_eq!(
            parse_score_response(&json!({"prob": {"fraud": 0.66}})).unwrap(),
            0.66
        );
        assert_eq!(
            parse_score_response(&json!({"probability": 0.25})).unwrap(),
            0.25
        );
    }

    #[test]
    fn test_out_of_range_is_clamped() {
        assert_eq!(parse_score_response(&json!({"score": 1.7})).unwrap(), 1.0);
        assert_eq!(parse_score_response(&json!({"score": -0.2})).unwrap(), 0.0);
    }

    #[test]
    fn test_unrecognised_shape_is_error() {
        assert!(matches!(
            parse_score_response(&json!({"label": "spam"})),
            Err(ClassifierError::Parse(_))
        ));
        assert!(matches!(
            parse_score_response(&json!({"prob_fraud": "high"})),
            Err(ClassifierError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_client_posts_text_and_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .and(body_json(json!({"text": "win money now", "url": "https://scam.example/"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"score": 0.93})))
            .mount(&server)
            .await;

        let client = ClassifierClient::new(
            &format!("{}/predict", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();
        let score = client
            .score("win money now", Some("https://scam.example/"))
            .await
            .unwrap();
        assert_eq!(score, 0.93);
    }

    #[tokio::test]
    async fn test_client_omits_url_for_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .and(body_json(json!({"text": "hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"prob_fraud": 0.05})))
            .mount(&server)
            .await;

        let client = ClassifierClient::new(
            &format!("{}/predict", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.score("hello", None).await.unwrap(), 0.05);
    }

    #[tokio::test]
    async fn test_client_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = ClassifierClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        match client.score("anything", None).await {
            Err(ClassifierError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"score": 0.5}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client = ClassifierClient::new(&server.uri(), Duration::from_millis(200)).unwrap();
        assert!(matches!(
            client.score("slow", None).await,
            Err(ClassifierError::Timeout)
        ));
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        assert!(ClassifierClient::new("not a url", Duration::from_secs(1)).is_err());
    }
}
