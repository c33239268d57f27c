use super::{check_status, SourceAdapter, SourceError};
use crate::entity::{Entity, SourceKind};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    chats: Vec<ChatInfo>,
}

#[derive(Debug, Deserialize)]
struct ChatInfo {
    username: Option<String>,
    title: Option<String>,
    id: Option<i64>,
    #[serde(default)]
    megagroup: bool,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<MessageInfo>,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    #[serde(default)]
    text: Option<Value>,
}

/// Messaging-platform channels reached through a JSON gateway that owns the
/// platform session.
///
/// Gateway contract:
/// - `GET  {base}/search?q=..&limit=..`          -> `{"chats": [...]}`
/// - `POST {base}/channels/{username}/join`      -> 2xx, or 409 if already joined
/// - `GET  {base}/channels/{username}/messages?limit=..` -> `{"messages": [...]}`
///
/// `429` responses carry the flood wait in `Retry-After` or `{"retry_after": n}`.
pub struct MessagingSource {
    client: Client,
    base: Url,
    limit_per_query: usize,
    api_token: Option<String>,
}

impl MessagingSource {
    pub fn new(
        gateway_url: &str,
        limit_per_query: usize,
        api_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut base = Url::parse(gateway_url)
            .with_context(|| format!("Invalid messaging gateway URL: {gateway_url}"))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("Messaging gateway URL cannot be a base: {gateway_url}");
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fraud-scout/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build gateway HTTP client")?;

        Ok(Self {
            client,
            base,
            limit_per_query,
            api_token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::Unavailable("gateway URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Public broadcast channels only: chats without a username cannot be
/// resolved later and megagroups are discussion groups, not channels.
fn parse_search_response(body: &str) -> Result<Vec<Entity>, SourceError> {
    let response: SearchResponse = serde_json::from_str(body)
        .map_err(|e| SourceError::Unavailable(format!("bad search response: {e}")))?;

    Ok(response
        .chats
        .into_iter()
        .filter(|chat| !chat.megagroup)
        .filter_map(|chat| {
            let username = chat.username.filter(|u| !u.trim().is_empty())?;
            let mut entity = Entity::new(username.trim(), SourceKind::Messaging);
            if let Some(title) = chat.title {
                entity = entity.with_title(title);
            }
            if let Some(id) = chat.id {
                entity = entity.with_provider_id(id);
            }
            Some(entity)
        })
        .collect())
}

/// Keep textual messages only; service messages and media without a caption
/// come back with a null or empty `text`.
fn parse_messages(body: &str, max_items: usize) -> Result<Vec<String>, SourceError> {
    let response: MessagesResponse = serde_json::from_str(body)
        .map_err(|e| SourceError::Unavailable(format!("bad messages response: {e}")))?;

    Ok(response
        .messages
        .into_iter()
        .filter_map(|m| match m.text {
            Some(Value::String(text)) if !text.trim().is_empty() => Some(text),
            _ => None,
        })
        .take(max_items)
        .collect())
}

#[async_trait]
impl SourceAdapter for MessagingSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Messaging
    }

    async fn discover(&self, query: &str) -> Result<Vec<Entity>, SourceError> {
        let mut url = self.endpoint(&["search"])?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("limit", &self.limit_per_query.to_string());

        let response = self.authorize(self.client.get(url)).send().await?;
        let response = check_status(response, "search").await?;
        let body = response.text().await?;

        let mut entities = parse_search_response(&body)?;
        entities.truncate(self.limit_per_query);
        log::debug!("Gateway search '{query}' returned {} channels", entities.len());
        Ok(entities)
    }

    async fn prepare(&self, entity: &Entity) -> Result<(), SourceError> {
        let url = self.endpoint(&["channels", entity.canonical_id(), "join"])?;
        let response = self.authorize(self.client.post(url)).send().await?;

        if response.status() == StatusCode::CONFLICT {
            log::debug!("Already a participant of {}", entity.canonical_id());
            return Ok(());
        }
        check_status(response, entity.canonical_id()).await?;
        log::info!("Joined {}", entity.canonical_id());
        Ok(())
    }

    async fn sample(&self, entity: &Entity, max_items: usize) -> Result<Vec<String>, SourceError> {
        let mut url = self.endpoint(&["channels", entity.canonical_id(), "messages"])?;
        url.query_pairs_mut()
            .append_pair("limit", &max_items.to_string());

        let response = self.authorize(self.client.get(url)).send().await?;
        let response = check_status(response, entity.canonical_id()).await?;
        let body = response.text().await?;
        parse_messages(&body, max_items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(server: &MockServer) -> MessagingSource {
        MessagingSource::new(
            &format!("{}/api", server.uri()),
            20,
            Some("secret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_search_filters_private_and_megagroups() {
        let body = json!({"chats": [
            {"username": "fastloans", "title": "Fast Loans", "id": 11, "megagroup": false},
            {"username": "loan_chat", "title": "Loan Chat", "id": 12, "megagroup": true},
            {"username": null, "title": "Private", "id": 13},
            {"username": "  ", "title": "Blank"},
            {"username": "jobs_goa", "id": 14}
        ]})
        .to_string();

        let entities = parse_search_response(&body).unwrap();
        let ids: Vec<_> = entities.iter().map(|e| e.canonical_id()).collect();
        assert_eq!(ids, vec!["fastloans", "jobs_goa"]);
        assert_eq!(entities[0].display_title.as_deref(), Some("Fast Loans"));
        assert_eq!(entities[0].provider_id, Some(11));
        assert_eq!(entities[1].display_title, None);
    }

    #[test]
    fn test_messages_skip_non_text() {
        let body = json!({"messages": [
            {"id": 1, "text": "Earn 5000 daily from home"},
            {"id": 2, "text": null},
            {"id": 3, "text": ""},
            {"id": 4},
            {"id": 5, "text": 17},
            {"id": 6, "text": "DM for details"}
        ]})
        .to_string();

        assert_eq!(
            parse_messages(&body, 10).unwrap(),
            vec!["Earn 5000 daily from home", "DM for details"]
        );
        assert_eq!(parse_messages(&body, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_body_is_unavailable() {
        assert!(matches!(
            parse_messages("<html>", 5),
            Err(SourceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_discover_sends_query_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/search"))
            .and(query_param("q", "loan offer"))
            .and(query_param("limit", "20"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"chats": [
                {"username": "loanoffer", "title": "Loan Offer", "id": 7}
            ]})))
            .mount(&server)
            .await;

        let entities = source(&server).discover("loan offer").await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].canonical_id(), "loanoffer");
    }

    #[tokio::test]
    async fn test_sample_rate_limited_with_flood_wait_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/channels/loanoffer/messages"))
            .respond_with(
                ResponseTemplate::new(429).set_body_json(json!({"retry_after": 30})),
            )
            .mount(&server)
            .await;

        let entity = Entity::new("loanoffer", SourceKind::Messaging);
        assert_eq!(
            source(&server).sample(&entity, 50).await,
            Err(SourceError::RateLimited {
                wait: Duration::from_secs(30)
            })
        );
    }

    #[tokio::test]
    async fn test_sample_rate_limited_with_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/channels/loanoffer/messages"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let entity = Entity::new("loanoffer", SourceKind::Messaging);
        assert_eq!(
            source(&server).sample(&entity, 50).await,
            Err(SourceError::RateLimited {
                wait: Duration::from_secs(7)
            })
        );
    }

    #[tokio::test]
    async fn test_sample_unknown_channel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/channels/ghost/messages"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let entity = Entity::new("ghost", SourceKind::Messaging);
        assert!(matches!(
            source(&server).sample(&entity, 50).await,
            Err(SourceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_sample_passes_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/channels/jobs/messages"))
            .and(query_param("limit", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"messages": [
                {"text": "a"}, {"text": "b"}, {"text": "c"}, {"text": "d"}
            ]})))
            .mount(&server)
            .await;

        let entity = Entity::new("jobs", SourceKind::Messaging);
        assert_eq!(
            source(&server).sample(&entity, 3).await.unwrap(),
            vec!["a", "b", "c"]
        );
    }

    #[tokio::test]
    async fn test_join_already_participant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/channels/jobs/join"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let entity = Entity::new("jobs", SourceKind::Messaging);
        assert!(source(&server).prepare(&entity).await.is_ok());
    }

    #[tokio::test]
    async fn test_join_forbidden() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/channels/jobs/join"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let entity = Entity::new("jobs", SourceKind::Messaging);
        assert!(matches!(
            source(&server).prepare(&entity).await,
            Err(SourceError::Unavailable(_))
        ));
    }
}
