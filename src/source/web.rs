use super::{check_status, SourceAdapter, SourceError};
use crate::entity::{Entity, SourceKind};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use url::Url;

/// Subtrees that never hold readable page content.
const HIDDEN_TAGS: &[&str] = &[
    "script", "style", "noscript", "header", "footer", "nav", "svg", "form", "iframe",
];

const BLOCK_TAGS: &[&str] = &[
    "p", "h1", "h2", "h3", "h4", "h5", "h6", "li", "td", "th", "blockquote", "pre",
];

/// Splits a page into visible text blocks.
pub struct TextExtractor {
    blocks: Selector,
    whitespace: Regex,
    max_text_length: usize,
}

impl TextExtractor {
    pub fn new(max_text_length: usize) -> anyhow::Result<Self> {
        let blocks = Selector::parse(&BLOCK_TAGS.join(", "))
            .map_err(|e| anyhow!("Invalid block selector: {e}"))?;
        Ok(Self {
            blocks,
            whitespace: Regex::new(r"\s+")?,
            max_text_length,
        })
    }

    /// One item per outermost visible text block. Pages built without any
    /// block markup fall back to their visible text nodes.
    pub fn extract(&self, html: &str, max_items: usize) -> Vec<String> {
        let document = Html::parse_document(html);

        let blocks: Vec<String> = document
            .select(&self.blocks)
            .filter(|el| !has_ancestor_in(el, HIDDEN_TAGS) && !has_ancestor_in(el, BLOCK_TAGS))
            .filter_map(|el| self.clean(&el.text().collect::<Vec<_>>().join(" ")))
            .take(max_items)
            .collect();
        if !blocks.is_empty() {
            return blocks;
        }

        document
            .root_element()
            .descendants()
            .filter_map(|node| {
                let text = node.value().as_text()?;
                let hidden = node
                    .ancestors()
                    .filter_map(ElementRef::wrap)
                    .any(|el| HIDDEN_TAGS.contains(&el.value().name()) || el.value().name() == "title");
                if hidden {
                    None
                } else {
                    self.clean(text)
                }
            })
            .take(max_items)
            .collect()
    }

    fn clean(&self, raw: &str) -> Option<String> {
        let collapsed = self.whitespace.replace_all(raw, " ");
        let trimmed = collapsed.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(match trimmed.char_indices().nth(self.max_text_length) {
            Some((idx, _)) => trimmed[..idx].to_string(),
            None => trimmed.to_string(),
        })
    }
}

fn has_ancestor_in(element: &ElementRef<'_>, tags: &[&str]) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|ancestor| tags.contains(&ancestor.value().name()))
}

/// Normalise a seed into a page identity: http(s) only, fragment dropped.
pub fn canonical_page_url(seed: &str) -> Result<Url, SourceError> {
    let mut url = Url::parse(seed.trim())
        .map_err(|e| SourceError::Unavailable(format!("invalid seed URL '{seed}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SourceError::Unavailable(format!(
            "unsupported scheme in seed URL '{seed}'"
        )));
    }
    url.set_fragment(None);
    Ok(url)
}

/// Read seed URLs, one per line; blank lines and `#` comments are skipped.
pub fn read_seed_file(path: &str) -> anyhow::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file: {path}"))?;
    Ok(parse_seed_lines(&content))
}

pub fn parse_seed_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Web pages named directly by seed URLs.
pub struct WebSource {
    client: Client,
    extractor: TextExtractor,
}

impl WebSource {
    pub fn new(user_agent: &str, timeout: Duration, max_text_length: usize) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("Failed to build web HTTP client")?;

        Ok(Self {
            client,
            extractor: TextExtractor::new(max_text_length)?,
        })
    }
}

#[async_trait]
impl SourceAdapter for WebSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Web
    }

    async fn discover(&self, query: &str) -> Result<Vec<Entity>, SourceError> {
        let url = canonical_page_url(query)?;
        Ok(vec![Entity::new(url.as_str(), SourceKind::Web)])
    }

    async fn sample(&self, entity: &Entity, max_items: usize) -> Result<Vec<String>, SourceError> {
        let response = self.client.get(entity.canonical_id()).send().await?;
        let response = check_status(response, entity.canonical_id()).await?;
        let html = response.text().await?;

        let items = self.extractor.extract(&html, max_items);
        log::debug!(
            "Extracted {} text blocks from {}",
            items.len(),
            entity.canonical_id()
        );
        Ok(items)
    }
}
