//! `web_search` and `web_fetch`.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Node, Selector};
use serde_json::{json, Value};

use super::search::{find_search_provider, format_hits, SearchBackend, SEARCH_PROVIDERS};
use super::{Tool, ToolError};
use crate::config::{self, Config};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_7_2) AppleWebKit/537.36";
const MAX_REDIRECTS: usize = 5;
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Web search over the configured providers: default first, then the rest in table order.
pub struct WebSearchTool {
    client: reqwest::Client,
    backends: Vec<SearchBackend>,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(backends: Vec<SearchBackend>, max_results: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            backends,
            max_results,
        }
    }

    /// Providers that are enabled and have what they need (key or base URL), in try order.
    pub fn from_config(config: &Config) -> Self {
        let search = &config.tools.web.search;
        let mut order: Vec<&str> = vec![search.default_provider.as_str()];
        for spec in SEARCH_PROVIDERS {
            if !order.contains(&spec.name) {
                order.push(spec.name);
            }
        }
        let backends = order
            .into_iter()
            .filter_map(|name| {
                let spec = find_search_provider(name)?;
                let cfg = search.providers.get(name)?;
                if !cfg.enabled {
                    return None;
                }
                let api_key = config::resolve_search_key(config, name);
                if spec.requires_api_key && api_key.is_none() {
                    return None;
                }
                let api_base = cfg.api_base.clone().filter(|b| !b.trim().is_empty());
                if spec.requires_api_base && api_base.is_none() {
                    return None;
                }
                Some(SearchBackend {
                    spec,
                    api_key,
                    api_base,
                })
            })
            .collect();
        Self::new(backends, search.max_results)
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns titles, URLs, and snippets."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "count": {"type": "integer", "description": "Results (1-10)", "minimum": 1, "maximum": 10}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let query = args["query"].as_str().unwrap_or_default().trim().to_string();
        if query.is_empty() {
            return Err(ToolError::InvalidArguments("query must not be empty".to_string()));
        }
        let count = args["count"]
            .as_u64()
            .map(|c| c as usize)
            .unwrap_or(self.max_results)
            .clamp(1, 10);

        let mut errors = Vec::new();
        for backend in &self.backends {
            match backend.search(&self.client, &query, count).await {
                Ok(hits) => return Ok(format_hits(&query, &hits)),
                Err(e) => {
                    log::debug!("web_search: {} failed: {}", backend.name(), e);
                    errors.push(format!("{}: {}", backend.name(), e));
                }
            }
        }
        if errors.is_empty() {
            Err(ToolError::Execution(format!(
                "no search provider available for query: {}",
                query
            )))
        } else {
            Err(ToolError::Execution(format!(
                "search failed for all providers:\n{}",
                errors.join("\n")
            )))
        }
    }
}

/// Fetch a URL and extract readable text. The result is a JSON envelope
/// `{url, finalUrl, status, extractor, truncated, length, text}`.
pub struct WebFetchTool {
    client: reqwest::Client,
    max_chars: usize,
}

impl WebFetchTool {
    pub fn new(max_chars: usize) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(FETCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client, max_chars }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch URL and extract readable content (HTML to markdown/text)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "URL to fetch"},
                "extractMode": {"type": "string", "enum": ["markdown", "text"], "default": "markdown"},
                "maxChars": {"type": "integer", "minimum": 100}
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let url = args["url"].as_str().unwrap_or_default().trim().to_string();
        validate_url(&url).map_err(|e| {
            ToolError::InvalidArguments(format!("url validation failed: {}", e))
        })?;
        let markdown = args["extractMode"].as_str() != Some("text");
        let max_chars = args["maxChars"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(self.max_chars);

        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            return Err(ToolError::Execution(format!("http {} for {}", status, url)));
        }
        let final_url = res.url().to_string();
        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();
        let body = res
            .text()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        let (text, extractor) = extract(&body, &content_type, markdown);
        let (text, truncated) = truncate_chars(text, max_chars);
        Ok(json!({
            "url": url,
            "finalUrl": final_url,
            "status": status.as_u16(),
            "extractor": extractor,
            "truncated": truncated,
            "length": text.chars().count(),
            "text": text,
        })
        .to_string())
    }
}

fn validate_url(url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| e.to_string())?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(format!("only http/https allowed, got '{}'", parsed.scheme()));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err("missing domain".to_string());
    }
    Ok(())
}

fn truncate_chars(text: String, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => (text[..idx].to_string(), true),
        None => (text, false),
    }
}

/// (text, extractor name) by content type: pretty JSON, HTML extraction, or raw body.
fn extract(body: &str, content_type: &str, markdown: bool) -> (String, &'static str) {
    if content_type.contains("application/json") {
        if let Ok(v) = serde_json::from_str::<Value>(body) {
            return (
                serde_json::to_string_pretty(&v).unwrap_or_else(|_| body.to_string()),
                "json",
            );
        }
    }
    let head: String = body.chars().take(256).collect::<String>().to_lowercase();
    if content_type.contains("text/html")
        || head.trim_start().starts_with("<!doctype")
        || head.trim_start().starts_with("<html")
    {
        return (html_to_text(body, markdown), "html");
    }
    (body.to_string(), "raw")
}

/// Title plus body text. In markdown mode headings, links and list items keep their markup.
fn html_to_text(html: &str, markdown: bool) -> String {
    let doc = Html::parse_document(html);
    let title = Selector::parse("title")
        .ok()
        .and_then(|sel| doc.select(&sel).next())
        .map(|t| collapse_ws(&t.text().collect::<String>()))
        .filter(|t| !t.is_empty());
    let root = Selector::parse("body")
        .ok()
        .and_then(|sel| doc.select(&sel).next())
        .unwrap_or_else(|| doc.root_element());

    let mut out = String::new();
    render(root, markdown, &mut out);
    let content = normalize(&out);
    match title {
        Some(t) => format!("# {}\n\n{}", t, content),
        None => content,
    }
}

fn render(el: ElementRef<'_>, markdown: bool, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(t) => out.push_str(&collapse_ws(t)),
            Node::Element(e) => {
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                let tag = e.name();
                match tag {
                    "script" | "style" | "noscript" | "template" | "svg" | "head" => {}
                    "br" | "hr" => out.push('\n'),
                    "h1" | "h2" | "h3" | "h4" | "h5" | "h6" if markdown => {
                        let level: usize = tag[1..].parse().unwrap_or(1);
                        let text = collapse_ws(&child_el.text().collect::<String>());
                        out.push_str(&format!("\n{} {}\n", "#".repeat(level), text.trim()));
                    }
                    "a" if markdown => {
                        let text = collapse_ws(&child_el.text().collect::<String>());
                        match e.attr("href") {
                            Some(href) if !text.trim().is_empty() => {
                                out.push_str(&format!("[{}]({})", text.trim(), href))
                            }
                            _ => out.push_str(&text),
                        }
                    }
                    "li" => {
                        out.push_str(if markdown { "\n- " } else { "\n" });
                        render(child_el, markdown, out);
                    }
                    "p" | "div" | "section" | "article" | "main" | "header" | "footer"
                    | "table" | "tr" | "ul" | "ol" | "blockquote" | "pre" | "h1" | "h2"
                    | "h3" | "h4" | "h5" | "h6" => {
                        render(child_el, markdown, out);
                        out.push_str("\n\n");
                    }
                    _ => render(child_el, markdown, out),
                }
            }
            _ => {}
        }
    }
}

fn collapse_ws(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !prev_space {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
    }
    out
}

/// Trim each line and collapse runs of blank lines to one.
fn normalize(s: &str) -> String {
    let mut out = Vec::new();
    let mut blank = 0;
    for line in s.lines().map(str::trim) {
        if line.is_empty() {
            blank += 1;
            if blank == 1 && !out.is_empty() {
                out.push("");
            }
        } else {
            blank = 0;
            out.push(line);
        }
    }
    while out.last() == Some(&"") {
        out.pop();
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        assert!(validate_url("https://example.com/a").is_ok());
        assert!(validate_url("ftp://example.com").unwrap_err().contains("only http/https"));
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn extracts_html_as_markdown() {
        let html = r#"<!DOCTYPE html><html><head><title>Ownership</title><style>p{}</style></head>
            <body><h2>Rules</h2><p>Each value has an <a href="https://doc.rust-lang.org">owner</a>.</p>
            <ul><li>One owner</li><li>Dropped at scope end</li></ul><script>alert(1)</script></body></html>"#;
        let (text, extractor) = extract(html, "text/html; charset=utf-8", true);
        assert_eq!(extractor, "html");
        assert!(text.starts_with("# Ownership\n\n## Rules"));
        assert!(text.contains("[owner](https://doc.rust-lang.org)"));
        assert!(text.contains("- One owner"));
        assert!(!text.contains("alert"));
        assert!(!text.contains("p{}"));
    }

    #[test]
    fn extracts_plain_text_mode_and_json() {
        let (text, _) = extract("<html><body><p>Hello <b>world</b></p></body></html>", "", false);
        assert_eq!(text, "Hello world");
        let (json_text, extractor) = extract(r#"{"a":1}"#, "application/json", true);
        assert_eq!(extractor, "json");
        assert_eq!(json_text, "{\n  \"a\": 1\n}");
    }

    #[test]
    fn truncates_on_char_boundary() {
        let (t, truncated) = truncate_chars("héllo".to_string(), 2);
        assert_eq!(t, "hé");
        assert!(truncated);
        let (t, truncated) = truncate_chars("abc".to_string(), 10);
        assert_eq!(t, "abc");
        assert!(!truncated);
    }

    #[test]
    fn search_order_puts_default_first_and_skips_keyless() {
        let mut config = Config::default();
        config.tools.web.search.default_provider = "searxng".to_string();
        config.tools.web.search.providers.searxng.api_base = Some("http://localhost:8888".into());
        config.tools.web.search.providers.brave.enabled = false;
        config.tools.web.search.providers.tavily.enabled = false;
        config.tools.web.search.providers.serper.enabled = false;
        let tool = WebSearchTool::from_config(&config);
        assert_eq!(tool.provider_names(), vec!["searxng", "duckduckgo"]);
    }
}
