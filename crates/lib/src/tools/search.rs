//! Search provider table and HTTP backends for `web_search`.

use std::time::Duration;

use serde_json::Value;

/// Static metadata for one search provider. Order is the fallback order.
#[derive(Debug, Clone, Copy)]
pub struct SearchProviderSpec {
    pub name: &'static str,
    pub display_name: &'static str,
    pub requires_api_key: bool,
    pub requires_api_base: bool,
}

pub const SEARCH_PROVIDERS: &[SearchProviderSpec] = &[
    SearchProviderSpec {
        name: "duckduckgo",
        display_name: "DuckDuckGo",
        requires_api_key: false,
        requires_api_base: false,
    },
    SearchProviderSpec {
        name: "brave",
        display_name: "Brave Search",
        requires_api_key: true,
        requires_api_base: false,
    },
    SearchProviderSpec {
        name: "tavily",
        display_name: "Tavily",
        requires_api_key: true,
        requires_api_base: false,
    },
    SearchProviderSpec {
        name: "serper",
        display_name: "Serper (Google)",
        requires_api_key: true,
        requires_api_base: false,
    },
    SearchProviderSpec {
        name: "searxng",
        display_name: "SearXNG",
        requires_api_key: false,
        requires_api_base: true,
    },
];

pub fn find_search_provider(name: &str) -> Option<&'static SearchProviderSpec> {
    SEARCH_PROVIDERS.iter().find(|s| s.name == name)
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: Option<String>,
}

/// A configured, usable provider.
#[derive(Debug, Clone)]
pub struct SearchBackend {
    pub spec: &'static SearchProviderSpec,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
}

impl SearchBackend {
    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    /// Query the provider and return up to `count` hits.
    pub async fn search(
        &self,
        client: &reqwest::Client,
        query: &str,
        count: usize,
    ) -> Result<Vec<SearchHit>, String> {
        let count_s = count.to_string();
        let key = self.api_key.as_deref().unwrap_or_default();
        let req = match self.spec.name {
            "duckduckgo" => client
                .get(self.base_or("https://api.duckduckgo.com/"))
                .query(&[("q", query), ("format", "json"), ("no_html", "1"), ("skip_disambig", "1")]),
            "brave" => client
                .get(self.base_or("https://api.search.brave.com/res/v1/web/search"))
                .query(&[("q", query), ("count", count_s.as_str())])
                .header("Accept", "application/json")
                .header("X-Subscription-Token", key),
            "tavily" => client
                .post(self.base_or("https://api.tavily.com/search"))
                .json(&serde_json::json!({
                    "api_key": key,
                    "query": query,
                    "max_results": count,
                    "include_answer": false,
                })),
            "serper" => client
                .get(self.base_or("https://google.serper.dev/search"))
                .query(&[("q", query), ("num", count_s.as_str())])
                .header("X-API-KEY", key),
            "searxng" => {
                let base = self.api_base.as_deref().unwrap_or_default().trim_end_matches('/');
                client
                    .get(format!("{}/search", base))
                    .query(&[("q", query), ("format", "json")])
            }
            other => return Err(format!("unknown search provider: {}", other)),
        };
        let res = req
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            return Err(format!("http {}", res.status()));
        }
        let data: Value = res.json().await.map_err(|e| e.to_string())?;
        let mut hits = parse_hits(self.spec.name, &data);
        hits.truncate(count);
        Ok(hits)
    }

    fn base_or(&self, default: &str) -> String {
        self.api_base
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or(default)
            .to_string()
    }
}

fn str_field(item: &Value, key: &str) -> String {
    item.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn opt_field(item: &Value, key: &str) -> Option<String> {
    item.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Map each provider's response shape to hits.
fn parse_hits(provider: &str, data: &Value) -> Vec<SearchHit> {
    let list = |path: &[&str]| -> Vec<Value> {
        let mut cur = data;
        for p in path {
            match cur.get(p) {
                Some(v) => cur = v,
                None => return Vec::new(),
            }
        }
        cur.as_array().cloned().unwrap_or_default()
    };
    match provider {
        "duckduckgo" => {
            let mut hits = Vec::new();
            let abstract_text = str_field(data, "AbstractText");
            if !abstract_text.is_empty() {
                hits.push(SearchHit {
                    title: str_field(data, "Heading"),
                    url: str_field(data, "AbstractURL"),
                    snippet: Some(abstract_text),
                });
            }
            let mut stack = list(&["RelatedTopics"]);
            stack.reverse();
            while let Some(topic) = stack.pop() {
                // Grouped topics nest their entries under "Topics".
                if let Some(children) = topic.get("Topics").and_then(Value::as_array) {
                    stack.extend(children.iter().rev().cloned());
                    continue;
                }
                let text = str_field(&topic, "Text");
                let url = str_field(&topic, "FirstURL");
                if text.is_empty() || url.is_empty() {
                    continue;
                }
                let title = text.split(" - ").next().unwrap_or(&text).to_string();
                hits.push(SearchHit {
                    title,
                    url,
                    snippet: Some(text),
                });
            }
            hits
        }
        "brave" => list(&["web", "results"])
            .iter()
            .map(|i| SearchHit {
                title: str_field(i, "title"),
                url: str_field(i, "url"),
                snippet: opt_field(i, "description"),
            })
            .collect(),
        "tavily" => list(&["results"])
            .iter()
            .map(|i| SearchHit {
                title: str_field(i, "title"),
                url: str_field(i, "url"),
                snippet: opt_field(i, "content").map(|c| {
                    let short: String = c.chars().take(200).collect();
                    format!("{}...", short)
                }),
            })
            .collect(),
        "serper" => list(&["organic"])
            .iter()
            .map(|i| SearchHit {
                title: str_field(i, "title"),
                url: str_field(i, "link"),
                snippet: opt_field(i, "snippet"),
            })
            .collect(),
        "searxng" => list(&["results"])
            .iter()
            .map(|i| SearchHit {
                title: str_field(i, "title"),
                url: str_field(i, "url"),
                snippet: opt_field(i, "content"),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Numbered result list shown to the model.
pub fn format_hits(query: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("No results for: {}", query);
    }
    let mut lines = vec![format!("Results for: {}\n", query)];
    for (i, hit) in hits.iter().enumerate() {
        lines.push(format!("{}. {}\n   {}", i + 1, hit.title, hit.url));
        if let Some(snippet) = &hit.snippet {
            lines.push(format!("   {}", snippet));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_brave_results() {
        let data = json!({"web": {"results": [
            {"title": "The Rust Book", "url": "https://doc.rust-lang.org/book/", "description": "Ownership rules"}
        ]}});
        let hits = parse_hits("brave", &data);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].snippet.as_deref(), Some("Ownership rules"));
    }

    #[test]
    fn parses_duckduckgo_nested_topics() {
        let data = json!({
            "Heading": "Rust",
            "AbstractText": "A language",
            "AbstractURL": "https://en.wikipedia.org/wiki/Rust",
            "RelatedTopics": [
                {"Text": "Ownership - memory model", "FirstURL": "https://a"},
                {"Name": "Group", "Topics": [{"Text": "Borrowing - refs", "FirstURL": "https://b"}]}
            ]
        });
        let hits = parse_hits("duckduckgo", &data);
        let urls: Vec<&str> = hits.iter().map(|h| h.url.as_str()).collect();
        assert_eq!(urls, vec!["https://en.wikipedia.org/wiki/Rust", "https://a", "https://b"]);
        assert_eq!(hits[1].title, "Ownership");
    }

    #[test]
    fn formats_numbered_list() {
        let hits = vec![SearchHit {
            title: "T".into(),
            url: "https://t".into(),
            snippet: None,
        }];
        assert_eq!(format_hits("q", &hits), "Results for: q\n\n1. T\n   https://t");
        assert_eq!(format_hits("q", &[]), "No results for: q");
    }

    #[test]
    fn provider_table_order() {
        let names: Vec<&str> = SEARCH_PROVIDERS.iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["duckduckgo", "brave", "tavily", "serper", "searxng"]);
        assert!(find_search_provider("brave").unwrap().requires_api_key);
    }
}
