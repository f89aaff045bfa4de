//! Search provider payload model and shape-based classification
//!
//! The provider answers 200 for almost everything, including invalid keys
//! (an HTML error page) and its own quota errors (`header.status != 0`), so
//! the outcome is decided by inspecting the body, never the HTTP status.

use serde::{Deserialize, Deserializer};

/// Maximum characters of an unstructured body kept for logs.
const SNIPPET_LEN: usize = 200;

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    pub header: ResponseHeader,
    #[serde(default)]
    pub results: Option<Vec<SearchMatch>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseHeader {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub status: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub long_remaining: Option<i64>,
}

/// One ranked match.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchMatch {
    #[serde(default, deserialize_with = "null_as_default")]
    pub header: MatchHeader,
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: MatchData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchHeader {
    #[serde(default, deserialize_with = "lenient_string")]
    pub similarity: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub index_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchData {
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub source: Option<String>,
    #[serde(default, deserialize_with = "lenient_urls")]
    pub ext_urls: Vec<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub author: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub member_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub part: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub year: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub est_time: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub imdb_id: Option<String>,
}

impl SearchMatch {
    /// Title, falling back to the source name.
    pub fn title(&self) -> Option<&str> {
        self.data
            .title
            .as_deref()
            .or(self.data.source.as_deref())
    }

    /// Author, falling back to the member name on art sites.
    pub fn author(&self) -> Option<&str> {
        self.data
            .author
            .as_deref()
            .or(self.data.member_name.as_deref())
    }
}

/// What a response body means for the keys involved.
#[derive(Debug, Clone)]
pub enum Payload {
    /// HTML page or otherwise unparseable body: invalid or blocked key
    Unstructured { snippet: String },
    /// Well-formed JSON whose status is missing or non-zero
    ProviderError {
        status: Option<i64>,
        message: String,
        remaining: Option<i64>,
    },
    /// Status 0 with at least one result; `top` is the best match
    Matches {
        remaining: Option<i64>,
        top: Box<SearchMatch>,
    },
    /// Status 0 with no results
    Empty { remaining: Option<i64> },
}

/// Classify a raw response body by its shape.
pub fn classify_payload(body: &str) -> Payload {
    let trimmed = body.trim_start();
    if trimmed.starts_with('<') || body.contains("<!DOCTYPE html") {
        return Payload::Unstructured {
            snippet: snippet(body),
        };
    }

    let response: SearchResponse = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(_) => {
            return Payload::Unstructured {
                snippet: snippet(body),
            };
        }
    };

    let remaining = response.header.long_remaining;
    if response.header.status != Some(0) {
        return Payload::ProviderError {
            status: response.header.status,
            message: response
                .header
                .message
                .unwrap_or_else(|| "unknown provider error".to_string()),
            remaining,
        };
    }

    match response.results.and_then(|r| r.into_iter().next()) {
        Some(top) => Payload::Matches {
            remaining,
            top: Box::new(top),
        },
        None => Payload::Empty { remaining },
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(SNIPPET_LEN).collect()
}

/// Accept strings, numbers, booleans or string arrays where a string is expected.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items
                .into_iter()
                .filter_map(|i| match i {
                    serde_json::Value::String(s) => Some(s),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    }))
}

/// Treat an explicit `null` like an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Keep the string entries of a URL list; anything else counts as no URLs.
fn lenient_urls<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|i| match i {
                serde_json::Value::String(s) if !s.is_empty() => Some(s),
                _ => None,
            })
            .collect(),
        Some(serde_json::Value::String(s)) if !s.is_empty() => vec![s],
        _ => Vec::new(),
    })
}

/// Accept integers or numeric strings where an integer is expected.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MATCH_BODY: &str = r#"{
        "header": {"status": 0, "long_remaining": 87, "short_remaining": 5},
        "results": [{
            "header": {"similarity": "93.41", "index_name": "Index #21: Anime", "thumbnail": "https://img/t.jpg"},
            "data": {"source": "Cowboy Bebop", "ext_urls": ["https://anidb.net/a23"], "part": 5, "year": "1998", "est_time": "00:12:31 / 00:24:00"}
        }]
    }"#;

    #[test]
    fn html_page_is_unstructured() {
        let body = "<!DOCTYPE html><html><body>Invalid API key</body></html>";
        assert!(matches!(classify_payload(body), Payload::Unstructured { .. }));
    }

    #[test]
    fn garbage_is_unstructured_with_bounded_snippet() {
        let body = "x".repeat(1000);
        match classify_payload(&body) {
            Payload::Unstructured { snippet } => assert_eq!(snippet.len(), SNIPPET_LEN),
            other => panic!("expected Unstructured, got {other:?}"),
        }
    }

    #[test]
    fn non_zero_status_is_provider_error() {
        let body = r#"{"header":{"status":-2,"message":"Search Rate Too High.","long_remaining":0}}"#;
        match classify_payload(body) {
            Payload::ProviderError {
                status,
                message,
                remaining,
            } => {
                assert_eq!(status, Some(-2));
                assert_eq!(message, "Search Rate Too High.");
                assert_eq!(remaining, Some(0));
            }
            other => panic!("expected ProviderError, got {other:?}"),
        }
    }

    #[test]
    fn missing_status_is_provider_error() {
        let body = r#"{"header":{}}"#;
        assert!(matches!(
            classify_payload(body),
            Payload::ProviderError { status: None, .. }
        ));
    }

    #[test]
    fn zero_status_with_results_is_match() {
        match classify_payload(MATCH_BODY) {
            Payload::Matches { remaining, top } => {
                assert_eq!(remaining, Some(87));
                assert_eq!(top.title(), Some("Cowboy Bebop"));
                assert_eq!(top.header.similarity.as_deref(), Some("93.41"));
                assert_eq!(top.data.part.as_deref(), Some("5"), "numeric part accepted");
                assert_eq!(top.data.ext_urls, vec!["https://anidb.net/a23"]);
                assert!(top.author().is_none());
            }
            other => panic!("expected Matches, got {other:?}"),
        }
    }

    #[test]
    fn zero_status_without_results_is_empty() {
        let body = r#"{"header":{"status":"0","long_remaining":"12"},"results":[]}"#;
        assert!(matches!(
            classify_payload(body),
            Payload::Empty {
                remaining: Some(12)
            }
        ));

        let body = r#"{"header":{"status":0}}"#;
        assert!(matches!(
            classify_payload(body),
            Payload::Empty { remaining: None }
        ));
    }

    #[test]
    fn author_falls_back_to_member_name() {
        let body = r#"{"header":{"status":0},"results":[{"header":{},"data":{"title":"t","member_name":"artist","author":["a","b"]}}]}"#;
        match classify_payload(body) {
            Payload::Matches { top, .. } => assert_eq!(top.author(), Some("a, b")),
            other => panic!("expected Matches, got {other:?}"),
        }

        let body = r#"{"header":{"status":0},"results":[{"data":{"member_name":"artist"}}]}"#;
        match classify_payload(body) {
            Payload::Matches { top, .. } => assert_eq!(top.author(), Some("artist")),
            other => panic!("expected Matches, got {other:?}"),
        }
    }

    #[test]
    fn null_match_fields_still_count_as_match() {
        let body = r#"{"header":{"status":0,"long_remaining":80},"results":[{"header":{"similarity":"90"},"data":{"title":"t","ext_urls":null}}]}"#;
        match classify_payload(body) {
            Payload::Matches { remaining, top } => {
                assert_eq!(remaining, Some(80));
                assert_eq!(top.title(), Some("t"));
                assert!(top.data.ext_urls.is_empty());
            }
            other => panic!("expected Matches, got {other:?}"),
        }

        let body = r#"{"header":{"status":0},"results":[{"header":null,"data":null}]}"#;
        match classify_payload(body) {
            Payload::Matches { top, .. } => {
                assert!(top.title().is_none());
                assert!(top.header.similarity.is_none());
            }
            other => panic!("expected Matches, got {other:?}"),
        }
    }

    #[test]
    fn non_string_urls_are_skipped() {
        let body = r#"{"header":{"status":0},"results":[{"data":{"ext_urls":["https://a",7,null,"","https://b"]}}]}"#;
        match classify_payload(body) {
            Payload::Matches { top, .. } => {
                assert_eq!(top.data.ext_urls, vec!["https://a", "https://b"]);
            }
            other => panic!("expected Matches, got {other:?}"),
        }
    }
}
