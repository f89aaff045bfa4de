//! Plain-text rendering of search outcomes

use std::fmt::Write;

use provider::SearchMatch;

use crate::orchestrator::SearchOutcome;

const MISSING: &str = "N/A";

/// Render an outcome as the multi-line text returned to clients.
///
/// `quota` is the SEARCH tier allowance the remaining counter is shown against.
pub fn render(outcome: &SearchOutcome, quota: u32) -> String {
    match outcome {
        SearchOutcome::Match { top, remaining } => render_match(top, *remaining, quota),
        SearchOutcome::NoMatch { remaining } => {
            format!("No match found.\nRemaining searches: {remaining}/{quota}")
        }
    }
}

fn render_match(top: &SearchMatch, remaining: u32, quota: u32) -> String {
    let header = &top.header;
    let data = &top.data;
    let links = if data.ext_urls.is_empty() {
        "none".to_string()
    } else {
        data.ext_urls.join(", ")
    };

    let mut out = String::from("Search result:\n");
    // Writing into a String cannot fail
    let _ = writeln!(out, "Similarity: {}%", or_missing(&header.similarity));
    let _ = writeln!(out, "Title: {}", top.title().unwrap_or("unknown"));
    let _ = writeln!(out, "Links: {links}");
    let _ = writeln!(out, "Author: {}", top.author().unwrap_or("unknown"));
    let _ = writeln!(out, "Part/Episode: {}", or_missing(&data.part));
    let _ = writeln!(out, "Year: {}", or_missing(&data.year));
    let _ = writeln!(out, "Timing: {}", or_missing(&data.est_time));
    let _ = writeln!(out, "IMDB ID: {}", or_missing(&data.imdb_id));
    let _ = writeln!(out, "Index: {}", or_missing(&header.index_name));
    let _ = writeln!(out, "Thumbnail: {}", or_missing(&header.thumbnail));
    let _ = write!(out, "Remaining searches: {remaining}/{quota}");
    out
}

fn or_missing(value: &Option<String>) -> &str {
    value.as_deref().filter(|v| !v.is_empty()).unwrap_or(MISSING)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn top_match(json: &str) -> Box<SearchMatch> {
        let body = format!(r#"{{"header": {{"status": 0}}, "results": [{json}]}}"#);
        match provider::classify_payload(&body) {
            provider::Payload::Matches { top, .. } => top,
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn full_match_renders_every_field() {
        let top = top_match(
            r#"{
                "header": {"similarity": "91.5", "index_name": "H-Anime", "thumbnail": "https://t/1.jpg"},
                "data": {
                    "source": "Show", "ext_urls": ["https://a", "https://b"],
                    "member_name": "artist", "part": "12", "year": "2019-2020",
                    "est_time": "00:12:01 / 00:23:40", "imdb_id": "tt123"
                }
            }"#,
        );
        let text = render(
            &SearchOutcome::Match {
                top,
                remaining: 41,
            },
            100,
        );

        assert!(text.contains("Similarity: 91.5%"));
        assert!(text.contains("Title: Show"));
        assert!(text.contains("Links: https://a, https://b"));
        assert!(text.contains("Author: artist"));
        assert!(text.contains("Part/Episode: 12"));
        assert!(text.contains("Year: 2019-2020"));
        assert!(text.contains("Timing: 00:12:01 / 00:23:40"));
        assert!(text.contains("IMDB ID: tt123"));
        assert!(text.contains("Index: H-Anime"));
        assert!(text.contains("Thumbnail: https://t/1.jpg"));
        assert!(text.ends_with("Remaining searches: 41/100"));
    }

    #[test]
    fn missing_fields_render_placeholders() {
        let top = top_match(r#"{"header": {}, "data": {}}"#);
        let text = render(&SearchOutcome::Match { top, remaining: 3 }, 100);

        assert!(text.contains("Similarity: N/A%"));
        assert!(text.contains("Title: unknown"));
        assert!(text.contains("Links: none"));
        assert!(text.contains("Author: unknown"));
        assert!(text.contains("Year: N/A"));
        assert!(text.contains("Thumbnail: N/A"));
    }

    #[test]
    fn no_match_carries_remaining() {
        let text = render(&SearchOutcome::NoMatch { remaining: 7 }, 200);
        assert_eq!(text, "No match found.\nRemaining searches: 7/200");
    }
}
