//! Evidence references: locating screenshot URLs in a row.
//!
//! An evidence cell may hold markdown links, bare URLs, or preview-page links
//! whose `url=` query parameter packs several image URLs. When the row carries
//! a `<field>__hyperlink` helper column (the link target behind a spreadsheet
//! cell), that value wins over the visible text.

use reqwest::Url;
use std::collections::HashSet;
use std::sync::LazyLock;

use super::{cell_text, Record};

/// Suffix of the helper column holding a cell's hyperlink target.
pub const HYPERLINK_SUFFIX: &str = "__hyperlink";

const IMAGE_EXTENSIONS: [&str; 5] = [".jpg", ".jpeg", ".png", ".webp", ".bmp"];

static URL_IN_PARENS: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\((https?://[^\s)]+)\)").expect("valid url pattern"));

static URL_GENERIC: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r#"(https?://[^\s\]"')]+)"#).expect("valid url pattern")
});

static PREVIEW_SPLIT: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"__|;|\s+").expect("valid split pattern"));

/// Evidence references for one row, at most `max_items`, in cell order.
pub fn evidence_for_row(record: &Record, field: &str, max_items: usize) -> Vec<String> {
    let helper = record
        .get(&format!("{field}{HYPERLINK_SUFFIX}"))
        .map(cell_text)
        .filter(|s| !s.is_empty());

    let raw = match helper {
        Some(link) => link,
        None => record.get(field).map(cell_text).unwrap_or_default(),
    };
    extract_evidence(&raw, max_items)
}

/// Extract evidence URLs from free cell text.
///
/// Direct image links are preferred; if none are present any http(s) link is
/// accepted.
pub fn extract_evidence(text: &str, max_items: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() || max_items == 0 {
        return Vec::new();
    }

    let found = pick_image_urls(&urls_in_text(text), max_items);
    if !found.is_empty() {
        return found;
    }

    if text.starts_with("http") {
        let expanded = expand_preview_url(text);
        let images: Vec<String> = expanded.iter().filter(|u| is_image_url(u)).cloned().collect();
        let chosen = if images.is_empty() { expanded } else { images };
        return dedupe(chosen, Some(max_items));
    }

    Vec::new()
}

/// URLs in markdown parentheses first, then bare URLs, deduplicated.
fn urls_in_text(text: &str) -> Vec<String> {
    let in_parens = URL_IN_PARENS.captures_iter(text).map(|c| c[1].to_string());
    let generic = URL_GENERIC.captures_iter(text).map(|c| c[1].to_string());
    dedupe(in_parens.chain(generic), None)
}

fn pick_image_urls(urls: &[String], max_items: usize) -> Vec<String> {
    let expanded: Vec<String> = urls.iter().flat_map(|u| expand_preview_url(u)).collect();

    let images = dedupe(
        expanded.iter().filter(|u| is_image_url(u)).cloned(),
        Some(max_items),
    );
    if !images.is_empty() {
        return images;
    }

    dedupe(
        expanded.into_iter().filter(|u| u.starts_with("http")),
        Some(max_items),
    )
}

/// Split a preview link into the URLs packed in its `url=` parameter.
/// Anything else comes back unchanged.
pub fn expand_preview_url(url: &str) -> Vec<String> {
    let url = url.trim();
    if url.is_empty() {
        return Vec::new();
    }

    let packed = Url::parse(url).ok().and_then(|parsed| {
        parsed
            .query_pairs()
            .find(|(key, _)| key == "url")
            .map(|(_, value)| value.into_owned())
    });

    if let Some(packed) = packed {
        let parts: Vec<String> = PREVIEW_SPLIT
            .split(&packed)
            .map(str::trim)
            .filter(|p| p.starts_with("http"))
            .map(str::to_string)
            .collect();
        if !parts.is_empty() {
            return parts;
        }
    }

    vec![url.to_string()]
}

fn is_image_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn dedupe(values: impl IntoIterator<Item = String>, max_items: Option<usize>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for value in values {
        let item = value.trim();
        if item.is_empty() || !seen.insert(item.to_string()) {
            continue;
        }
        out.push(item.to_string());
        if max_items.is_some_and(|max| out.len() >= max) {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_markdown_and_bare_links() {
        let text = "[shot](https://img.example.com/a.png) see also https://img.example.com/b.JPG";
        assert_eq!(
            extract_evidence(text, 4),
            vec!["https://img.example.com/a.png", "https://img.example.com/b.JPG"]
        );
    }

    #[test]
    fn test_images_preferred_over_pages() {
        let text = "https://shop.example.com/item/1 https://img.example.com/c.webp";
        assert_eq!(extract_evidence(text, 4), vec!["https://img.example.com/c.webp"]);
    }

    #[test]
    fn test_non_image_links_accepted_as_fallback() {
        let text = "https://files.example.com/view?id=7";
        assert_eq!(extract_evidence(text, 4), vec!["https://files.example.com/view?id=7"]);
    }

    #[test]
    fn test_preview_url_is_expanded_and_capped() {
        let text = "https://preview.example.com/p?url=https%3A%2F%2Fa.example.com%2F1.jpg__https%3A%2F%2Fa.example.com%2F2.jpg%3Bhttps%3A%2F%2Fa.example.com%2F3.jpg";
        assert_eq!(
            extract_evidence(text, 2),
            vec!["https://a.example.com/1.jpg", "https://a.example.com/2.jpg"]
        );
    }

    #[test]
    fn test_duplicates_removed_in_order() {
        let text = "(https://x.example.com/1.png) https://x.example.com/1.png https://x.example.com/2.png";
        assert_eq!(
            extract_evidence(text, 4),
            vec!["https://x.example.com/1.png", "https://x.example.com/2.png"]
        );
    }

    #[test]
    fn test_hyperlink_helper_column_wins() {
        let record = json!({
            "evidence": "查看图片",
            "evidence__hyperlink": "https://img.example.com/hidden.png"
        });
        let record = record.as_object().unwrap();
        assert_eq!(
            evidence_for_row(record, "evidence", 4),
            vec!["https://img.example.com/hidden.png"]
        );
    }

    #[test]
    fn test_no_evidence() {
        let record = json!({"evidence": "no link here"});
        assert!(evidence_for_row(record.as_object().unwrap(), "evidence", 4).is_empty());
        assert!(extract_evidence("   ", 4).is_empty());
    }
}
