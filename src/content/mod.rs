//! Content normalization
//!
//! HTML cleanup, inline-image extraction, custom-emoji and hashtag
//! recognition, and the hardcoded quote-link patterns for the handful
//! of platforms whose post URLs we know how to expand.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::federation::shape;

lazy_static! {
    static ref RE_MAST0_LINK: Regex =
        Regex::new(r"https://[[:alnum:].-]+/users/[[:alnum:]_]+/statuses/[[:digit:]]+")
            .expect("regex");
    static ref RE_MAST1_LINK: Regex =
        Regex::new(r"https://([[:alnum:].-]+)/@([[:alnum:]_]+)(@[[:alnum:].]+)?/([[:digit:]]+)")
            .expect("regex");
    static ref RE_MISS_LINK: Regex =
        Regex::new(r"https://[[:alnum:].-]+/notes/[[:alnum:]]+").expect("regex");
    static ref RE_HONK_LINK: Regex =
        Regex::new(r"https://[[:alnum:].-]+/u/[[:alnum:]_]+/h/[[:alnum:]]+").expect("regex");
    static ref RE_R0MA_LINK: Regex =
        Regex::new(r"https://[[:alnum:].-]+/objects/[[:alnum:]-]+").expect("regex");
    static ref RE_R1MA_LINK: Regex =
        Regex::new(r"https://[[:alnum:].-]+/notice/[[:alnum:]]+").expect("regex");
    static ref RE_QT_LINKS: Regex = Regex::new(r">https://[^\s<]+<").expect("regex");
    static ref RE_EMUS: Regex = Regex::new(r":[[:alnum:]_-]+:").expect("regex");
    static ref RE_IMG_TAG: Regex = Regex::new(r#"<img[^>]*\bsrc="([^"]+)""#).expect("regex");
}

/// Clean untrusted HTML down to a safe subset.
///
/// Links and spans keep their classes so mentions and code highlights
/// survive; scripts, styles, and event handlers do not.
pub fn sanitize(html: &str) -> String {
    ammonia::Builder::default()
        .add_tag_attributes("span", &["class"])
        .add_tag_attributes("a", &["class"])
        .add_tag_attributes("code", &["class"])
        .clean(html)
        .to_string()
}

/// HTML-escape plain text content.
pub fn escape_plain(text: &str) -> String {
    html_escape::encode_text(text).into_owned()
}

/// Wrap a plain text diff for display; the side branch taken for
/// Commit objects instead of plain escaping.
pub fn highlight_diff(text: &str) -> String {
    format!("<pre><code>{}</code></pre>", escape_plain(text))
}

/// Content always starts with a paragraph.
pub fn ensure_paragraph(content: String) -> String {
    if content.starts_with("<p>") {
        content
    } else {
        format!("<p>{}", content)
    }
}

/// Does a URL look like a post on a platform we can quote-expand?
pub fn is_quotable_link(url: &str) -> bool {
    RE_MAST0_LINK.is_match(url)
        || RE_MAST1_LINK.is_match(url)
        || RE_MISS_LINK.is_match(url)
        || RE_HONK_LINK.is_match(url)
        || RE_R0MA_LINK.is_match(url)
        || RE_R1MA_LINK.is_match(url)
}

/// Candidate quote links in rendered content: every `>https://...<`
/// bracketed URL, plus an explicit `quoteUrl` when present. Mastodon's
/// ellipsis/invisible span wrappers are unwrapped first so split URLs
/// match.
pub fn find_quote_links(content: &str, quote_url: &str) -> Vec<String> {
    let malcontent = content
        .replace(r#"</span><span class="ellipsis">"#, "")
        .replace(r#"</span><span class="invisible">"#, "");
    let mut links: Vec<String> = RE_QT_LINKS
        .find_iter(&malcontent)
        .map(|m| {
            let s = m.as_str();
            s[1..s.len() - 1].to_string()
        })
        .collect();
    if !quote_url.is_empty() {
        links.push(quote_url.to_string());
    }
    crate::federation::one_of_a_kind(links)
        .into_iter()
        .filter(|link| is_quotable_link(link))
        .collect()
}

/// `:shortcode:` emoji references in content.
pub fn emoji_shortcodes(content: &str) -> Vec<String> {
    crate::federation::one_of_a_kind(
        RE_EMUS
            .find_iter(content)
            .map(|m| m.as_str().to_string())
            .collect(),
    )
}

/// `src` attributes of inline images, for localization.
pub fn inline_image_sources(content: &str) -> Vec<String> {
    RE_IMG_TAG
        .captures_iter(content)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Append a question's choices to content as a list.
pub fn append_poll_choices(mut content: String, obj: &Value) -> String {
    content.push_str("<ul>");
    for key in ["oneOf", "anyOf"] {
        for choice in shape::one_for_all(obj, key) {
            if let Some(name) = shape::get_string(choice, "name") {
                content.push_str("<li>");
                content.push_str(&escape_plain(name));
            }
        }
    }
    content.push_str("</ul>");
    content
}

/// Does the content need the Article treatment when federated out?
pub fn too_fancy(noise: &str) -> bool {
    noise.contains("<img") || noise.contains("<table")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_strips_scripts_keeps_structure() {
        let dirty = r#"<p>hi<script>alert(1)</script> <a href="https://x" class="mention">@x</a></p>"#;
        let clean = sanitize(dirty);
        assert!(!clean.contains("script"));
        assert!(clean.contains(r#"class="mention""#));
        assert!(clean.contains("<p>"));
    }

    #[test]
    fn ensure_paragraph_is_idempotent() {
        assert_eq!(ensure_paragraph("<p>hi".to_string()), "<p>hi");
        assert_eq!(ensure_paragraph("hi".to_string()), "<p>hi");
    }

    #[test]
    fn quotable_links_match_known_platforms() {
        assert!(is_quotable_link(
            "https://mastodon.example/users/alice/statuses/123456"
        ));
        assert!(is_quotable_link("https://mastodon.example/@alice/123456"));
        assert!(is_quotable_link("https://misskey.example/notes/9a8b7c"));
        assert!(is_quotable_link("https://honk.example/u/ted/h/Q5K2"));
        assert!(is_quotable_link(
            "https://pleroma.example/objects/abc-def-123"
        ));
        assert!(is_quotable_link("https://pleroma.example/notice/AbC123"));
        assert!(!is_quotable_link("https://example.com/some/page"));
    }

    #[test]
    fn find_quote_links_unwraps_ellipsis_spans() {
        let content = concat!(
            r#"<p>look <a href="https://mastodon.example/users/alice/statuses/123">"#,
            r#">https://mastodon.example/users/al</span><span class="ellipsis">ice/statuses/123<</a>"#
        );
        let links = find_quote_links(content, "");
        assert_eq!(
            links,
            vec!["https://mastodon.example/users/alice/statuses/123"]
        );
    }

    #[test]
    fn find_quote_links_includes_quote_url() {
        let links = find_quote_links("<p>no links", "https://misskey.example/notes/9z8y7x");
        assert_eq!(links, vec!["https://misskey.example/notes/9z8y7x"]);
    }

    #[test]
    fn emoji_shortcodes_dedupe() {
        let codes = emoji_shortcodes("<p>:wave: hello :wave: :big_smile:");
        assert_eq!(codes, vec![":wave:", ":big_smile:"]);
    }

    #[test]
    fn inline_image_sources_found() {
        let sources =
            inline_image_sources(r#"<p>pic <img alt="x" src="https://remote.example/a.png">"#);
        assert_eq!(sources, vec!["https://remote.example/a.png"]);
    }

    #[test]
    fn poll_choices_appended_in_order() {
        let obj = json!({
            "oneOf": [{"name": "yes"}, {"name": "no"}],
        });
        let content = append_poll_choices("<p>poll".to_string(), &obj);
        assert_eq!(content, "<p>poll<ul><li>yes<li>no</ul>");
    }

    #[test]
    fn too_fancy_detects_rich_markup() {
        assert!(too_fancy("<p>pic <img src=x>"));
        assert!(too_fancy("<table><tr>"));
        assert!(!too_fancy("<p>plain"));
    }
}
