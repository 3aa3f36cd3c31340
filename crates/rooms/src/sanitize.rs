//! Content sanitisation applied to every `send_message` before mention
//! parsing, persistence, and broadcast (spec §4.7, invariant I5).
//!
//! Style note: this walks the input byte-by-byte rather than building a DOM,
//! the same manual-state-machine approach the upstream web-fetch tool uses
//! to turn arbitrary HTML into safe text (`html_to_text`) — appropriate here
//! too, since chat messages are untrusted strings, not documents we need to
//! round-trip.

use regex::Regex;
use std::sync::OnceLock;

const DANGEROUS_TAGS: &[&str] = &["svg", "math", "script", "iframe", "object", "embed", "form"];
const DANGEROUS_SCHEMES: &[&str] = &["javascript:", "vbscript:", "data:text/html"];

fn dangerous_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let alternation = DANGEROUS_TAGS.join("|");
        Regex::new(&format!(
            r"(?is)<\s*({alternation})\b[^>]*>.*?<\s*/\s*({alternation})\s*>"
        ))
        .expect("static regex is valid")
    })
}

fn self_closing_dangerous_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let alternation = DANGEROUS_TAGS.join("|");
        Regex::new(&format!(r"(?is)<\s*({alternation})\b[^>]*/?>")).expect("static regex is valid")
    })
}

fn event_handler_attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).expect("static regex is valid")
    })
}

fn generic_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("static regex is valid"))
}

/// Sanitise user-supplied message content per spec §4.7:
/// - strip dangerous HTML blocks (and their content) for
///   svg/math/script/iframe/object/embed/form
/// - strip event-handler attributes (`on*=`) on any remaining tags
/// - neutralise `javascript:`/`vbscript:`/`data:text/html` URL schemes
/// - decode HTML entities
/// - strip generic tags while preserving the prose they contain
pub fn sanitize_content(input: &str) -> String {
    let mut content = dangerous_block_re().replace_all(input, "").into_owned();
    content = self_closing_dangerous_re().replace_all(&content, "").into_owned();
    content = event_handler_attr_re().replace_all(&content, "").into_owned();
    content = neutralise_schemes(&content);
    content = generic_tag_re().replace_all(&content, "").into_owned();
    content = decode_entities(&content);
    content.trim().to_string()
}

fn neutralise_schemes(input: &str) -> String {
    let mut out = input.to_string();
    for scheme in DANGEROUS_SCHEMES {
        let re = Regex::new(&format!(r"(?i){}", regex::escape(scheme))).expect("valid regex");
        out = re.replace_all(&out, "blocked:").into_owned();
    }
    out
}

fn decode_entities(input: &str) -> String {
    input
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_script_block_entirely() {
        let out = sanitize_content("hello <script>alert(1)</script> world");
        assert_eq!(out, "hello  world");
    }

    #[test]
    fn strips_iframe_and_svg() {
        let out = sanitize_content("<iframe src=evil></iframe><svg onload=alert(1)></svg>ok");
        assert_eq!(out, "ok");
    }

    #[test]
    fn strips_event_handler_attributes() {
        let out = sanitize_content(r#"<img src=x onerror="alert(1)">text"#);
        assert_eq!(out, "text");
    }

    #[test]
    fn neutralises_javascript_scheme() {
        let out = sanitize_content(r#"<a href="javascript:alert(1)">click</a>"#);
        assert_eq!(out, "click");
        // Even outside a tag, the scheme string itself gets neutralised.
        let out2 = sanitize_content("see javascript:alert(1) here");
        assert!(!out2.contains("javascript:"));
    }

    #[test]
    fn preserves_prose_mentioning_dangerous_keywords() {
        let out = sanitize_content("I wrote a script today about forms and objects");
        assert_eq!(out, "I wrote a script today about forms and objects");
    }

    #[test]
    fn decodes_entities_after_tag_stripping() {
        let out = sanitize_content("a &amp; b &lt;tag&gt;");
        assert_eq!(out, "a & b <tag>");
    }

    #[test]
    fn strips_generic_tags_but_keeps_text() {
        let out = sanitize_content("<b>bold</b> and <i>italic</i>");
        assert_eq!(out, "bold and italic");
    }
}
