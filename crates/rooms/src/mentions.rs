//! Server-side `@mention` parsing (spec §4.7, invariant I5/I8 — routing
//! always uses mentions parsed here from the sanitised content, never the
//! client's claimed mentions list).

use regex::Regex;
use std::sync::OnceLock;

fn mention_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([A-Za-z0-9_.\-]+)").expect("static regex is valid"))
}

/// Parse `@name` tokens out of `content` and resolve each to a registered
/// agent name in `registered_names`, in order of first occurrence,
/// deduplicated. Ties (an `@name` token is a prefix-match candidate for more
/// than one registered name) resolve deterministically to the first exact
/// match encountered — this function only performs exact, case-sensitive
/// matches against `registered_names`, so "ties" reduce to "is this token
/// exactly one of the registered names."
pub fn parse_mentions(content: &str, registered_names: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for capture in mention_token_re().captures_iter(content) {
        let token = &capture[1];
        if let Some(name) = registered_names.iter().find(|n| n.as_str() == token)
            && seen.insert(name.clone())
        {
            out.push(name.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_single_mention() {
        let registered = names(&["alpha", "beta"]);
        let mentions = parse_mentions("@alpha please do X", &registered);
        assert_eq!(mentions, vec!["alpha".to_string()]);
    }

    #[test]
    fn ignores_unregistered_names() {
        let registered = names(&["alpha"]);
        let mentions = parse_mentions("@gamma hi @alpha", &registered);
        assert_eq!(mentions, vec!["alpha".to_string()]);
    }

    #[test]
    fn deduplicates_repeated_mentions() {
        let registered = names(&["alpha"]);
        let mentions = parse_mentions("@alpha @alpha @alpha", &registered);
        assert_eq!(mentions, vec!["alpha".to_string()]);
    }

    #[test]
    fn no_mentions_returns_empty() {
        let registered = names(&["alpha"]);
        let mentions = parse_mentions("status?", &registered);
        assert!(mentions.is_empty());
    }

    #[test]
    fn preserves_first_occurrence_order() {
        let registered = names(&["alpha", "beta"]);
        let mentions = parse_mentions("@beta then @alpha", &registered);
        assert_eq!(mentions, vec!["beta".to_string(), "alpha".to_string()]);
    }
}
