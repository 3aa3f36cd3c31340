//! Inbound frame validator (spec §4.6). Runs before any handler dispatch;
//! every rejection carries one of the typed wire error codes.

use agentim_protocol::error_codes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{}", error_codes::MESSAGE_TOO_LARGE)]
    TooLarge,
    #[error("{}", error_codes::INVALID_JSON)]
    InvalidJson,
    #[error("{}", error_codes::JSON_TOO_DEEP)]
    TooDeep,
}

impl ValidationError {
    pub fn code(self) -> &'static str {
        match self {
            ValidationError::TooLarge => error_codes::MESSAGE_TOO_LARGE,
            ValidationError::InvalidJson => error_codes::INVALID_JSON,
            ValidationError::TooDeep => error_codes::JSON_TOO_DEEP,
        }
    }
}

/// Validate a raw inbound frame: size cap, then a cheap bracket-depth scan
/// that rejects over-nested documents before `serde_json` ever materialises
/// them, then the actual parse. Schema validation (does this deserialize
/// into a known frame variant) is left to the caller's `serde_json::from_str`
/// into the frame enum, which yields `INVALID_MESSAGE` on mismatch.
pub fn validate_size_and_depth(
    raw: &str,
    max_size_bytes: usize,
    max_depth: usize,
) -> Result<(), ValidationError> {
    if raw.len() > max_size_bytes {
        return Err(ValidationError::TooLarge);
    }
    check_depth(raw, max_depth)
}

/// Scans the raw JSON text tracking `{`/`[` nesting depth with a simple
/// counter, bailing out as soon as the bound is exceeded rather than
/// building any intermediate tree — the spec requires the depth check to
/// never fully materialise a deeper-than-allowed value.
fn check_depth(raw: &str, max_depth: usize) -> Result<(), ValidationError> {
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;

    for ch in raw.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' | '[' => {
                depth += 1;
                if depth > max_depth {
                    return Err(ValidationError::TooDeep);
                }
            },
            '}' | ']' => depth = depth.saturating_sub(1),
            _ => {},
        }
    }

    // An unterminated string or unbalanced braces is malformed JSON, but
    // that is `serde_json::from_str`'s job to report as INVALID_JSON; this
    // pass only ever rejects for depth.
    Ok(())
}

/// Parse and validate a frame of known shape `T`, applying size/depth
/// checks before attempting the `serde_json` parse.
pub fn validate_and_parse<T: serde::de::DeserializeOwned>(
    raw: &str,
    max_size_bytes: usize,
    max_depth: usize,
) -> Result<T, ValidationError> {
    validate_size_and_depth(raw, max_size_bytes, max_depth)?;
    serde_json::from_str(raw).map_err(|_| ValidationError::InvalidJson)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_payload() {
        let raw = "x".repeat(100);
        assert_eq!(validate_size_and_depth(&raw, 10, 10), Err(ValidationError::TooLarge));
    }

    #[test]
    fn rejects_excessive_nesting_without_materialising() {
        let mut raw = String::new();
        for _ in 0..20 {
            raw.push('[');
        }
        for _ in 0..20 {
            raw.push(']');
        }
        assert_eq!(validate_size_and_depth(&raw, 10_000, 10), Err(ValidationError::TooDeep));
    }

    #[test]
    fn allows_nesting_within_bound() {
        let raw = r#"{"a":{"b":{"c":1}}}"#;
        assert_eq!(validate_size_and_depth(raw, 10_000, 10), Ok(()));
    }

    #[test]
    fn braces_inside_strings_do_not_count_toward_depth() {
        let raw = r#"{"a":"{{{{{{{{{{{{"}"#;
        assert_eq!(validate_size_and_depth(raw, 10_000, 3), Ok(()));
    }
}
