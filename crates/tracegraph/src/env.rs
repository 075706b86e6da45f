use std::env;
use std::sync::OnceLock;

static TRACEGRAPH_VALIDATE: OnceLock<bool> = OnceLock::new();
static TRACEGRAPH_REMOTE_TIMEOUT_MS: OnceLock<Option<u64>> = OnceLock::new();
static TRACEGRAPH_WIRE_ENCODING: OnceLock<Option<String>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

pub(crate) fn validate_enabled() -> bool {
    *TRACEGRAPH_VALIDATE.get_or_init(|| match non_empty("TRACEGRAPH_VALIDATE") {
        Some(value) => parse_bool(&value),
        None => true,
    })
}

pub(crate) fn remote_timeout_ms() -> Option<u64> {
    *TRACEGRAPH_REMOTE_TIMEOUT_MS.get_or_init(|| {
        non_empty("TRACEGRAPH_REMOTE_TIMEOUT_MS").and_then(|value| value.parse().ok())
    })
}

pub(crate) fn wire_encoding() -> Option<&'static str> {
    TRACEGRAPH_WIRE_ENCODING
        .get_or_init(|| non_empty("TRACEGRAPH_WIRE_ENCODING"))
        .as_deref()
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value:?} should enable");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value:?} should disable");
        }
    }
}
