//! Topic filter matching
//!
//! `+` matches exactly one level, `#` matches the remainder (including
//! nothing). Tokens otherwise require exact equality, and lengths must agree
//! unless the filter ends in `#`.

/// Whether `filter` matches the published `topic`.
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter_tokens: Vec<&str> = filter.split('/').collect();
    let topic_tokens: Vec<&str> = topic.split('/').collect();

    let mut i = 0;
    loop {
        match (filter_tokens.get(i), topic_tokens.get(i)) {
            // Remainder wildcard swallows everything, including an empty tail.
            (Some(&"#"), _) => return true,
            (Some(ft), Some(tt)) => {
                if *ft != "+" && ft != tt {
                    return false;
                }
            }
            // Filter longer than topic (and not `#`): no match.
            (Some(_), None) => return false,
            // Topic longer than filter: no match.
            (None, Some(_)) => return false,
            (None, None) => return true,
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_topics() {
        assert!(matches("devices/42/telemetry", "devices/42/telemetry"));
        assert!(!matches("devices/42/telemetry", "devices/42/status"));
        assert!(!matches("devices/42", "devices/42/status"));
        assert!(!matches("devices/42/status", "devices/42"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(!matches("a/+/c", "a/c"));
        assert!(!matches("a/+/c", "a/b/c/d"));
        assert!(matches("devices/+/telemetry", "devices/abc/telemetry"));
        assert!(!matches("devices/+/telemetry", "gateways/1/telemetry"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(matches("a/#", "a"));
        assert!(matches("a/#", "a/b"));
        assert!(matches("a/#", "a/b/c"));
        assert!(matches("#", "anything/at/all"));
        assert!(!matches("a/#", "b/a"));
    }

    #[test]
    fn wildcard_monotonicity() {
        // Replacing a token with `+` can only widen the match set.
        let topics = [
            "devices/42/telemetry",
            "devices/42/status",
            "devices/abc/telemetry",
            "gateways/1/telemetry",
        ];
        for t in topics {
            if matches("devices/42/telemetry", t) {
                assert!(matches("devices/+/telemetry", t));
            }
        }
    }
}
