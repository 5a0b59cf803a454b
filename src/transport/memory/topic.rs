//! Topic strings and subscription filters
//!
//! Topics are `/`-separated levels. Filters may use `+` for exactly one level
//! and a trailing `#` for any number of remaining levels (including none).

/// Normalise a topic string: no leading, trailing or repeated separators
pub fn canonicalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|level| !level.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether a topic or filter is well formed; wildcards only when `allow_wildcards`
pub fn validate_topic(topic: &str, allow_wildcards: bool) -> Result<(), String> {
    let canonical = canonicalize_topic(topic);
    if canonical.is_empty() {
        return Err("topic string is empty".to_string());
    }

    let levels: Vec<&str> = canonical.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let has_wildcard = level.contains('+') || level.contains('#');
        if !has_wildcard {
            continue;
        }
        if !allow_wildcards {
            return Err(format!("wildcard in publication topic '{canonical}'"));
        }
        match *level {
            "+" => {}
            "#" if i == levels.len() - 1 => {}
            "#" => return Err("'#' must be the last level".to_string()),
            _ => return Err(format!("wildcard must occupy a whole level in '{canonical}'")),
        }
    }
    Ok(())
}

/// Whether `topic` is matched by `filter`; both are canonicalised first
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter = canonicalize_topic(filter);
    let topic = canonicalize_topic(topic);
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize_topic("/prices//fx/"), "prices/fx");
        assert_eq!(canonicalize_topic("prices/fx"), "prices/fx");
        assert_eq!(canonicalize_topic("///"), "");
    }

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("prices/fx/eur", "prices/fx/eur"));
        assert!(!topic_matches("prices/fx/eur", "prices/fx/usd"));
        assert!(!topic_matches("prices/fx", "prices/fx/eur"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("prices/+/eur", "prices/fx/eur"));
        assert!(!topic_matches("prices/+", "prices/fx/eur"));
        assert!(!topic_matches("prices/+", "prices"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches("prices/#", "prices/fx/eur"));
        assert!(topic_matches("prices/#", "prices"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("prices/#", "stock/ibm"));
    }

    #[test]
    fn test_validation() {
        assert!(validate_topic("prices/+/eur", true).is_ok());
        assert!(validate_topic("prices/#", true).is_ok());
        assert!(validate_topic("prices/+/eur", false).is_err());
        assert!(validate_topic("prices/#/eur", true).is_err());
        assert!(validate_topic("prices/fx+", true).is_err());
        assert!(validate_topic("//", true).is_err());
    }

    proptest! {
        #[test]
        fn prop_canonicalize_is_idempotent(topic in "[a-z/]{0,24}") {
            let once = canonicalize_topic(&topic);
            prop_assert_eq!(canonicalize_topic(&once), once.clone());
            prop_assert!(!once.starts_with('/') && !once.ends_with('/'));
        }

        #[test]
        fn prop_topic_matches_itself(topic in "[a-z]{1,5}(/[a-z]{1,5}){0,4}") {
            prop_assert!(topic_matches(&topic, &topic));
            prop_assert!(topic_matches("#", &topic));
        }
    }
}
