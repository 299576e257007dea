//! Topic name and filter validation
//!
//! Topic names are what PUBLISH carries: non-empty, no wildcards. Topic
//! filters additionally allow `+` (exactly one level) and `#` (the rest of
//! the topic, final level only). Matching is case sensitive and does not
//! normalize UTF-8.

use std::fmt;

/// Maximum encoded length of a topic string.
pub const MAX_TOPIC_LENGTH: usize = 65_535;

/// Why a topic name or filter was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    Empty,
    TooLong,
    WildcardInName,
    /// `#` not at the end, or sharing a level with other characters
    InvalidMultiWildcard,
    /// `+` sharing a level with other characters
    InvalidSingleWildcard,
    /// `$share/` prefix without group or filter
    InvalidShare,
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicError::Empty => write!(f, "topic is empty"),
            TopicError::TooLong => write!(f, "topic exceeds {MAX_TOPIC_LENGTH} bytes"),
            TopicError::WildcardInName => write!(f, "wildcard in topic name"),
            TopicError::InvalidMultiWildcard => write!(f, "invalid use of '#'"),
            TopicError::InvalidSingleWildcard => write!(f, "invalid use of '+'"),
            TopicError::InvalidShare => write!(f, "invalid $share filter"),
        }
    }
}

impl std::error::Error for TopicError {}

/// Validate a topic name as used by PUBLISH and will messages.
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::TooLong);
    }
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInName);
    }
    Ok(())
}

/// Validate a topic filter as used by SUBSCRIBE and UNSUBSCRIBE.
///
/// Shared filters (`$share/<group>/<filter>`) are validated on the inner
/// filter; the group itself may not be empty or contain wildcards.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }
    if filter.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::TooLong);
    }

    let filter = match parse_shared_filter(filter) {
        Some((group, inner)) => {
            if group.is_empty() || group.contains(['+', '#', '/']) {
                return Err(TopicError::InvalidShare);
            }
            if inner.is_empty() {
                return Err(TopicError::InvalidShare);
            }
            inner
        }
        None => {
            if filter.starts_with("$share/") || filter == "$share" {
                return Err(TopicError::InvalidShare);
            }
            filter
        }
    };

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        if level.contains('#') {
            if level != "#" || !is_last {
                return Err(TopicError::InvalidMultiWildcard);
            }
        } else if level.contains('+') && level != "+" {
            return Err(TopicError::InvalidSingleWildcard);
        }
    }
    Ok(())
}

/// Split a `$share/<group>/<filter>` subscription into (group, filter).
pub fn parse_shared_filter(filter: &str) -> Option<(&str, &str)> {
    let rest = filter.strip_prefix("$share/")?;
    let slash = rest.find('/')?;
    let (group, inner) = (&rest[..slash], &rest[slash + 1..]);
    if group.is_empty() || inner.is_empty() {
        return None;
    }
    Some((group, inner))
}

/// Whether `topic` matches `filter` under MQTT wildcard rules.
///
/// Reference matcher used by the retained store and by tests against the
/// trie; filters starting with a wildcard never match `$`-topics.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // '#' swallows the rest of the topic, including zero levels
            // ("a/#" matches "a").
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (Some(_), Some(_)) => return false,
            (Some(_), None) => return false,
            (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("a/b/c", "a/b/c", true; "exact")]
    #[test_case("a/b/c", "a/+/c", true; "plus mid")]
    #[test_case("a/b/c", "+/+/+", true; "all plus")]
    #[test_case("a/b/c", "a/#", true; "hash tail")]
    #[test_case("a", "a/#", true; "hash covers zero levels")]
    #[test_case("a/b/c", "#", true; "bare hash")]
    #[test_case("a/b", "a/+/c", false; "plus needs level")]
    #[test_case("a/b/c/d", "a/b/c", false; "topic longer")]
    #[test_case("a/b", "a/b/c", false; "filter longer")]
    #[test_case("a/b/c", "a/b/+", true; "plus tail")]
    #[test_case("", "", true; "both empty")]
    #[test_case("/a", "+/a", true; "leading empty level")]
    #[test_case("a//c", "a/+/c", true; "empty mid level")]
    #[test_case("$SYS/stats", "#", false; "hash excludes dollar")]
    #[test_case("$SYS/stats", "+/stats", false; "plus excludes dollar")]
    #[test_case("$SYS/stats", "$SYS/#", true; "explicit dollar prefix")]
    #[test_case("A/b", "a/b", false; "case sensitive")]
    fn matches(topic: &str, filter: &str, expected: bool) {
        assert_eq!(topic_matches_filter(topic, filter), expected);
    }

    #[test]
    fn valid_names() {
        assert!(validate_topic_name("a").is_ok());
        assert!(validate_topic_name("a/b c/d").is_ok());
        assert!(validate_topic_name("/").is_ok());
        assert!(validate_topic_name("$SYS/internal").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert_eq!(validate_topic_name(""), Err(TopicError::Empty));
        assert_eq!(validate_topic_name("a/+"), Err(TopicError::WildcardInName));
        assert_eq!(validate_topic_name("a/#"), Err(TopicError::WildcardInName));
    }

    #[test]
    fn valid_filters() {
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("a/+/b/#").is_ok());
        assert!(validate_topic_filter("$share/g/a/+").is_ok());
    }

    #[test]
    fn invalid_filters() {
        assert_eq!(validate_topic_filter(""), Err(TopicError::Empty));
        assert_eq!(
            validate_topic_filter("a/#/b"),
            Err(TopicError::InvalidMultiWildcard)
        );
        assert_eq!(
            validate_topic_filter("a/b#"),
            Err(TopicError::InvalidMultiWildcard)
        );
        assert_eq!(
            validate_topic_filter("a/b+/c"),
            Err(TopicError::InvalidSingleWildcard)
        );
        assert_eq!(
            validate_topic_filter("$share//x"),
            Err(TopicError::InvalidShare)
        );
        assert_eq!(
            validate_topic_filter("$share/g"),
            Err(TopicError::InvalidShare)
        );
    }

    #[test]
    fn shared_filter_parsing() {
        assert_eq!(parse_shared_filter("$share/g/a/b"), Some(("g", "a/b")));
        assert_eq!(parse_shared_filter("a/b"), None);
        assert_eq!(parse_shared_filter("$share/g"), None);
        assert_eq!(parse_shared_filter("$share//f"), None);
    }
}
