//! Topic pattern compilation and matching
//!
//! Topics are colon-delimited segment strings (`project-a:events`).
//! Subscription patterns are literal topics or wildcards: `*` matches
//! exactly one segment, and a terminal `*` after a literal prefix
//! (`project-a:*`) matches any non-empty suffix. Patterns are compiled once
//! at subscription time so dispatch only walks pre-parsed matchers.

use serde::{Deserialize, Serialize};

/// Topic segment delimiter.
pub const TOPIC_DELIMITER: char = ':';

/// A compiled subscription pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicPattern {
    /// Exact topic match.
    Literal(String),
    /// `prefix:*`: any topic whose segments start with the literal prefix
    /// and continue with at least one more segment.
    Prefix(String),
    /// Segment-wise match where `*` stands for exactly one segment.
    Segments(Vec<SegmentMatcher>),
}

/// One segment of a compiled pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentMatcher {
    /// Matches this exact segment.
    Literal(String),
    /// Matches any single segment.
    Wildcard,
}

impl TopicPattern {
    /// Compiles a pattern string
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        if !pattern.contains('*') {
            return Self::Literal(pattern.to_owned());
        }

        // A terminal `*` behind a wildcard-free prefix is a suffix match.
        if let Some(prefix) = pattern.strip_suffix(":*") {
            if !prefix.is_empty() && !prefix.contains('*') {
                return Self::Prefix(prefix.to_owned());
            }
        }

        let segments = pattern
            .split(TOPIC_DELIMITER)
            .map(|segment| {
                if segment == "*" {
                    SegmentMatcher::Wildcard
                } else {
                    SegmentMatcher::Literal(segment.to_owned())
                }
            })
            .collect();
        Self::Segments(segments)
    }

    /// Whether the compiled pattern matches the given topic
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Literal(literal) => literal == topic,
            Self::Prefix(prefix) => topic
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix(TOPIC_DELIMITER))
                .is_some_and(|suffix| !suffix.is_empty()),
            Self::Segments(matchers) => {
                let segments: Vec<&str> = topic.split(TOPIC_DELIMITER).collect();
                if segments.len() != matchers.len() {
                    return false;
                }
                matchers
                    .iter()
                    .zip(segments)
                    .all(|(matcher, segment)| match matcher {
                        SegmentMatcher::Literal(literal) => literal == segment,
                        SegmentMatcher::Wildcard => !segment.is_empty(),
                    })
            }
        }
    }

    /// Whether this pattern contains any wildcard
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        !matches!(self, Self::Literal(_))
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(literal) => write!(f, "{literal}"),
            Self::Prefix(prefix) => write!(f, "{prefix}:*"),
            Self::Segments(matchers) => {
                let rendered: Vec<&str> = matchers
                    .iter()
                    .map(|m| match m {
                        SegmentMatcher::Literal(l) => l.as_str(),
                        SegmentMatcher::Wildcard => "*",
                    })
                    .collect();
                write!(f, "{}", rendered.join(":"))
            }
        }
    }
}
