use fusion_core::{FusionError, FusionResult};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*` matches exactly one segment.
    One,
    /// `#` matches one or more trailing segments.
    Rest,
}

/// A subscription pattern over dot-separated topics.
///
/// `*` matches exactly one segment and a trailing `#` matches one or more
/// remaining segments, so `agent.*.idle` matches `agent.a1.idle` and
/// `task.#` matches every task topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse a pattern, rejecting empty segments and a `#` that is not last.
    pub fn parse(pattern: &str) -> FusionResult<Self> {
        if pattern.is_empty() {
            return Err(FusionError::Router("empty pattern".to_string()));
        }
        let parts: Vec<&str> = pattern.split('.').collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => {
                    return Err(FusionError::Router(format!(
                        "pattern '{pattern}' has an empty segment"
                    )))
                }
                "*" => Segment::One,
                "#" if i + 1 == parts.len() => Segment::Rest,
                "#" => {
                    return Err(FusionError::Router(format!(
                        "pattern '{pattern}': '#' must be the last segment"
                    )))
                }
                literal if literal.contains(['*', '#']) => {
                    return Err(FusionError::Router(format!(
                        "pattern '{pattern}': wildcards must span a whole segment"
                    )))
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern contains no wildcard.
    pub fn is_exact(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Check whether a concrete topic matches this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split('.');
        for segment in &self.segments {
            match segment {
                Segment::Rest => return parts.next().is_some(),
                Segment::One => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(lit) => match parts.next() {
                    Some(part) if part == lit => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Reject topics that are empty, have empty segments, or contain wildcards.
pub fn validate_topic(topic: &str) -> FusionResult<()> {
    if topic.is_empty() {
        return Err(FusionError::Router("empty topic".to_string()));
    }
    if topic.split('.').any(str::is_empty) {
        return Err(FusionError::Router(format!(
            "topic '{topic}' has an empty segment"
        )));
    }
    if topic.contains(['*', '#']) {
        return Err(FusionError::Router(format!(
            "topic '{topic}' must not contain wildcards"
        )));
    }
    Ok(())
}
