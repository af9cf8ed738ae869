//! Tag filter trees

use crate::{QuiverError, Result, Tag};
use std::fmt;
use std::str::FromStr;

/// Boolean combination of tag equality tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagFilter {
    /// Series carrying the tag `key=value`
    Equals { key: String, value: String },
    /// Series matching every child
    And(Vec<TagFilter>),
    /// Series matching at least one child
    Or(Vec<TagFilter>),
}

impl TagFilter {
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        TagFilter::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn and(self, other: TagFilter) -> Self {
        match self {
            TagFilter::And(mut children) => {
                children.push(other);
                TagFilter::And(children)
            }
            this => TagFilter::And(vec![this, other]),
        }
    }

    pub fn or(self, other: TagFilter) -> Self {
        match self {
            TagFilter::Or(mut children) => {
                children.push(other);
                TagFilter::Or(children)
            }
            this => TagFilter::Or(vec![this, other]),
        }
    }

    /// Parse `key=value` terms joined by `&` and `|`, where `&` binds tighter.
    ///
    /// `"dc=east&host=a|host=b"` reads as `(dc=east AND host=a) OR host=b`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut alternatives = Vec::new();
        for alternative in text.split('|') {
            let mut terms = Vec::new();
            for term in alternative.split('&') {
                let term = term.trim();
                let (key, value) = term.split_once('=').ok_or_else(|| {
                    QuiverError::Query(format!("tag filter term {:?} is not key=value", term))
                })?;
                let tag = Tag::new(key.trim(), value.trim());
                tag.validate()
                    .map_err(|e| QuiverError::Query(format!("tag filter {:?}: {}", text, e)))?;
                terms.push(TagFilter::equals(tag.key, tag.value));
            }
            alternatives.push(Self::collapse(terms, TagFilter::And));
        }
        Ok(Self::collapse(alternatives, TagFilter::Or))
    }

    fn collapse(mut filters: Vec<TagFilter>, combine: fn(Vec<TagFilter>) -> TagFilter) -> Self {
        if filters.len() == 1 {
            filters.remove(0)
        } else {
            combine(filters)
        }
    }
}

impl FromStr for TagFilter {
    type Err = QuiverError;

    fn from_str(s: &str) -> Result<Self> {
        TagFilter::parse(s)
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, children: &[TagFilter], op: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            write!(f, " {} ", op)?;
        }
        write!(f, "{}", child)?;
    }
    write!(f, ")")
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagFilter::Equals { key, value } => write!(f, "{}={}", key, value),
            TagFilter::And(children) => write_joined(f, children, "AND"),
            TagFilter::Or(children) => write_joined(f, children, "OR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_precedence() {
        let filter = TagFilter::parse("dc=east & host=a | host=b").unwrap();
        assert_eq!(
            filter,
            TagFilter::Or(vec![
                TagFilter::And(vec![
                    TagFilter::equals("dc", "east"),
                    TagFilter::equals("host", "a"),
                ]),
                TagFilter::equals("host", "b"),
            ])
        );
        assert_eq!(filter.to_string(), "((dc=east AND host=a) OR host=b)");
    }

    #[test]
    fn test_parse_single_term() {
        let filter: TagFilter = "test=1".parse().unwrap();
        assert_eq!(filter, TagFilter::equals("test", "1"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(TagFilter::parse("").is_err());
        assert!(TagFilter::parse("host").is_err());
        assert!(TagFilter::parse("host=a&").is_err());
        assert!(TagFilter::parse("host=").is_err());
    }

    #[test]
    fn test_builders() {
        let filter = TagFilter::equals("a", "1")
            .and(TagFilter::equals("b", "2"))
            .and(TagFilter::equals("c", "3"));
        assert!(matches!(&filter, TagFilter::And(children) if children.len() == 3));
    }
}
