// src/version/label.rs

//! Repository labels
//!
//! A label names a line of development hosted by one repository and is
//! written `host@namespace:tag`. Inside a version string a label may be
//! abbreviated against the label before it (`tag` or `namespace:tag`).

use super::ParseError;
use std::fmt;
use std::str::FromStr;

/// Host name shared by every client-only label
pub const LOCAL_HOST: &str = "local";

/// Namespace shared by every client-only label
pub const LOCAL_NAMESPACE: &str = "local";

/// Characters which can never appear in a label
const BAD_CHARS: &[char] = &['/', '\'', '"', '\\', '(', ')', '[', ']', '='];

/// A `host@namespace:tag` label
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    host: String,
    namespace: String,
    tag: String,
}

impl Label {
    /// Parse a fully qualified label
    pub fn new(value: &str) -> Result<Self, ParseError> {
        Self::parse_with_template(value, None)
    }

    /// Label used for ad hoc local checkouts
    pub fn local() -> Self {
        Self::reserved("LOCAL")
    }

    /// Label used for troves built and installed in one step
    pub fn emerge() -> Self {
        Self::reserved("EMERGE")
    }

    /// Label used for troves cooked locally
    pub fn cook() -> Self {
        Self::reserved("COOK")
    }

    /// Label used to hold local changes during a rollback
    pub fn rollback() -> Self {
        Self::reserved("ROLLBACK")
    }

    fn reserved(tag: &str) -> Self {
        Self {
            host: LOCAL_HOST.to_string(),
            namespace: LOCAL_NAMESPACE.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Parse a label, filling in a missing host or namespace from `template`
    pub(crate) fn parse_with_template(
        value: &str,
        template: Option<&Label>,
    ) -> Result<Self, ParseError> {
        if value.contains('/') {
            return Err(ParseError::new(value, "/ should not appear in a label"));
        }

        let colons = value.matches(':').count();
        let ats = value.matches('@').count();

        if colons > 1 {
            return Err(ParseError::new(value, "unexpected colon"));
        }
        if ats > 0 && colons == 0 {
            return Err(ParseError::new(value, "@ sign can only be used with a colon"));
        }
        if ats > 1 {
            return Err(ParseError::new(value, "unexpected @ sign"));
        }

        let colon = value.find(':');
        let at = value.find('@');

        if let (Some(at), Some(colon)) = (at, colon) {
            if at > colon {
                return Err(ParseError::new(value, "@ sign must occur before a colon"));
            }
        }

        let (host, namespace, tag) = match (at, colon) {
            (_, None) => {
                let template = template
                    .ok_or_else(|| ParseError::new(value, "colon expected before branch name"))?;
                (template.host.as_str(), template.namespace.as_str(), value)
            }
            (None, Some(colon)) => {
                let template = template.ok_or_else(|| {
                    ParseError::new(value, "@ expected before label namespace")
                })?;
                (template.host.as_str(), &value[..colon], &value[colon + 1..])
            }
            (Some(at), Some(colon)) => (&value[..at], &value[at + 1..colon], &value[colon + 1..]),
        };

        if host.is_empty() {
            return Err(ParseError::new(value, format!("host may not be empty: {}", value)));
        }
        if namespace.is_empty() {
            return Err(ParseError::new(
                value,
                format!("namespace may not be empty: {}", value),
            ));
        }
        if tag.is_empty() {
            return Err(ParseError::new(
                value,
                format!("branch tag may not be empty: {}", value),
            ));
        }

        if let Some(bad) = value
            .chars()
            .find(|c| BAD_CHARS.contains(c) || c.is_control() || c.is_whitespace())
        {
            return Err(ParseError::new(
                value,
                format!("illegal character {:?} in label {}", bad, value),
            ));
        }

        Ok(Self {
            host: host.to_string(),
            namespace: namespace.to_string(),
            tag: tag.to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// True for every label which lives only on a client
    pub fn is_local_host(&self) -> bool {
        self.host == LOCAL_HOST
    }

    /// Shortest form of this label which still parses against `versus`
    pub fn as_string(&self, versus: Option<&Label>) -> String {
        match versus {
            Some(other) if other.host == self.host => {
                if other.namespace == self.namespace {
                    self.tag.clone()
                } else {
                    format!("{}:{}", self.namespace, self.tag)
                }
            }
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.host, self.namespace, self.tag)
    }
}

impl FromStr for Label {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
