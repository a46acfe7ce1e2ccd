// src/version/revision.rs

//! Revisions: upstream version, source count, build count and timestamp

use super::ParseError;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Characters which can never appear in an upstream version
const BAD_VERSION_CHARS: &str = "!\"#$%&'*-/:<=>?@[]^`{|}\\";

/// A dotted list of counters such as `2`, `2.1` or `1.0.1`
///
/// Every element past the first records one level of shadowing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNumber(Vec<u32>);

impl SerialNumber {
    pub fn parse(value: &str) -> Result<Self, ParseError> {
        let mut numbers = Vec::new();
        for part in value.split('.') {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::new(
                    value,
                    format!("release numbers must be all numeric: {}", value),
                ));
            }
            let number = part.parse::<u32>().map_err(|_| {
                ParseError::new(value, format!("release number out of range: {}", value))
            })?;
            numbers.push(number);
        }
        Ok(Self(numbers))
    }

    /// A single zero element
    pub fn zero() -> Self {
        Self(vec![0])
    }

    pub fn counts(&self) -> &[u32] {
        &self.0
    }

    /// Number of shadow levels this counter records
    pub fn shadow_count(&self) -> usize {
        self.0.len() - 1
    }

    /// Pad with zeros to `depth + 1` elements, then bump the last element
    pub fn increment(&mut self, depth: usize) {
        if self.0.len() < depth + 1 {
            self.0.resize(depth + 1, 0);
        }
        if let Some(last) = self.0.last_mut() {
            *last += 1;
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|n| *n == 0)
    }

    /// The first `depth + 1` elements, with trailing zeros removed
    pub(crate) fn truncated(&self, depth: usize) -> Self {
        let mut numbers = self.0[..self.0.len().min(depth + 1)].to_vec();
        while numbers.len() > 1 && numbers.last() == Some(&0) {
            numbers.pop();
        }
        Self(numbers)
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|n| n.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// One revision of a trove on a branch
///
/// Equality, hashing and ordering ignore the timestamp.
#[derive(Debug, Clone)]
pub struct Revision {
    version: String,
    source_count: SerialNumber,
    build_count: Option<SerialNumber>,
    timestamp: f64,
}

impl Revision {
    /// Parse a standalone `upstream-source[-build]` string
    pub fn new(value: &str) -> Result<Self, ParseError> {
        Self::parse(value, None, false)
    }

    /// Parse a frozen `timestamp:revision` string
    pub fn thaw(value: &str) -> Result<Self, ParseError> {
        Self::parse(value, None, true)
    }

    /// Parse a revision, possibly abbreviated against `template`
    pub(crate) fn parse(
        value: &str,
        template: Option<&Revision>,
        frozen: bool,
    ) -> Result<Self, ParseError> {
        let (timestamp, text) = if frozen {
            let (stamp, rest) = value.split_once(':').ok_or_else(|| {
                ParseError::new(value, format!("missing timestamp in frozen revision: {}", value))
            })?;
            let stamp = stamp.parse::<f64>().map_err(|_| {
                ParseError::new(value, format!("bad timestamp in frozen revision: {}", value))
            })?;
            (stamp, rest)
        } else {
            (0.0, value)
        };

        if text.contains(':') {
            return Err(ParseError::new(
                value,
                "version/release pairs may not contain colons",
            ));
        }
        if text.contains('@') {
            return Err(ParseError::new(
                value,
                "version/release pairs may not contain @ signs",
            ));
        }

        let fields: Vec<&str> = text.split('-').collect();
        if fields.len() > 3 {
            return Err(ParseError::new(
                value,
                format!("too many '-' characters in version string: {}", text),
            ));
        }

        let template_with_build = template.filter(|t| t.build_count.is_some());

        let (version, source, build) = match fields.as_slice() {
            [count] => match (template_with_build, template) {
                (Some(t), _) => (
                    t.version.clone(),
                    t.source_count.clone(),
                    Some(SerialNumber::parse(count)?),
                ),
                (None, Some(t)) => (t.version.clone(), SerialNumber::parse(count)?, None),
                (None, None) => {
                    return Err(ParseError::new(value, format!("bad release string: {}", text)));
                }
            },
            [first, second] => match template_with_build {
                Some(t) => (
                    t.version.clone(),
                    SerialNumber::parse(first)?,
                    Some(SerialNumber::parse(second)?),
                ),
                None => {
                    Self::check_version(value, text, first)?;
                    (first.to_string(), SerialNumber::parse(second)?, None)
                }
            },
            [upstream, source, build] => {
                Self::check_version(value, text, upstream)?;
                (
                    upstream.to_string(),
                    SerialNumber::parse(source)?,
                    Some(SerialNumber::parse(build)?),
                )
            }
            _ => return Err(ParseError::new(value, format!("bad release string: {}", text))),
        };

        Ok(Self {
            version,
            source_count: source,
            build_count: build,
            timestamp,
        })
    }

    pub(crate) fn from_parts(
        version: &str,
        source_count: SerialNumber,
        build_count: Option<SerialNumber>,
    ) -> Self {
        Self {
            version: version.to_string(),
            source_count,
            build_count,
            timestamp: 0.0,
        }
    }

    fn check_version(value: &str, text: &str, upstream: &str) -> Result<(), ParseError> {
        if upstream.is_empty() {
            return Err(ParseError::new(value, format!("bad release string: {}", text)));
        }
        if let Some(bad) = upstream
            .chars()
            .find(|c| BAD_VERSION_CHARS.contains(*c) || (*c as u32) < 0x20 || (*c as u32) >= 0x7f)
        {
            return Err(ParseError::new(
                value,
                format!("version string {} contains illegal character {:?}", upstream, bad),
            ));
        }
        Ok(())
    }

    /// Upstream version, e.g. `1.2a`
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn source_count(&self) -> &SerialNumber {
        &self.source_count
    }

    pub fn build_count(&self) -> Option<&SerialNumber> {
        self.build_count.as_ref()
    }

    /// Seconds since the epoch; 0 when not yet assigned
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: f64) {
        self.timestamp = timestamp;
    }

    pub(crate) fn set_build_count(&mut self, build_count: Option<SerialNumber>) {
        self.build_count = build_count;
    }

    /// Bump the source count at `shadow_depth` and drop the build count
    pub fn increment_source_count(&mut self, shadow_depth: usize) {
        self.source_count.increment(shadow_depth);
        self.build_count = None;
    }

    /// Bump the build count for a trove built on a branch `shadow_depth`
    /// shadows deep
    ///
    /// A revision whose source count was made on this shadow keeps
    /// counting builds at the build count's own depth; otherwise the build
    /// count is extended to the shadow depth.
    pub fn increment_build_count(&mut self, shadow_depth: usize) {
        let mut build = self.build_count.take().unwrap_or_else(SerialNumber::zero);
        let depth = if self.source_count.shadow_count() == shadow_depth {
            build.shadow_count()
        } else {
            shadow_depth
        };
        build.increment(depth);
        self.build_count = Some(build);
    }

    /// Shortest form of this revision which still parses against `versus`
    pub fn as_string(&self, versus: Option<&Revision>) -> String {
        // An abbreviation is read back against the template's build count,
        // so both sides must agree on having one.
        let versus =
            versus.filter(|other| other.build_count.is_some() == self.build_count.is_some());

        let mut text = match versus {
            Some(other) if other.version == self.version => {
                if other.source_count == self.source_count && self.build_count.is_some() {
                    String::new()
                } else {
                    self.source_count.to_string()
                }
            }
            _ => format!("{}-{}", self.version, self.source_count),
        };

        if let Some(build) = &self.build_count {
            if text.is_empty() {
                text = build.to_string();
            } else {
                text = format!("{}-{}", text, build);
            }
        }
        text
    }

    /// [`Revision::as_string`] prefixed with the timestamp
    pub fn freeze(&self, versus: Option<&Revision>) -> String {
        format!("{:.3}:{}", self.timestamp, self.as_string(versus))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string(None))
    }
}

impl FromStr for Revision {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.source_count == other.source_count
            && self.build_count == other.build_count
    }
}

impl Eq for Revision {}

impl Hash for Revision {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.version.hash(state);
        self.source_count.hash(state);
        self.build_count.hash(state);
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.source_count.cmp(&other.source_count))
            .then_with(|| self.build_count.cmp(&other.build_count))
    }
}
