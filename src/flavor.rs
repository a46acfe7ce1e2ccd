// src/flavor.rs

//! Build flavors
//!
//! A flavor records the build-time variation of a trove (architecture,
//! feature flags). Changeset computation only compares flavors, so they
//! are kept as opaque, ordered strings.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flavor(String);

impl Flavor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The flavor of troves built without any variation
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Flavor {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
