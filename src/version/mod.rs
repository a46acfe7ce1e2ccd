// src/version/mod.rs

//! Version algebra for troves
//!
//! A [`Version`] records where a trove sits in the tree of branches and
//! shadows: an ordered list of hops, each naming a [`Label`] and, for every
//! hop a revision was made on, a [`Revision`]. A version whose last hop
//! carries no revision is a branch.
//!
//! Versions are immutable and cheap to clone. Parsed and thawed versions
//! are interned through the caches in [`cache`].

pub mod cache;
mod label;
mod parse;
mod revision;

pub use cache::VersionCache;
pub use label::{LOCAL_HOST, LOCAL_NAMESPACE, Label};
pub use parse::str_to_frozen;
pub use revision::{Revision, SerialNumber};

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// String form of the sentinel version with no hops
pub const NEW_VERSION: &str = "@NEW@";

/// A malformed label, revision or version string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ParseError {
    text: String,
    message: String,
}

impl ParseError {
    pub(crate) fn new(text: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            message: message.into(),
        }
    }

    /// The text which failed to parse
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Misuse of a version operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("{0} has no parent version")]
    NoParent(String),

    #[error("{0} is not a branch")]
    NotABranch(String),

    #[error("{0} is not a version")]
    NotAVersion(String),

    #[error("label {label} already appears in {version}")]
    CircularLabel { label: String, version: String },

    #[error("expected {expected} timestamps, found {found}")]
    TimestampMismatch { expected: usize, found: usize },

    #[error("revision {revision} is too deeply shadowed for {version}")]
    ShadowDepth { revision: String, version: String },
}

/// One step along a version's path
#[derive(Debug, Clone, PartialEq)]
pub enum Hop {
    /// A label branched from the revision before it
    Branch {
        label: Label,
        revision: Option<Revision>,
    },
    /// A label shadowing the branch before it
    Shadow {
        label: Label,
        revision: Option<Revision>,
    },
}

impl Hop {
    pub fn label(&self) -> &Label {
        match self {
            Hop::Branch { label, .. } | Hop::Shadow { label, .. } => label,
        }
    }

    pub fn revision(&self) -> Option<&Revision> {
        match self {
            Hop::Branch { revision, .. } | Hop::Shadow { revision, .. } => revision.as_ref(),
        }
    }

    pub fn is_shadow(&self) -> bool {
        matches!(self, Hop::Shadow { .. })
    }

    fn revision_mut(&mut self) -> Option<&mut Revision> {
        match self {
            Hop::Branch { revision, .. } | Hop::Shadow { revision, .. } => revision.as_mut(),
        }
    }

    pub(crate) fn set_revision(&mut self, value: Option<Revision>) {
        match self {
            Hop::Branch { revision, .. } | Hop::Shadow { revision, .. } => *revision = value,
        }
    }
}

#[derive(Debug)]
pub(crate) struct VersionData {
    hops: Vec<Hop>,
    frozen: String,
}

/// An immutable handle to a version or branch
#[derive(Clone)]
pub struct Version {
    inner: Arc<VersionData>,
}

fn now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

impl Version {
    fn from_hops(hops: Vec<Hop>) -> Self {
        let frozen = if hops.is_empty() {
            NEW_VERSION.to_string()
        } else {
            parse::render(&hops, true)
        };
        Self {
            inner: Arc::new(VersionData { hops, frozen }),
        }
    }

    /// The `@NEW@` sentinel
    pub fn new_version() -> Self {
        Self::from_hops(Vec::new())
    }

    /// Parse an absolute version or branch string
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        Self::from_string_with_timestamps(text, &[])
    }

    /// Parse a version string which may be relative to `branch`
    ///
    /// Strings not starting with `/` are appended to `branch`.
    pub fn parse_relative(text: &str, branch: &Version) -> Result<Self, ParseError> {
        if text.starts_with('/') || text == NEW_VERSION {
            return Self::parse(text);
        }
        if !branch.is_branch() {
            return Err(ParseError::new(
                text,
                format!("relative version {} requires a default branch", text),
            ));
        }
        Self::parse(&format!("{}/{}", branch.as_string(), text))
    }

    /// Parse a display string and assign one timestamp per revision
    ///
    /// An empty `timestamps` slice leaves every timestamp unassigned.
    pub fn from_string_with_timestamps(
        text: &str,
        timestamps: &[f64],
    ) -> Result<Self, ParseError> {
        if text == NEW_VERSION {
            return Ok(Self::new_version());
        }

        let stamps: Vec<String> = timestamps.iter().map(|t| format!("{:.3}", t)).collect();
        let key = format!("{}\0{}", text, stamps.join(","));

        VersionCache::parsed().intern(&key, || {
            let mut hops = parse::parse_hops(text, false)?;
            if !timestamps.is_empty() {
                let count = hops.iter().filter(|h| h.revision().is_some()).count();
                if count != timestamps.len() {
                    return Err(ParseError::new(
                        text,
                        format!("expected {} timestamps, found {}", count, timestamps.len()),
                    ));
                }
                let revisions = hops.iter_mut().filter_map(Hop::revision_mut);
                for (revision, stamp) in revisions.zip(timestamps) {
                    revision.set_timestamp(*stamp);
                }
            }
            Ok(Self::from_hops(hops))
        })
    }

    /// Parse a frozen string produced by [`Version::freeze`]
    pub fn thaw(text: &str) -> Result<Self, ParseError> {
        if text == NEW_VERSION {
            return Ok(Self::new_version());
        }
        VersionCache::thawed().intern(text, || {
            parse::parse_hops(text, true).map(Self::from_hops)
        })
    }

    /// The exact, timestamp-bearing string form
    pub fn freeze(&self) -> &str {
        &self.inner.frozen
    }

    /// Display form with abbreviated labels and revisions
    pub fn as_string(&self) -> String {
        if self.is_new() {
            return NEW_VERSION.to_string();
        }
        parse::render(&self.inner.hops, false)
    }

    /// Display form with `context` dropped when it is a prefix of this version
    pub fn as_string_relative(&self, context: &Version) -> String {
        if self.is_new() {
            return NEW_VERSION.to_string();
        }
        parse::render_relative(&self.inner.hops, &context.inner.hops)
    }

    /// True when both handles point at the same interned value
    pub fn same_handle(a: &Version, b: &Version) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn hops(&self) -> &[Hop] {
        &self.inner.hops
    }

    pub fn is_new(&self) -> bool {
        self.inner.hops.is_empty()
    }

    /// True when the last hop carries no revision
    pub fn is_branch(&self) -> bool {
        self.inner
            .hops
            .last()
            .is_some_and(|hop| hop.revision().is_none())
    }

    pub fn trailing_label(&self) -> Option<&Label> {
        self.inner.hops.last().map(Hop::label)
    }

    pub fn trailing_revision(&self) -> Option<&Revision> {
        self.inner.hops.last().and_then(Hop::revision)
    }

    /// Host of the trailing label
    pub fn host(&self) -> Option<&str> {
        self.trailing_label().map(Label::host)
    }

    pub fn iter_labels(&self) -> impl Iterator<Item = &Label> {
        self.inner.hops.iter().map(Hop::label)
    }

    pub fn iter_revisions(&self) -> impl Iterator<Item = &Revision> {
        self.inner.hops.iter().filter_map(Hop::revision)
    }

    pub fn timestamps(&self) -> Vec<f64> {
        self.iter_revisions().map(Revision::timestamp).collect()
    }

    /// Copy of this version with new per-revision timestamps
    pub fn with_timestamps(&self, timestamps: &[f64]) -> Result<Version, VersionError> {
        let count = self.iter_revisions().count();
        if count != timestamps.len() {
            return Err(VersionError::TimestampMismatch {
                expected: count,
                found: timestamps.len(),
            });
        }
        let mut hops = self.inner.hops.clone();
        for (revision, stamp) in hops.iter_mut().filter_map(Hop::revision_mut).zip(timestamps) {
            revision.set_timestamp(*stamp);
        }
        Ok(Self::from_hops(hops))
    }

    /// The branch this version lives on
    pub fn branch(&self) -> Version {
        if self.is_new() || self.is_branch() {
            return self.clone();
        }
        let mut hops = self.inner.hops.clone();
        if let Some(last) = hops.last_mut() {
            last.set_revision(None);
        }
        Self::from_hops(hops)
    }

    pub fn has_parent_branch(&self) -> bool {
        self.inner.hops.len() >= 2
    }

    /// The branch this version's branch was branched or shadowed from
    pub fn parent_branch(&self) -> Result<Version, VersionError> {
        if !self.has_parent_branch() {
            return Err(VersionError::NoParent(self.as_string()));
        }
        let mut hops = self.inner.hops.clone();
        hops.pop();
        if let Some(last) = hops.last_mut() {
            last.set_revision(None);
        }
        Ok(Self::from_hops(hops))
    }

    /// Number of shadow hops since the last branch hop
    pub fn shadow_length(&self) -> usize {
        self.inner
            .hops
            .iter()
            .rev()
            .take_while(|hop| hop.is_shadow())
            .count()
    }

    pub fn is_shadow(&self) -> bool {
        self.inner.hops.last().is_some_and(Hop::is_shadow)
    }

    /// True for a shadowed version which has been changed on the shadow
    pub fn is_modified_shadow(&self) -> bool {
        if !self.is_shadow() {
            return false;
        }
        let Some(revision) = self.trailing_revision() else {
            return false;
        };
        let depth = self.shadow_length();
        revision.source_count().shadow_count() == depth
            || revision
                .build_count()
                .is_some_and(|b| b.shadow_count() == depth)
    }

    /// Revision this shadowed version was copied from, if it still exists
    fn shadow_parent_revision(&self) -> Option<Revision> {
        let revision = self.trailing_revision()?;
        let depth = self.shadow_length();
        if depth == 0 {
            return None;
        }

        let mut parent = match revision.build_count() {
            Some(build) => {
                if revision.source_count().shadow_count() == depth {
                    return None;
                }
                let build = build.truncated(depth - 1);
                if build.is_zero() {
                    return None;
                }
                Revision::from_parts(
                    revision.version(),
                    revision.source_count().truncated(depth - 1),
                    Some(build),
                )
            }
            None => {
                let source = revision.source_count().truncated(depth - 1);
                if source.is_zero() {
                    return None;
                }
                Revision::from_parts(revision.version(), source, None)
            }
        };
        parent.set_timestamp(0.0);
        Some(parent)
    }

    /// True when the trailing hop still carries its parent's upstream
    /// version without local modifications
    pub fn has_parent_version(&self) -> bool {
        let hops = &self.inner.hops;
        let Some(revision) = self.trailing_revision() else {
            return false;
        };
        if hops.len() < 2 {
            return false;
        }
        if self.is_shadow() {
            return self.shadow_parent_revision().is_some();
        }
        effective_revision(hops, hops.len() - 2)
            .is_some_and(|parent| parent.version() == revision.version())
    }

    /// The version this one was branched or shadowed from
    pub fn parent_version(&self) -> Result<Version, VersionError> {
        if !self.has_parent_version() {
            return Err(VersionError::NoParent(self.as_string()));
        }

        let mut hops = self.inner.hops.clone();
        if self.is_shadow() {
            let revision = self
                .shadow_parent_revision()
                .ok_or_else(|| VersionError::NoParent(self.as_string()))?;
            hops.pop();
            if let Some(last) = hops.last_mut() {
                last.set_revision(Some(revision));
            }
        } else {
            hops.pop();
        }
        Ok(Self::from_hops(hops))
    }

    /// Walk up unmodified shadows to the version they mirror
    pub fn canonical_version(&self) -> Version {
        let mut current = self.clone();
        while current.is_shadow() && !current.is_modified_shadow() {
            match current.parent_version() {
                Ok(parent) => current = parent,
                Err(_) => break,
            }
        }
        current
    }

    fn check_new_label(&self, label: &Label) -> Result<(), VersionError> {
        if self.iter_labels().any(|l| l == label) {
            return Err(VersionError::CircularLabel {
                label: label.to_string(),
                version: self.as_string(),
            });
        }
        Ok(())
    }

    fn check_depth(hops: &[Hop], revision: &Revision) -> Result<(), VersionError> {
        let depth = hops.iter().rev().take_while(|h| h.is_shadow()).count();
        let too_deep = revision.source_count().shadow_count() > depth
            || revision
                .build_count()
                .is_some_and(|b| b.shadow_count() > depth);
        if too_deep {
            return Err(VersionError::ShadowDepth {
                revision: revision.to_string(),
                version: parse::render(hops, false),
            });
        }
        Ok(())
    }

    /// Add `revision` to this branch
    pub fn create_version(&self, revision: Revision) -> Result<Version, VersionError> {
        if !self.is_branch() {
            return Err(VersionError::NotABranch(self.as_string()));
        }
        let mut hops = self.inner.hops.clone();
        Self::check_depth(&hops, &revision)?;
        if let Some(last) = hops.last_mut() {
            last.set_revision(Some(revision));
        }
        Ok(Self::from_hops(hops))
    }

    /// Shadow this branch or version onto `label`
    ///
    /// A version keeps its revision, which moves onto the shadow.
    pub fn create_shadow(&self, label: Label) -> Result<Version, VersionError> {
        if self.is_new() {
            return Err(VersionError::NotAVersion(self.as_string()));
        }
        self.check_new_label(&label)?;

        let mut hops = self.inner.hops.clone();
        let revision = hops.last_mut().and_then(|last| {
            let revision = last.revision().cloned();
            last.set_revision(None);
            revision
        });
        hops.push(Hop::Shadow { label, revision });
        Ok(Self::from_hops(hops))
    }

    /// Branch this version onto `label`
    ///
    /// With `with_revision` the new branch starts with a copy of this
    /// version's trailing revision.
    pub fn create_branch(&self, label: Label, with_revision: bool) -> Result<Version, VersionError> {
        let Some(trailing) = self.trailing_revision() else {
            return Err(VersionError::NotAVersion(self.as_string()));
        };
        self.check_new_label(&label)?;

        let mut hops = self.inner.hops.clone();
        hops.push(Hop::Branch {
            label,
            revision: None,
        });

        if with_revision {
            let revision = trailing.clone();
            Self::check_depth(&hops, &revision)?;
            if let Some(last) = hops.last_mut() {
                last.set_revision(Some(revision));
            }
        }
        Ok(Self::from_hops(hops))
    }

    fn with_trailing_revision<F>(&self, change: F) -> Result<Version, VersionError>
    where
        F: FnOnce(&mut Revision, usize),
    {
        if self.trailing_revision().is_none() {
            return Err(VersionError::NotAVersion(self.as_string()));
        }
        let depth = self.shadow_length();
        let mut hops = self.inner.hops.clone();
        if let Some(revision) = hops.last_mut().and_then(Hop::revision_mut) {
            change(revision, depth);
            revision.set_timestamp(now());
        }
        Ok(Self::from_hops(hops))
    }

    /// Next source revision on this branch, stamped with the current time
    pub fn increment_source_count(&self) -> Result<Version, VersionError> {
        self.with_trailing_revision(|revision, depth| revision.increment_source_count(depth))
    }

    /// Next build of the same source, stamped with the current time
    pub fn increment_build_count(&self) -> Result<Version, VersionError> {
        self.with_trailing_revision(|revision, depth| revision.increment_build_count(depth))
    }

    fn trailing_label_is(&self, label: &Label) -> bool {
        self.trailing_label() == Some(label)
    }

    pub fn is_on_local_host(&self) -> bool {
        self.trailing_label().is_some_and(Label::is_local_host)
    }

    pub fn is_in_local_namespace(&self) -> bool {
        self.trailing_label()
            .is_some_and(|label| label.namespace() == LOCAL_NAMESPACE)
    }

    pub fn on_local_label(&self) -> bool {
        self.trailing_label_is(&Label::local())
    }

    pub fn on_emerge_label(&self) -> bool {
        self.trailing_label_is(&Label::emerge())
    }

    pub fn on_cook_label(&self) -> bool {
        self.trailing_label_is(&Label::cook())
    }

    pub fn on_rollback_label(&self) -> bool {
        self.trailing_label_is(&Label::rollback())
    }

    /// True when the branch this version lives on was branched from a
    /// built binary rather than from a source revision
    pub fn is_branched_binary(&self) -> bool {
        let hops = &self.inner.hops;
        let depth = self.shadow_length();
        if hops.len() < depth + 2 {
            return false;
        }
        hops[hops.len() - depth - 2]
            .revision()
            .and_then(Revision::build_count)
            .is_some_and(|build| !build.is_zero())
    }

    /// The source version a binary was built from
    ///
    /// Build counts are removed and every timestamp is cleared.
    pub fn get_source_version(&self) -> Result<Version, VersionError> {
        let mut current = self.clone();
        while current.is_branched_binary() {
            current = current.parent_version()?;
        }

        let mut hops = current.inner.hops.clone();
        for revision in hops.iter_mut().filter_map(Hop::revision_mut) {
            revision.set_build_count(None);
            revision.set_timestamp(0.0);
        }
        Ok(Self::from_hops(hops))
    }

    /// The binary version matching a source version
    ///
    /// Every revision this version branched from receives build count 0.
    pub fn get_binary_version(&self) -> Version {
        let mut hops = self.inner.hops.clone();
        let count = hops.len();
        for hop in hops.iter_mut().take(count.saturating_sub(1)) {
            if let Some(revision) = hop.revision_mut() {
                revision.set_build_count(Some(SerialNumber::zero()));
            }
        }
        Self::from_hops(hops)
    }

    /// True when this version was committed after `other`
    pub fn is_after(&self, other: &Version) -> bool {
        let ours = self.trailing_revision().map_or(0.0, Revision::timestamp);
        let theirs = other.trailing_revision().map_or(0.0, Revision::timestamp);
        ours > theirs
    }

    /// Affinity between two versions; larger means closer
    ///
    /// Shared leading labels score `c * (c + 1) / 2`. Every hop beyond the
    /// shared prefix divides the score by 2 for a shadow and by 1.5 for a
    /// branch, and every shared hop whose revisions disagree divides it by 2.
    pub fn closeness(&self, other: &Version) -> f64 {
        let ours = self.hops();
        let theirs = other.hops();

        let common = ours
            .iter()
            .zip(theirs)
            .take_while(|(a, b)| a.label() == b.label())
            .count();
        if common == 0 {
            return 0.0;
        }

        let mut score = (common * (common + 1)) as f64 / 2.0;

        for index in 0..common {
            if let (Some(a), Some(b)) = (
                effective_revision(ours, index),
                effective_revision(theirs, index),
            ) {
                if a != b {
                    score /= 2.0;
                }
            }
        }

        for hop in ours[common..].iter().chain(&theirs[common..]) {
            score /= if hop.is_shadow() { 2.0 } else { 1.5 };
        }

        score
    }

    fn branch_key(&self) -> String {
        if self.is_new() || self.is_branch() {
            return self.as_string();
        }
        let mut hops = self.inner.hops.clone();
        if let Some(last) = hops.last_mut() {
            last.set_revision(None);
        }
        parse::render(&hops, false)
    }
}

/// Revision a hop was made at, looking through shadows of an empty hop
fn effective_revision(hops: &[Hop], index: usize) -> Option<&Revision> {
    if let Some(revision) = hops[index].revision() {
        return Some(revision);
    }
    hops[index + 1..]
        .iter()
        .take_while(|hop| hop.is_shadow())
        .find_map(Hop::revision)
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.frozen == other.inner.frozen
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.frozen.hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    /// Versions on one branch order by commit time, then by revision;
    /// different branches order by the branch's string form.
    fn cmp(&self, other: &Self) -> Ordering {
        if self == other {
            return Ordering::Equal;
        }
        let ours = self.trailing_revision();
        let theirs = other.trailing_revision();

        self.branch_key()
            .cmp(&other.branch_key())
            .then_with(|| {
                let a = ours.map_or(0.0, Revision::timestamp);
                let b = theirs.map_or(0.0, Revision::timestamp);
                a.total_cmp(&b)
            })
            .then_with(|| ours.cmp(&theirs))
            .then_with(|| self.inner.frozen.cmp(&other.inner.frozen))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Version").field(&self.inner.frozen).finish()
    }
}

impl FromStr for Version {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
